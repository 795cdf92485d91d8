//! Partial-update operators
//!
//! An [`UpdateSpec`] is the only way configuration documents change. It uses
//! the same operator vocabulary as the remote document store (`$set`,
//! `$unset`, `$push`, `$pull`, `$addToSet`, `$inc`) and is applied
//! atomically by the collection backend against the current document.

use crate::error::UpdateError;
use crate::schema::FieldPath;
use serde_json::{Map, Number, Value};

const OPERATORS: &[&str] = &["$set", "$unset", "$push", "$pull", "$addToSet", "$inc"];

/// A single update operator.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Replace the value at `path`.
    Set { path: String, value: Value },
    /// Remove the field at `path`.
    Unset { path: String },
    /// Append `value` to the sequence at `path`, creating it if absent.
    Push { path: String, value: Value },
    /// Remove every element of the sequence at `path` matching `matcher`.
    Pull { path: String, matcher: Value },
    /// Append `value` unless an equal element is already present.
    AddToSet { path: String, value: Value },
    /// Add `by` to the number at `path`, treating an absent field as zero.
    Inc { path: String, by: Number },
}

impl UpdateOp {
    pub fn path(&self) -> &str {
        match self {
            UpdateOp::Set { path, .. }
            | UpdateOp::Unset { path }
            | UpdateOp::Push { path, .. }
            | UpdateOp::Pull { path, .. }
            | UpdateOp::AddToSet { path, .. }
            | UpdateOp::Inc { path, .. } => path,
        }
    }

    pub fn operator(&self) -> &'static str {
        match self {
            UpdateOp::Set { .. } => "$set",
            UpdateOp::Unset { .. } => "$unset",
            UpdateOp::Push { .. } => "$push",
            UpdateOp::Pull { .. } => "$pull",
            UpdateOp::AddToSet { .. } => "$addToSet",
            UpdateOp::Inc { .. } => "$inc",
        }
    }

    /// Whether applying this op may create missing intermediate mappings.
    fn creates_path(&self) -> bool {
        !matches!(self, UpdateOp::Unset { .. } | UpdateOp::Pull { .. })
    }
}

/// An ordered list of update operators applied as one atomic write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSpec {
    ops: Vec<UpdateOp>,
}

impl UpdateSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Set {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::Unset { path: path.into() });
        self
    }

    pub fn push(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Push {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn pull(mut self, path: impl Into<String>, matcher: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Pull {
            path: path.into(),
            matcher: matcher.into(),
        });
        self
    }

    pub fn add_to_set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::AddToSet {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn inc(mut self, path: impl Into<String>, by: impl Into<Number>) -> Self {
        self.ops.push(UpdateOp::Inc {
            path: path.into(),
            by: by.into(),
        });
        self
    }

    /// Append `other`'s operators after this spec's.
    pub fn merge(mut self, other: UpdateSpec) -> Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Top-level fields this update touches, in operator order.
    pub fn fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for op in &self.ops {
            let root = op.path().split('.').next().unwrap_or_default();
            if !fields.iter().any(|f| f == root) {
                fields.push(root.to_string());
            }
        }
        fields
    }

    /// Parse an operator document such as
    /// `{"$push": {"tags": {"name": "a", "value": "b"}}}`.
    ///
    /// `$push` and `$addToSet` accept `{"$each": [...]}` to append several
    /// values in order.
    pub fn from_operators(doc: &Value) -> Result<Self, UpdateError> {
        let operators = doc.as_object().ok_or_else(|| UpdateError::Malformed {
            reason: "update must be a mapping of operators".to_string(),
        })?;
        if operators.is_empty() {
            return Err(UpdateError::Malformed {
                reason: "update has no operators".to_string(),
            });
        }

        let mut spec = UpdateSpec::new();
        for (operator, fields) in operators {
            if !OPERATORS.contains(&operator.as_str()) {
                return Err(UpdateError::UnknownOperator {
                    operator: operator.clone(),
                });
            }
            let fields = fields.as_object().ok_or_else(|| UpdateError::Malformed {
                reason: format!("{operator} expects a mapping of fields"),
            })?;
            for (path, value) in fields {
                FieldPath::parse(path)?;
                let path = path.clone();
                match operator.as_str() {
                    "$set" => spec = spec.set(path, value.clone()),
                    "$unset" => spec = spec.unset(path),
                    "$pull" => spec = spec.pull(path, value.clone()),
                    "$inc" => {
                        let Value::Number(by) = value else {
                            return Err(UpdateError::Malformed {
                                reason: format!("$inc on {path} expects a number"),
                            });
                        };
                        spec = spec.inc(path, by.clone());
                    }
                    "$push" | "$addToSet" => {
                        for item in each_values(value) {
                            spec = if operator == "$push" {
                                spec.push(path.clone(), item)
                            } else {
                                spec.add_to_set(path.clone(), item)
                            };
                        }
                    }
                    other => {
                        return Err(UpdateError::UnknownOperator {
                            operator: other.to_string(),
                        })
                    }
                }
            }
        }
        Ok(spec)
    }

    /// Render back into an operator document.
    ///
    /// Repeated appends to one path collapse into `$each`.
    pub fn to_operators(&self) -> Value {
        let mut operators: Map<String, Value> = Map::new();
        for op in &self.ops {
            let fields = operators
                .entry(op.operator())
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(fields) = fields else {
                continue;
            };
            let path = op.path().to_string();
            match op {
                UpdateOp::Set { value, .. } => {
                    fields.insert(path, value.clone());
                }
                UpdateOp::Unset { .. } => {
                    fields.insert(path, Value::String(String::new()));
                }
                UpdateOp::Pull { matcher, .. } => {
                    fields.insert(path, matcher.clone());
                }
                UpdateOp::Inc { by, .. } => {
                    fields.insert(path, Value::Number(by.clone()));
                }
                UpdateOp::Push { value, .. } | UpdateOp::AddToSet { value, .. } => {
                    match fields.remove(&path) {
                        None => {
                            fields.insert(path, value.clone());
                        }
                        Some(Value::Object(mut each)) if each.contains_key("$each") => {
                            if let Some(Value::Array(items)) = each.get_mut("$each") {
                                items.push(value.clone());
                            }
                            fields.insert(path, Value::Object(each));
                        }
                        Some(previous) => {
                            let mut each = Map::new();
                            each.insert(
                                "$each".to_string(),
                                Value::Array(vec![previous, value.clone()]),
                            );
                            fields.insert(path, Value::Object(each));
                        }
                    }
                }
            }
        }
        Value::Object(operators)
    }

    /// Apply every operator in order to `doc`.
    ///
    /// `key_field` names the document's identifier, which no operator may
    /// touch. On error `doc` may be partially updated; callers apply to a
    /// scratch copy and only persist on success.
    pub fn apply(&self, doc: &mut Value, key_field: &str) -> Result<(), UpdateError> {
        for op in &self.ops {
            let path = FieldPath::parse(op.path())?;
            if path.root() == key_field {
                return Err(UpdateError::ImmutableField {
                    field: key_field.to_string(),
                });
            }
            apply_op(doc, &path, op)?;
        }
        Ok(())
    }
}

/// Values carried by a `$push`/`$addToSet` field, expanding `$each`.
fn each_values(value: &Value) -> Vec<Value> {
    match value.get("$each") {
        Some(Value::Array(items)) if value.as_object().is_some_and(|m| m.len() == 1) => {
            items.clone()
        }
        _ => vec![value.clone()],
    }
}

/// Whether a sequence element matches a `$pull` condition.
///
/// A mapping condition matches mapping elements whose listed fields are all
/// equal; anything else matches by equality.
pub fn pull_matches(element: &Value, matcher: &Value) -> bool {
    match (element, matcher) {
        (Value::Object(element), Value::Object(condition)) => condition
            .iter()
            .all(|(key, expected)| element.get(key) == Some(expected)),
        _ => element == matcher,
    }
}

fn apply_op(doc: &mut Value, path: &FieldPath, op: &UpdateOp) -> Result<(), UpdateError> {
    let (parents, last) = path.split_last();
    let Some(parent) = descend(doc, parents, path, op.creates_path())? else {
        // nothing to unset or pull from
        return Ok(());
    };

    match op {
        UpdateOp::Set { value, .. } => {
            *slot(parent, last, path)? = value.clone();
        }
        UpdateOp::Unset { .. } => match parent {
            Value::Object(map) => {
                map.remove(last);
            }
            _ => return Err(conflict(path)),
        },
        UpdateOp::Push { value, .. } => {
            sequence_slot(parent, last, path)?.push(value.clone());
        }
        UpdateOp::AddToSet { value, .. } => {
            let items = sequence_slot(parent, last, path)?;
            if !items.contains(value) {
                items.push(value.clone());
            }
        }
        UpdateOp::Pull { matcher, .. } => match existing_child(parent, last, path)? {
            None => {}
            Some(Value::Array(items)) => items.retain(|item| !pull_matches(item, matcher)),
            Some(_) => {
                return Err(UpdateError::NotASequence {
                    path: path.to_string(),
                })
            }
        },
        UpdateOp::Inc { by, .. } => {
            let target = slot(parent, last, path)?;
            *target = increment(target, by, path)?;
        }
    }
    Ok(())
}

/// Walk to the parent of the final segment.
///
/// Returns `None` when an intermediate is missing and `create` is false.
fn descend<'v>(
    mut current: &'v mut Value,
    segments: &[String],
    path: &FieldPath,
    create: bool,
) -> Result<Option<&'v mut Value>, UpdateError> {
    for segment in segments {
        current = match current {
            Value::Object(map) => {
                if !map.contains_key(segment) {
                    if !create {
                        return Ok(None);
                    }
                    map.insert(segment.clone(), Value::Object(Map::new()));
                }
                match map.get_mut(segment) {
                    Some(child) => child,
                    None => return Err(conflict(path)),
                }
            }
            Value::Array(items) => {
                let index = segment.parse::<usize>().map_err(|_| conflict(path))?;
                match items.get_mut(index) {
                    Some(child) => child,
                    None if create => return Err(conflict(path)),
                    None => return Ok(None),
                }
            }
            _ => return Err(conflict(path)),
        };
    }
    Ok(Some(current))
}

/// Mutable slot for `key` under `parent`, created as null if absent.
fn slot<'v>(parent: &'v mut Value, key: &str, path: &FieldPath) -> Result<&'v mut Value, UpdateError> {
    match parent {
        Value::Object(map) => Ok(map.entry(key.to_string()).or_insert(Value::Null)),
        Value::Array(items) => {
            let index = key.parse::<usize>().map_err(|_| conflict(path))?;
            items.get_mut(index).ok_or_else(|| conflict(path))
        }
        _ => Err(conflict(path)),
    }
}

fn existing_child<'v>(
    parent: &'v mut Value,
    key: &str,
    path: &FieldPath,
) -> Result<Option<&'v mut Value>, UpdateError> {
    match parent {
        Value::Object(map) => Ok(map.get_mut(key)),
        Value::Array(items) => {
            let index = key.parse::<usize>().map_err(|_| conflict(path))?;
            Ok(items.get_mut(index))
        }
        _ => Err(conflict(path)),
    }
}

fn sequence_slot<'v>(
    parent: &'v mut Value,
    key: &str,
    path: &FieldPath,
) -> Result<&'v mut Vec<Value>, UpdateError> {
    let target = slot(parent, key, path)?;
    if target.is_null() {
        *target = Value::Array(Vec::new());
    }
    match target {
        Value::Array(items) => Ok(items),
        _ => Err(UpdateError::NotASequence {
            path: path.to_string(),
        }),
    }
}

fn increment(current: &Value, by: &Number, path: &FieldPath) -> Result<Value, UpdateError> {
    let not_a_number = || UpdateError::NotANumber {
        path: path.to_string(),
    };
    if current.is_null() {
        return Ok(Value::Number(by.clone()));
    }
    let Value::Number(current) = current else {
        return Err(not_a_number());
    };
    if let (Some(a), Some(b)) = (current.as_i64(), by.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Value::from(sum));
        }
    }
    let sum = current.as_f64().unwrap_or_default() + by.as_f64().unwrap_or_default();
    Number::from_f64(sum).map(Value::Number).ok_or_else(not_a_number)
}

fn conflict(path: &FieldPath) -> UpdateError {
    UpdateError::PathConflict {
        path: path.to_string(),
    }
}

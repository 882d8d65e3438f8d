//! Field-level differences between two JSON documents.
//!
//! A [Patch] is the minimal set of object-key writes and removals that turns one document body
//! into another. Arrays and scalars are never diffed internally, a change anywhere inside one
//! replaces it whole. This keeps every operation expressible as a single SQLite
//! `json_set`/`json_remove` call (see [json_path]).
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write;

use crate::error::JobsiteError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PatchOp {
    Set { path: Vec<String>, value: Value },
    Remove { path: Vec<String> },
}

impl PatchOp {
    pub fn path(&self) -> &[String] {
        match self {
            PatchOp::Set { path, .. } => path,
            PatchOp::Remove { path } => path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Vec<PatchOp>);

impl Patch {
    pub fn new(ops: Vec<PatchOp>) -> Patch {
        Patch(ops)
    }

    /// Set a single top-level or nested field.
    pub fn set<S: ToString>(path: &[S], value: Value) -> Patch {
        Patch(vec![PatchOp::Set {
            path: path.iter().map(|s| s.to_string()).collect(),
            value,
        }])
    }

    /// Ops that turn `old` into `new`. Identical inputs produce an empty patch.
    pub fn between(old: &Value, new: &Value) -> Patch {
        let mut ops = Vec::new();
        let mut path = Vec::new();
        diff_into(old, new, &mut path, &mut ops);
        Patch(ops)
    }

    pub fn apply(&self, target: &mut Value) {
        for op in self.0.iter() {
            match op {
                PatchOp::Set { path, value } => set_at(target, path, value.clone()),
                PatchOp::Remove { path } => remove_at(target, path),
            }
        }
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend(&mut self, other: Patch) {
        self.0.extend(other.0);
    }
}

impl IntoIterator for Patch {
    type Item = PatchOp;
    type IntoIter = std::vec::IntoIter<PatchOp>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

fn diff_into(old: &Value, new: &Value, path: &mut Vec<String>, ops: &mut Vec<PatchOp>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    let mut removed = path.clone();
                    removed.push(key.clone());
                    ops.push(PatchOp::Remove { path: removed });
                }
            }
            for (key, new_value) in new_map.iter() {
                path.push(key.clone());
                match old_map.get(key) {
                    Some(old_value) => diff_into(old_value, new_value, path, ops),
                    None => ops.push(PatchOp::Set {
                        path: path.clone(),
                        value: new_value.clone(),
                    }),
                }
                path.pop();
            }
        }
        _ => ops.push(PatchOp::Set {
            path: path.clone(),
            value: new.clone(),
        }),
    }
}

fn set_at(target: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *target = value;
        return;
    };
    let mut cursor = target;
    for key in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        cursor = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert(last.clone(), value);
    }
}

fn remove_at(target: &mut Value, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        *target = Value::Null;
        return;
    };
    let mut cursor = target;
    for key in parents {
        match cursor.get_mut(key) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Value::Object(map) = cursor {
        map.remove(last);
    }
}

/// Render `path` as an SQLite JSON path (`$."a"."b"`). Keys may not contain double quotes.
pub fn json_path<S: AsRef<str>>(path: &[S]) -> Result<String, JobsiteError> {
    let mut rendered = String::from("$");
    for key in path {
        let key = key.as_ref();
        if key.contains('"') {
            return Err(JobsiteError::Validation(format!(
                "JSON key '{key}' cannot be addressed by path"
            )));
        }
        write!(rendered, ".\"{key}\"")?;
    }
    Ok(rendered)
}

//! Identity-keyed registry of the variables seen by one trace.
//!
//! Keys are [`ObjectId`]s, never values: two equal tensors in two locals are
//! two entries, and one tensor in two locals is one entry with one guard.
//! Each entry keeps a clone of its value so the identity stays reserved for
//! the lifetime of the trace.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::host::value::{ObjectId, Value};

use super::error::{TraceError, TraceResult};
use super::variables::Variable;

#[derive(Debug)]
struct Entry {
    value: Value,
    var: Variable,
}

#[derive(Debug, Default)]
pub struct ObjectTable {
    index: HashMap<ObjectId, usize>,
    entries: Vec<Entry>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `var` for `value`. Callers check [`contains`](Self::contains)
    /// first; a second registration is an error.
    pub fn add(&mut self, var: Variable, value: Value) -> TraceResult<()> {
        let id = value.id();
        if self.index.contains_key(&id) {
            return Err(TraceError::DuplicateObject(describe(&value)));
        }
        self.index.insert(id, self.entries.len());
        self.entries.push(Entry { value, var });
        Ok(())
    }

    /// The variable registered for `value`.
    ///
    /// With `allow_unexist_const`, an unregistered constant-like value (a
    /// scalar, `None`, a slice or a builtin) gets an unguarded wrapper made on
    /// the spot. The table itself is not modified.
    pub fn get(&self, value: &Value, allow_unexist_const: bool) -> TraceResult<Cow<'_, Variable>> {
        if let Some(&i) = self.index.get(&value.id()) {
            return Ok(Cow::Borrowed(&self.entries[i].var));
        }
        if allow_unexist_const {
            if let Some(var) = Variable::constant(value) {
                return Ok(Cow::Owned(var));
            }
        }
        Err(TraceError::MissingObject(describe(value)))
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.index.contains_key(&value.id())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Variable)> {
        self.entries.iter().map(|e| (&e.value, &e.var))
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.entries.iter().map(|e| &e.var)
    }
}

fn describe(value: &Value) -> String {
    format!("{} at {}", value.type_name(), value.id())
}

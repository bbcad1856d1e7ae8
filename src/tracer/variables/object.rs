use crate::host::value::Value;
use crate::tracer::access::AccessPath;
use crate::tracer::codegen::{GuardBuilder, GuardCheck};

use super::Origin;

/// Builtin, module or user function, guarded by identity.
///
/// Keeps the object alive so its identity cannot be reused while a guard
/// refers to it.
#[derive(Debug, Clone)]
pub struct ObjectVar {
    object: Value,
    pub(super) origin: Origin,
}

impl ObjectVar {
    pub fn new(object: Value, origin: Origin) -> Self {
        Self { object, origin }
    }

    pub fn object(&self) -> &Value {
        &self.object
    }

    pub(super) fn make_guard_inner(&self, path: &AccessPath, codegen: &mut GuardBuilder) {
        codegen.add_check(path.clone(), GuardCheck::Identity(self.object.clone()));
    }
}

/// The NULL slot `LOAD_METHOD` leaves under a plain attribute.
///
/// Nothing to check: the slot is NULL whenever the same instructions ran.
#[derive(Debug, Clone)]
pub struct NullVar {
    pub(super) origin: Origin,
}

impl NullVar {
    pub fn new(origin: Origin) -> Self {
        Self { origin }
    }
}

use crate::tracer::access::AccessPath;
use crate::tracer::codegen::{GuardBuilder, GuardCheck};
use crate::tracer::graph::{Literal, Scalar};

use super::Origin;

/// Int, float, bool or str. Guarded by exact value.
#[derive(Debug, Clone)]
pub struct ScalarVar {
    value: Scalar,
    pub(super) origin: Origin,
}

impl ScalarVar {
    pub fn new(value: Scalar, origin: Origin) -> Self {
        Self { value, origin }
    }

    pub fn value(&self) -> &Scalar {
        &self.value
    }

    pub(super) fn make_guard_inner(&self, path: &AccessPath, codegen: &mut GuardBuilder) {
        codegen.add_check(path.clone(), GuardCheck::Scalar(self.value.clone()));
    }
}

/// Structured literal: `None` or a slice.
#[derive(Debug, Clone)]
pub struct ConstVar {
    literal: Literal,
    pub(super) origin: Origin,
}

impl ConstVar {
    pub fn new(literal: Literal, origin: Origin) -> Self {
        Self { literal, origin }
    }

    pub fn literal(&self) -> &Literal {
        &self.literal
    }

    pub(super) fn make_guard_inner(&self, path: &AccessPath, codegen: &mut GuardBuilder) {
        codegen.add_check(path.clone(), GuardCheck::Literal(self.literal.clone()));
    }
}

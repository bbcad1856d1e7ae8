//! Tracked runtime values.
//!
//! Every value the tracer reads is wrapped in a [`Variable`]. A variable can
//! do three things:
//!
//! - `make_guard`: add the checks that must hold for the trace to be reused
//! - `make_output`: reproduce its value when a cached graph writes state back
//! - `as_graph_node`: act as an operand of a graph node
//!
//! A variable read from the frame at trace start carries
//! [`Origin::Guarded`] with the path it was read from. Results of graph
//! operations and synthesized constants are [`Origin::Derived`]: they need no
//! guard and have no path.

mod object;
mod scalar;
mod tensor;

pub use object::{NullVar, ObjectVar};
pub use scalar::{ConstVar, ScalarVar};
pub use tensor::TensorVar;

use crate::host::value::{Object, Value};

use super::access::AccessPath;
use super::cache::StorePos;
use super::codegen::{GraphFnBuilder, GuardBuilder};
use super::error::{TraceError, TraceResult};
use super::graph::{GraphBuilder, Literal, Operand, Scalar};

/// Where a variable's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Read from the frame at trace start; must be guarded.
    Guarded(AccessPath),
    /// Produced inside the trace or baked in as a literal.
    Derived,
}

impl Origin {
    pub fn need_guard_check(&self) -> bool {
        matches!(self, Self::Guarded(_))
    }

    pub fn access_path(&self) -> Option<&AccessPath> {
        match self {
            Self::Guarded(path) => Some(path),
            Self::Derived => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Variable {
    Scalar(ScalarVar),
    Tensor(TensorVar),
    Null(NullVar),
    Object(ObjectVar),
    Const(ConstVar),
}

impl Variable {
    /// Wrap a value read from `path`. Tensors become graph placeholders.
    pub fn from_value(value: &Value, path: AccessPath, graph: &mut GraphBuilder) -> TraceResult<Self> {
        if let Object::Tensor(t) = value.object() {
            return Ok(Self::Tensor(TensorVar::placeholder(t, path, graph)));
        }
        let origin = Origin::Guarded(path);
        if let Some(scalar) = Scalar::from_value(value) {
            return Ok(Self::Scalar(ScalarVar::new(scalar, origin)));
        }
        match value.object() {
            Object::Null => Ok(Self::Null(NullVar::new(origin))),
            Object::Builtin(_) | Object::Module(_) | Object::Function(_) => {
                Ok(Self::Object(ObjectVar::new(value.clone(), origin)))
            }
            Object::None | Object::Slice(_) => match Literal::from_value(value) {
                Some(literal) => Ok(Self::Const(ConstVar::new(literal, origin))),
                None => Err(TraceError::UnknownType(value.type_name())),
            },
            _ => Err(TraceError::UnknownType(value.type_name())),
        }
    }

    /// Unguarded wrapper for a constant-like value not read from the frame.
    pub fn constant(value: &Value) -> Option<Self> {
        if let Some(scalar) = Scalar::from_value(value) {
            return Some(Self::Scalar(ScalarVar::new(scalar, Origin::Derived)));
        }
        match value.object() {
            Object::Null => Some(Self::Null(NullVar::new(Origin::Derived))),
            Object::None | Object::Slice(_) => {
                Literal::from_value(value).map(|lit| Self::Const(ConstVar::new(lit, Origin::Derived)))
            }
            Object::Builtin(_) => Some(Self::Object(ObjectVar::new(value.clone(), Origin::Derived))),
            _ => None,
        }
    }

    pub fn origin(&self) -> &Origin {
        match self {
            Self::Scalar(v) => &v.origin,
            Self::Tensor(v) => &v.origin,
            Self::Null(v) => &v.origin,
            Self::Object(v) => &v.origin,
            Self::Const(v) => &v.origin,
        }
    }

    #[inline]
    pub fn need_guard_check(&self) -> bool {
        self.origin().need_guard_check()
    }

    #[inline]
    pub fn access_path(&self) -> Option<&AccessPath> {
        self.origin().access_path()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Tensor(_) => "tensor",
            Self::Null(_) => "null",
            Self::Object(_) => "object",
            Self::Const(_) => "const",
        }
    }

    /// Append this variable's checks. Derived variables add nothing.
    pub fn make_guard(&self, codegen: &mut GuardBuilder) {
        let Origin::Guarded(path) = self.origin() else {
            return;
        };
        match self {
            Self::Scalar(v) => v.make_guard_inner(path, codegen),
            Self::Tensor(v) => v.make_guard_inner(path, codegen),
            Self::Null(_) => {}
            Self::Object(v) => v.make_guard_inner(path, codegen),
            Self::Const(v) => v.make_guard_inner(path, codegen),
        }
    }

    /// Schedule writing this variable's value to `pos` under `name`.
    pub fn make_output(&self, name: &str, pos: StorePos, codegen: &mut GraphFnBuilder) {
        match self {
            Self::Scalar(v) => codegen.output_value(name, pos, v.value().to_value()),
            Self::Tensor(v) => codegen.output_node(name, pos, v.node()),
            Self::Null(_) => codegen.output_value(name, pos, Value::null()),
            Self::Object(v) => codegen.output_value(name, pos, v.object().clone()),
            Self::Const(v) => codegen.output_value(name, pos, v.literal().to_value()),
        }
    }

    /// Operand form for a graph node.
    pub fn as_graph_node(&self) -> TraceResult<Operand> {
        match self {
            Self::Scalar(v) => Ok(Operand::Literal(Literal::Scalar(v.value().clone()))),
            Self::Tensor(v) => Ok(Operand::Node(v.node())),
            Self::Const(v) => Ok(Operand::Literal(v.literal().clone())),
            Self::Null(_) | Self::Object(_) => Err(TraceError::NotRepresentable(self.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tensor::Tensor;
    use crate::host::value::{Builtin, SliceValue};

    #[test]
    fn test_from_value_kinds() {
        let mut graph = GraphBuilder::new(Value::none());
        let path = || AccessPath::local("v");

        let s = Variable::from_value(&Value::int(1), path(), &mut graph).unwrap();
        assert_eq!(s.kind(), "scalar");
        assert!(s.need_guard_check());
        assert_eq!(s.access_path(), Some(&path()));

        let t = Value::tensor(Tensor::from_vec(&[2], vec![1.0, 2.0]).unwrap());
        let tv = Variable::from_value(&t, path(), &mut graph).unwrap();
        assert_eq!(tv.kind(), "tensor");
        assert_eq!(graph.graph().placeholder_count(), 1);

        let n = Variable::from_value(&Value::null(), path(), &mut graph).unwrap();
        assert!(n.as_graph_node().is_err());

        let b = Variable::from_value(&Value::builtin(Builtin::Add), path(), &mut graph).unwrap();
        assert_eq!(b.kind(), "object");

        let c = Variable::from_value(&Value::slice(SliceValue::default()), path(), &mut graph).unwrap();
        assert_eq!(c.kind(), "const");
    }

    #[test]
    fn test_unknown_types_rejected() {
        let mut graph = GraphBuilder::new(Value::none());
        let err = Variable::from_value(&Value::tuple(vec![]), AccessPath::local("t"), &mut graph).unwrap_err();
        assert!(matches!(err, TraceError::UnknownType("tuple")));
        let err = Variable::from_value(&Value::opaque("socket"), AccessPath::local("o"), &mut graph).unwrap_err();
        assert!(matches!(err, TraceError::UnknownType("object")));
        assert!(graph.graph().is_empty());
    }

    #[test]
    fn test_constants_are_unguarded() {
        let c = Variable::constant(&Value::float(2.5)).unwrap();
        assert!(!c.need_guard_check());
        assert!(c.access_path().is_none());
        assert!(Variable::constant(&Value::none()).is_some());
        assert!(Variable::constant(&Value::builtin(Builtin::Relu)).is_some());
        assert!(Variable::constant(&Value::tuple(vec![])).is_none());
        let null = Variable::constant(&Value::null()).unwrap();
        assert_eq!(null.kind(), "null");
        assert!(!null.need_guard_check());
    }

    #[test]
    fn test_derived_variable_adds_no_guard() {
        let mut guards = GuardBuilder::new(false);
        Variable::constant(&Value::int(3)).unwrap().make_guard(&mut guards);
        assert_eq!(guards.len(), 0);
    }

    #[test]
    fn test_null_adds_no_guard() {
        let mut graph = GraphBuilder::new(Value::none());
        let mut guards = GuardBuilder::new(false);
        Variable::from_value(&Value::null(), AccessPath::Stack(1), &mut graph)
            .unwrap()
            .make_guard(&mut guards);
        assert_eq!(guards.len(), 0);
    }
}

use crate::host::tensor::{DType, Shape, Tensor};
use crate::tracer::access::AccessPath;
use crate::tracer::codegen::GuardBuilder;
use crate::tracer::graph::{GraphBuilder, NodeId};

use super::Origin;

/// A tensor bound to a graph node.
///
/// A guarded tensor is a graph input: its node is a placeholder fed from the
/// access path. A derived tensor is the result of an earlier node.
#[derive(Debug, Clone)]
pub struct TensorVar {
    node: NodeId,
    dtype: DType,
    shape: Shape,
    pub(super) origin: Origin,
}

impl TensorVar {
    /// Graph input fed from `path`.
    pub(super) fn placeholder(tensor: &Tensor, path: AccessPath, graph: &mut GraphBuilder) -> Self {
        let node = graph.create_placeholder(path.clone());
        Self::bind(tensor, node, Origin::Guarded(path))
    }

    /// Result of `node`, observed as `tensor` once the host ran it.
    pub fn from_node(tensor: &Tensor, node: NodeId) -> Self {
        Self::bind(tensor, node, Origin::Derived)
    }

    fn bind(tensor: &Tensor, node: NodeId, origin: Origin) -> Self {
        Self {
            node,
            dtype: tensor.dtype(),
            shape: Shape::from_slice(tensor.shape()),
            origin,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub(super) fn make_guard_inner(&self, path: &AccessPath, codegen: &mut GuardBuilder) {
        codegen.add_tensor_check(path.clone(), self.dtype, &self.shape);
    }
}

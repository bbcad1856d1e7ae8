//! Reference graph backend.
//!
//! [`InterpreterBackend`] drops nodes no output depends on, resolves
//! `call_module` paths once at compile time and then evaluates the remaining
//! nodes in order with the host kernels from [`crate::host::ops`].

use std::sync::Arc;

use crate::host::ops;
use crate::host::value::{Module, Value};

use super::error::{CompileError, GraphError};
use super::graph::{CompiledArtifact, Graph, GraphCompiler, Node, NodeId, NodeOp, Operand};

#[derive(Debug, Default, Clone, Copy)]
pub struct InterpreterBackend;

impl InterpreterBackend {
    pub fn new() -> Self {
        Self
    }
}

struct Step {
    node: Node,
    /// Resolved submodule for `call_module` nodes
    module: Option<Value>,
}

/// Compiled form: live nodes in program order.
struct InterpretedGraph {
    node_count: usize,
    /// Placeholder node for each input position
    inputs: Vec<NodeId>,
    steps: Vec<Step>,
    outputs: Vec<NodeId>,
}

impl GraphCompiler for InterpreterBackend {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn compile(&self, graph: &Graph, outputs: &[NodeId]) -> Result<Arc<dyn CompiledArtifact>, CompileError> {
        let mut live = vec![false; graph.len()];
        for &out in outputs {
            let slot = live.get_mut(out.index()).ok_or(CompileError::UnknownNode(out))?;
            *slot = true;
        }
        for node in graph.nodes().iter().rev() {
            if !live[node.id.index()] {
                continue;
            }
            for operand in node.operands() {
                if let Operand::Node(dep) = operand {
                    if dep.index() >= node.id.index() {
                        return Err(CompileError::ForwardReference {
                            node: node.id,
                            operand: *dep,
                        });
                    }
                    live[dep.index()] = true;
                }
            }
        }

        let mut steps = Vec::new();
        for node in graph.nodes() {
            if !live[node.id.index()] {
                continue;
            }
            let module = match &node.op {
                NodeOp::Placeholder { .. } => continue,
                NodeOp::CallFunction(_) => None,
                NodeOp::CallModule { path } => Some(
                    Module::resolve_path(graph.root(), path)
                        .filter(|m| m.as_module().is_some_and(|m| m.is_leaf()))
                        .ok_or_else(|| CompileError::UnknownModule(path.clone()))?,
                ),
            };
            steps.push(Step {
                node: node.clone(),
                module,
            });
        }

        let artifact: Arc<dyn CompiledArtifact> = Arc::new(InterpretedGraph {
            node_count: graph.len(),
            inputs: graph.inputs().iter().map(|(id, _)| *id).collect(),
            steps,
            outputs: outputs.to_vec(),
        });
        Ok(artifact)
    }
}

impl InterpretedGraph {
    fn operand(env: &[Option<Value>], operand: &Operand) -> Result<Value, GraphError> {
        match operand {
            Operand::Node(id) => env
                .get(id.index())
                .and_then(Option::clone)
                .ok_or(GraphError::UnboundNode(*id)),
            Operand::Literal(lit) => Ok(lit.to_value()),
        }
    }
}

impl CompiledArtifact for InterpretedGraph {
    fn run(&self, inputs: &[Value]) -> Result<Vec<Value>, GraphError> {
        if inputs.len() != self.inputs.len() {
            return Err(GraphError::InputCount {
                expected: self.inputs.len(),
                got: inputs.len(),
            });
        }

        let mut env: Vec<Option<Value>> = vec![None; self.node_count];
        for (id, value) in self.inputs.iter().zip(inputs) {
            env[id.index()] = Some(value.clone());
        }

        for step in &self.steps {
            let args = step
                .node
                .args
                .iter()
                .map(|a| Self::operand(&env, a))
                .collect::<Result<Vec<_>, _>>()?;
            let kwargs = step
                .node
                .kwargs
                .iter()
                .map(|(name, a)| Ok((name.clone(), Self::operand(&env, a)?)))
                .collect::<Result<Vec<_>, GraphError>>()?;

            let result = match (&step.node.op, &step.module) {
                (NodeOp::CallFunction(builtin), _) => ops::call_builtin_kwargs(*builtin, &args, &kwargs)?,
                (NodeOp::CallModule { .. }, Some(module)) => match module.as_module() {
                    Some(m) => ops::call_module(m, &args)?,
                    None => return Err(GraphError::UnboundNode(step.node.id)),
                },
                _ => return Err(GraphError::UnboundNode(step.node.id)),
            };
            env[step.node.id.index()] = Some(result);
        }

        self.outputs
            .iter()
            .enumerate()
            .map(|(i, id)| env[id.index()].clone().ok_or(GraphError::MissingOutput(i)))
            .collect()
    }
}

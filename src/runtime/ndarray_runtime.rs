use crate::graph_def::{GraphDef, OperatorDef, UpdateTarget};
use crate::runtime::{RunOptions, Runtime};
use crate::store::{StoreError, TensorStore, Workspace};
use ndarray::ArrayD;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Graph \"{0}\" is not registered")]
    UnknownGraph(String),
    #[error("Graph \"{0}\" is already registered")]
    DuplicateGraph(String),
    #[error("Unsupported operator type: {0}")]
    UnsupportedOperator(String),
    #[error("Operator {op} expects {expected} tensors, got {got}")]
    InvalidArity {
        op: String,
        expected: usize,
        got: usize,
    },
    #[error("Missing expected argument \"{arg}\" for op {op}")]
    MissingArgument { op: String, arg: String },
    #[error("Operator {op} cannot combine shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        op: String,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("Tensor \"{0}\" is empty, expected a scalar")]
    EmptyTensor(String),
    #[error("Graph registry lock poisoned")]
    Poisoned,
    #[error(transparent)]
    StoreError(#[from] StoreError),
}

/// Small reference runtime that evaluates graphs against a [`Workspace`].
///
/// Supports `Identity`, `Scale`, `Add`, `Sub` and `Mul` operators and plain
/// `SGDUpdate` targets. It exists to drive the compiler end to end, not to be
/// fast.
pub struct NDArrayRuntime {
    workspace: Arc<Workspace>,
    graphs: RwLock<HashMap<String, GraphDef>>,
}

impl NDArrayRuntime {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            workspace,
            graphs: RwLock::new(HashMap::new()),
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn get_graph(&self, name: &str) -> Result<GraphDef, RuntimeError> {
        self.graphs
            .read()
            .map_err(|_| RuntimeError::Poisoned)?
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownGraph(name.to_string()))
    }

    fn run_operator(&self, op: &OperatorDef) -> Result<(), RuntimeError> {
        let inputs = op
            .input
            .iter()
            .map(|x| self.workspace.fetch(x))
            .collect::<Result<Vec<_>, _>>()?;

        let value = match op.r#type.as_str() {
            "Identity" => {
                check_arity(op, inputs.len(), 1)?;
                inputs[0].clone()
            }
            "Scale" => {
                check_arity(op, inputs.len(), 1)?;
                let scale = op
                    .get_arg("scale")
                    .and_then(|a| a.f)
                    .ok_or_else(|| RuntimeError::MissingArgument {
                        op: op.name.clone(),
                        arg: "scale".to_string(),
                    })?;
                inputs[0].mapv(|x| x * scale)
            }
            "Add" => {
                check_arity(op, inputs.len(), 2)?;
                binary(op, &inputs[0], &inputs[1], |a, b| a + b)?
            }
            "Sub" => {
                check_arity(op, inputs.len(), 2)?;
                binary(op, &inputs[0], &inputs[1], |a, b| a - b)?
            }
            "Mul" => {
                check_arity(op, inputs.len(), 2)?;
                binary(op, &inputs[0], &inputs[1], |a, b| a * b)?
            }
            other => return Err(RuntimeError::UnsupportedOperator(other.to_string())),
        };

        let output = op.output.first().ok_or(RuntimeError::InvalidArity {
            op: op.name.clone(),
            expected: 1,
            got: 0,
        })?;
        self.workspace.insert(output, value)?;
        Ok(())
    }

    fn apply_update(&self, target: &UpdateTarget) -> Result<(), RuntimeError> {
        if target.r#type != "SGDUpdate" {
            return Err(RuntimeError::UnsupportedOperator(target.r#type.clone()));
        }
        let [param_name, grad_name] = target.tensor.as_slice() else {
            return Err(RuntimeError::InvalidArity {
                op: target.name.clone(),
                expected: 2,
                got: target.tensor.len(),
            });
        };
        let domain = target
            .get_arg("domain")
            .and_then(|a| a.s.clone())
            .unwrap_or_default();
        let lr_mult = target.get_arg("lr_mult").and_then(|a| a.f).unwrap_or(1.0);
        let base_lr = self.scalar(&format!("{domain}base_lr"))?;
        let scale_gradient = if self.workspace.contains(&format!("{domain}scale_gradient"))? {
            self.scalar(&format!("{domain}scale_gradient"))?
        } else {
            1.0
        };

        let mut param = self.workspace.fetch(param_name)?;
        let grad = self.workspace.fetch(grad_name)?;
        if param.shape() != grad.shape() {
            return Err(RuntimeError::ShapeMismatch {
                op: target.name.clone(),
                lhs: param.shape().to_vec(),
                rhs: grad.shape().to_vec(),
            });
        }
        let step = base_lr * lr_mult * scale_gradient;
        param.zip_mut_with(&grad, |p, g| *p -= step * g);
        self.workspace.insert(param_name, param)?;
        Ok(())
    }

    fn scalar(&self, name: &str) -> Result<f32, RuntimeError> {
        let value = self.workspace.fetch(name)?;
        value
            .iter()
            .next()
            .copied()
            .ok_or_else(|| RuntimeError::EmptyTensor(name.to_string()))
    }
}

fn check_arity(op: &OperatorDef, got: usize, expected: usize) -> Result<(), RuntimeError> {
    if got != expected {
        return Err(RuntimeError::InvalidArity {
            op: op.name.clone(),
            expected,
            got,
        });
    }
    Ok(())
}

fn binary(
    op: &OperatorDef,
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>, RuntimeError> {
    if a.shape() == b.shape() {
        let mut out = a.clone();
        out.zip_mut_with(b, |x, y| *x = f(*x, *y));
        Ok(out)
    } else if b.len() == 1 {
        let y = b.iter().next().copied().unwrap_or_default();
        Ok(a.mapv(|x| f(x, y)))
    } else if a.len() == 1 {
        let x = a.iter().next().copied().unwrap_or_default();
        Ok(b.mapv(|y| f(x, y)))
    } else {
        Err(RuntimeError::ShapeMismatch {
            op: op.name.clone(),
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        })
    }
}

impl Runtime for NDArrayRuntime {
    fn register_graph(&self, graph_def: GraphDef) -> anyhow::Result<()> {
        let mut guard = self.graphs.write().map_err(|_| RuntimeError::Poisoned)?;
        if guard.contains_key(&graph_def.name) {
            return Err(RuntimeError::DuplicateGraph(graph_def.name).into());
        }
        log::debug!(
            "Registered {} with {} operators and {} update targets",
            graph_def.name,
            graph_def.op.len(),
            graph_def.u_target.len()
        );
        guard.insert(graph_def.name.clone(), graph_def);
        Ok(())
    }

    fn run(
        &self,
        graph_name: &str,
        inputs: Vec<(String, ArrayD<f32>)>,
        outputs: &[String],
        options: &RunOptions,
    ) -> anyhow::Result<Vec<(String, ArrayD<f32>)>> {
        let graph = self.get_graph(graph_name)?;
        for (name, value) in inputs {
            self.workspace.feed(&name, value)?;
        }
        for op in &graph.op {
            self.run_operator(op)?;
        }
        for target in &graph.u_target {
            self.apply_update(target)?;
        }
        if !options.return_outputs {
            return Ok(vec![]);
        }
        let mut results = Vec::with_capacity(outputs.len());
        for name in outputs {
            results.push((name.clone(), self.workspace.fetch(name)?));
        }
        Ok(results)
    }
}

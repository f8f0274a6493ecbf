use crate::expression::Variable;
use crate::graph_def::{GradientTarget, OperatorDef};
use crate::options::Phase;
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum GradientError {
    #[error("Gradients were requested but no gradient maker is configured")]
    MissingGradientMaker,
    #[error(transparent)]
    Maker(anyhow::Error),
}

/// Builds the backward pass for a forward operator list.
///
/// Returns the (possibly annotated) forward operators and the backward
/// operators, in execution order.
pub trait GradientMaker: Send + Sync {
    fn make(
        &self,
        forward_ops: Vec<OperatorDef>,
        costs: &[String],
    ) -> anyhow::Result<(Vec<OperatorDef>, Vec<OperatorDef>)>;
}

pub fn inject_gradients(
    maker: Option<&dyn GradientMaker>,
    forward_ops: Vec<OperatorDef>,
    costs: &[String],
) -> Result<(Vec<OperatorDef>, Vec<OperatorDef>), GradientError> {
    let maker = maker.ok_or(GradientError::MissingGradientMaker)?;
    let num_forward = forward_ops.len();
    let (forward_ops, backward_ops) = maker
        .make(forward_ops, costs)
        .map_err(GradientError::Maker)?;
    log::debug!(
        "Gradient maker turned {} forward operators into {} forward and {} backward operators",
        num_forward,
        forward_ops.len(),
        backward_ops.len()
    );
    Ok((forward_ops, backward_ops))
}

/// Every distinct (cost, wrt) request across `outputs`.
pub fn gradient_targets(outputs: &[Variable]) -> Vec<GradientTarget> {
    let mut pairs = BTreeSet::new();
    for output in outputs {
        for wrt in output.grad_wrts() {
            pairs.insert((output.name().to_string(), wrt.clone()));
        }
    }
    pairs
        .into_iter()
        .map(|(cost, wrt)| GradientTarget { cost, wrt })
        .collect()
}

/// An explicit phase wins; otherwise `TRAIN` iff any output requests gradients.
pub fn infer_phase(outputs: &[Variable], explicit: Option<Phase>) -> Phase {
    if let Some(phase) = explicit {
        return phase;
    }
    if outputs.iter().any(|x| !x.grad_wrts().is_empty()) {
        Phase::Train
    } else {
        Phase::Test
    }
}

use crate::expression::{Expressions, OperatorId, Variable};
use std::collections::BTreeSet;
use std::collections::btree_map::Entry;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("Operator id {} is claimed by both {existing} and {incoming}", .id.index())]
    OperatorIdCollision {
        id: OperatorId,
        existing: String,
        incoming: String,
    },
}

pub struct MergedExpressions {
    /// Requested output names followed by extra targets, without repeats.
    pub targets: Vec<String>,
    /// Owned copies of every defining operator, keyed (and thus ordered) by creation.
    pub operators: Expressions,
    pub has_gradients: bool,
}

/// Union the defining subgraphs of `outputs` into one deduplicated operator set.
///
/// The operators are cloned, so rewriting the result never touches the
/// expressions held by the variables. Two distinct operators under one id mean
/// the variables were built by unrelated contexts, and are rejected.
pub fn merge_expressions(outputs: &[Variable]) -> Result<MergedExpressions, MergeError> {
    let mut operators = Expressions::new();
    let mut extra_targets = BTreeSet::new();
    let mut has_gradients = false;

    for output in outputs {
        for (id, op) in output.expressions() {
            match operators.entry(*id) {
                Entry::Vacant(entry) => {
                    entry.insert(op.clone());
                }
                Entry::Occupied(entry) => {
                    if entry.get().name != op.name {
                        return Err(MergeError::OperatorIdCollision {
                            id: *id,
                            existing: entry.get().name.clone(),
                            incoming: op.name.clone(),
                        });
                    }
                }
            }
        }
        extra_targets.extend(output.extra_targets().iter().cloned());
        if !output.grad_wrts().is_empty() {
            has_gradients = true;
        }
    }

    let mut targets: Vec<String> = Vec::new();
    for name in outputs
        .iter()
        .map(|x| x.name().to_string())
        .chain(extra_targets)
    {
        if !targets.contains(&name) {
            targets.push(name);
        }
    }

    log::debug!(
        "Merged {} outputs into {} operators",
        outputs.len(),
        operators.len()
    );

    Ok(MergedExpressions {
        targets,
        operators,
        has_gradients,
    })
}

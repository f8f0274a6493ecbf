use crate::expression::{Expressions, Variable};
use crate::graph_def::OperatorDef;
use crate::store::TensorStore;
use ndarray::ArrayD;
use std::collections::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum GivensError {
    #[error("Unknown substitution target \"{0}\": no operator in the graph consumes it")]
    UnknownSubstitutionTarget(String),
    #[error(transparent)]
    Store(anyhow::Error),
}

#[derive(Debug, Clone)]
pub enum GivenValue {
    Variable(Variable),
    Array(ArrayD<f32>),
}

impl From<Variable> for GivenValue {
    fn from(value: Variable) -> Self {
        GivenValue::Variable(value)
    }
}

impl From<&Variable> for GivenValue {
    fn from(value: &Variable) -> Self {
        GivenValue::Variable(value.clone())
    }
}

impl From<ArrayD<f32>> for GivenValue {
    fn from(value: ArrayD<f32>) -> Self {
        GivenValue::Array(value)
    }
}

/// Substitutions applied to the forward graph before it is registered.
#[derive(Debug, Clone, Default)]
pub struct Givens {
    entries: Vec<(String, GivenValue)>,
}

impl Givens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, original: &Variable, replacement: impl Into<GivenValue>) -> Self {
        self.insert(original, replacement);
        self
    }

    pub fn insert(&mut self, original: &Variable, replacement: impl Into<GivenValue>) {
        let name = original.name().to_string();
        let replacement = replacement.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == name) {
            entry.1 = replacement;
        } else {
            self.entries.push((name, replacement));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Rewrite `forward` so every consumer of a substituted variable reads its replacement.
///
/// Operators defining variable replacements are placed first; array
/// replacements are fed into `store` under a fresh name. Input lists are
/// rewritten in place and keep their length.
pub fn apply_givens(
    forward: Expressions,
    givens: &Givens,
    store: &dyn TensorStore,
) -> Result<Vec<OperatorDef>, GivensError> {
    let consumed: HashSet<&str> = forward
        .values()
        .flat_map(|op| op.input.iter().map(|x| x.as_str()))
        .collect();
    for (original, _) in &givens.entries {
        if !consumed.contains(original.as_str()) {
            return Err(GivensError::UnknownSubstitutionTarget(original.clone()));
        }
    }

    let mut substitutions: HashMap<&str, String> = HashMap::new();
    let mut external = Expressions::new();
    for (original, replacement) in &givens.entries {
        match replacement {
            GivenValue::Variable(variable) => {
                for (id, op) in variable.expressions() {
                    external.entry(*id).or_insert_with(|| op.clone());
                }
                substitutions.insert(original.as_str(), variable.name().to_string());
            }
            GivenValue::Array(array) => {
                let name = store.generate_name();
                store
                    .feed(&name, array.clone())
                    .map_err(GivensError::Store)?;
                substitutions.insert(original.as_str(), name);
            }
        }
    }

    for (original, replacement) in &substitutions {
        log::debug!("Substituting \"{original}\" with \"{replacement}\"");
    }

    let mut ops: Vec<OperatorDef> = Vec::with_capacity(external.len() + forward.len());
    for (id, mut op) in forward {
        if external.contains_key(&id) {
            continue;
        }
        for input in op.input.iter_mut() {
            if let Some(replacement) = substitutions.get(input.as_str()) {
                *input = replacement.clone();
            }
        }
        ops.push(op);
    }

    let mut result: Vec<OperatorDef> = external.into_values().collect();
    result.extend(ops);
    Ok(result)
}

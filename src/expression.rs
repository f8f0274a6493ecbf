use crate::context::CompilationContext;
use crate::graph_def::{Argument, OperatorDef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Creation index of an operator. Ordering by id is a valid topological order,
/// since an operator is always created after the producers of its inputs.
#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct OperatorId(pub(crate) u64);

impl OperatorId {
    pub fn index(&self) -> u64 {
        self.0
    }
}

pub type Expressions = BTreeMap<OperatorId, OperatorDef>;

/// A named symbolic tensor together with the operators that define it.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    expressions: Arc<Expressions>,
    extra_targets: BTreeSet<String>,
    grad_wrts: Vec<String>,
}

impl Variable {
    /// A leaf: fed by the value store or bound at call time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expressions: Arc::new(Expressions::new()),
            extra_targets: BTreeSet::new(),
            grad_wrts: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expressions(&self) -> &Expressions {
        &self.expressions
    }

    pub fn extra_targets(&self) -> &BTreeSet<String> {
        &self.extra_targets
    }

    pub fn grad_wrts(&self) -> &[String] {
        &self.grad_wrts
    }

    /// Keep `target` alive whenever this variable is compiled.
    pub fn with_extra_target(mut self, target: impl Into<String>) -> Self {
        self.extra_targets.insert(target.into());
        self
    }

    /// Ask for the gradient of this variable with respect to `wrt`.
    pub fn request_grad(&mut self, wrt: &Variable) {
        self.grad_wrts.push(wrt.name.clone());
    }
}

/// Records operators into variable expressions.
#[derive(Debug, Clone)]
pub struct ExpressionBuilder {
    context: Arc<CompilationContext>,
}

impl Default for ExpressionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionBuilder {
    /// A builder drawing operator ids from the process-wide context.
    pub fn new() -> Self {
        Self::with_context(CompilationContext::global())
    }

    pub(crate) fn with_context(context: Arc<CompilationContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<CompilationContext> {
        &self.context
    }

    /// Create an operator of `op_type` over `inputs` with `num_outputs` outputs,
    /// named `<op_type>_<id>:<slot>`.
    pub fn apply(
        &self,
        op_type: &str,
        inputs: &[&Variable],
        arguments: Vec<Argument>,
        num_outputs: usize,
    ) -> Vec<Variable> {
        let (id, op_name) = self.context.next_operator();

        let mut expressions = Expressions::new();
        let mut extra_targets = BTreeSet::new();
        for input in inputs {
            for (k, v) in input.expressions.iter() {
                expressions.entry(*k).or_insert_with(|| v.clone());
            }
            extra_targets.extend(input.extra_targets.iter().cloned());
        }

        let outputs: Vec<String> = (0..num_outputs)
            .map(|slot| format!("{}_{}:{}", op_type, id.0, slot))
            .collect();
        expressions.insert(
            id,
            OperatorDef {
                input: inputs.iter().map(|x| x.name.clone()).collect(),
                output: outputs.clone(),
                name: op_name,
                r#type: op_type.to_string(),
                arg: arguments,
            },
        );

        let expressions = Arc::new(expressions);
        outputs
            .into_iter()
            .map(|name| Variable {
                name,
                expressions: expressions.clone(),
                extra_targets: extra_targets.clone(),
                grad_wrts: Vec::new(),
            })
            .collect()
    }

    pub fn apply_single(&self, op_type: &str, inputs: &[&Variable], arguments: Vec<Argument>) -> Variable {
        let mut outputs = self.apply(op_type, inputs, arguments, 1);
        outputs.remove(0)
    }

    pub fn identity(&self, x: &Variable) -> Variable {
        self.apply_single("Identity", &[x], vec![])
    }

    pub fn scale(&self, x: &Variable, factor: f32) -> Variable {
        self.apply_single("Scale", &[x], vec![Argument::float("scale", factor)])
    }

    pub fn add(&self, a: &Variable, b: &Variable) -> Variable {
        self.apply_single("Add", &[a, b], vec![])
    }

    pub fn sub(&self, a: &Variable, b: &Variable) -> Variable {
        self.apply_single("Sub", &[a, b], vec![])
    }

    pub fn mul(&self, a: &Variable, b: &Variable) -> Variable {
        self.apply_single("Mul", &[a, b], vec![])
    }
}

use crate::context::CompilationContext;
use crate::expression::Variable;
use crate::givens::{Givens, GivensError, apply_givens};
use crate::gradient::{GradientError, GradientMaker, gradient_targets, infer_phase, inject_gradients};
use crate::graph_def::{Argument, GraphDef};
use crate::merge::{MergeError, merge_expressions};
use crate::options::{ExecutionOptions, Phase};
use crate::runtime::{RunOptions, Runtime};
use crate::store::TensorStore;
use crate::update::{NoParallel, ParallelContext, UpdateError, Updater, inject_updates};
use ndarray::ArrayD;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Either outputs or an updater may be specified, not both")]
    ArgumentConflict,
    #[error(transparent)]
    MergeError(#[from] MergeError),
    #[error(transparent)]
    GivensError(#[from] GivensError),
    #[error(transparent)]
    GradientError(#[from] GradientError),
    #[error(transparent)]
    UpdateError(#[from] UpdateError),
    #[error(transparent)]
    Registration(anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Function takes {expected} positional inputs but {got} were given")]
    TooManyArguments { expected: usize, got: usize },
    #[error("\"{0}\" is not an input of this function")]
    UnknownInput(String),
    #[error("Input \"{0}\" was bound more than once")]
    DuplicateArgument(String),
    #[error(transparent)]
    Runtime(anyhow::Error),
}

/// One compilation request: either outputs to evaluate or an updater to apply.
#[derive(Default)]
pub struct FunctionRequest<'a> {
    inputs: Vec<Variable>,
    outputs: Vec<Variable>,
    givens: Givens,
    updater: Option<&'a mut dyn Updater>,
    phase: Option<Phase>,
}

impl<'a> FunctionRequest<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inputs(mut self, inputs: impl IntoIterator<Item = Variable>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    pub fn outputs(mut self, outputs: impl IntoIterator<Item = Variable>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }

    pub fn givens(mut self, givens: Givens) -> Self {
        self.givens = givens;
        self
    }

    pub fn updater(mut self, updater: &'a mut dyn Updater) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }
}

pub struct Compiler {
    context: Arc<CompilationContext>,
    options: ExecutionOptions,
    store: Arc<dyn TensorStore>,
    runtime: Arc<dyn Runtime>,
    gradient_maker: Option<Arc<dyn GradientMaker>>,
    parallel: Arc<dyn ParallelContext>,
}

impl Compiler {
    pub fn new(store: Arc<dyn TensorStore>, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            context: CompilationContext::global(),
            options: ExecutionOptions::default(),
            store,
            runtime,
            gradient_maker: None,
            parallel: Arc::new(NoParallel),
        }
    }

    pub(crate) fn with_context(mut self, context: Arc<CompilationContext>) -> Self {
        self.context = context;
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_gradient_maker(mut self, maker: Arc<dyn GradientMaker>) -> Self {
        self.gradient_maker = Some(maker);
        self
    }

    pub fn with_parallel_context(mut self, parallel: Arc<dyn ParallelContext>) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn context(&self) -> &Arc<CompilationContext> {
        &self.context
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Lower the request into a [`GraphDef`], register it and return a handle to run it.
    pub fn compile(&self, request: FunctionRequest<'_>) -> Result<CompiledFunction, CompileError> {
        let FunctionRequest {
            inputs,
            outputs,
            givens,
            updater,
            phase,
        } = request;

        if !outputs.is_empty() && updater.is_some() {
            return Err(CompileError::ArgumentConflict);
        }

        let mut graph_def = GraphDef::new(self.context.next_graph_name());
        log::debug!("Compiling {}", graph_def.name);

        let merged = merge_expressions(&outputs)?;
        graph_def.target = merged.targets;

        let forward_ops = if givens.is_empty() {
            merged.operators.into_values().collect()
        } else {
            apply_givens(merged.operators, &givens, self.store.as_ref())?
        };

        if merged.has_gradients {
            let costs: Vec<String> = outputs.iter().map(|x| x.name().to_string()).collect();
            let (forward_ops, backward_ops) =
                inject_gradients(self.gradient_maker.as_deref(), forward_ops, &costs)?;
            graph_def.op = forward_ops;
            graph_def.op.extend(backward_ops);
        } else {
            graph_def.op = forward_ops;
        }

        graph_def.device_option = self.options.device_option();
        graph_def.debug_mode = self.options.debug_mode;
        graph_def.share_grads = self.options.share_grads;
        graph_def.g_target = gradient_targets(&outputs);
        let phase = infer_phase(&outputs, phase.or(self.options.phase));
        graph_def.arg.push(Argument::string("phase", phase.to_string()));

        if let Some(updater) = updater {
            inject_updates(
                &mut graph_def,
                updater,
                self.store.as_ref(),
                self.parallel.as_ref(),
                &self.context,
            )?;
        }

        self.runtime
            .register_graph(graph_def.clone())
            .map_err(CompileError::Registration)?;
        log::info!(
            "Created {} ({} operators, {} gradient targets, {} update targets, phase {})",
            graph_def.name,
            graph_def.op.len(),
            graph_def.g_target.len(),
            graph_def.u_target.len(),
            phase
        );

        Ok(CompiledFunction {
            graph_def,
            inputs: inputs.iter().map(|x| x.name().to_string()).collect(),
            outputs: outputs.iter().map(|x| x.name().to_string()).collect(),
            runtime: self.runtime.clone(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FunctionCall {
    pub positional: Vec<ArrayD<f32>>,
    pub named: Vec<(String, ArrayD<f32>)>,
    pub options: RunOptions,
}

/// A registered graph, callable any number of times.
pub struct CompiledFunction {
    graph_def: GraphDef,
    inputs: Vec<String>,
    outputs: Vec<String>,
    runtime: Arc<dyn Runtime>,
}

impl CompiledFunction {
    pub fn name(&self) -> &str {
        &self.graph_def.name
    }

    pub fn graph_def(&self) -> &GraphDef {
        &self.graph_def
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn call(
        &self,
        positional: impl IntoIterator<Item = ArrayD<f32>>,
    ) -> Result<Vec<(String, ArrayD<f32>)>, CallError> {
        self.call_with(FunctionCall {
            positional: positional.into_iter().collect(),
            ..Default::default()
        })
    }

    pub fn call_with(&self, call: FunctionCall) -> Result<Vec<(String, ArrayD<f32>)>, CallError> {
        let bound = self.bind(call.positional, call.named)?;
        self.runtime
            .run(&self.graph_def.name, bound, &self.outputs, &call.options)
            .map_err(CallError::Runtime)
    }

    fn bind(
        &self,
        positional: Vec<ArrayD<f32>>,
        named: Vec<(String, ArrayD<f32>)>,
    ) -> Result<Vec<(String, ArrayD<f32>)>, CallError> {
        if positional.len() > self.inputs.len() {
            return Err(CallError::TooManyArguments {
                expected: self.inputs.len(),
                got: positional.len(),
            });
        }
        let mut bound: Vec<(String, ArrayD<f32>)> =
            self.inputs.iter().cloned().zip(positional).collect();
        for (name, value) in named {
            if !self.inputs.contains(&name) {
                return Err(CallError::UnknownInput(name));
            }
            if bound.iter().any(|(k, _)| *k == name) {
                return Err(CallError::DuplicateArgument(name));
            }
            bound.push((name, value));
        }
        Ok(bound)
    }
}

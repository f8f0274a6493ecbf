use crate::context::CompilationContext;
use crate::expression::Variable;
use crate::graph_def::{Argument, ArgumentValue, GraphDef, UpdateTarget};
use crate::store::TensorStore;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("Parallel group for rank {0} has no members")]
    EmptyParallelGroup(i32),
    #[error(transparent)]
    Store(anyhow::Error),
    #[error(transparent)]
    Parallel(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInstruction {
    pub tensors: Vec<String>,
    pub arguments: BTreeMap<String, ArgumentValue>,
}

/// Source of parameter-update instructions for an update-only graph.
pub trait Updater {
    fn update_type(&self) -> &str;
    fn prefix(&self) -> &str;
    /// Namespace for the hyper-parameter tensors of the graph being built.
    fn set_prefix(&mut self, prefix: String);
    fn hyper_params(&self) -> &BTreeMap<String, f32>;
    fn extra_arguments(&self) -> &BTreeMap<String, ArgumentValue>;
    fn instructions(&self) -> &[UpdateInstruction];
}

/// Common updater: `[param, grad]` instructions plus the usual hyper-parameters.
#[derive(Debug, Clone)]
pub struct BaseUpdater {
    update_type: String,
    prefix: String,
    hyper_params: BTreeMap<String, f32>,
    extra_arguments: BTreeMap<String, ArgumentValue>,
    instructions: Vec<UpdateInstruction>,
}

impl BaseUpdater {
    pub fn new(update_type: impl Into<String>, base_lr: f32) -> Self {
        let mut hyper_params = BTreeMap::new();
        hyper_params.insert("base_lr".to_string(), base_lr);
        hyper_params.insert("scale_gradient".to_string(), 1.0);
        hyper_params.insert("clip_gradient".to_string(), -1.0);
        hyper_params.insert("l2_decay".to_string(), -1.0);
        let mut extra_arguments = BTreeMap::new();
        extra_arguments.insert("slot".to_string(), ArgumentValue::String(String::new()));
        Self {
            update_type: update_type.into(),
            prefix: String::new(),
            hyper_params,
            extra_arguments,
            instructions: Vec::new(),
        }
    }

    pub fn sgd(base_lr: f32, momentum: f32) -> Self {
        Self::new("SGDUpdate", base_lr).with_hyper_param("momentum", momentum)
    }

    pub fn nesterov(base_lr: f32, momentum: f32) -> Self {
        Self::new("NesterovUpdate", base_lr).with_hyper_param("momentum", momentum)
    }

    pub fn rmsprop(base_lr: f32, decay: f32, eps: f32) -> Self {
        Self::new("RMSPropUpdate", base_lr)
            .with_hyper_param("decay", decay)
            .with_hyper_param("eps", eps)
    }

    pub fn adam(base_lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Self::new("AdamUpdate", base_lr)
            .with_hyper_param("beta1", beta1)
            .with_hyper_param("beta2", beta2)
            .with_hyper_param("eps", eps)
    }

    pub fn with_hyper_param(mut self, name: impl Into<String>, value: f32) -> Self {
        self.hyper_params.insert(name.into(), value);
        self
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.extra_arguments
            .insert("slot".to_string(), ArgumentValue::String(slot.into()));
        self
    }

    pub fn with_extra_argument(mut self, name: impl Into<String>, value: impl Into<ArgumentValue>) -> Self {
        self.extra_arguments.insert(name.into(), value.into());
        self
    }

    pub fn append(&mut self, param: &Variable, grad: &Variable, lr_mult: f32, decay_mult: f32) -> &mut Self {
        let mut arguments = BTreeMap::new();
        arguments.insert("lr_mult".to_string(), ArgumentValue::Float(lr_mult));
        arguments.insert("decay_mult".to_string(), ArgumentValue::Float(decay_mult));
        self.push_instruction(UpdateInstruction {
            tensors: vec![param.name().to_string(), grad.name().to_string()],
            arguments,
        })
    }

    pub fn push_instruction(&mut self, instruction: UpdateInstruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }
}

impl Updater for BaseUpdater {
    fn update_type(&self) -> &str {
        &self.update_type
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn set_prefix(&mut self, prefix: String) {
        self.prefix = prefix;
    }

    fn hyper_params(&self) -> &BTreeMap<String, f32> {
        &self.hyper_params
    }

    fn extra_arguments(&self) -> &BTreeMap<String, ArgumentValue> {
        &self.extra_arguments
    }

    fn instructions(&self) -> &[UpdateInstruction] {
        &self.instructions
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelGroup {
    pub rank: i32,
    pub members: Vec<i32>,
}

/// Distributed-execution state consulted when emitting update operators.
pub trait ParallelContext: Send + Sync {
    fn is_initialized(&self) -> bool;
    /// `None` when the current rank takes part in no group.
    fn active_group(&self) -> Option<ParallelGroup>;
    fn parallel_mode(&self) -> String;
    /// Returns `(communicator, group)` handles.
    fn create_communicator(&self, root: i32, members: &[i32]) -> anyhow::Result<(i64, i64)>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoParallel;

impl ParallelContext for NoParallel {
    fn is_initialized(&self) -> bool {
        false
    }

    fn active_group(&self) -> Option<ParallelGroup> {
        None
    }

    fn parallel_mode(&self) -> String {
        String::new()
    }

    fn create_communicator(&self, _root: i32, _members: &[i32]) -> anyhow::Result<(i64, i64)> {
        anyhow::bail!("No parallel context is initialized")
    }
}

fn parallel_arguments(
    parallel: &dyn ParallelContext,
) -> Result<BTreeMap<String, ArgumentValue>, UpdateError> {
    let mut arguments = BTreeMap::new();
    if !parallel.is_initialized() {
        return Ok(arguments);
    }
    let Some(group) = parallel.active_group() else {
        return Ok(arguments);
    };
    let root = *group
        .members
        .first()
        .ok_or(UpdateError::EmptyParallelGroup(group.rank))?;
    let (comm, group_handle) = parallel
        .create_communicator(root, &group.members)
        .map_err(UpdateError::Parallel)?;
    log::info!(
        "Rank {} joins parallel group {:?} rooted at {}",
        group.rank,
        group.members,
        root
    );
    arguments.insert(
        "parallel_mode".to_string(),
        ArgumentValue::String(parallel.parallel_mode()),
    );
    arguments.insert("comm".to_string(), ArgumentValue::Int(comm));
    arguments.insert("group".to_string(), ArgumentValue::Int(group_handle));
    arguments.insert("root".to_string(), ArgumentValue::Int(root as i64));
    Ok(arguments)
}

/// Emit one update target per instruction of `updater` into `graph_def`.
pub fn inject_updates(
    graph_def: &mut GraphDef,
    updater: &mut dyn Updater,
    store: &dyn TensorStore,
    parallel: &dyn ParallelContext,
    context: &CompilationContext,
) -> Result<(), UpdateError> {
    updater.set_prefix(format!("{}_", graph_def.name));
    let prefix = updater.prefix().to_string();

    for (name, value) in updater.hyper_params() {
        store
            .feed(
                &format!("{prefix}{name}"),
                ndarray::arr1(&[*value]).into_dyn(),
            )
            .map_err(UpdateError::Store)?;
    }

    let mut shared = updater.extra_arguments().clone();
    shared.insert("domain".to_string(), ArgumentValue::String(prefix.clone()));
    shared.extend(parallel_arguments(parallel)?);

    for instruction in updater.instructions() {
        let mut arguments = shared.clone();
        arguments.extend(
            instruction
                .arguments
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let (_, name) = context.next_operator();
        graph_def.u_target.push(UpdateTarget {
            name,
            r#type: updater.update_type().to_string(),
            tensor: instruction.tensors.clone(),
            arg: arguments
                .into_iter()
                .map(|(k, v)| Argument::new(k, v))
                .collect(),
        });
    }

    log::debug!(
        "Emitted {} {} targets into {}",
        graph_def.u_target.len(),
        updater.update_type(),
        graph_def.name
    );
    Ok(())
}

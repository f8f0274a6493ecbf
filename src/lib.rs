//! Lowers symbolic expressions into a flat, topologically ordered [`GraphDef`]
//! and hands it to a runtime for execution.
//!
//! ```text
//! Variable expressions -> merge -> givens -> gradients -> updates -> GraphDef -> Runtime
//! ```

pub mod compiler;
pub mod context;
pub mod expression;
pub mod givens;
pub mod gradient;
pub mod graph_def;
pub mod merge;
pub mod options;
pub mod runtime;
pub mod store;
pub mod update;

pub use compiler::{CallError, CompileError, CompiledFunction, Compiler, FunctionCall, FunctionRequest};
pub use context::CompilationContext;
pub use expression::{ExpressionBuilder, OperatorId, Variable};
pub use givens::{GivenValue, Givens};
pub use gradient::GradientMaker;
pub use graph_def::{Argument, ArgumentValue, GraphDef, OperatorDef};
pub use options::{DeviceKind, ExecutionOptions, Phase};
pub use runtime::{NDArrayRuntime, RunOptions, Runtime};
pub use store::{TensorStore, Workspace};
pub use update::{BaseUpdater, NoParallel, ParallelContext, ParallelGroup, UpdateInstruction, Updater};

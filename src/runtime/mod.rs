pub mod ndarray_runtime;

use crate::graph_def::GraphDef;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

pub use ndarray_runtime::{NDArrayRuntime, RuntimeError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// When false the run is executed for its side effects only.
    pub return_outputs: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            return_outputs: true,
        }
    }
}

/// Executes registered graphs by name.
pub trait Runtime: Send + Sync {
    fn register_graph(&self, graph_def: GraphDef) -> anyhow::Result<()>;

    fn run(
        &self,
        graph_name: &str,
        inputs: Vec<(String, ArrayD<f32>)>,
        outputs: &[String],
        options: &RunOptions,
    ) -> anyhow::Result<Vec<(String, ArrayD<f32>)>>;
}

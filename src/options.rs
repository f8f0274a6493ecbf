use crate::graph_def::{DeviceOption, DeviceType};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl From<DeviceKind> for DeviceType {
    fn from(value: DeviceKind) -> Self {
        match value {
            DeviceKind::Cpu => DeviceType::Cpu,
            DeviceKind::Cuda => DeviceType::Cuda,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Train,
    Test,
}

/// Device and execution settings stamped onto every compiled graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// `None` leaves the device block out and lets the runtime decide.
    pub device: Option<DeviceKind>,
    pub device_index: i32,
    pub use_cudnn: bool,
    pub random_seed: u32,
    pub debug_mode: bool,
    pub share_grads: bool,
    /// Overrides the phase inferred from gradient requests.
    pub phase: Option<Phase>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            device: Some(DeviceKind::Cpu),
            device_index: 0,
            use_cudnn: false,
            random_seed: 3,
            debug_mode: false,
            share_grads: false,
            phase: None,
        }
    }
}

impl ExecutionOptions {
    pub fn from_json_str(json: &str) -> Result<Self, OptionsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, OptionsError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn device_option(&self) -> Option<DeviceOption> {
        let device = self.device?;
        Some(DeviceOption {
            device_type: DeviceType::from(device) as i32,
            device_id: self.device_index,
            random_seed: self.random_seed,
            engine: if self.use_cudnn {
                "CUDNN".to_string()
            } else {
                String::new()
            },
        })
    }
}

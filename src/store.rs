use ndarray::ArrayD;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Tensor \"{0}\" not found in the workspace")]
    MissingTensor(String),
    #[error("Workspace lock poisoned")]
    Poisoned,
}

/// Where concrete values live, keyed by tensor name.
pub trait TensorStore: Send + Sync {
    fn feed(&self, name: &str, value: ArrayD<f32>) -> anyhow::Result<()>;
    fn generate_name(&self) -> String;
}

/// In-memory value store.
#[derive(Debug, Default)]
pub struct Workspace {
    tensors: RwLock<HashMap<String, ArrayD<f32>>>,
    next_name_idx: AtomicU64,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch(&self, name: &str) -> Result<ArrayD<f32>, StoreError> {
        let guard = self.tensors.read().map_err(|_| StoreError::Poisoned)?;
        guard
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::MissingTensor(name.to_string()))
    }

    pub fn insert(&self, name: &str, value: ArrayD<f32>) -> Result<(), StoreError> {
        let mut guard = self.tensors.write().map_err(|_| StoreError::Poisoned)?;
        guard.insert(name.to_string(), value);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> Result<bool, StoreError> {
        let guard = self.tensors.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.contains_key(name))
    }
}

impl TensorStore for Workspace {
    fn feed(&self, name: &str, value: ArrayD<f32>) -> anyhow::Result<()> {
        self.insert(name, value)?;
        Ok(())
    }

    fn generate_name(&self) -> String {
        let idx = self.next_name_idx.fetch_add(1, Ordering::Relaxed);
        format!("_workspace_tensor_{idx}")
    }
}

use crate::expression::OperatorId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Sequence counters shared by every compilation in the process.
///
/// Graph names (`Graph_<n>`) and operator ids are unique for the lifetime of
/// the context; operator ids also order operators by creation, which the
/// merger relies on for a topological order. Only [`CompilationContext::global`]
/// is handed out publicly, so ids never collide across builders.
#[derive(Debug)]
pub struct CompilationContext {
    next_graph_idx: AtomicU64,
    next_operator_idx: AtomicU64,
}

impl CompilationContext {
    pub(crate) fn new() -> Self {
        Self {
            next_graph_idx: AtomicU64::new(0),
            next_operator_idx: AtomicU64::new(0),
        }
    }

    /// The process-wide context.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<CompilationContext>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(CompilationContext::new())).clone()
    }

    pub fn next_graph_name(&self) -> String {
        let idx = self.next_graph_idx.fetch_add(1, Ordering::Relaxed);
        format!("Graph_{idx}")
    }

    pub fn next_operator(&self) -> (OperatorId, String) {
        let idx = self.next_operator_idx.fetch_add(1, Ordering::Relaxed);
        (OperatorId(idx), format!("Op_{idx}"))
    }
}

//! Per-scope hook storage

use std::sync::Arc;

use super::{Hook, HookHandler, Stage};
use crate::error::HookError;
use crate::scope::ScopeId;

/// Ordered hook lists for one scope, keyed by stage.
///
/// Registration order is execution order. This holds only the scope's own
/// hooks; inheritance from ancestors is resolved by the scope tree.
#[derive(Debug, Default)]
pub struct HookRegistry {
    lists: [Vec<Arc<HookHandler>>; Stage::COUNT],
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `hook` to `stage`'s list.
    ///
    /// Fails with `IncompatibleHook` when the callable's shape does not fit
    /// the stage (e.g. a request hook registered for `onClose`).
    pub fn register(
        &mut self,
        stage: Stage,
        scope: ScopeId,
        seq: u64,
        hook: Hook,
    ) -> Result<Arc<HookHandler>, HookError> {
        hook.check_stage(stage)?;
        let handler = Arc::new(HookHandler::new(stage, scope, seq, hook));
        self.lists[stage.index()].push(Arc::clone(&handler));
        Ok(handler)
    }

    /// Like [`register`](Self::register), with the stage given by name
    pub fn register_named(
        &mut self,
        stage: &str,
        scope: ScopeId,
        seq: u64,
        hook: Hook,
    ) -> Result<Arc<HookHandler>, HookError> {
        let stage = stage.parse::<Stage>()?;
        self.register(stage, scope, seq, hook)
    }

    /// The scope-local handlers for `stage`, in registration order
    pub fn handlers_for(&self, stage: Stage) -> &[Arc<HookHandler>] {
        &self.lists[stage.index()]
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(Vec::is_empty)
    }

    /// (stage, count) for every stage with at least one local hook
    pub fn counts(&self) -> Vec<(Stage, usize)> {
        Stage::ALL
            .iter()
            .filter_map(|stage| {
                let n = self.lists[stage.index()].len();
                (n > 0).then_some((*stage, n))
            })
            .collect()
    }
}

//! Ordered fallback chain of backends

use std::sync::Arc;
use super::Backend;

/// Builds the ordered list of backends a new connection tries.
pub trait BackendChainFactory: Send + Sync {
    fn build_chain(&self) -> Vec<BackendDescriptor>;
}

/// One backend plus its retry bookkeeping
pub struct BackendDescriptor {
    backend: Arc<dyn Backend>,
    max_errors: u32,
    errors: u32,
    daemon_starts: u32,
    ok: bool,
    error_message: Option<String>,
}

impl BackendDescriptor {
    pub fn new(backend: Arc<dyn Backend>, max_errors: u32) -> Self {
        Self {
            backend,
            max_errors,
            errors: 0,
            daemon_starts: 0,
            ok: true,
            error_message: None,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn max_errors(&self) -> u32 {
        self.max_errors
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    /// Counts one failure. Returns false once the budget is exceeded, which
    /// also marks the descriptor unusable.
    pub fn record_error(&mut self, message: impl Into<String>) -> bool {
        self.errors += 1;
        self.error_message = Some(message.into());
        if self.errors > self.max_errors {
            self.ok = false;
        }
        self.ok
    }

    pub fn mark_broken(&mut self, message: impl Into<String>) {
        self.ok = false;
        self.error_message = Some(message.into());
    }

    /// Claims one daemon start attempt, bounded by the error budget.
    pub fn claim_daemon_start(&mut self) -> bool {
        if self.daemon_starts >= self.max_errors.max(1) {
            return false;
        }
        self.daemon_starts += 1;
        true
    }

    fn reset_errors(&mut self) {
        self.errors = 0;
        self.daemon_starts = 0;
    }
}

/// The chain never moves backwards: once a backend has been left behind it
/// stays behind for the lifetime of the connection that owns the chain.
pub struct BackendChain {
    nodes: Vec<BackendDescriptor>,
    current: usize,
}

impl BackendChain {
    pub fn new(nodes: Vec<BackendDescriptor>) -> Self {
        let mut chain = Self { nodes, current: 0 };
        chain.skip_broken();
        chain
    }

    pub fn current(&self) -> Option<&BackendDescriptor> {
        self.nodes.get(self.current)
    }

    pub fn current_mut(&mut self) -> Option<&mut BackendDescriptor> {
        self.nodes.get_mut(self.current)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current >= self.nodes.len()
    }

    /// Moves past any descriptor already marked unusable.
    pub fn skip_broken(&mut self) {
        while self.current().map(|n| !n.is_ok()).unwrap_or(false) {
            self.current += 1;
        }
    }

    /// Abandons the current backend and returns the name of the next usable
    /// one, if any. The new current backend starts with a fresh error count.
    pub fn advance(&mut self) -> Option<String> {
        if let Some(node) = self.current_mut() {
            node.ok = false;
        }
        self.current += 1;
        self.skip_broken();
        let node = self.current_mut()?;
        node.reset_errors();
        Some(node.name().to_string())
    }

    /// Error budget of the current backend plus every fallback behind it.
    pub fn remaining_fallback_budget(&self) -> u32 {
        self.nodes[self.current.min(self.nodes.len())..]
            .iter()
            .map(|n| n.max_errors.max(1))
            .sum()
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name().to_string()).collect()
    }
}

//! Explicit operation context.
//!
//! Every pipeline operation receives an `OpCtx` carrying the request id used
//! in log fields and the cooperative cancellation token propagated from
//! shutdown. There is no process-global context.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OpCtx {
    pub request_id: String,
    pub cancel: CancellationToken,
}

impl OpCtx {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Context scoped under an existing cancellation root (worker pools hand
    /// each job a child so shutdown reaches in-flight operations).
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancel,
        }
    }

    pub fn child(&self) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for OpCtx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_cancellation() {
        let root = OpCtx::new();
        let child = root.child();
        assert!(!child.is_cancelled());
        root.cancel.cancel();
        assert!(child.is_cancelled());
        assert_ne!(root.request_id, child.request_id);
    }
}

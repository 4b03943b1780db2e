//! Render-wide stop flag and yield checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{RenderError, RenderResult};

/// Shared stop request. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    stop: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Called after every probe: gives other threads a chance to run and
    /// fails once a stop has been requested.
    #[inline]
    pub fn checkpoint(&self) -> RenderResult<()> {
        if self.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        std::thread::yield_now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_after_cancel() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());

        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.checkpoint(), Err(RenderError::Cancelled)));
    }
}

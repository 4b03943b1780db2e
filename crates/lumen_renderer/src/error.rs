use lumen_cache::CacheError;
use thiserror::Error;

/// Errors that abort a rectangle, a worker or the whole render.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Render cancelled")]
    Cancelled,

    #[error("Trace failed: {0}")]
    Trace(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("A render worker panicked")]
    WorkerPanicked,

    #[error("Failed to build thread pool: {0}")]
    ThreadPool(String),
}

impl RenderError {
    /// True for a stop request rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RenderError::Cancelled)
    }
}

/// Result type for rendering operations.
pub type RenderResult<T> = Result<T, RenderError>;

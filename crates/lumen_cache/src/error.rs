use glam::Vec3;
use thiserror::Error;

use crate::node_id::NodeId;

/// Errors raised by the irradiance cache.
///
/// Corrupt cache files are not errors: the loader keeps the readable prefix
/// and reports the damage through `ReadInfo`.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid node id {0:?}")]
    InvalidNodeId(NodeId),

    #[error("Point {0} lies outside the cacheable coordinate range")]
    OutOfRange(Vec3),

    #[error("Invalid radiosity settings: {0}")]
    InvalidSettings(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

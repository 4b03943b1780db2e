//! Lumen Cache - octree irradiance cache for radiosity.
//!
//! This crate provides:
//!
//! - **Addressing**: `NodeId`, canonical integer cell ids over a biased grid
//! - **Storage**: `Octree`, an upward-growing point-region tree of `Block`s
//! - **Reuse**: `IrradianceCache`, neighbor weighting and query statistics
//! - **Persistence**: flat binary cache files with damage-tolerant loading
//!
//! # Example
//!
//! ```ignore
//! use lumen_cache::{CacheStats, GatherQuery, IrradianceCache, RadiositySettings, SampleRecord};
//!
//! let cache = IrradianceCache::new(RadiositySettings::default());
//! cache.record(point, normal, &SampleRecord::uniform(irradiance, 2.0), 0, 1, 0, 1.8)?;
//!
//! let mut stats = CacheStats::default();
//! let hit = cache.gather(&GatherQuery { point, normal, bounce_depth: 0, error_bound: 1.8 }, &mut stats);
//! ```

pub mod block;
pub mod error;
pub mod irradiance;
pub mod node_id;
pub mod octree;
pub mod persist;
pub mod settings;

// Re-export commonly used types
pub use block::{Block, SampleRecord, FINAL_PASS};
pub use error::{CacheError, CacheResult};
pub use irradiance::{CacheStats, CacheSummary, GatherQuery, Gathered, IrradianceCache};
pub use node_id::{NodeId, CELL_QUANTUM, MAX_EXTENT, MAX_SIZE, OCTREE_BIAS};
pub use octree::{BlockVisitor, Octree, OctreeNode};
pub use persist::{load, load_from_path, save, save_to_path, LoadParams, ReadInfo, RECORD_SIZE};
pub use settings::RadiositySettings;

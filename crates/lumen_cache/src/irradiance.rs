//! Irradiance cache: neighbor weighting, reuse decisions and statistics on
//! top of the [`Octree`].

use std::io::{Read, Write};
use std::ops::ControlFlow;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use glam::Vec3;

use crate::block::{Block, SampleRecord};
use crate::error::CacheResult;
use crate::node_id::NodeId;
use crate::octree::{BlockVisitor, Octree};
use crate::persist::{self, LoadParams, ReadInfo};
use crate::settings::RadiositySettings;

/// Weight of the normal-divergence term in the reuse error.
pub const NORMAL_ERROR_WEIGHT: f32 = 1.0;

/// A neighbor lying this far (relative to distance) behind the query's
/// tangent plane is treated as in front of the point and rejected.
pub const IN_FRONT_TOLERANCE: f32 = 0.05;

/// Floor on the reuse error so coincident samples get a finite weight.
const MIN_ERROR: f32 = 1e-4;

/// Where and at which bounce indirect light is wanted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatherQuery {
    pub point: Vec3,
    pub normal: Vec3,
    pub bounce_depth: u32,
    pub error_bound: f32,
}

/// Irradiance interpolated from cached neighbors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gathered {
    pub irradiance: Vec3,
    pub total_weight: f32,
    pub neighbors: u32,
}

/// Top-level query counters for the batch currently being sampled.
///
/// Owned by one worker; never shared between threads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    queries: u64,
    reuses: u64,
}

impl CacheStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// `(query_count, reuse_fraction)` since the last reset.
    pub fn top_level(&self) -> (u64, f32) {
        let fraction = if self.queries == 0 {
            0.0
        } else {
            self.reuses as f32 / self.queries as f32
        };
        (self.queries, fraction)
    }

    pub fn queries(&self) -> u64 {
        self.queries
    }

    pub fn reuses(&self) -> u64 {
        self.reuses
    }

    pub fn merge(&mut self, other: &CacheStats) {
        self.queries += other.queries;
        self.reuses += other.reuses;
    }
}

/// Block and node totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSummary {
    pub blocks: usize,
    pub nodes: usize,
}

/// Accumulates weighted neighbor predictions during a traversal.
struct NeighborWeights<'q> {
    query: &'q GatherQuery,
    max_candidates: u32,
    weighted: Vec3,
    total_weight: f32,
    accepted: u32,
}

impl<'q> NeighborWeights<'q> {
    fn new(query: &'q GatherQuery, max_candidates: u32) -> Self {
        Self {
            query,
            max_candidates,
            weighted: Vec3::ZERO,
            total_weight: 0.0,
            accepted: 0,
        }
    }

    /// Weight of `block` at the query, or `None` if it must not be reused.
    fn weight(&self, block: &Block) -> Option<f32> {
        let q = self.query;
        let ri = block.harmonic_mean_distance;
        if !(ri > 0.0) {
            return None;
        }

        let delta = q.point - block.position;
        let dist = delta.length();
        if dist >= block.reuse_radius(q.error_bound) {
            return None;
        }

        let cos = q.normal.dot(block.normal).clamp(-1.0, 1.0);
        if cos <= 0.0 {
            return None;
        }

        let error = (dist / ri + NORMAL_ERROR_WEIGHT * (1.0 - cos).sqrt()).max(MIN_ERROR);
        if error >= q.error_bound {
            return None;
        }

        if dist > MIN_ERROR {
            // Sample sits in front of the query surface.
            let mean_normal = (q.normal + block.normal).normalize_or_zero();
            if delta.dot(mean_normal) < -IN_FRONT_TOLERANCE * dist {
                return None;
            }
            // Query lies beyond the occluder the sample saw.
            let to_nearest = block.to_nearest_surface;
            let reach = to_nearest.length_squared();
            if reach > 0.0 && delta.dot(to_nearest) > reach {
                return None;
            }
        }

        Some(block.quality.max(0.0) * (1.0 / error - 1.0 / q.error_bound))
    }

    fn finish(self, nearest_count: u32) -> Option<Gathered> {
        if self.accepted < nearest_count || !(self.total_weight > 0.0) {
            return None;
        }
        Some(Gathered {
            irradiance: self.weighted / self.total_weight,
            total_weight: self.total_weight,
            neighbors: self.accepted,
        })
    }
}

impl BlockVisitor for NeighborWeights<'_> {
    fn visit(&mut self, block: &Block) -> ControlFlow<()> {
        if let Some(w) = self.weight(block) {
            if w > 0.0 {
                self.weighted += block.extrapolate(self.query.point) * w;
                self.total_weight += w;
                self.accepted += 1;
                if self.accepted >= self.max_candidates {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// Shared sample cache.
///
/// Gathers take a read lock and may run concurrently; records take the write
/// lock, so no gather ever sees a node list mid-append.
#[derive(Debug)]
pub struct IrradianceCache {
    octree: RwLock<Octree>,
    settings: RadiositySettings,
}

impl IrradianceCache {
    pub fn new(settings: RadiositySettings) -> Self {
        Self::with_octree(settings, Octree::new())
    }

    /// Wrap an existing tree, typically one produced by [`persist::load`].
    pub fn with_octree(settings: RadiositySettings, octree: Octree) -> Self {
        Self {
            octree: RwLock::new(octree),
            settings,
        }
    }

    pub fn settings(&self) -> &RadiositySettings {
        &self.settings
    }

    fn read(&self) -> RwLockReadGuard<'_, Octree> {
        self.octree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Octree> {
        self.octree.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interpolate irradiance at the query from cached neighbors.
    ///
    /// `None` means the caller must compute a fresh sample. Top-level queries
    /// (bounce depth 0) are counted in `stats`.
    pub fn gather(&self, query: &GatherQuery, stats: &mut CacheStats) -> Option<Gathered> {
        let mut weights = NeighborWeights::new(query, self.settings.max_candidates);
        // Each sample's cell is sized by its own reuse radius, so the walk
        // keys on the point alone and the bound only filters in the visitor.
        let _ = self.read().traverse(query.point, query.bounce_depth, &mut weights);
        let result = weights.finish(self.settings.nearest_count);

        if query.bounce_depth == 0 {
            stats.queries += 1;
            if result.is_some() {
                stats.reuses += 1;
            }
        }
        result
    }

    /// Store a freshly computed sample; returns the node it was placed in.
    ///
    /// The node holds `point` and is at least as wide as the sample's reuse
    /// sphere at `error_bound`.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        point: Vec3,
        normal: Vec3,
        sample: &SampleRecord,
        tile_id: u32,
        pass: u32,
        bounce_depth: u32,
        error_bound: f32,
    ) -> CacheResult<NodeId> {
        let block = Block::from_sample(point, normal, sample, tile_id, pass, bounce_depth);
        let id = NodeId::for_sphere(point, block.reuse_radius(error_bound))?;
        self.write().insert(block, id)?;
        Ok(id)
    }

    pub fn summary(&self) -> CacheSummary {
        let octree = self.read();
        CacheSummary {
            blocks: octree.block_count(),
            nodes: octree.node_count(),
        }
    }

    pub fn save<W: Write>(&self, writer: W) -> CacheResult<usize> {
        persist::save(&self.read(), writer)
    }

    /// Replace the cache contents with a saved tree.
    pub fn load<R: Read>(&self, reader: R, params: &LoadParams) -> CacheResult<ReadInfo> {
        let (octree, info) = persist::load(reader, params)?;
        *self.write() = octree;
        Ok(info)
    }

    /// Drop every sample.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Run `f` against the tree under the read lock.
    pub fn with_octree_ref<T>(&self, f: impl FnOnce(&Octree) -> T) -> T {
        f(&self.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn settings(nearest_count: u32) -> RadiositySettings {
        RadiositySettings {
            nearest_count,
            ..Default::default()
        }
    }

    fn query(point: Vec3, normal: Vec3) -> GatherQuery {
        GatherQuery {
            point,
            normal,
            bounce_depth: 0,
            error_bound: 1.0,
        }
    }

    #[test]
    fn test_empty_cache_misses_and_counts() {
        let cache = IrradianceCache::new(settings(1));
        let mut stats = CacheStats::default();
        assert!(cache.gather(&query(Vec3::ZERO, Vec3::Y), &mut stats).is_none());
        assert_eq!(stats.top_level(), (1, 0.0));
    }

    #[test]
    fn test_record_then_gather_reuses() {
        let cache = IrradianceCache::new(settings(1));
        let sample = SampleRecord::uniform(Vec3::new(0.3, 0.6, 0.9), 2.0);
        cache.record(Vec3::ZERO, Vec3::Y, &sample, 0, 1, 0, 1.0).unwrap();

        let mut stats = CacheStats::default();
        let hit = cache
            .gather(&query(Vec3::new(0.5, 0.0, 0.2), Vec3::Y), &mut stats)
            .unwrap();
        assert!((hit.irradiance - sample.irradiance).length() < 1e-5);
        assert_eq!(hit.neighbors, 1);
        assert_eq!(stats.top_level(), (1, 1.0));
    }

    #[test]
    fn test_far_point_misses() {
        let cache = IrradianceCache::new(settings(1));
        cache
            .record(Vec3::ZERO, Vec3::Y, &SampleRecord::uniform(Vec3::ONE, 0.5), 0, 1, 0, 1.0)
            .unwrap();
        let mut stats = CacheStats::default();
        assert!(cache.gather(&query(Vec3::new(3.0, 0.0, 0.0), Vec3::Y), &mut stats).is_none());
    }

    #[test]
    fn test_opposite_normal_rejected() {
        let cache = IrradianceCache::new(settings(1));
        cache
            .record(Vec3::ZERO, Vec3::Y, &SampleRecord::uniform(Vec3::ONE, 2.0), 0, 1, 0, 1.0)
            .unwrap();
        let mut stats = CacheStats::default();
        assert!(cache.gather(&query(Vec3::ZERO, -Vec3::Y), &mut stats).is_none());
        assert_eq!(stats.top_level(), (1, 0.0));
    }

    #[test]
    fn test_sample_in_front_rejected() {
        let cache = IrradianceCache::new(settings(1));
        cache
            .record(Vec3::new(0.0, 0.5, 0.0), Vec3::Y, &SampleRecord::uniform(Vec3::ONE, 2.0), 0, 1, 0, 1.0)
            .unwrap();
        let mut stats = CacheStats::default();
        assert!(cache.gather(&query(Vec3::ZERO, Vec3::Y), &mut stats).is_none());
    }

    #[test]
    fn test_point_beyond_nearest_occluder_rejected() {
        let cache = IrradianceCache::new(settings(1));
        let mut sample = SampleRecord::uniform(Vec3::ONE, 2.0);
        sample.to_nearest_surface = Vec3::new(0.25, 0.0, 0.0);
        cache.record(Vec3::ZERO, Vec3::Y, &sample, 0, 1, 0, 1.0).unwrap();

        let mut stats = CacheStats::default();
        assert!(cache.gather(&query(Vec3::new(0.5, 0.0, 0.0), Vec3::Y), &mut stats).is_none());
        assert!(cache.gather(&query(Vec3::new(-0.5, 0.0, 0.0), Vec3::Y), &mut stats).is_some());
    }

    #[test]
    fn test_nearest_count_required() {
        let cache = IrradianceCache::new(settings(2));
        let sample = SampleRecord::uniform(Vec3::ONE, 2.0);
        cache.record(Vec3::ZERO, Vec3::Y, &sample, 0, 1, 0, 1.0).unwrap();

        let mut stats = CacheStats::default();
        let q = query(Vec3::new(0.1, 0.0, 0.0), Vec3::Y);
        assert!(cache.gather(&q, &mut stats).is_none());

        cache.record(Vec3::new(0.2, 0.0, 0.0), Vec3::Y, &sample, 0, 1, 0, 1.0).unwrap();
        assert!(cache.gather(&q, &mut stats).is_some());
        assert_eq!(stats.top_level(), (2, 0.5));
    }

    #[test]
    fn test_closer_sample_dominates() {
        let cache = IrradianceCache::new(settings(2));
        cache
            .record(Vec3::ZERO, Vec3::Y, &SampleRecord::uniform(Vec3::ZERO, 4.0), 0, 1, 0, 1.0)
            .unwrap();
        cache
            .record(Vec3::new(2.0, 0.0, 0.0), Vec3::Y, &SampleRecord::uniform(Vec3::ONE, 4.0), 0, 1, 0, 1.0)
            .unwrap();

        let mut stats = CacheStats::default();
        let hit = cache.gather(&query(Vec3::new(1.8, 0.0, 0.0), Vec3::Y), &mut stats).unwrap();
        assert!(hit.irradiance.x > 0.5);
    }

    #[test]
    fn test_deeper_bounce_samples_hidden_from_top_level() {
        let cache = IrradianceCache::new(settings(1));
        cache
            .record(Vec3::ZERO, Vec3::Y, &SampleRecord::uniform(Vec3::ONE, 2.0), 0, 1, 1, 1.0)
            .unwrap();
        let mut stats = CacheStats::default();
        assert!(cache.gather(&query(Vec3::ZERO, Vec3::Y), &mut stats).is_none());

        let deep = GatherQuery {
            bounce_depth: 1,
            ..query(Vec3::ZERO, Vec3::Y)
        };
        assert!(cache.gather(&deep, &mut stats).is_some());
        // Only the top-level query is counted.
        assert_eq!(stats.queries(), 1);
    }

    /// Counts blocks offered to a visitor during one traversal.
    fn blocks_visited(cache: &IrradianceCache, point: Vec3) -> usize {
        let mut visited = 0;
        cache.with_octree_ref(|tree| {
            let _ = tree.traverse(point, 0, &mut |_: &Block| {
                visited += 1;
                ControlFlow::Continue(())
            });
        });
        visited
    }

    #[test]
    fn test_floor_on_world_plane_stays_local() {
        for height in [0.0, 0.37, 1.0] {
            let cache = IrradianceCache::new(settings(1));
            let sample = SampleRecord::uniform(Vec3::ONE, 0.05);
            for i in 0..40 {
                for j in 0..40 {
                    let p = Vec3::new(i as f32 * 0.05 - 1.0, height, j as f32 * 0.05 - 1.0);
                    cache.record(p, Vec3::Y, &sample, 0, 1, 0, 0.9).unwrap();
                }
            }
            assert_eq!(cache.summary().blocks, 1600);

            let largest = cache.with_octree_ref(|tree| {
                tree.iter().map(|(id, _)| id.edge()).fold(0.0, f64::max)
            });
            assert_eq!(largest, 0.125, "floor at y={height}");

            for q in [Vec3::new(0.5, height, 0.5), Vec3::new(0.0, height, 0.0), Vec3::new(-0.9, height, 0.9)] {
                let visited = blocks_visited(&cache, q);
                assert!(visited <= 36, "floor at y={height}: {visited} blocks visited from {q:?}");
                let mut stats = CacheStats::default();
                let at_floor = GatherQuery {
                    error_bound: 0.9,
                    ..query(q, Vec3::Y)
                };
                assert!(cache.gather(&at_floor, &mut stats).is_some());
            }
        }
    }

    #[test]
    fn test_stats_reset() {
        let mut stats = CacheStats::default();
        let cache = IrradianceCache::new(settings(1));
        cache.gather(&query(Vec3::ZERO, Vec3::Y), &mut stats);
        stats.reset();
        assert_eq!(stats.top_level(), (0, 0.0));
    }

    #[test]
    fn test_save_and_load_through_cache() {
        let cache = IrradianceCache::new(settings(1));
        cache
            .record(Vec3::ONE, Vec3::Y, &SampleRecord::uniform(Vec3::ONE, 1.0), 3, 2, 0, 1.0)
            .unwrap();
        let mut bytes = Vec::new();
        assert_eq!(cache.save(&mut bytes).unwrap(), 1);

        let restored = IrradianceCache::new(settings(1));
        let info = restored.load(Cursor::new(bytes), &LoadParams::default()).unwrap();
        assert_eq!(info.records, 1);
        assert_eq!(restored.summary().blocks, 1);

        restored.clear();
        assert_eq!(restored.summary(), CacheSummary::default());
    }
}

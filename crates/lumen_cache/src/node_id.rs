//! Canonical octree addressing.
//!
//! World coordinates are shifted by [`OCTREE_BIAS`] and quantized to a fixed
//! grid of [`CELL_QUANTUM`] world units. A [`NodeId`] names one cube of that
//! grid: its integer coordinates are the biased quanta shifted right by
//! `log2(size)`. Because an id is a pure function of the point and the cell
//! size, samples computed independently on different threads land in the same
//! node without any coordination beyond the insert lock.

use glam::Vec3;

use crate::error::{CacheError, CacheResult};

/// Offset added to every world coordinate before quantization.
///
/// Must exceed twice the largest scene extent so biased values never go
/// negative.
pub const OCTREE_BIAS: f64 = 1.0e7;

/// Edge length, in world units, of a size-1 cell.
pub const CELL_QUANTUM: f64 = 1.0 / 65536.0;

/// Largest biased quantum coordinate a point can map to.
pub const MAX_COORD: i64 = (2.0 * OCTREE_BIAS / CELL_QUANTUM) as i64;

/// Largest cell size; a cell this big covers the whole biased range.
pub const MAX_SIZE: u64 = 1 << 42;

/// Largest absolute world coordinate the cache accepts.
pub const MAX_EXTENT: f32 = (OCTREE_BIAS * 0.5) as f32;

/// Canonical address of a cubical octree cell.
///
/// `size` is the cell edge measured in quanta and is always a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub size: u64,
}

/// Quantize one world coordinate to biased grid units (floor).
#[inline]
fn quantize(v: f32) -> i64 {
    let q = ((v as f64 + OCTREE_BIAS) / CELL_QUANTUM).floor();
    (q as i64).clamp(0, MAX_COORD)
}

/// Smallest power-of-two size whose edge covers `edge` world units.
fn size_for_edge(edge: f64) -> u64 {
    if !(edge > CELL_QUANTUM) {
        return 1;
    }
    let quanta = (edge / CELL_QUANTUM).ceil();
    if quanta >= MAX_SIZE as f64 {
        return MAX_SIZE;
    }
    (quanta as u64).next_power_of_two().min(MAX_SIZE)
}

fn check_extent(point: Vec3) -> CacheResult<()> {
    if point.is_finite() && point.abs().max_element() < MAX_EXTENT {
        Ok(())
    } else {
        Err(CacheError::OutOfRange(point))
    }
}

impl NodeId {
    /// Id of the cell of edge at least `target_edge` containing `point`.
    ///
    /// Points beyond [`MAX_EXTENT`] are clamped onto the edge of the grid;
    /// callers that store samples go through [`NodeId::for_sphere`],
    /// which rejects them instead.
    pub fn from_point(point: Vec3, target_edge: f64) -> Self {
        let size = size_for_edge(target_edge);
        let shift = size.trailing_zeros();
        Self {
            x: quantize(point.x) >> shift,
            y: quantize(point.y) >> shift,
            z: quantize(point.z) >> shift,
            size,
        }
    }

    /// Cell that stores a sample with reuse sphere (`center`, `radius`).
    ///
    /// The cell holds `center` and its edge is at least the sphere's
    /// diameter, so the sphere lies inside the cell's [loose bounds]. Where
    /// the sphere sits relative to grid boundaries does not change the cell
    /// size.
    ///
    /// [loose bounds]: NodeId::loosely_contains
    pub fn for_sphere(center: Vec3, radius: f32) -> CacheResult<Self> {
        check_extent(center)?;
        Ok(Self::from_point(center, 2.0 * radius.max(0.0) as f64))
    }

    /// The enclosing cell one level up: size doubled, coordinates halved.
    #[inline]
    pub fn parent(&self) -> Self {
        Self {
            x: self.x >> 1,
            y: self.y >> 1,
            z: self.z >> 1,
            size: self.size << 1,
        }
    }

    /// The enclosing cell at `size` (which must be >= `self.size`).
    #[inline]
    pub fn ancestor_at(&self, size: u64) -> Self {
        debug_assert!(size >= self.size && size.is_power_of_two());
        let shift = size.trailing_zeros() - self.size.trailing_zeros();
        Self {
            x: self.x >> shift,
            y: self.y >> shift,
            z: self.z >> shift,
            size,
        }
    }

    /// True if `other` is this cell or lies inside it.
    pub fn contains(&self, other: &NodeId) -> bool {
        self.size >= other.size && other.ancestor_at(self.size) == *self
    }

    /// True if the leaf cell `leaf` lies in this cell's cube grown by half
    /// an edge on every side.
    ///
    /// Every point within `edge / 2` of a point in this cell passes. Size-1
    /// cells have no slack.
    pub fn loosely_contains(&self, leaf: &NodeId) -> bool {
        let size = self.size as i64;
        let slack = size / 2;
        [(self.x, leaf.x), (self.y, leaf.y), (self.z, leaf.z)]
            .iter()
            .all(|&(cell, q)| (cell * size - slack..(cell + 1) * size + slack).contains(&q))
    }

    /// Octant slot (0..8) of the child of `self` on the path to `descendant`.
    pub fn child_index(&self, descendant: &NodeId) -> usize {
        let child = descendant.ancestor_at(self.size >> 1);
        ((child.x & 1) | ((child.y & 1) << 1) | ((child.z & 1) << 2)) as usize
    }

    /// Id of the child in octant `index`.
    pub fn child(&self, index: usize) -> Self {
        let bit = |b: usize| ((index >> b) & 1) as i64;
        Self {
            x: (self.x << 1) | bit(0),
            y: (self.y << 1) | bit(1),
            z: (self.z << 1) | bit(2),
            size: self.size >> 1,
        }
    }

    /// Cell edge length in world units.
    pub fn edge(&self) -> f64 {
        self.size as f64 * CELL_QUANTUM
    }

    /// World-space corner with the smallest coordinates.
    pub fn min_corner(&self) -> Vec3 {
        let edge = self.edge();
        Vec3::new(
            (self.x as f64 * edge - OCTREE_BIAS) as f32,
            (self.y as f64 * edge - OCTREE_BIAS) as f32,
            (self.z as f64 * edge - OCTREE_BIAS) as f32,
        )
    }

    /// Whether this id could have been produced by quantization.
    pub fn is_valid(&self) -> bool {
        if !self.size.is_power_of_two() || self.size > MAX_SIZE {
            return false;
        }
        let limit = (MAX_COORD >> self.size.trailing_zeros()) + 1;
        [self.x, self.y, self.z]
            .iter()
            .all(|&c| (0..limit).contains(&c))
    }
}

//! Cached irradiance samples.

use glam::Vec3;
use lumen_math::luminance;

/// Pass number stamped on samples taken during the final render.
///
/// Pretrace passes are numbered from 1.
pub const FINAL_PASS: u32 = 0;

/// A freshly computed irradiance estimate, before it is placed in the tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRecord {
    /// Incoming irradiance (cosine-weighted mean radiance), linear RGB
    pub irradiance: Vec3,
    /// d(irradiance)/dx, d/dy, d/dz
    pub gradients: [Vec3; 3],
    /// Direction and distance to the closest surface seen by the sample rays
    pub to_nearest_surface: Vec3,
    pub nearest_distance: f32,
    /// Harmonic mean of the sample ray hit distances
    pub harmonic_mean_distance: f32,
    /// Confidence in [0, 1]; reduced-ray samples score lower
    pub quality: f32,
}

impl SampleRecord {
    /// A sample with no gradient or occluder information.
    pub fn uniform(irradiance: Vec3, harmonic_mean_distance: f32) -> Self {
        Self {
            irradiance,
            gradients: [Vec3::ZERO; 3],
            to_nearest_surface: Vec3::ZERO,
            nearest_distance: harmonic_mean_distance,
            harmonic_mean_distance,
            quality: 1.0,
        }
    }
}

/// One cached irradiance observation, owned by exactly one octree node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block {
    pub position: Vec3,
    pub normal: Vec3,
    pub to_nearest_surface: Vec3,
    pub irradiance: Vec3,
    pub gradients: [Vec3; 3],
    pub nearest_distance: f32,
    pub harmonic_mean_distance: f32,
    pub quality: f32,
    pub tile_id: u32,
    pub pass: u32,
    pub bounce_depth: u32,
}

impl Block {
    pub fn from_sample(
        position: Vec3,
        normal: Vec3,
        sample: &SampleRecord,
        tile_id: u32,
        pass: u32,
        bounce_depth: u32,
    ) -> Self {
        Self {
            position,
            normal,
            to_nearest_surface: sample.to_nearest_surface,
            irradiance: sample.irradiance,
            gradients: sample.gradients,
            nearest_distance: sample.nearest_distance,
            harmonic_mean_distance: sample.harmonic_mean_distance,
            quality: sample.quality,
            tile_id,
            pass,
            bounce_depth,
        }
    }

    /// Radius inside which this sample may be reused at `error_bound`.
    #[inline]
    pub fn reuse_radius(&self, error_bound: f32) -> f32 {
        self.harmonic_mean_distance * error_bound
    }

    /// Irradiance extrapolated to `point` along the stored gradients.
    pub fn extrapolate(&self, point: Vec3) -> Vec3 {
        let d = point - self.position;
        let predicted =
            self.irradiance + self.gradients[0] * d.x + self.gradients[1] * d.y + self.gradients[2] * d.z;
        predicted.max(Vec3::ZERO)
    }

    pub fn luminance(&self) -> f32 {
        luminance(self.irradiance)
    }
}

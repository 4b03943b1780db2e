//! Radiosity settings shared by the cache, the pretrace scheduler and the
//! final pass.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Scene-wide radiosity configuration.
///
/// Sizes given as fractions are relative to the image width, so the same
/// settings behave alike at any resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiositySettings {
    /// Probe spacing of the first pretrace pass, as a fraction of image width
    pub pretrace_start: f32,
    /// Smallest probe spacing, as a fraction of image width
    pub pretrace_end: f32,
    /// Hard cap on the number of pretrace passes
    pub pretrace_max_passes: u32,
    /// Probe jitter as a fraction of the probe spacing (0 = regular grid)
    pub pretrace_jitter: f32,
    /// Fraction of cache queries that must be reuses for a sub-block to stop
    /// refining. 0 disables adaptive subdivision.
    pub coverage: f32,

    /// Maximum reuse error; larger values reuse samples further away
    pub error_bound: f32,
    /// Multiplier applied to `error_bound` during pretrace
    pub low_error_factor: f32,
    /// Deepest diffuse bounce that still gathers indirect light
    pub recursion_limit: u32,
    /// Hemisphere rays per fresh sample at the top level
    pub count: u32,
    /// Neighbors required before a gather counts as a hit
    pub nearest_count: u32,
    /// Accepted neighbors after which a gather stops inspecting candidates
    pub max_candidates: u32,
    /// Lower clamp on a sample's reuse distance, as a fraction of eye distance
    pub minimum_reuse: f32,
    /// Upper clamp on a sample's reuse distance, as a fraction of eye distance
    pub maximum_reuse: f32,
    /// Scale applied to gathered indirect light
    pub brightness: f32,
}

impl Default for RadiositySettings {
    fn default() -> Self {
        Self {
            pretrace_start: 0.08,
            pretrace_end: 0.01,
            pretrace_max_passes: 8,
            pretrace_jitter: 1.0,
            coverage: 0.9,
            error_bound: 1.8,
            low_error_factor: 0.5,
            recursion_limit: 2,
            count: 35,
            nearest_count: 5,
            max_candidates: 64,
            minimum_reuse: 0.015,
            maximum_reuse: 0.2,
            brightness: 1.0,
        }
    }
}

impl RadiositySettings {
    /// Check the values the scheduler and cache rely on.
    pub fn validate(&self) -> CacheResult<()> {
        let bad = |msg: &str| Err(CacheError::InvalidSettings(msg.to_string()));

        if !(self.pretrace_end > 0.0) || !(self.pretrace_start >= self.pretrace_end) {
            return bad("pretrace sizes must satisfy 0 < pretrace_end <= pretrace_start");
        }
        if self.pretrace_max_passes == 0 {
            return bad("pretrace_max_passes must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.pretrace_jitter) {
            return bad("pretrace_jitter must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.coverage) {
            return bad("coverage must be within [0, 1]");
        }
        if !(self.error_bound > 0.0) || !self.error_bound.is_finite() {
            return bad("error_bound must be positive");
        }
        if !(self.low_error_factor > 0.0) || !self.low_error_factor.is_finite() {
            return bad("low_error_factor must be positive");
        }
        if self.count == 0 || self.nearest_count == 0 {
            return bad("count and nearest_count must be at least 1");
        }
        if self.max_candidates < self.nearest_count {
            return bad("max_candidates must be at least nearest_count");
        }
        if !(self.minimum_reuse >= 0.0) || !(self.maximum_reuse >= self.minimum_reuse) {
            return bad("reuse clamps must satisfy 0 <= minimum_reuse <= maximum_reuse");
        }
        if !(self.brightness >= 0.0) || !self.brightness.is_finite() {
            return bad("brightness must be non-negative");
        }
        Ok(())
    }

    /// Error bound used while pretracing.
    pub fn pretrace_error_bound(&self) -> f32 {
        self.error_bound * self.low_error_factor
    }

    /// Probe spacing in pixels for each pretrace pass.
    ///
    /// The start spacing is halved each pass, never dropping below the end
    /// spacing, until the end spacing or the pass cap is reached.
    pub fn pretrace_step_sizes(&self, image_width: u32) -> Vec<u32> {
        let width = image_width.max(1) as f32;
        let start = ((self.pretrace_start * width).round() as u32).max(1);
        let end = ((self.pretrace_end * width).round() as u32).clamp(1, start);

        let mut steps = vec![start];
        let mut step = start;
        while step > end && (steps.len() as u32) < self.pretrace_max_passes {
            step = (step / 2).max(end);
            steps.push(step);
        }
        steps
    }
}

//! Probe tracing: the collaborator the pretrace scheduler and the final pass
//! call for every probe position.
//!
//! [`RadiosityTracer`] follows the camera ray into the scene and asks the
//! irradiance cache for indirect light at the hit. On a miss it shoots a
//! cosine-weighted hemisphere of rays, records the fresh estimate and
//! returns it. Hemisphere rays that land on diffuse surfaces recurse with
//! the next bounce depth, up to `recursion_limit`.

use lumen_cache::{CacheError, CacheStats, GatherQuery, IrradianceCache, RadiositySettings, SampleRecord};
use lumen_math::{Interval, Ray, Vec3};
use rand::rngs::StdRng;

use crate::camera::Camera;
use crate::error::RenderResult;
use crate::hittable::{HitRecord, Hittable};
use crate::material::Color;
use crate::sampling::{cosine_hemisphere, gen_f32};

/// Offset that keeps secondary rays from re-hitting their origin surface.
const RAY_EPSILON: f32 = 1e-3;

/// Fewest hemisphere rays shot for a nested (bounce > 0) sample.
const MIN_NESTED_RAYS: u32 = 4;

/// Everything a probe needs from the worker that runs it.
pub struct ProbeContext<'a> {
    pub cache: &'a IrradianceCache,
    /// Top-level counters of the sub-block being sampled
    pub stats: &'a mut CacheStats,
    pub rng: &'a mut StdRng,
    /// Serial of the rectangle that owns the probe
    pub tile_id: u32,
    pub pass: u32,
    /// Error bound for both gathers and records
    pub error_bound: f32,
}

/// Computes the colour seen through one image position.
///
/// Implementations may be expensive and may fail; a failure abandons the
/// rectangle being sampled.
pub trait ProbeTracer: Send + Sync {
    /// Trace through fractional image coordinates `(x, y)`.
    fn trace_probe(&self, x: f32, y: f32, ctx: &mut ProbeContext<'_>) -> RenderResult<Color>;
}

/// Scene tracer with cached diffuse interreflection.
pub struct RadiosityTracer<W: Hittable> {
    world: W,
    camera: Camera,
    settings: RadiositySettings,
    background: Color,
}

impl<W: Hittable> RadiosityTracer<W> {
    /// `camera` must already be initialized.
    pub fn new(world: W, camera: Camera, settings: RadiositySettings, background: Color) -> Self {
        Self {
            world,
            camera,
            settings,
            background,
        }
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn settings(&self) -> &RadiositySettings {
        &self.settings
    }

    /// Radiance arriving along `ray`, evaluated with indirect light from
    /// bounce `bounce` onwards.
    fn radiance(&self, ray: &Ray, bounce: u32, ctx: &mut ProbeContext<'_>) -> RenderResult<Color> {
        let mut rec = HitRecord::default();
        if !self.world.hit(ray, Interval::new(RAY_EPSILON, f32::INFINITY), &mut rec) {
            return Ok(self.background);
        }
        self.shade(&rec, bounce, ctx)
    }

    /// Outgoing radiance at a surface hit.
    fn shade(&self, rec: &HitRecord<'_>, bounce: u32, ctx: &mut ProbeContext<'_>) -> RenderResult<Color> {
        let emitted = rec.material.emitted();
        let albedo = rec.material.albedo();
        if bounce >= self.settings.recursion_limit || albedo.max_element() <= 0.0 {
            return Ok(emitted);
        }

        let irradiance = self.irradiance(rec.p, rec.normal, bounce, ctx)?;
        Ok(emitted + albedo * irradiance * self.settings.brightness)
    }

    /// Indirect irradiance at a surface point, from the cache if possible.
    fn irradiance(&self, point: Vec3, normal: Vec3, bounce: u32, ctx: &mut ProbeContext<'_>) -> RenderResult<Color> {
        let query = GatherQuery {
            point,
            normal,
            bounce_depth: bounce,
            error_bound: ctx.error_bound,
        };
        if let Some(gathered) = ctx.cache.gather(&query, ctx.stats) {
            return Ok(gathered.irradiance);
        }

        let sample = self.compute_sample(point, normal, bounce, ctx)?;
        match ctx
            .cache
            .record(point, normal, &sample, ctx.tile_id, ctx.pass, bounce, ctx.error_bound)
        {
            Ok(_) => {}
            // Far-away geometry is shaded but never cached
            Err(CacheError::OutOfRange(p)) => log::debug!("Not caching sample at {p}"),
            Err(e) => return Err(e.into()),
        }
        Ok(sample.irradiance)
    }

    /// Fresh hemisphere estimate at `point`.
    fn compute_sample(
        &self,
        point: Vec3,
        normal: Vec3,
        bounce: u32,
        ctx: &mut ProbeContext<'_>,
    ) -> RenderResult<SampleRecord> {
        let full = self.settings.count.max(1);
        let rays = if bounce == 0 {
            full
        } else {
            (full >> (2 * bounce.min(15))).max(MIN_NESTED_RAYS).min(full)
        };

        let origin = point + normal * RAY_EPSILON;
        let mut sum = Color::ZERO;
        let mut inverse_distance_sum = 0.0f32;
        let mut nearest = f32::INFINITY;
        let mut to_nearest = Vec3::ZERO;
        let mut gradients = [Vec3::ZERO; 3];

        for _ in 0..rays {
            let direction = cosine_hemisphere(normal, gen_f32(ctx.rng), gen_f32(ctx.rng));
            let ray = Ray::new_simple(origin, direction);

            let mut rec = HitRecord::default();
            if !self.world.hit(&ray, Interval::new(RAY_EPSILON, f32::INFINITY), &mut rec) {
                sum += self.background;
                continue;
            }
            let radiance = self.shade(&rec, bounce + 1, ctx)?;
            sum += radiance;

            inverse_distance_sum += 1.0 / rec.t;
            if rec.t < nearest {
                nearest = rec.t;
                to_nearest = direction * rec.t;
            }
            // Moving towards a close, bright surface raises irradiance
            let tangential = direction - normal * direction.dot(normal);
            let pull = tangential / rec.t;
            gradients[0] += radiance * pull.x;
            gradients[1] += radiance * pull.y;
            gradients[2] += radiance * pull.z;
        }

        let n = rays as f32;
        let irradiance = sum / n;
        for g in &mut gradients {
            *g /= n;
        }

        let eye_distance = (point - self.camera.origin()).length();
        let min_reuse = (self.settings.minimum_reuse * eye_distance).max(RAY_EPSILON);
        let max_reuse = (self.settings.maximum_reuse * eye_distance).max(min_reuse);
        let harmonic = if inverse_distance_sum > 0.0 {
            n / inverse_distance_sum
        } else {
            f32::INFINITY
        };
        let harmonic_mean_distance = harmonic.clamp(min_reuse, max_reuse);

        // Keep the extrapolated change across the reuse radius below the
        // sample's own magnitude.
        let slope = gradients.iter().map(|g| g.length_squared()).sum::<f32>().sqrt();
        let limit = irradiance.length() / harmonic_mean_distance;
        if slope > limit && slope > 0.0 {
            let scale = limit / slope;
            for g in &mut gradients {
                *g *= scale;
            }
        }

        Ok(SampleRecord {
            irradiance,
            gradients,
            to_nearest_surface: to_nearest,
            nearest_distance: nearest.min(harmonic_mean_distance),
            harmonic_mean_distance,
            quality: n / full as f32,
        })
    }
}

impl<W: Hittable> ProbeTracer for RadiosityTracer<W> {
    fn trace_probe(&self, x: f32, y: f32, ctx: &mut ProbeContext<'_>) -> RenderResult<Color> {
        let ray = self.camera.ray_at(x, y);
        self.radiance(&ray, 0, ctx)
    }
}

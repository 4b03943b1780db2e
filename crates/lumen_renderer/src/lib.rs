//! Lumen Renderer - radiosity pretrace and final pass.
//!
//! A small CPU ray tracer whose diffuse interreflection comes from the
//! `lumen_cache` irradiance cache. Rendering runs in two phases:
//!
//! 1. **Pretrace**: workers pull screen rectangles from a [`WorkQueue`] and
//!    sample them in passes of decreasing probe spacing, subdividing only
//!    where the cache does not yet explain the lighting.
//! 2. **Final pass**: buckets are rendered in parallel, reusing the cache.

mod bucket;
mod bvh;
mod camera;
mod cancel;
mod error;
mod final_pass;
mod hittable;
mod material;
mod pool;
mod pretrace;
mod renderer;
mod sampling;
mod sphere;
mod tracer;
mod work_queue;

pub use bucket::{generate_buckets, Bucket};
pub use bvh::BvhNode;
pub use camera::Camera;
pub use cancel::CancelToken;
pub use error::{RenderError, RenderResult};
pub use final_pass::{render_bucket, render_final, BucketResult};
pub use hittable::{HitRecord, Hittable};
pub use material::{Color, DiffuseLight, Lambertian, Material};
pub use pool::{run_pretrace, PretraceReport};
pub use pretrace::{
    continue_sampling, pass_weight, subdivision_factor, PretraceScheduler, SubBlock, TileState,
    CHILD_FOOTPRINT, MIN_PROBES,
};
pub use renderer::{color_to_rgba, linear_to_gamma, ImageBuffer, RenderConfig};
pub use sampling::{cosine_hemisphere, gen_f32, tile_seed};
pub use sphere::Sphere;
pub use tracer::{ProbeContext, ProbeTracer, RadiosityTracer};
pub use work_queue::{PixelSample, TileRect, TileResult, TileSlot, WorkItem, WorkQueue};

/// Re-export Vec3 and common math types from lumen_math
pub use lumen_math::{Aabb, Interval, Ray, Vec3};

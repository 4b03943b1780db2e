//! Final render over the warmed cache.
//!
//! Buckets are rendered in parallel. Gathers use the full error bound, and
//! misses record new samples tagged with [`FINAL_PASS`].

use std::time::Instant;

use lumen_cache::{CacheStats, IrradianceCache, FINAL_PASS};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::bucket::{generate_buckets, Bucket};
use crate::cancel::CancelToken;
use crate::error::{RenderError, RenderResult};
use crate::material::Color;
use crate::renderer::{ImageBuffer, RenderConfig};
use crate::sampling::{gen_f32, tile_seed};
use crate::tracer::{ProbeContext, ProbeTracer};

/// Result of rendering a bucket.
#[derive(Debug, Clone)]
pub struct BucketResult {
    pub bucket: Bucket,
    /// Row-major pixels within the bucket
    pub pixels: Vec<Color>,
    pub stats: CacheStats,
}

/// Render one bucket.
pub fn render_bucket(
    bucket: &Bucket,
    tracer: &dyn ProbeTracer,
    cache: &IrradianceCache,
    config: &RenderConfig,
    cancel: &CancelToken,
) -> RenderResult<BucketResult> {
    let mut rng = StdRng::seed_from_u64(tile_seed(FINAL_PASS, bucket.index as u32));
    let mut stats = CacheStats::default();
    let samples = config.samples_per_pixel.max(1);
    let mut pixels = Vec::with_capacity(bucket.pixel_count() as usize);

    for y in bucket.y..bucket.y + bucket.height {
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        for x in bucket.x..bucket.x + bucket.width {
            let mut sum = Color::ZERO;
            for _ in 0..samples {
                let (jx, jy) = (gen_f32(&mut rng), gen_f32(&mut rng));
                let mut ctx = ProbeContext {
                    cache,
                    stats: &mut stats,
                    rng: &mut rng,
                    tile_id: bucket.index as u32,
                    pass: FINAL_PASS,
                    error_bound: cache.settings().error_bound,
                };
                sum += tracer.trace_probe(x as f32 + jx, y as f32 + jy, &mut ctx)?;
            }
            pixels.push(sum / samples as f32);
        }
    }

    Ok(BucketResult {
        bucket: *bucket,
        pixels,
        stats,
    })
}

/// Render the whole image on `config.worker_threads()` threads.
pub fn render_final(
    tracer: &dyn ProbeTracer,
    cache: &IrradianceCache,
    config: &RenderConfig,
    cancel: &CancelToken,
) -> RenderResult<(ImageBuffer, CacheStats)> {
    let start = Instant::now();
    let buckets = generate_buckets(config.width, config.height, config.bucket_size);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads())
        .thread_name(|i| format!("lumen-final-{i}"))
        .build()
        .map_err(|e| RenderError::ThreadPool(e.to_string()))?;

    let results: Vec<BucketResult> = pool.install(|| {
        buckets
            .par_iter()
            .map(|bucket| {
                let result = render_bucket(bucket, tracer, cache, config, cancel);
                if result.is_err() {
                    // Stop the other buckets early
                    cancel.cancel();
                }
                result
            })
            .collect::<RenderResult<Vec<_>>>()
    })?;

    let mut image = ImageBuffer::new(config.width, config.height);
    let mut stats = CacheStats::default();
    for result in &results {
        let b = result.bucket;
        for (i, color) in result.pixels.iter().enumerate() {
            let i = i as u32;
            image.set(b.x + i % b.width, b.y + i / b.width, *color);
        }
        stats.merge(&result.stats);
    }

    let (queries, reuse) = stats.top_level();
    log::info!(
        "Final pass done in {:.2?}: {} buckets, {} queries ({:.1}% reused), {} samples cached",
        start.elapsed(),
        results.len(),
        queries,
        reuse * 100.0,
        cache.summary().blocks
    );
    Ok((image, stats))
}

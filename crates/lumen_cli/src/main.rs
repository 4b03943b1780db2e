//! `lumen`: render the demo scene with a cached radiosity pretrace.
//!
//! ```text
//! lumen [--config scene.json] [--width N] [--height N] [--threads N]
//!       [--load-cache in.cache] [--save-cache out.cache]
//!       [--preview pretrace.png] [--out render.png]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use lumen_cache::{load_from_path, save_to_path, IrradianceCache, LoadParams, RadiositySettings};
use lumen_math::Vec3;
use lumen_renderer::{
    generate_buckets, render_final, run_pretrace, BvhNode, CancelToken, Camera, Color, DiffuseLight, Hittable,
    ImageBuffer, Lambertian, PretraceScheduler, RadiosityTracer, RenderConfig, Sphere, TileRect,
};
use serde::{Deserialize, Serialize};

/// Contents of the `--config` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct SceneConfig {
    radiosity: RadiositySettings,
    render: RenderConfig,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = match parse_str_arg(&args, "--config") {
        Some(path) => load_config(Path::new(&path))?,
        None => SceneConfig::default(),
    };
    if let Some(width) = parse_u32_arg(&args, "--width") {
        config.render.width = width;
    }
    if let Some(height) = parse_u32_arg(&args, "--height") {
        config.render.height = height;
    }
    if let Some(threads) = parse_usize_arg(&args, "--threads") {
        config.render.threads = threads;
    }
    let out = parse_str_arg(&args, "--out").unwrap_or_else(|| "render.png".to_string());

    config.radiosity.validate().context("Invalid radiosity settings")?;
    anyhow::ensure!(
        config.render.width > 0 && config.render.height > 0,
        "Image size must be non-zero, got {}x{}",
        config.render.width,
        config.render.height
    );

    let settings = config.radiosity.clone();
    let render = &config.render;
    let tracer = demo_scene(render, &settings);
    let cache = match parse_str_arg(&args, "--load-cache") {
        Some(path) => load_cache(Path::new(&path), &settings),
        None => IrradianceCache::new(settings.clone()),
    };

    let cancel = CancelToken::new();
    let threads = render.worker_threads();

    let scheduler = PretraceScheduler::new(settings.clone(), render.width);
    let rects: Vec<TileRect> = generate_buckets(render.width, render.height, render.bucket_size)
        .iter()
        .map(TileRect::from)
        .collect();
    let report = run_pretrace(&tracer, &cache, &scheduler, rects, threads, &cancel).context("Pretrace failed")?;

    if let Some(path) = parse_str_arg(&args, "--preview") {
        ImageBuffer::from_samples(render.width, render.height, &report.pixels)
            .to_image()
            .save(&path)
            .with_context(|| format!("Failed to write preview {path}"))?;
        log::info!("Wrote pretrace preview to {path}");
    }

    let (image, _) = render_final(&tracer, &cache, render, &cancel).context("Final pass failed")?;

    if let Some(path) = parse_str_arg(&args, "--save-cache") {
        let written = cache
            .with_octree_ref(|tree| save_to_path(tree, &path))
            .with_context(|| format!("Failed to save cache {path}"))?;
        log::info!("Saved {written} cached samples to {path}");
    }

    image
        .to_image()
        .save(&out)
        .with_context(|| format!("Failed to write {out}"))?;
    log::info!("Wrote {}x{} image to {out}", image.width, image.height);
    Ok(())
}

fn load_config(path: &Path) -> Result<SceneConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Warm cache from disk; any problem falls back to an empty cache.
fn load_cache(path: &Path, settings: &RadiositySettings) -> IrradianceCache {
    let params = LoadParams {
        // Final-pass gathers reach further than the pretrace that stored them
        error_bound: Some(settings.error_bound),
        ..Default::default()
    };
    match load_from_path(path, &params) {
        Ok((octree, info)) => {
            if info.untrusted {
                log::warn!(
                    "Cache {} is damaged: kept {} samples, dropped the rest",
                    path.display(),
                    info.records
                );
            }
            log::info!(
                "Loaded {} cached samples from {} (average brightness {:.3}{})",
                info.records,
                path.display(),
                info.average_brightness(),
                if info.found_non_final_samples { ", includes pretrace samples" } else { "" }
            );
            IrradianceCache::with_octree(settings.clone(), octree)
        }
        Err(e) => {
            log::warn!("Could not load cache {}: {e}; starting cold", path.display());
            IrradianceCache::new(settings.clone())
        }
    }
}

/// Three diffuse spheres on a floor, lit by an overhead emitter and the sky.
fn demo_scene(render: &RenderConfig, settings: &RadiositySettings) -> RadiosityTracer<BvhNode> {
    let objects: Vec<Box<dyn Hittable>> = vec![
        Box::new(Sphere::new(
            Vec3::new(0.0, -1000.0, 0.0),
            1000.0,
            Lambertian::new(Color::new(0.6, 0.6, 0.55)),
        )),
        Box::new(Sphere::new(Vec3::new(0.0, 1.0, 0.0), 1.0, Lambertian::new(Color::new(0.8, 0.3, 0.3)))),
        Box::new(Sphere::new(Vec3::new(-2.2, 0.7, 0.6), 0.7, Lambertian::new(Color::new(0.3, 0.8, 0.3)))),
        Box::new(Sphere::new(Vec3::new(2.0, 0.5, 0.9), 0.5, Lambertian::new(Color::new(0.3, 0.4, 0.9)))),
        Box::new(Sphere::new(Vec3::new(0.0, 6.0, 2.0), 1.5, DiffuseLight::new(Color::splat(6.0)))),
    ];

    let mut camera = Camera::new()
        .with_resolution(render.width, render.height)
        .with_position(Vec3::new(0.0, 2.0, 7.0), Vec3::new(0.0, 0.8, 0.0), Vec3::Y)
        .with_fov(45.0);
    camera.initialize();

    RadiosityTracer::new(BvhNode::new(objects), camera, settings.clone(), render.background_color())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

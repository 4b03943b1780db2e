//! Adaptive multi-pass pretrace.
//!
//! Each rectangle is sampled in passes with a probe grid that halves its
//! spacing every pass. The rectangle is split into sub-blocks; after a pass
//! every sub-block looks at how many of its cache queries were answered by
//! existing samples and decides whether it needs the finer grid. Sub-blocks
//! that continue are divided so each child still gets at least a 4x4 probe
//! grid on the next pass; the rest drop out.
//!
//! One call to [`PretraceScheduler::run_rectangle`] runs exactly one pass and
//! returns the updated [`TileState`] for the queue to hold until the next.

use lumen_cache::{CacheStats, IrradianceCache, RadiositySettings};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::cancel::CancelToken;
use crate::error::RenderResult;
use crate::sampling::{gen_f32, tile_seed};
use crate::tracer::{ProbeContext, ProbeTracer};
use crate::work_queue::{PixelSample, TileRect, TileResult, TileSlot, WorkItem};

/// Sub-blocks with fewer probes than this always get another pass.
pub const MIN_PROBES: u32 = 9;

/// Probes per axis each child sub-block should receive on the next pass.
pub const CHILD_FOOTPRINT: u32 = 4;

/// Per-rectangle scheduler state between passes.
#[derive(Debug, Clone, PartialEq)]
pub struct TileState {
    /// Pass to run next, counted from 1
    pass: u32,
    count_x: u32,
    count_y: u32,
    /// Row-major, `count_x * count_y` entries
    active: Vec<bool>,
    /// Completion already reported for this rectangle
    progress: f32,
}

impl TileState {
    /// State of a rectangle that has not been sampled.
    pub fn new() -> Self {
        Self {
            pass: 1,
            count_x: 1,
            count_y: 1,
            active: vec![true],
            progress: 0.0,
        }
    }

    pub fn pass(&self) -> u32 {
        self.pass
    }

    pub fn sub_block_counts(&self) -> (u32, u32) {
        (self.count_x, self.count_y)
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    fn is_consistent(&self, pass_count: u32) -> bool {
        self.pass >= 1
            && self.pass <= pass_count
            && self.count_x >= 1
            && self.count_y >= 1
            && self.active.len() == (self.count_x as usize) * (self.count_y as usize)
            && (0.0..1.0).contains(&self.progress)
    }

    /// Bounds of sub-block `(sx, sy)` inside `rect`.
    pub fn sub_block(&self, rect: &TileRect, sx: u32, sy: u32) -> SubBlock {
        let split = |lo: u32, len: u32, i: u32, n: u32| lo + ((len as u64 * i as u64) / n as u64) as u32;
        SubBlock {
            sx,
            sy,
            rect: TileRect::new(
                split(rect.x0, rect.width(), sx, self.count_x),
                split(rect.y0, rect.height(), sy, self.count_y),
                split(rect.x0, rect.width(), sx + 1, self.count_x),
                split(rect.y0, rect.height(), sy + 1, self.count_y),
            ),
        }
    }

    /// State for the next pass: every continuing sub-block becomes
    /// `divide_x * divide_y` active children.
    fn subdivide(&self, continuing: &[bool], divide_x: u32, divide_y: u32, weight: f32) -> Self {
        let count_x = self.count_x * divide_x;
        let count_y = self.count_y * divide_y;
        let active = (0..count_y)
            .flat_map(|cy| (0..count_x).map(move |cx| (cx, cy)))
            .map(|(cx, cy)| {
                let parent = (cy / divide_y) * self.count_x + cx / divide_x;
                continuing[parent as usize]
            })
            .collect();
        Self {
            pass: self.pass + 1,
            count_x,
            count_y,
            active,
            progress: self.progress + weight,
        }
    }
}

impl Default for TileState {
    fn default() -> Self {
        Self::new()
    }
}

/// A sub-block position and its pixel bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubBlock {
    pub sx: u32,
    pub sy: u32,
    pub rect: TileRect,
}

/// Whether a sub-block needs another pass.
///
/// Too few probes always continue. A sub-block that made no cache queries
/// sees nothing but background and stops. Otherwise it stops once the reuse
/// fraction reaches `coverage`; with `coverage == 0` it never stops early.
pub fn continue_sampling(probes: u32, queries: u64, reuse_fraction: f32, coverage: f32) -> bool {
    if probes < MIN_PROBES {
        return true;
    }
    if queries == 0 {
        return false;
    }
    if coverage > 0.0 && reuse_fraction >= coverage {
        return false;
    }
    true
}

/// Children per axis for a continuing sub-block of the given size.
///
/// `next_step` is the probe spacing of the next pass, `None` after the last
/// pass. Adaptive subdivision off (`coverage == 0`) always yields 1x1.
pub fn subdivision_factor(sub_width: u32, sub_height: u32, next_step: Option<u32>, coverage: f32) -> (u32, u32) {
    match next_step {
        Some(step) if coverage > 0.0 => {
            let footprint = CHILD_FOOTPRINT * step.max(1);
            ((sub_width / footprint).max(1), (sub_height / footprint).max(1))
        }
        _ => (1, 1),
    }
}

/// Share of a rectangle's completion attributed to `pass` (from 1) out of
/// `pass_count`: `4^(pass-1) / sum(4^i, i < pass_count)`.
pub fn pass_weight(pass: u32, pass_count: u32) -> f32 {
    if pass == 0 || pass > pass_count {
        return 0.0;
    }
    let total = (4f64.powi(pass_count as i32) - 1.0) / 3.0;
    (4f64.powi(pass as i32 - 1) / total) as f32
}

/// Runs pretrace passes over rectangles.
#[derive(Debug, Clone)]
pub struct PretraceScheduler {
    settings: RadiositySettings,
    steps: Vec<u32>,
}

impl PretraceScheduler {
    pub fn new(settings: RadiositySettings, image_width: u32) -> Self {
        let steps = settings.pretrace_step_sizes(image_width);
        Self { settings, steps }
    }

    pub fn pass_count(&self) -> u32 {
        self.steps.len() as u32
    }

    /// Probe spacing of `pass` (from 1).
    pub fn step_for_pass(&self, pass: u32) -> Option<u32> {
        let index = pass.checked_sub(1)?;
        self.steps.get(index as usize).copied()
    }

    /// Run the next pass over `item`.
    ///
    /// A tracer failure or a stop request aborts the pass; samples already
    /// recorded stay in the cache.
    pub fn run_rectangle(
        &self,
        item: WorkItem,
        tracer: &dyn ProbeTracer,
        cache: &IrradianceCache,
        cancel: &CancelToken,
    ) -> RenderResult<TileResult> {
        let WorkItem { serial, rect, slot } = item;
        let state = match slot {
            TileSlot::Fresh => TileState::new(),
            TileSlot::InProgress(state) if state.is_consistent(self.pass_count()) => state,
            TileSlot::InProgress(state) => {
                log::warn!(
                    "Rectangle {serial}: discarding inconsistent pretrace state (pass {}), starting over",
                    state.pass
                );
                TileState::new()
            }
        };

        let pass = state.pass;
        let Some(step) = self.step_for_pass(pass) else {
            // No passes configured for this image width
            return Ok(self.finished(serial, rect, pass, &state, Vec::new(), CacheStats::default(), 0));
        };

        let mut rng = StdRng::seed_from_u64(tile_seed(pass, serial));
        let mut pixels = Vec::new();
        let mut totals = CacheStats::default();
        let mut probes_total = 0;
        let mut continuing = vec![false; state.active.len()];

        for sy in 0..state.count_y {
            for sx in 0..state.count_x {
                let index = (sy * state.count_x + sx) as usize;
                if !state.active[index] {
                    continue;
                }
                let block = state.sub_block(&rect, sx, sy);
                if block.rect.is_empty() {
                    continue;
                }

                let mut stats = CacheStats::default();
                let probes = self.sample_sub_block(
                    &block.rect,
                    step,
                    &mut ProbeContext {
                        cache,
                        stats: &mut stats,
                        rng: &mut rng,
                        tile_id: serial,
                        pass,
                        error_bound: self.settings.pretrace_error_bound(),
                    },
                    tracer,
                    cancel,
                    &mut pixels,
                )?;

                let (queries, reuse) = stats.top_level();
                continuing[index] = continue_sampling(probes, queries, reuse, self.settings.coverage);
                log::trace!(
                    "Rectangle {serial} pass {pass} sub-block ({sx}, {sy}): {probes} probes, {queries} queries, reuse {reuse:.3}"
                );

                totals.merge(&stats);
                probes_total += probes;
            }
        }

        let next_step = self.step_for_pass(pass + 1);
        if next_step.is_none() || !continuing.iter().any(|&c| c) {
            return Ok(self.finished(serial, rect, pass, &state, pixels, totals, probes_total));
        }

        let (sub_w, sub_h) = (rect.width() / state.count_x, rect.height() / state.count_y);
        let (dx, dy) = subdivision_factor(sub_w, sub_h, next_step, self.settings.coverage);
        let weight = pass_weight(pass, self.pass_count());
        let next = state.subdivide(&continuing, dx, dy, weight);
        log::debug!(
            "Rectangle {serial} pass {pass}: {} of {} sub-blocks continue, next grid {}x{}",
            continuing.iter().filter(|&&c| c).count(),
            state.active_count(),
            next.count_x,
            next.count_y
        );

        Ok(TileResult {
            serial,
            rect,
            pass,
            next: Some(next),
            pixels,
            progress: weight,
            stats: totals,
            probes: probes_total,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn finished(
        &self,
        serial: u32,
        rect: TileRect,
        pass: u32,
        state: &TileState,
        pixels: Vec<PixelSample>,
        stats: CacheStats,
        probes: u32,
    ) -> TileResult {
        log::debug!("Rectangle {serial} done after pass {pass}");
        TileResult {
            serial,
            rect,
            pass,
            next: None,
            pixels,
            progress: (1.0 - state.progress).max(0.0),
            stats,
            probes,
        }
    }

    /// Trace a jittered probe grid over `block`; returns the probe count.
    fn sample_sub_block(
        &self,
        block: &TileRect,
        step: u32,
        ctx: &mut ProbeContext<'_>,
        tracer: &dyn ProbeTracer,
        cancel: &CancelToken,
        pixels: &mut Vec<PixelSample>,
    ) -> RenderResult<u32> {
        let jitter = step as f32 * self.settings.pretrace_jitter;
        let mut probes = 0;

        for y in (block.y0..block.y1).step_by(step as usize) {
            for x in (block.x0..block.x1).step_by(step as usize) {
                let cx = (x + (x + step).min(block.x1)) as f32 * 0.5;
                let cy = (y + (y + step).min(block.y1)) as f32 * 0.5;
                let px = clamp_into(cx + jitter * (gen_f32(ctx.rng) - 0.5), block.x0, block.x1);
                let py = clamp_into(cy + jitter * (gen_f32(ctx.rng) - 0.5), block.y0, block.y1);

                let color = tracer.trace_probe(px, py, ctx)?;
                pixels.push(PixelSample {
                    x: (px as u32).min(block.x1 - 1),
                    y: (py as u32).min(block.y1 - 1),
                    color,
                });
                probes += 1;
                cancel.checkpoint()?;
            }
        }
        Ok(probes)
    }
}

/// Clamp an image coordinate into the half-open pixel span `[lo, hi)`.
fn clamp_into(v: f32, lo: u32, hi: u32) -> f32 {
    let max = (hi as f32 - 1e-3).max(lo as f32);
    v.clamp(lo as f32, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use crate::material::Color;
    use lumen_cache::{GatherQuery, SampleRecord};
    use lumen_math::Vec3;
    use std::sync::Mutex;

    /// Misses all geometry: no cache queries at all.
    struct Background;

    impl ProbeTracer for Background {
        fn trace_probe(&self, _x: f32, _y: f32, _ctx: &mut ProbeContext<'_>) -> RenderResult<Color> {
            Ok(Color::new(0.1, 0.2, 0.3))
        }
    }

    /// A flat, evenly lit floor under the whole image.
    struct FlatFloor;

    impl ProbeTracer for FlatFloor {
        fn trace_probe(&self, x: f32, y: f32, ctx: &mut ProbeContext<'_>) -> RenderResult<Color> {
            let point = Vec3::new(x * 0.01, 0.0, y * 0.01);
            let query = GatherQuery {
                point,
                normal: Vec3::Y,
                bounce_depth: 0,
                error_bound: ctx.error_bound,
            };
            if let Some(hit) = ctx.cache.gather(&query, ctx.stats) {
                return Ok(hit.irradiance);
            }
            let sample = SampleRecord::uniform(Color::splat(0.5), 100.0);
            ctx.cache
                .record(point, Vec3::Y, &sample, ctx.tile_id, ctx.pass, 0, ctx.error_bound)?;
            Ok(sample.irradiance)
        }
    }

    /// Queries the cache but never finds or stores anything.
    struct Busy;

    impl ProbeTracer for Busy {
        fn trace_probe(&self, x: f32, y: f32, ctx: &mut ProbeContext<'_>) -> RenderResult<Color> {
            let query = GatherQuery {
                point: Vec3::new(x, y, 0.0),
                normal: Vec3::Z,
                bounce_depth: 0,
                error_bound: ctx.error_bound,
            };
            ctx.cache.gather(&query, ctx.stats);
            Ok(Color::ZERO)
        }
    }

    /// Remembers where it was asked to trace.
    #[derive(Default)]
    struct Recorder {
        positions: Mutex<Vec<(f32, f32)>>,
    }

    impl ProbeTracer for Recorder {
        fn trace_probe(&self, x: f32, y: f32, _ctx: &mut ProbeContext<'_>) -> RenderResult<Color> {
            self.positions.lock().unwrap().push((x, y));
            Ok(Color::ZERO)
        }
    }

    struct Failing;

    impl ProbeTracer for Failing {
        fn trace_probe(&self, _x: f32, _y: f32, _ctx: &mut ProbeContext<'_>) -> RenderResult<Color> {
            Err(RenderError::Trace("shader exploded".into()))
        }
    }

    /// Steps 8, 4, 2, 1 at width 100.
    fn settings(coverage: f32) -> RadiositySettings {
        RadiositySettings {
            pretrace_start: 0.08,
            pretrace_end: 0.01,
            coverage,
            nearest_count: 1,
            ..Default::default()
        }
    }

    fn fresh(serial: u32, rect: TileRect) -> WorkItem {
        WorkItem {
            serial,
            rect,
            slot: TileSlot::Fresh,
        }
    }

    /// Run every pass of one rectangle, returning each pass's result.
    fn run_all(scheduler: &PretraceScheduler, tracer: &dyn ProbeTracer, cache: &IrradianceCache, rect: TileRect) -> Vec<TileResult> {
        let cancel = CancelToken::new();
        let mut item = fresh(0, rect);
        let mut results = Vec::new();
        loop {
            let result = scheduler.run_rectangle(item.clone(), tracer, cache, &cancel).unwrap();
            let next = result.next.clone();
            results.push(result);
            match next {
                Some(state) => {
                    item = WorkItem {
                        slot: TileSlot::InProgress(state),
                        ..item
                    }
                }
                None => return results,
            }
        }
    }

    #[test]
    fn test_pass_weights_sum_to_one() {
        for n in 1..=8 {
            let sum: f32 = (1..=n).map(|p| pass_weight(p, n)).sum();
            assert!((sum - 1.0).abs() < 1e-5, "n = {n}: {sum}");
        }
        assert!(pass_weight(2, 3) > pass_weight(1, 3));
        assert_eq!(pass_weight(0, 3), 0.0);
        assert_eq!(pass_weight(4, 3), 0.0);
    }

    #[test]
    fn test_continue_rules_in_order() {
        // Too few probes beats everything
        assert!(continue_sampling(8, 0, 1.0, 0.5));
        // No queries: background only
        assert!(!continue_sampling(9, 0, 0.0, 0.5));
        // Covered
        assert!(!continue_sampling(16, 10, 0.5, 0.5));
        // Not yet covered
        assert!(continue_sampling(16, 10, 0.4, 0.5));
        // Non-adaptive never stops a lit sub-block early
        assert!(continue_sampling(16, 10, 1.0, 0.0));
    }

    #[test]
    fn test_subdivision_factor() {
        assert_eq!(subdivision_factor(64, 32, Some(4), 0.9), (4, 2));
        assert_eq!(subdivision_factor(10, 10, Some(4), 0.9), (1, 1));
        assert_eq!(subdivision_factor(64, 64, Some(4), 0.0), (1, 1));
        assert_eq!(subdivision_factor(64, 64, None, 0.9), (1, 1));
    }

    #[test]
    fn test_background_rectangle_stops_after_first_pass() {
        let scheduler = PretraceScheduler::new(settings(0.9), 100);
        let cache = IrradianceCache::new(settings(0.9));
        let results = run_all(&scheduler, &Background, &cache, TileRect::new(0, 0, 32, 32));

        assert_eq!(results.len(), 1);
        let only = &results[0];
        assert_eq!(only.pass, 1);
        assert_eq!(only.probes, 16);
        assert_eq!(only.stats.top_level(), (0, 0.0));
        assert_eq!(cache.summary().blocks, 0);
        assert!((only.progress - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_flat_rectangle_converges_without_further_subdivision() {
        let scheduler = PretraceScheduler::new(settings(1.0), 100);
        let cache = IrradianceCache::new(settings(1.0));
        let results = run_all(&scheduler, &FlatFloor, &cache, TileRect::new(0, 0, 32, 32));

        // First pass records the one sample everything else reuses
        assert_eq!(cache.summary().blocks, 1);
        assert_eq!(results[0].stats.top_level(), (16, 15.0 / 16.0));

        assert_eq!(results.len(), 2);
        let last = &results[1];
        assert_eq!(last.stats.top_level().1, 1.0);
        assert!(last.next.is_none());
        assert!(results.len() < scheduler.pass_count() as usize);
    }

    #[test]
    fn test_subdivision_monotonic_and_progress_complete() {
        let scheduler = PretraceScheduler::new(settings(0.9), 100);
        let cache = IrradianceCache::new(settings(0.9));
        let results = run_all(&scheduler, &Busy, &cache, TileRect::new(0, 0, 64, 64));

        assert_eq!(results.len(), scheduler.pass_count() as usize);
        let grids: Vec<u32> = results
            .iter()
            .filter_map(|r| r.next.as_ref())
            .map(|s| {
                let (x, y) = s.sub_block_counts();
                x * y
            })
            .collect();
        assert_eq!(grids, vec![16, 64, 256]);
        assert!(grids.windows(2).all(|w| w[0] <= w[1]));

        let total: f32 = results.iter().map(|r| r.progress).sum();
        assert!((total - 1.0).abs() < 1e-5);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.pass, i as u32 + 1);
        }
    }

    #[test]
    fn test_zero_coverage_never_subdivides() {
        let scheduler = PretraceScheduler::new(settings(0.0), 100);
        let cache = IrradianceCache::new(settings(0.0));
        let results = run_all(&scheduler, &Busy, &cache, TileRect::new(0, 0, 64, 64));

        assert_eq!(results.len(), 4);
        for r in &results {
            if let Some(state) = &r.next {
                assert_eq!(state.sub_block_counts(), (1, 1));
            }
        }
        // Whole rectangle each pass: 8x8, 16x16, 32x32, 64x64 probes
        let probes: Vec<u32> = results.iter().map(|r| r.probes).collect();
        assert_eq!(probes, vec![64, 256, 1024, 4096]);
    }

    #[test]
    fn test_sparse_sub_block_continues_despite_full_reuse() {
        let s = settings(0.5);
        let cache = IrradianceCache::new(s.clone());
        // Pre-seed so every probe reuses
        cache
            .record(Vec3::ZERO, Vec3::Y, &SampleRecord::uniform(Color::ONE, 100.0), 99, 1, 0, s.pretrace_error_bound())
            .unwrap();

        let scheduler = PretraceScheduler::new(s.clone(), 100);
        let cancel = CancelToken::new();
        let first = scheduler
            .run_rectangle(fresh(0, TileRect::new(0, 0, 16, 16)), &FlatFloor, &cache, &cancel)
            .unwrap();
        assert_eq!(first.probes, 4);
        assert_eq!(first.stats.top_level(), (4, 1.0));
        assert!(first.next.is_some());

        // Unless the pass budget is spent
        let capped = RadiositySettings {
            pretrace_max_passes: 1,
            ..s
        };
        let scheduler = PretraceScheduler::new(capped, 100);
        let only = scheduler
            .run_rectangle(fresh(0, TileRect::new(0, 0, 16, 16)), &FlatFloor, &cache, &cancel)
            .unwrap();
        assert!(only.next.is_none());
        assert!((only.progress - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_probe_jitter_is_reproducible() {
        let scheduler = PretraceScheduler::new(settings(0.9), 100);
        let cache = IrradianceCache::new(settings(0.9));
        let cancel = CancelToken::new();
        let rect = TileRect::new(0, 0, 32, 32);

        let positions = |serial: u32| {
            let recorder = Recorder::default();
            scheduler
                .run_rectangle(fresh(serial, rect), &recorder, &cache, &cancel)
                .unwrap();
            recorder.positions.into_inner().unwrap()
        };

        let a = positions(5);
        assert_eq!(a.len(), 16);
        assert_eq!(a, positions(5));
        assert_ne!(a, positions(6));
        assert!(a.iter().all(|&(x, y)| (0.0..32.0).contains(&x) && (0.0..32.0).contains(&y)));
    }

    #[test]
    fn test_inconsistent_state_restarts() {
        let scheduler = PretraceScheduler::new(settings(0.9), 100);
        let cache = IrradianceCache::new(settings(0.9));
        let broken = TileState {
            pass: 3,
            count_x: 4,
            count_y: 4,
            active: vec![true; 3],
            progress: 0.2,
        };
        let item = WorkItem {
            serial: 0,
            rect: TileRect::new(0, 0, 32, 32),
            slot: TileSlot::InProgress(broken),
        };
        let result = scheduler
            .run_rectangle(item, &Background, &cache, &CancelToken::new())
            .unwrap();
        assert_eq!(result.pass, 1);
        assert_eq!(result.probes, 16);
    }

    #[test]
    fn test_tracer_failure_propagates() {
        let scheduler = PretraceScheduler::new(settings(0.9), 100);
        let cache = IrradianceCache::new(settings(0.9));
        let err = scheduler
            .run_rectangle(fresh(0, TileRect::new(0, 0, 32, 32)), &Failing, &cache, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, RenderError::Trace(_)));
    }

    #[test]
    fn test_cancel_stops_after_one_probe() {
        let scheduler = PretraceScheduler::new(settings(0.9), 100);
        let cache = IrradianceCache::new(settings(0.9));
        let cancel = CancelToken::new();
        cancel.cancel();

        let recorder = Recorder::default();
        let err = scheduler
            .run_rectangle(fresh(0, TileRect::new(0, 0, 32, 32)), &recorder, &cache, &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(recorder.positions.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_children_inherit_parent_verdict() {
        let state = TileState {
            pass: 1,
            count_x: 2,
            count_y: 1,
            active: vec![true, true],
            progress: 0.0,
        };
        let next = state.subdivide(&[true, false], 2, 2, 0.1);
        assert_eq!(next.sub_block_counts(), (4, 2));
        assert_eq!(
            next.active,
            vec![true, true, false, false, true, true, false, false]
        );

        // Children tile their parent exactly
        let rect = TileRect::new(0, 0, 30, 10);
        let parent = state.sub_block(&rect, 0, 0).rect;
        let a = next.sub_block(&rect, 0, 0).rect;
        let b = next.sub_block(&rect, 1, 1).rect;
        assert_eq!((a.x0, a.y0), (parent.x0, parent.y0));
        assert_eq!((b.x1, b.y1), (parent.x1, parent.y1));
    }
}

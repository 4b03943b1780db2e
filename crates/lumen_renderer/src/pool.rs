//! Pretrace worker pool.
//!
//! A fixed set of workers, each looping `next_rectangle` → one pass →
//! `completed_rectangle` against the shared [`WorkQueue`]. The first worker
//! to fail records its error, raises the render-wide stop and closes the
//! queue; the others notice at their next checkpoint.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use lumen_cache::{CacheStats, IrradianceCache};

use crate::cancel::CancelToken;
use crate::error::{RenderError, RenderResult};
use crate::pretrace::PretraceScheduler;
use crate::tracer::ProbeTracer;
use crate::work_queue::{PixelSample, TileRect, WorkQueue};

/// What a pretrace run did.
#[derive(Debug, Clone, Default)]
pub struct PretraceReport {
    pub rectangles: usize,
    pub passes: u64,
    pub probes: u64,
    /// Top-level cache statistics over every pass
    pub stats: CacheStats,
    /// Samples in the cache afterwards
    pub blocks: usize,
    pub elapsed: Duration,
    /// Probe colours, usable as a low-resolution preview
    pub pixels: Vec<PixelSample>,
}

#[derive(Debug, Default)]
struct Totals {
    passes: u64,
    probes: u64,
    stats: CacheStats,
}

/// Pretrace `rects` on `threads` workers.
pub fn run_pretrace(
    tracer: &dyn ProbeTracer,
    cache: &IrradianceCache,
    scheduler: &PretraceScheduler,
    rects: Vec<TileRect>,
    threads: usize,
    cancel: &CancelToken,
) -> RenderResult<PretraceReport> {
    let start = Instant::now();
    let threads = threads.max(1);
    let queue = WorkQueue::from_rects(rects);
    let totals = Mutex::new(Totals::default());
    let failure: Mutex<Option<RenderError>> = Mutex::new(None);

    log::info!(
        "Pretrace: {} rectangles, {} passes, {} workers",
        queue.total(),
        scheduler.pass_count(),
        threads
    );

    let fail = |err: RenderError| {
        {
            let mut slot = failure.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        cancel.cancel();
        queue.close();
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("lumen-pretrace-{i}"))
        .build()
        .map_err(|e| RenderError::ThreadPool(e.to_string()))?;

    pool.scope(|s| {
        for worker in 0..threads {
            let queue = &queue;
            let totals = &totals;
            let fail = &fail;
            s.spawn(move |_| {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    worker_loop(worker, tracer, cache, scheduler, queue, totals, cancel)
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => fail(err),
                    Err(_) => {
                        log::warn!("Pretrace worker {worker} panicked");
                        fail(RenderError::WorkerPanicked);
                    }
                }
            });
        }
    });

    if let Some(err) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(RenderError::Cancelled);
    }

    let totals = totals.into_inner().unwrap_or_else(PoisonError::into_inner);
    let report = PretraceReport {
        rectangles: queue.finished_count(),
        passes: totals.passes,
        probes: totals.probes,
        stats: totals.stats,
        blocks: cache.summary().blocks,
        elapsed: start.elapsed(),
        pixels: queue.take_pixels(),
    };
    let (queries, reuse) = report.stats.top_level();
    log::info!(
        "Pretrace done in {:.2?}: {} passes, {} probes, {} queries ({:.1}% reused), {} samples cached",
        report.elapsed,
        report.passes,
        report.probes,
        queries,
        reuse * 100.0,
        report.blocks
    );
    Ok(report)
}

fn worker_loop(
    worker: usize,
    tracer: &dyn ProbeTracer,
    cache: &IrradianceCache,
    scheduler: &PretraceScheduler,
    queue: &WorkQueue,
    totals: &Mutex<Totals>,
    cancel: &CancelToken,
) -> RenderResult<()> {
    while let Some(item) = queue.next_rectangle() {
        let serial = item.serial;
        if cancel.is_cancelled() {
            queue.abandon(serial);
            return Err(RenderError::Cancelled);
        }

        match scheduler.run_rectangle(item, tracer, cache, cancel) {
            Ok(result) => {
                {
                    let mut t = totals.lock().unwrap_or_else(PoisonError::into_inner);
                    t.passes += 1;
                    t.probes += result.probes as u64;
                    t.stats.merge(&result.stats);
                }
                queue.completed_rectangle(result);
                log::debug!("Worker {worker}: pretrace {:.1}% complete", queue.progress() * 100.0);
            }
            Err(err) => {
                queue.abandon(serial);
                if !err.is_cancelled() {
                    log::warn!("Worker {worker} abandoned rectangle {serial}: {err}");
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

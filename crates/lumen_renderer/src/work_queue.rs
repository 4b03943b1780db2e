//! Shared queue of screen rectangles for the pretrace workers.
//!
//! A rectangle is either waiting in the queue or held by exactly one worker.
//! Its scheduler state travels with it ([`TileSlot`]); when a worker finishes
//! a pass it hands the state back and the rectangle is re-queued behind the
//! others, so passes of one rectangle never overlap.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use lumen_cache::CacheStats;

use crate::bucket::Bucket;
use crate::material::Color;
use crate::pretrace::TileState;

/// Half-open pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl TileRect {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self {
            x0,
            y0,
            x1: x1.max(x0),
            y1: y1.max(y0),
        }
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

impl From<&Bucket> for TileRect {
    fn from(b: &Bucket) -> Self {
        TileRect::new(b.x, b.y, b.x + b.width, b.y + b.height)
    }
}

/// Scheduler state carried by a queued rectangle.
#[derive(Debug, Clone, PartialEq)]
pub enum TileSlot {
    /// Not sampled yet
    Fresh,
    InProgress(TileState),
}

/// A rectangle handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Stable id of the rectangle; also the `tile_id` of its samples
    pub serial: u32,
    pub rect: TileRect,
    pub slot: TileSlot,
}

/// A probe colour at a pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelSample {
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

/// Outcome of one pass over a rectangle.
#[derive(Debug, Clone, PartialEq)]
pub struct TileResult {
    pub serial: u32,
    pub rect: TileRect,
    /// Pass that was just run
    pub pass: u32,
    /// State for the next pass, or `None` once the rectangle is done
    pub next: Option<TileState>,
    pub pixels: Vec<PixelSample>,
    /// Completion added by this pass, in [0, 1] of one rectangle
    pub progress: f32,
    /// Top-level statistics summed over the pass's sub-blocks
    pub stats: CacheStats,
    pub probes: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<WorkItem>,
    in_flight: usize,
    finished: usize,
    total: usize,
    progress: f64,
    pixels: Vec<PixelSample>,
    closed: bool,
}

/// Rectangle queue shared by all workers.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl WorkQueue {
    /// Queue fresh rectangles; serials follow the given order.
    pub fn from_rects(rects: impl IntoIterator<Item = TileRect>) -> Self {
        let pending: VecDeque<WorkItem> = rects
            .into_iter()
            .filter(|r| !r.is_empty())
            .enumerate()
            .map(|(serial, rect)| WorkItem {
                serial: serial as u32,
                rect,
                slot: TileSlot::Fresh,
            })
            .collect();
        let total = pending.len();
        Self {
            state: Mutex::new(QueueState {
                pending,
                total,
                ..Default::default()
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the next rectangle, waiting while others are still in flight
    /// and may come back. `None` once everything is done or the queue is
    /// closed.
    pub fn next_rectangle(&self) -> Option<WorkItem> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.pending.pop_front() {
                state.in_flight += 1;
                return Some(item);
            }
            if state.in_flight == 0 {
                return None;
            }
            state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Hand back a rectangle after one pass.
    pub fn completed_rectangle(&self, result: TileResult) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.progress += result.progress as f64;
        state.pixels.extend(result.pixels);
        match result.next {
            Some(next) => state.pending.push_back(WorkItem {
                serial: result.serial,
                rect: result.rect,
                slot: TileSlot::InProgress(next),
            }),
            None => state.finished += 1,
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Drop a rectangle whose pass failed. It is not re-queued.
    pub fn abandon(&self, serial: u32) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        log::debug!("Abandoned rectangle {serial}");
        self.changed.notify_all();
    }

    /// Stop handing out work and wake every waiting worker.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    /// Overall completion in [0, 1].
    pub fn progress(&self) -> f64 {
        let state = self.lock();
        if state.total == 0 {
            1.0
        } else {
            (state.progress / state.total as f64).min(1.0)
        }
    }

    /// Probe colours delivered so far; clears the internal buffer.
    pub fn take_pixels(&self) -> Vec<PixelSample> {
        std::mem::take(&mut self.lock().pixels)
    }

    /// Rectangles that ran all their passes.
    pub fn finished_count(&self) -> usize {
        self.lock().finished
    }

    pub fn total(&self) -> usize {
        self.lock().total
    }

    pub fn is_finished(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.in_flight == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn result(item: &WorkItem, next: Option<TileState>, progress: f32) -> TileResult {
        TileResult {
            serial: item.serial,
            rect: item.rect,
            pass: 1,
            next,
            pixels: vec![PixelSample {
                x: item.rect.x0,
                y: item.rect.y0,
                color: Color::ONE,
            }],
            progress,
            stats: CacheStats::default(),
            probes: 1,
        }
    }

    #[test]
    fn test_serials_and_empty_rects() {
        let queue = WorkQueue::from_rects([
            TileRect::new(0, 0, 8, 8),
            TileRect::new(8, 0, 8, 8),
            TileRect::new(0, 8, 8, 16),
        ]);
        assert_eq!(queue.total(), 2);
        let a = queue.next_rectangle().unwrap();
        let b = queue.next_rectangle().unwrap();
        assert_eq!((a.serial, b.serial), (0, 1));
        assert_eq!(a.slot, TileSlot::Fresh);
    }

    #[test]
    fn test_requeued_rectangle_carries_state() {
        let queue = WorkQueue::from_rects([TileRect::new(0, 0, 8, 8)]);
        let item = queue.next_rectangle().unwrap();
        let state = TileState::new();
        queue.completed_rectangle(result(&item, Some(state.clone()), 0.25));

        let again = queue.next_rectangle().unwrap();
        assert_eq!(again.serial, item.serial);
        assert_eq!(again.slot, TileSlot::InProgress(state));

        queue.completed_rectangle(result(&again, None, 0.75));
        assert!(queue.next_rectangle().is_none());
        assert!(queue.is_finished());
        assert_eq!(queue.finished_count(), 1);
        assert!((queue.progress() - 1.0).abs() < 1e-9);
        assert_eq!(queue.take_pixels().len(), 2);
        assert!(queue.take_pixels().is_empty());
    }

    #[test]
    fn test_idle_worker_waits_for_returning_rectangle() {
        let queue = Arc::new(WorkQueue::from_rects([TileRect::new(0, 0, 4, 4)]));
        let item = queue.next_rectangle().unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next_rectangle().map(|w| w.serial))
        };
        thread::sleep(Duration::from_millis(20));
        queue.completed_rectangle(result(&item, Some(TileState::new()), 0.5));

        assert_eq!(waiter.join().unwrap(), Some(0));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let queue = Arc::new(WorkQueue::from_rects([TileRect::new(0, 0, 4, 4)]));
        let _held = queue.next_rectangle().unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next_rectangle().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_abandon_releases_in_flight() {
        let queue = WorkQueue::from_rects([TileRect::new(0, 0, 4, 4)]);
        let item = queue.next_rectangle().unwrap();
        queue.abandon(item.serial);
        assert!(queue.next_rectangle().is_none());
        assert_eq!(queue.finished_count(), 0);
    }
}

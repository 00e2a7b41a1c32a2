//! Triple-buffered RGB handoff between the capture thread and the renderer.
//!
//! The producer converts into the back surface and commits it to the ready
//! slot; the renderer swaps the ready slot to the front only when a committed
//! frame is waiting. A commit never withdraws the ready frame before the
//! renderer can see it, so a producer slower than the renderer's poll still
//! gets its frames shown. Index bookkeeping lives under one mutex; each
//! surface has its own lock so conversion and upload never hold the shared one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;

use crate::capture::frame::Surface;

#[derive(Debug)]
struct State {
    back: usize,
    ready: usize,
    front: usize,
    /// The ready slot holds a commit the renderer has not taken.
    new_frame: bool,
    /// Committed dimensions differ from the ones the renderer last saw.
    dims_changed: bool,
    committed_dims: Option<(u32, u32)>,
}

#[derive(Default)]
struct Stats {
    committed: AtomicU64,
    swapped: AtomicU64,
    overwritten: AtomicU64,
}

/// Counters since creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuttleStats {
    pub committed: u64,
    pub swapped: u64,
    /// Committed frames replaced before the renderer picked them up.
    pub overwritten: u64,
}

/// Slot indices at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIndices {
    pub front: usize,
    pub ready: usize,
    pub back: usize,
}

pub struct FrameShuttle {
    state: Mutex<State>,
    surfaces: [Mutex<Surface>; 3],
    stats: CachePadded<Stats>,
}

/// Front surface handed to the renderer by [`FrameShuttle::consumer_try_swap`].
pub struct FrontFrame<'a> {
    pub surface: MutexGuard<'a, Surface>,
    /// Texture storage must be re-specified before uploading this surface.
    pub dims_changed: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FrameShuttle {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Mutex::new(State {
                back: 0,
                ready: 1,
                front: 2,
                new_frame: false,
                dims_changed: false,
                committed_dims: None,
            }),
            surfaces: [
                Mutex::new(Surface::new(width, height)),
                Mutex::new(Surface::new(width, height)),
                Mutex::new(Surface::new(width, height)),
            ],
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Writable back surface, to be handed back through [`Self::producer_commit`].
    ///
    /// The back slot is never the front one, so this does not wait on the renderer.
    pub fn producer_begin(&self) -> MutexGuard<'_, Surface> {
        let back = lock(&self.state).back;
        lock(&self.surfaces[back])
    }

    /// Publish the back surface obtained from [`Self::producer_begin`].
    ///
    /// A ready frame the renderer has not taken yet is replaced and counted
    /// as overwritten.
    pub fn producer_commit(&self, back: MutexGuard<'_, Surface>) {
        let dims = (back.width, back.height);
        drop(back);

        let mut state = lock(&self.state);
        if state.committed_dims != Some(dims) {
            if state.committed_dims.is_some() {
                tracing::info!("Frame size changed to {}x{}", dims.0, dims.1);
            }
            state.committed_dims = Some(dims);
            state.dims_changed = true;
        }
        if state.new_frame {
            self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        let State { back, ready, .. } = &mut *state;
        std::mem::swap(back, ready);
        state.new_frame = true;
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Swap in the newest committed frame, if any.
    pub fn consumer_try_swap(&self) -> Option<FrontFrame<'_>> {
        let (front, dims_changed) = {
            let mut state = lock(&self.state);
            if !state.new_frame {
                return None;
            }
            state.new_frame = false;
            let State { ready, front, .. } = &mut *state;
            std::mem::swap(ready, front);
            (state.front, std::mem::take(&mut state.dims_changed))
        };
        self.stats.swapped.fetch_add(1, Ordering::Relaxed);
        Some(FrontFrame {
            surface: lock(&self.surfaces[front]),
            dims_changed,
        })
    }

    pub fn indices(&self) -> SlotIndices {
        let state = lock(&self.state);
        SlotIndices {
            front: state.front,
            ready: state.ready,
            back: state.back,
        }
    }

    pub fn stats(&self) -> ShuttleStats {
        ShuttleStats {
            committed: self.stats.committed.load(Ordering::Relaxed),
            swapped: self.stats.swapped.load(Ordering::Relaxed),
            overwritten: self.stats.overwritten.load(Ordering::Relaxed),
        }
    }
}

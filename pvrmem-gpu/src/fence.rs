// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Kick fences and the completion event.
//!
//! Every attachment point (a render context or a surface) owns a
//! [`FenceTimeline`] with two monotonically increasing 32-bit counters:
//!
//! - `pending`: the fence value of the kick currently being built. Work
//!   recorded now is tagged with this value. Submitting the kick advances it.
//! - `completed`: status memory written by the GPU as kicks retire. The CPU
//!   only ever reads it (the simulated GPU and tests write it through
//!   [`FenceTimeline::complete`]).
//!
//! A [`KickEvent`] is signalled whenever any kick retires so that blocked
//! producers can re-check their condition.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pvrmem_common::{fence_reached, FenceValue};

/// Identity of a context or surface whose kicks resources wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentPointId(pub u32);

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

/// Completion-event handle contract.
pub trait CompletionEvent: Send + Sync {
    /// Block until the event fires or `timeout` expires.
    fn wait(&self, timeout: Duration) -> WaitOutcome;
}

/// Broadcast event signalled on every kick retirement.
pub struct KickEvent {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl KickEvent {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Wake every waiter.
    pub fn signal(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_all();
    }

    /// Number of signals so far.
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }
}

impl Default for KickEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionEvent for KickEvent {
    fn wait(&self, timeout: Duration) -> WaitOutcome {
        let mut generation = self.generation.lock();
        let start = *generation;
        let deadline = Instant::now() + timeout;

        while *generation == start {
            if self.condvar.wait_until(&mut generation, deadline).timed_out() {
                return if *generation == start {
                    WaitOutcome::TimedOut
                } else {
                    WaitOutcome::Signaled
                };
            }
        }
        WaitOutcome::Signaled
    }
}

/// Kick counters of one attachment point.
pub struct FenceTimeline {
    id: AttachmentPointId,
    pending: AtomicU32,
    completed: AtomicU32,
    event: Arc<KickEvent>,
}

impl FenceTimeline {
    /// The first kick built on a new timeline has fence value 1.
    pub fn new(id: AttachmentPointId, event: Arc<KickEvent>) -> Self {
        Self {
            id,
            pending: AtomicU32::new(1),
            completed: AtomicU32::new(0),
            event,
        }
    }

    pub fn id(&self) -> AttachmentPointId {
        self.id
    }

    /// Fence value of the kick currently being built.
    pub fn pending(&self) -> FenceValue {
        self.pending.load(Ordering::Acquire)
    }

    /// Highest fence value retired by the hardware.
    pub fn completed(&self) -> FenceValue {
        self.completed.load(Ordering::Acquire)
    }

    /// Submit the kick being built. Returns its fence value.
    pub fn submit(&self) -> FenceValue {
        let fence = self.pending.fetch_add(1, Ordering::AcqRel);
        log::trace!("fence[{}]: submitted kick {}", self.id.0, fence);
        fence
    }

    /// Hardware side: mark every kick up to and including `fence` retired.
    pub fn complete(&self, fence: FenceValue) {
        let mut current = self.completed.load(Ordering::Acquire);
        while !fence_reached(current, fence) {
            match self.completed.compare_exchange_weak(
                current,
                fence,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        log::trace!("fence[{}]: completed up to {}", self.id.0, fence);
        self.event.signal();
    }

    /// Whether the kick tagged `fence` has retired.
    pub fn is_retired(&self, fence: FenceValue) -> bool {
        fence_reached(self.completed(), fence)
    }

    /// Whether the kick tagged `fence` has been handed to the hardware.
    pub fn is_submitted(&self, fence: FenceValue) -> bool {
        fence != self.pending()
    }

    /// Completion event shared with the rest of the device.
    pub fn event(&self) -> &Arc<KickEvent> {
        &self.event
    }
}

impl std::fmt::Debug for FenceTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceTimeline")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .field("completed", &self.completed())
            .finish()
    }
}

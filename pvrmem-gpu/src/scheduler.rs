// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Kick scheduling callback.

use std::sync::atomic::{AtomicU32, Ordering};

/// Asked to kick the owning context soon.
///
/// Ring buffers call this when unkicked work crosses their threshold, and the
/// kick resource manager calls it when a resource is waiting on a kick that
/// has not been submitted yet.
pub trait KickScheduler {
    fn schedule_kick(&self, final_in_scene: bool);
}

/// Scheduler that only counts requests. The owner polls and kicks.
#[derive(Debug, Default)]
pub struct KickRequests {
    requested: AtomicU32,
    final_requested: AtomicU32,
}

impl KickRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the outstanding requests: `None` if there were none, otherwise
    /// whether any of them asked for the final kick of the scene.
    pub fn take(&self) -> Option<bool> {
        let requested = self.requested.swap(0, Ordering::AcqRel);
        let final_requested = self.final_requested.swap(0, Ordering::AcqRel);
        (requested + final_requested > 0).then_some(final_requested > 0)
    }

    pub fn pending(&self) -> u32 {
        self.requested.load(Ordering::Acquire) + self.final_requested.load(Ordering::Acquire)
    }
}

impl KickScheduler for KickRequests {
    fn schedule_kick(&self, final_in_scene: bool) {
        if final_in_scene {
            self.final_requested.fetch_add(1, Ordering::AcqRel);
        } else {
            self.requested.fetch_add(1, Ordering::AcqRel);
        }
    }
}

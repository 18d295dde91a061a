// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Simulated GPU.
//!
//! A worker thread runs submitted kicks in order: after a fixed latency it
//! moves each ring's read offset to the end of the kick's data and writes the
//! kick's fence to the context's status memory.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace};
use pvrmem_gpu::fence::{CompletionEvent, FenceTimeline, KickEvent};
use pvrmem_gpu::render_context::KickSubmission;
use pvrmem_gpu::ring_buffer::{RingBufferKind, RingConsumer};

const RING_KINDS: usize = RingBufferKind::ALL.len();

struct Job {
    submission: KickSubmission,
    timeline: Arc<FenceTimeline>,
}

struct Shared {
    reads: [AtomicU64; RING_KINDS],
    /// Kicks submitted but not yet run, per ring.
    in_flight: [AtomicU32; RING_KINDS],
    kicks_run: AtomicU64,
    event: Arc<KickEvent>,
}

pub struct SimGpu {
    shared: Arc<Shared>,
    queue: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SimGpu {
    pub fn start(event: Arc<KickEvent>, latency: Duration) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            reads: Default::default(),
            in_flight: Default::default(),
            kicks_run: AtomicU64::new(0),
            event,
        });
        let (tx, rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("sim-gpu".into())
            .spawn({
                let shared = shared.clone();
                move || run(shared, rx, latency)
            })?;

        Ok(Self {
            shared,
            queue: Some(tx),
            worker: Some(worker),
        })
    }

    /// Queue a kick for execution.
    pub fn submit(&self, submission: KickSubmission, timeline: Arc<FenceTimeline>) {
        for &(kind, _) in &submission.ring_ends {
            self.shared.in_flight[kind.index()].fetch_add(1, Ordering::AcqRel);
        }
        let Some(queue) = &self.queue else {
            return;
        };
        if queue.send(Job { submission, timeline }).is_err() {
            log::warn!("sim-gpu: worker has stopped, kick dropped");
        }
    }

    pub fn kicks_run(&self) -> u64 {
        self.shared.kicks_run.load(Ordering::Acquire)
    }

    pub fn event(&self) -> &Arc<KickEvent> {
        &self.shared.event
    }
}

impl RingConsumer for SimGpu {
    fn read_offset(&self, kind: RingBufferKind) -> u64 {
        self.shared.reads[kind.index()].load(Ordering::Acquire)
    }

    fn is_idle(&self, kind: RingBufferKind) -> bool {
        self.shared.in_flight[kind.index()].load(Ordering::Acquire) == 0
    }

    fn completion_event(&self) -> &dyn CompletionEvent {
        &*self.shared.event
    }
}

impl Drop for SimGpu {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain and exit.
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("sim-gpu: worker panicked");
            }
        }
    }
}

fn run(shared: Arc<Shared>, rx: Receiver<Job>, latency: Duration) {
    debug!("sim-gpu: started");
    for job in rx {
        thread::sleep(latency);
        let submission = &job.submission;
        if submission.flush_code_cache {
            trace!("sim-gpu: kick {} invalidates the code cache", submission.fence);
        }

        for &(kind, end) in &submission.ring_ends {
            shared.reads[kind.index()].store(end, Ordering::Release);
            shared.in_flight[kind.index()].fetch_sub(1, Ordering::AcqRel);
        }
        shared.kicks_run.fetch_add(1, Ordering::AcqRel);
        job.timeline.complete(submission.fence);
        trace!(
            "sim-gpu: ran kick {} of context {}",
            submission.fence,
            submission.context.0
        );
    }
    debug!("sim-gpu: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvrmem_gpu::fence::AttachmentPointId;

    #[test]
    fn test_kick_runs_and_completes() {
        let event = Arc::new(KickEvent::new());
        let timeline = Arc::new(FenceTimeline::new(AttachmentPointId(1), event.clone()));
        let gpu = SimGpu::start(event, Duration::from_millis(1)).unwrap();

        let fence = timeline.submit();
        gpu.submit(
            KickSubmission {
                context: timeline.id(),
                fence,
                control_stream: 0,
                final_in_scene: false,
                flush_code_cache: false,
                ring_ends: vec![(RingBufferKind::Vertex, 0x40)],
            },
            timeline.clone(),
        );
        assert!(!gpu.is_idle(RingBufferKind::Vertex) || timeline.is_retired(fence));

        while !timeline.is_retired(fence) {
            gpu.completion_event().wait(Duration::from_millis(10));
        }
        assert_eq!(gpu.read_offset(RingBufferKind::Vertex), 0x40);
        assert!(gpu.is_idle(RingBufferKind::Vertex));
        assert_eq!(gpu.kicks_run(), 1);
    }
}

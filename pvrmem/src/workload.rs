// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Synthetic producer.
//!
//! Each unit streams a draw call's worth of data into every ring and churns
//! a small set of shader programs, kicking whenever a ring asks for it and
//! ending a scene every `SCENE_UNITS` units.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use pvrmem_common::Classify;
use pvrmem_gpu::code_heap::CodeHeapKind;
use pvrmem_gpu::kick_resource::ResourceId;
use pvrmem_gpu::render_context::RenderContext;
use pvrmem_gpu::ring_buffer::{RingBufferKind, RingConsumer};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::gpu_sim::SimGpu;

const SCENE_UNITS: u32 = 16;
const MAX_PROGRAMS: usize = 24;
const EMIT_ATTEMPTS: u32 = 4;

#[derive(Debug, Default, Clone, Copy)]
pub struct WorkloadStats {
    pub units: u32,
    pub kicks: u32,
    pub final_kicks: u32,
    pub ring_stalls: u32,
    pub uploads: u32,
    pub replacements: u32,
    pub deletions: u32,
    pub reclaimed: usize,
}

pub struct Workload<'a> {
    ctx: RenderContext,
    gpu: &'a SimGpu,
    rng: ChaCha8Rng,
    programs: Vec<ResourceId>,
    stats: WorkloadStats,
}

impl<'a> Workload<'a> {
    pub fn new(ctx: RenderContext, gpu: &'a SimGpu, seed: u64) -> Self {
        Self {
            ctx,
            gpu,
            rng: ChaCha8Rng::seed_from_u64(seed),
            programs: Vec::new(),
            stats: WorkloadStats::default(),
        }
    }

    pub fn run_unit(&mut self) -> Result<()> {
        self.churn_programs()?;

        for _ in 0..self.rng.gen_range(1..=3) {
            if let Some(&program) = self.pick_program() {
                self.ctx.use_program(program)?;
                if self.rng.gen_bool(0.05) {
                    self.ctx.flush_unkicked_resource(program)?;
                }
            }
        }

        for kind in RingBufferKind::ALL {
            let len = self.payload_len(kind);
            self.emit(kind, len)?;
        }

        self.stats.units += 1;
        let wants_kick = self.ctx.end_unit();
        if self.stats.units % SCENE_UNITS == 0 {
            self.kick(true)?;
        } else if wants_kick || self.ctx.kick_requests().pending() > 0 {
            self.kick(false)?;
        }
        Ok(())
    }

    /// End the scene, wait for the GPU to drain and tear the context down.
    pub fn finish(mut self) -> Result<WorkloadStats> {
        self.kick(true)?;

        let timeline = self.ctx.timeline().clone();
        let last = timeline.pending().wrapping_sub(1);
        let mut waits = 0;
        while !timeline.is_retired(last) {
            if waits == 10_000 {
                bail!("GPU did not retire kick {} ({:?})", last, timeline);
            }
            waits += 1;
            self.gpu
                .completion_event()
                .wait(std::time::Duration::from_millis(1));
        }
        self.stats.reclaimed += self.ctx.reclaim()?;

        let stats = self.ctx.stats();
        info!(
            "Programs: {} live, {} ghosts, attachments {}/{}",
            stats.programs.live,
            stats.programs.ghosts,
            stats.programs.attachments_in_use,
            stats.programs.attachment_capacity
        );
        info!(
            "USE heap: {} segments, {} blocks out, {} free bytes in {} blocks",
            stats.use_heap.segments,
            stats.use_heap.outstanding,
            stats.use_heap.free_bytes,
            stats.use_heap.free_blocks
        );
        info!(
            "PDS heap: {} segments, {} blocks out, {} free bytes in {} blocks",
            stats.pds_heap.segments,
            stats.pds_heap.outstanding,
            stats.pds_heap.free_bytes,
            stats.pds_heap.free_blocks
        );

        self.ctx
            .shutdown(self.gpu.event().as_ref())
            .context("shutting down render context")?;
        Ok(self.stats)
    }

    fn kick(&mut self, final_in_scene: bool) -> Result<()> {
        let mut attempt = 1;
        let submission = loop {
            match self.ctx.kick(final_in_scene, self.gpu) {
                Ok(submission) => break submission,
                // The control stream is full of kicks the GPU has not read yet.
                Err(e) if e.class().is_retryable() && attempt < EMIT_ATTEMPTS => {
                    debug!("{} (kick attempt {})", e, attempt);
                    self.stats.ring_stalls += 1;
                    attempt += 1;
                    self.gpu
                        .completion_event()
                        .wait(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(e).context("kicking"),
            }
        };
        self.gpu.submit(submission, self.ctx.timeline().clone());
        self.stats.kicks += 1;
        if final_in_scene {
            self.stats.final_kicks += 1;
        }
        self.stats.reclaimed += self.ctx.reclaim()?;
        Ok(())
    }

    fn emit(&mut self, kind: RingBufferKind, len: usize) -> Result<()> {
        let data: Vec<u8> = (0..len).map(|_| self.rng.gen()).collect();
        for attempt in 1..=EMIT_ATTEMPTS {
            match self.ctx.emit(kind, &data, self.gpu) {
                Ok(_) => return Ok(()),
                Err(e) if e.class().is_retryable() => {
                    debug!("{} (attempt {})", e, attempt);
                    self.stats.ring_stalls += 1;
                    // Pixel-stage data is only released by the end of the scene.
                    self.kick(kind.is_late_stage())?;
                }
                Err(e) => return Err(e).context(format!("emitting {} bytes", len)),
            }
        }
        bail!("ring {:?} still full after {} kicks", kind, EMIT_ATTEMPTS)
    }

    fn churn_programs(&mut self) -> Result<()> {
        if self.programs.len() < MAX_PROGRAMS && self.rng.gen_bool(0.3) {
            let kind = if self.rng.gen_bool(0.5) {
                CodeHeapKind::Use
            } else {
                CodeHeapKind::Pds
            };
            let code = self.program_code(kind);
            let id = self.ctx.upload_program(kind, &code)?;
            self.programs.push(id);
            self.stats.uploads += 1;
        }

        if !self.programs.is_empty() && self.rng.gen_bool(0.1) {
            let idx = self.rng.gen_range(0..self.programs.len());
            let id = self.programs[idx];
            let kind = self.ctx.programs().lock().payload(id)?.kind();
            let code = self.program_code(kind);
            self.ctx.replace_program(id, &code)?;
            self.stats.replacements += 1;
        }

        if !self.programs.is_empty() && self.rng.gen_bool(0.1) {
            let idx = self.rng.gen_range(0..self.programs.len());
            let id = self.programs.swap_remove(idx);
            if let Err(e) = self.ctx.delete_program(id) {
                warn!("Failed to delete program: {}", e);
            }
            self.stats.deletions += 1;
        }
        Ok(())
    }

    fn pick_program(&mut self) -> Option<&ResourceId> {
        if self.programs.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.programs.len());
        self.programs.get(idx)
    }

    fn program_code(&mut self, kind: CodeHeapKind) -> Vec<u8> {
        let len = match kind {
            CodeHeapKind::Use => self.rng.gen_range(16..=512),
            CodeHeapKind::Pds => self.rng.gen_range(64..=1024),
        };
        (0..len).map(|_| self.rng.gen()).collect()
    }

    fn payload_len(&mut self, kind: RingBufferKind) -> usize {
        let words = match kind {
            RingBufferKind::ControlStream => self.rng.gen_range(2..=16),
            RingBufferKind::Index => self.rng.gen_range(16..=256),
            RingBufferKind::Vertex => self.rng.gen_range(64..=1024),
            RingBufferKind::UseCode => self.rng.gen_range(4..=64),
            RingBufferKind::PdsCode | RingBufferKind::PdsPixel => self.rng.gen_range(4..=32),
        };
        words * 4
    }
}

// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Render context.
//!
//! Owns one ring per buffer kind, the USE and PDS code heaps, and a kick
//! resource manager holding every uploaded program. Programs referenced by a
//! kick are attached to the context's fence timeline; deleted or replaced
//! programs go to the ghost list and are returned to their heap by
//! [`RenderContext::reclaim`] once the kicks using them have retired.

use std::sync::Arc;

use pvrmem_common::{Classify, DevAddr, ErrorClass, FenceValue, Settings};
use thiserror::Error;

use crate::code_heap::{
    CodeBlock, CodeHeap, CodeHeapConfig, CodeHeapKind, CodeHeapStats, HeapError,
};
use crate::device_memory::{DeviceMemory, DeviceMemoryError};
use crate::fence::{AttachmentPointId, CompletionEvent, FenceTimeline, KickEvent};
use crate::kick_resource::{
    KickResourceManager, KrmConfig, KrmError, KrmKind, KrmStats, ResourceId, ResourceList,
};
use crate::leak_tracker::ContextCodeHeap;
use crate::ring_buffer::{RingBufferKind, RingBufferSet, RingConsumer, RingError};
use crate::scheduler::{KickRequests, KickScheduler};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Krm(#[from] KrmError),
    #[error(transparent)]
    Memory(#[from] DeviceMemoryError),
}

impl Classify for ContextError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Ring(e) => e.class(),
            Self::Heap(e) => e.class(),
            Self::Krm(e) => e.class(),
            Self::Memory(e) => e.class(),
        }
    }
}

/// An uploaded program, owned by the context's resource manager.
#[derive(Debug)]
pub struct Program {
    kind: CodeHeapKind,
    block: CodeBlock,
}

impl Program {
    pub fn kind(&self) -> CodeHeapKind {
        self.kind
    }

    pub fn device_addr(&self) -> DevAddr {
        self.block.device_addr()
    }

    pub fn size(&self) -> u64 {
        self.block.size()
    }
}

/// Everything the hardware needs to run one kick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickSubmission {
    pub context: AttachmentPointId,
    pub fence: FenceValue,
    /// Device address of the kick's first control stream record.
    pub control_stream: DevAddr,
    pub final_in_scene: bool,
    /// Code memory was recycled since the previous kick.
    pub flush_code_cache: bool,
    /// Offset each ring's consumer may read up to once the kick runs.
    pub ring_ends: Vec<(RingBufferKind, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextStats {
    pub pending_fence: FenceValue,
    pub completed_fence: FenceValue,
    pub programs: KrmStats,
    pub use_heap: CodeHeapStats,
    pub pds_heap: CodeHeapStats,
}

pub struct RenderContext {
    timeline: Arc<FenceTimeline>,
    memory: Arc<dyn DeviceMemory>,
    rings: RingBufferSet,
    heaps: [ContextCodeHeap; 2],
    programs: KickResourceManager<Program>,
    requests: KickRequests,
    flush_code_cache: bool,
}

fn heap_slot(kind: CodeHeapKind) -> usize {
    match kind {
        CodeHeapKind::Use => 0,
        CodeHeapKind::Pds => 1,
    }
}

fn release(heaps: &mut [ContextCodeHeap; 2], program: Program) -> Result<(), HeapError> {
    heaps[heap_slot(program.kind)].free(program.block)
}

impl RenderContext {
    pub fn new(
        id: AttachmentPointId,
        settings: &Settings,
        memory: Arc<dyn DeviceMemory>,
        event: Arc<KickEvent>,
    ) -> Result<Self, ContextError> {
        let heap_config = CodeHeapConfig::from_settings(settings);
        let use_heap = CodeHeap::new(CodeHeapKind::Use, heap_config, memory.clone())?;
        let pds_heap = CodeHeap::new(CodeHeapKind::Pds, heap_config, memory.clone())?;

        log::info!("context[{}]: created", id.0);
        Ok(Self {
            timeline: Arc::new(FenceTimeline::new(id, event)),
            rings: RingBufferSet::new(settings, memory.clone())?,
            memory,
            heaps: [use_heap.into(), pds_heap.into()],
            programs: KickResourceManager::new(KrmKind::Ta, KrmConfig::from_settings(settings)),
            requests: KickRequests::new(),
            flush_code_cache: false,
        })
    }

    pub fn id(&self) -> AttachmentPointId {
        self.timeline.id()
    }

    pub fn timeline(&self) -> &Arc<FenceTimeline> {
        &self.timeline
    }

    pub fn rings(&self) -> &RingBufferSet {
        &self.rings
    }

    pub fn programs(&self) -> &KickResourceManager<Program> {
        &self.programs
    }

    /// Kicks requested by the rings or by resource flushes since the last kick.
    pub fn kick_requests(&self) -> &KickRequests {
        &self.requests
    }

    /// Copy `data` into the ring of `kind`. Returns its device address.
    pub fn emit(
        &mut self,
        kind: RingBufferKind,
        data: &[u8],
        consumer: &dyn RingConsumer,
    ) -> Result<DevAddr, ContextError> {
        let ring = self.rings.ring_mut(kind);
        let reservation = ring.reserve(data.len() as u64, consumer)?;
        let device = reservation.device_addr();
        if let Err(e) = ring.write(&reservation, 0, data) {
            ring.commit(reservation, 0)?;
            return Err(e.into());
        }
        ring.commit(reservation, data.len() as u64)?;
        Ok(device)
    }

    /// Close a unit of work. Returns whether a kick is now wanted.
    pub fn end_unit(&mut self) -> bool {
        self.rings.note_completed_unit(&self.requests)
    }

    /// Copy `code` into a fresh block of the `kind` heap.
    #[track_caller]
    pub fn upload_program(
        &mut self,
        kind: CodeHeapKind,
        code: &[u8],
    ) -> Result<ResourceId, ContextError> {
        let program = self.load(kind, code)?;
        Ok(self.programs.create_resource(program))
    }

    pub fn program_address(&self, id: ResourceId) -> Result<DevAddr, ContextError> {
        Ok(self.programs.lock().payload(id)?.device_addr())
    }

    /// Reference `id` from the kick being built.
    pub fn use_program(&self, id: ResourceId) -> Result<(), ContextError> {
        self.programs
            .attach(id, &self.timeline, self.timeline.pending())?;
        Ok(())
    }

    /// Upload new code for `id`. Kicks already referencing the old code keep
    /// it alive through a ghost until they retire.
    #[track_caller]
    pub fn replace_program(&mut self, id: ResourceId, code: &[u8]) -> Result<(), ContextError> {
        let kind = self.programs.lock().payload(id)?.kind;
        let program = self.load(kind, code)?;

        let mut state = self.programs.lock();
        let old = std::mem::replace(state.payload_mut(id)?, program);
        if state.is_resource_in_use(id, self.timeline.id(), self.timeline.pending())? {
            let ghost = state.create_resource(old);
            state.ghost(id, ghost)?;
        } else {
            state.remove_resource_from_all_lists(id)?;
            drop(state);
            release(&mut self.heaps, old)?;
        }
        Ok(())
    }

    /// Drop `id`. Its code is freed now if no kick needs it, otherwise on a
    /// later [`reclaim`](Self::reclaim).
    pub fn delete_program(&mut self, id: ResourceId) -> Result<(), ContextError> {
        let mut state = self.programs.lock();
        if state.is_resource_in_use(id, self.timeline.id(), self.timeline.pending())? {
            state.retire(id)?;
            return Ok(());
        }
        let program = state.destroy_resource(id)?;
        drop(state);
        release(&mut self.heaps, program)?;
        Ok(())
    }

    /// Ask for a kick if `id` is waiting on this context's unsubmitted kick.
    pub fn flush_unkicked_resource(&self, id: ResourceId) -> Result<bool, ContextError> {
        let unkicked = self.programs.lock().unkicked_attachment_points(id)?;
        if unkicked.contains(&self.timeline.id()) {
            log::debug!("context[{}]: flushing for {:?}", self.id().0, id);
            self.requests.schedule_kick(false);
            return Ok(true);
        }
        Ok(false)
    }

    /// Return retired programs whose kicks have completed to their heaps.
    pub fn reclaim(&mut self) -> Result<usize, ContextError> {
        let heaps = &mut self.heaps;
        let mut result = Ok(());
        let count = self.programs.reclaim_unneeded(ResourceList::Ghost, |_, program| {
            if let Err(e) = release(heaps, program) {
                result = Err(e);
            }
        });
        result?;
        Ok(count)
    }

    /// Submit everything recorded since the previous kick.
    pub fn kick(
        &mut self,
        final_in_scene: bool,
        consumer: &dyn RingConsumer,
    ) -> Result<KickSubmission, ContextError> {
        let control = self.rings.ring_mut(RingBufferKind::ControlStream);
        let control_stream = control.next_kick_start();
        control.close_kick_stream(consumer)?;

        self.rings.note_completed_unit(&self.requests);
        let fence = self.timeline.submit();
        self.rings.note_kicked(final_in_scene, consumer);
        self.requests.take();

        let ring_ends = self
            .rings
            .iter()
            .filter(|r| final_in_scene || !r.kind().is_late_stage())
            .map(|r| (r.kind(), r.committed_hw_offset()))
            .collect();
        let submission = KickSubmission {
            context: self.id(),
            fence,
            control_stream,
            final_in_scene,
            flush_code_cache: std::mem::take(&mut self.flush_code_cache),
            ring_ends,
        };

        log::debug!(
            "context[{}]: kick {} at 0x{:X}{}",
            self.id().0,
            fence,
            control_stream,
            if final_in_scene { " (final)" } else { "" }
        );
        Ok(submission)
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            pending_fence: self.timeline.pending(),
            completed_fence: self.timeline.completed(),
            programs: self.programs.stats(),
            use_heap: self.heaps[heap_slot(CodeHeapKind::Use)].stats(),
            pds_heap: self.heaps[heap_slot(CodeHeapKind::Pds)].stats(),
        }
    }

    /// Tear down the context. Each program gets a bounded wait for its kicks,
    /// then its code is freed regardless.
    pub fn shutdown(self, event: &dyn CompletionEvent) -> Result<(), ContextError> {
        let Self {
            programs,
            mut heaps,
            timeline,
            ..
        } = self;

        let ids = {
            let state = programs.lock();
            let mut ids = state.resources(ResourceList::Live);
            ids.extend(state.untracked());
            ids
        };
        for id in ids {
            if let Err(e) = programs.wait_until_not_needed(id, event) {
                log::warn!("context[{}]: {}", timeline.id().0, e);
            }
            release(&mut heaps, programs.destroy_resource(id)?)?;
        }

        let mut result = Ok(());
        programs.destroy(event, |_, program| {
            if let Err(e) = release(&mut heaps, program) {
                result = Err(e);
            }
        })?;
        result?;

        log::info!("context[{}]: destroyed", timeline.id().0);
        Ok(())
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    #[track_caller]
    fn load(&mut self, kind: CodeHeapKind, code: &[u8]) -> Result<Program, ContextError> {
        let heap = &mut self.heaps[heap_slot(kind)];
        let allocation = heap.allocate(code.len() as u64)?;
        if let Err(e) = self.memory.write(allocation.block.linear_addr(), code) {
            heap.free(allocation.block)?;
            return Err(e.into());
        }
        self.flush_code_cache |= allocation.flush_cache;
        Ok(Program {
            kind,
            block: allocation.block,
        })
    }
}

// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU memory lifecycle for a tile-based renderer.
//!
//! Ring buffers stream per-kick data to the hardware, code heaps hold USE and
//! PDS programs, and the kick resource manager decides when memory the GPU
//! may still read can be recycled.

pub mod code_heap;
pub mod device_memory;
pub mod fence;
pub mod kick_resource;
pub mod leak_tracker;
pub mod render_context;
pub mod ring_buffer;
pub mod scheduler;

pub use code_heap::{CodeAllocation, CodeBlock, CodeHeap, CodeHeapKind, HeapError};
pub use device_memory::{DeviceMemory, HostDeviceMemory};
pub use fence::{AttachmentPointId, CompletionEvent, FenceTimeline, KickEvent, WaitOutcome};
pub use kick_resource::{KickResourceManager, KrmError, KrmState, ResourceId, ResourceList};
pub use render_context::{ContextError, KickSubmission, RenderContext};
pub use ring_buffer::{RingBuffer, RingBufferKind, RingBufferSet, RingConsumer, RingError};
pub use scheduler::{KickRequests, KickScheduler};

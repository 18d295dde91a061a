// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Allocation provenance for code heaps.
//!
//! [`TrackedCodeHeap`] wraps a [`CodeHeap`] and remembers the call site of
//! every live block, so that blocks still allocated when the heap goes away
//! can be reported with where they came from. Allocation behaviour is
//! unchanged.

use std::collections::BTreeMap;
use std::panic::Location;

use pvrmem_common::LinAddr;

use crate::code_heap::{
    CodeAllocation, CodeBlock, CodeHeap, CodeHeapKind, CodeHeapStats, HeapError,
};

/// Code heap used by render contexts: tracked in debug builds, bare in release.
#[cfg(debug_assertions)]
pub type ContextCodeHeap = TrackedCodeHeap;
#[cfg(not(debug_assertions))]
pub type ContextCodeHeap = CodeHeap;

pub struct TrackedCodeHeap {
    heap: CodeHeap,
    live: BTreeMap<LinAddr, &'static Location<'static>>,
}

impl TrackedCodeHeap {
    pub fn new(heap: CodeHeap) -> Self {
        Self {
            heap,
            live: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> CodeHeapKind {
        self.heap.kind()
    }

    pub fn outstanding(&self) -> usize {
        self.heap.outstanding()
    }

    pub fn stats(&self) -> CodeHeapStats {
        self.heap.stats()
    }

    #[track_caller]
    pub fn allocate(&mut self, size: u64) -> Result<CodeAllocation, HeapError> {
        let caller = Location::caller();
        let allocation = self.heap.allocate(size)?;
        self.live.insert(allocation.block.linear_addr(), caller);
        Ok(allocation)
    }

    pub fn free(&mut self, block: CodeBlock) -> Result<(), HeapError> {
        let addr = block.linear_addr();
        self.heap.free(block)?;
        self.live.remove(&addr);
        Ok(())
    }

    /// Live blocks and the call sites that allocated them, in address order.
    pub fn leaks(&self) -> impl Iterator<Item = (LinAddr, &'static Location<'static>)> + '_ {
        self.live.iter().map(|(&addr, &loc)| (addr, loc))
    }
}

impl From<CodeHeap> for TrackedCodeHeap {
    fn from(heap: CodeHeap) -> Self {
        Self::new(heap)
    }
}

impl Drop for TrackedCodeHeap {
    fn drop(&mut self) {
        for (addr, loc) in &self.live {
            log::warn!(
                "code_heap[{:?}]: leaked block 0x{:X} allocated at {}:{}",
                self.heap.kind(),
                addr,
                loc.file(),
                loc.line()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_heap::CodeHeapConfig;
    use crate::device_memory::HostDeviceMemory;
    use std::sync::Arc;

    fn tracked() -> TrackedCodeHeap {
        let config = CodeHeapConfig {
            segment_size: 4096,
            code_page_size: 4096,
        };
        let memory = Arc::new(HostDeviceMemory::new());
        let heap = CodeHeap::new(CodeHeapKind::Use, config, memory).unwrap();
        TrackedCodeHeap::new(heap)
    }

    #[test]
    fn test_records_call_site() {
        let mut heap = tracked();
        let line = line!() + 1;
        let a = heap.allocate(64).unwrap();

        let leaks: Vec<_> = heap.leaks().collect();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].0, a.block.linear_addr());
        assert_eq!(leaks[0].1.line(), line);
        assert!(leaks[0].1.file().ends_with("leak_tracker.rs"));
    }

    #[test]
    fn test_free_forgets_block() {
        let mut heap = tracked();
        let a = heap.allocate(64).unwrap();
        let _b = heap.allocate(64).unwrap();
        heap.free(a.block).unwrap();
        assert_eq!(heap.leaks().count(), 1);
        assert_eq!(heap.outstanding(), 1);
    }

    #[test]
    fn test_failed_free_keeps_record() {
        let mut heap = tracked();
        let mut other = tracked();
        let _a = heap.allocate(64).unwrap();
        let foreign = other.allocate(64).unwrap();
        assert!(heap.free(foreign.block).is_err());
        assert_eq!(heap.leaks().count(), 1);
    }

    #[test]
    fn test_behaviour_matches_bare_heap() {
        let mut heap = tracked();
        let a = heap.allocate(4096).unwrap();
        let b = heap.allocate(16).unwrap();
        assert_eq!(heap.stats().segments, 2);
        heap.free(a.block).unwrap();
        heap.free(b.block).unwrap();
        assert_eq!(heap.stats().outstanding, 0);
        assert_eq!(heap.stats().free_blocks, 2);
        assert_eq!(heap.leaks().count(), 0);
    }
}

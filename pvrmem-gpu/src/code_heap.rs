// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Heap for GPU-executable code.
//!
//! USE and PDS programs live in fixed-size device segments. Blocks are carved
//! from an address-sorted free list with best-fit search, and a block handed
//! out never crosses a code page boundary: the instruction fetch unit only
//! sees the offset within the current code page.
//!
//! Free blocks only coalesce with neighbours in the same segment. Two
//! segments that happen to be adjacent in the address space are still
//! separate device grants.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use pvrmem_common::{
    page_straddle_pad, round_up, Classify, DevAddr, ErrorClass, LinAddr, Settings,
    PDS_CACHE_LINE_SIZE, USE_DOUBLE_INSTRUCTION_SIZE,
};
use thiserror::Error;

use crate::device_memory::{DeviceMemory, DeviceMemoryError, Segment};

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("code_heap[{kind:?}]: cannot place a block of 0x{requested:X} bytes")]
    InvalidSize { kind: CodeHeapKind, requested: u64 },
    #[error("code_heap[{kind:?}]: out of code memory: {source}")]
    Grow {
        kind: CodeHeapKind,
        #[source]
        source: DeviceMemoryError,
    },
    #[error("code_heap[{kind:?}]: block at 0x{addr:016X} was not allocated from this heap")]
    ForeignBlock { kind: CodeHeapKind, addr: LinAddr },
    #[error("code_heap[{kind:?}]: block at 0x{addr:016X} overlaps free space")]
    DoubleFree { kind: CodeHeapKind, addr: LinAddr },
    #[error("code_heap[{kind:?}]: inconsistent free list: {detail}")]
    Corrupt { kind: CodeHeapKind, detail: String },
}

impl Classify for HeapError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Grow { source, .. } => source.class(),
            _ => ErrorClass::ContractViolation,
        }
    }
}

/// Which program type a heap holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeHeapKind {
    Use,
    Pds,
}

impl CodeHeapKind {
    /// Size multiple and alignment of every block.
    pub fn granularity(self) -> u64 {
        match self {
            Self::Use => USE_DOUBLE_INSTRUCTION_SIZE,
            Self::Pds => PDS_CACHE_LINE_SIZE,
        }
    }
}

/// Geometry of a code heap.
#[derive(Debug, Clone, Copy)]
pub struct CodeHeapConfig {
    pub segment_size: u64,
    pub code_page_size: u64,
}

impl CodeHeapConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            segment_size: settings.code_segment_size,
            code_page_size: settings.code_page_size,
        }
    }

    /// Segments no larger than a page are aligned to their own size so they
    /// never cross a page; larger ones start on a page.
    fn segment_alignment(&self) -> u64 {
        if self.segment_size <= self.code_page_size {
            self.segment_size.next_power_of_two()
        } else {
            self.code_page_size
        }
    }
}

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

/// Index of a segment within its heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u32);

/// A block of code memory owned by the caller until passed back to `free`.
#[derive(Debug, PartialEq, Eq)]
pub struct CodeBlock {
    heap: u32,
    segment: SegmentId,
    linear_addr: LinAddr,
    device_addr: DevAddr,
    size: u64,
}

impl CodeBlock {
    pub fn linear_addr(&self) -> LinAddr {
        self.linear_addr
    }

    pub fn device_addr(&self) -> DevAddr {
        self.device_addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn segment(&self) -> SegmentId {
        self.segment
    }
}

/// Result of a successful allocation.
#[derive(Debug)]
pub struct CodeAllocation {
    pub block: CodeBlock,
    /// The block reuses memory that held code before, so the instruction
    /// cache must be invalidated before the next kick.
    pub flush_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    size: u64,
    segment: SegmentId,
}

struct HeapSegment {
    segment: Segment,
    /// Some block of this segment has been handed out before.
    touched: bool,
}

#[derive(Debug, Clone, Copy)]
struct Fit {
    addr: LinAddr,
    pad: u64,
}

/// Snapshot of heap occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeHeapStats {
    pub segments: usize,
    pub segment_bytes: u64,
    pub free_blocks: usize,
    pub free_bytes: u64,
    pub allocated_bytes: u64,
    pub outstanding: usize,
}

/// Best-fit allocator over a growable set of code segments.
pub struct CodeHeap {
    id: u32,
    kind: CodeHeapKind,
    config: CodeHeapConfig,
    memory: Arc<dyn DeviceMemory>,
    segments: Vec<HeapSegment>,
    /// Keyed by linear address.
    free_list: BTreeMap<LinAddr, FreeBlock>,
    outstanding: usize,
    allocated_bytes: u64,
}

impl CodeHeap {
    /// Create a heap with one segment already in place.
    pub fn new(
        kind: CodeHeapKind,
        config: CodeHeapConfig,
        memory: Arc<dyn DeviceMemory>,
    ) -> Result<Self, HeapError> {
        let granule = kind.granularity();
        let valid = config.code_page_size.is_power_of_two()
            && config.code_page_size % granule == 0
            && config.segment_size % granule == 0
            && config.segment_size >= granule;
        if !valid {
            return Err(HeapError::InvalidSize {
                kind,
                requested: config.segment_size,
            });
        }

        let mut heap = Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            config,
            memory,
            segments: Vec::new(),
            free_list: BTreeMap::new(),
            outstanding: 0,
            allocated_bytes: 0,
        };
        heap.grow()?;
        Ok(heap)
    }

    pub fn kind(&self) -> CodeHeapKind {
        self.kind
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Allocate `size` bytes, rounded up to the kind's granularity.
    pub fn allocate(&mut self, size: u64) -> Result<CodeAllocation, HeapError> {
        let max = self.config.code_page_size.min(self.config.segment_size);
        if size == 0 || size > max {
            return Err(HeapError::InvalidSize {
                kind: self.kind,
                requested: size,
            });
        }
        let size = round_up(size, self.kind.granularity());

        let fit = match self.find_fit(size) {
            Some(fit) => fit,
            None => {
                self.grow()?;
                self.find_fit(size).ok_or(HeapError::InvalidSize {
                    kind: self.kind,
                    requested: size,
                })?
            }
        };

        let allocation = self.carve(fit, size);
        self.outstanding += 1;
        self.allocated_bytes += size;
        self.debug_check();

        log::trace!(
            "code_heap[{:?}]: allocated 0x{:X} bytes at device 0x{:X}",
            self.kind,
            size,
            allocation.block.device_addr
        );
        Ok(allocation)
    }

    /// Return a block to the free list, merging it with its immediate
    /// neighbours in the same segment.
    pub fn free(&mut self, block: CodeBlock) -> Result<(), HeapError> {
        if block.heap != self.id || block.segment.0 as usize >= self.segments.len() {
            log::warn!(
                "code_heap[{:?}]: free of foreign block 0x{:X}",
                self.kind,
                block.linear_addr
            );
            return Err(HeapError::ForeignBlock {
                kind: self.kind,
                addr: block.linear_addr,
            });
        }
        if self.overlaps_free(block.linear_addr, block.size) {
            log::warn!(
                "code_heap[{:?}]: double free of 0x{:X}",
                self.kind,
                block.linear_addr
            );
            return Err(HeapError::DoubleFree {
                kind: self.kind,
                addr: block.linear_addr,
            });
        }

        self.outstanding -= 1;
        self.allocated_bytes -= block.size;
        self.insert_free(
            block.linear_addr,
            FreeBlock {
                size: block.size,
                segment: block.segment,
            },
        );
        self.debug_check();

        log::trace!(
            "code_heap[{:?}]: freed 0x{:X} bytes at device 0x{:X}",
            self.kind,
            block.size,
            block.device_addr
        );
        Ok(())
    }

    pub fn stats(&self) -> CodeHeapStats {
        CodeHeapStats {
            segments: self.segments.len(),
            segment_bytes: self.segments.iter().map(|s| s.segment.size).sum(),
            free_blocks: self.free_list.len(),
            free_bytes: self.free_list.values().map(|b| b.size).sum(),
            allocated_bytes: self.allocated_bytes,
            outstanding: self.outstanding,
        }
    }

    /// Free blocks in address order as `(linear address, size)`.
    pub fn free_blocks(&self) -> impl Iterator<Item = (LinAddr, u64)> + '_ {
        self.free_list.iter().map(|(&addr, b)| (addr, b.size))
    }

    /// Verify the free list: sorted, non-overlapping, inside its segment,
    /// granule aligned, and fully coalesced within each segment.
    pub fn check_consistency(&self) -> Result<(), HeapError> {
        let corrupt = |detail: String| HeapError::Corrupt {
            kind: self.kind,
            detail,
        };
        let granule = self.kind.granularity();

        let mut prev: Option<(LinAddr, FreeBlock)> = None;
        for (&addr, &block) in &self.free_list {
            let seg = self
                .segments
                .get(block.segment.0 as usize)
                .ok_or_else(|| corrupt(format!("block 0x{addr:X} has no segment")))?;
            let seg = &seg.segment;
            if block.size == 0 || block.size % granule != 0 || addr % granule != 0 {
                return Err(corrupt(format!("block 0x{addr:X} misaligned")));
            }
            if !seg.contains_linear(addr) || addr + block.size > seg.linear_addr + seg.size {
                return Err(corrupt(format!("block 0x{addr:X} outside its segment")));
            }
            if let Some((prev_addr, prev_block)) = prev {
                let prev_end = prev_addr + prev_block.size;
                if prev_end > addr {
                    return Err(corrupt(format!("blocks 0x{prev_addr:X} and 0x{addr:X} overlap")));
                }
                if prev_end == addr && prev_block.segment == block.segment {
                    return Err(corrupt(format!("blocks 0x{prev_addr:X} and 0x{addr:X} not merged")));
                }
            }
            prev = Some((addr, block));
        }

        let free: u64 = self.free_list.values().map(|b| b.size).sum();
        let total: u64 = self.segments.iter().map(|s| s.segment.size).sum();
        if free + self.allocated_bytes != total {
            return Err(corrupt(format!(
                "free 0x{free:X} + allocated 0x{:X} != 0x{total:X}",
                self.allocated_bytes
            )));
        }
        Ok(())
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn device_addr(&self, addr: LinAddr, segment: SegmentId) -> DevAddr {
        let seg = &self.segments[segment.0 as usize].segment;
        seg.device_addr + (addr - seg.linear_addr)
    }

    /// First exact fit (after page padding), otherwise the smallest block that
    /// still fits once its own padding is added.
    fn find_fit(&self, size: u64) -> Option<Fit> {
        let mut best: Option<(u64, Fit)> = None;
        for (&addr, block) in &self.free_list {
            let device = self.device_addr(addr, block.segment);
            let pad = page_straddle_pad(device, size, self.config.code_page_size);
            let needed = pad + size;
            if needed > block.size {
                continue;
            }
            let fit = Fit { addr, pad };
            if needed == block.size {
                return Some(fit);
            }
            if best.map_or(true, |(best_size, _)| block.size < best_size) {
                best = Some((block.size, fit));
            }
        }
        best.map(|(_, fit)| fit)
    }

    fn carve(&mut self, fit: Fit, size: u64) -> CodeAllocation {
        let Some(block) = self.free_list.remove(&fit.addr) else {
            unreachable!("fit refers to a free block");
        };

        // Leading pad and trailing remainder border allocated memory or the
        // segment edge, so they go back without merging.
        if fit.pad > 0 {
            self.free_list.insert(
                fit.addr,
                FreeBlock {
                    size: fit.pad,
                    segment: block.segment,
                },
            );
        }
        let start = fit.addr + fit.pad;
        let remainder = block.size - fit.pad - size;
        if remainder > 0 {
            self.free_list.insert(
                start + size,
                FreeBlock {
                    size: remainder,
                    segment: block.segment,
                },
            );
        }

        let seg = &mut self.segments[block.segment.0 as usize];
        let flush_cache = seg.touched;
        seg.touched = true;

        CodeAllocation {
            block: CodeBlock {
                heap: self.id,
                segment: block.segment,
                linear_addr: start,
                device_addr: self.device_addr(start, block.segment),
                size,
            },
            flush_cache,
        }
    }

    fn grow(&mut self) -> Result<(), HeapError> {
        let segment = self
            .memory
            .allocate_segment(self.config.segment_size, self.config.segment_alignment())
            .map_err(|source| HeapError::Grow {
                kind: self.kind,
                source,
            })?;

        let id = SegmentId(self.segments.len() as u32);
        self.segments.push(HeapSegment {
            segment,
            touched: false,
        });
        self.insert_free(
            segment.linear_addr,
            FreeBlock {
                size: segment.size,
                segment: id,
            },
        );

        log::debug!(
            "code_heap[{:?}]: grew to {} segments (device 0x{:X})",
            self.kind,
            self.segments.len(),
            segment.device_addr
        );
        Ok(())
    }

    /// Insert a block, merging with the immediate predecessor and successor
    /// when they are contiguous and in the same segment.
    fn insert_free(&mut self, mut addr: LinAddr, mut block: FreeBlock) {
        let prev = self
            .free_list
            .range(..addr)
            .next_back()
            .map(|(&a, &b)| (a, b));
        if let Some((prev_addr, prev)) = prev {
            if prev.segment == block.segment && prev_addr + prev.size == addr {
                self.free_list.remove(&prev_addr);
                addr = prev_addr;
                block.size += prev.size;
            }
        }

        let end = addr + block.size;
        if let Some(&next) = self.free_list.get(&end) {
            if next.segment == block.segment {
                self.free_list.remove(&end);
                block.size += next.size;
            }
        }

        self.free_list.insert(addr, block);
    }

    fn overlaps_free(&self, addr: LinAddr, size: u64) -> bool {
        let prev_overlaps = self
            .free_list
            .range(..=addr)
            .next_back()
            .is_some_and(|(&a, b)| a + b.size > addr);
        let next_overlaps = self
            .free_list
            .range(addr..)
            .next()
            .is_some_and(|(&a, _)| a < addr + size);
        prev_overlaps || next_overlaps
    }

    fn debug_check(&self) {
        if cfg!(debug_assertions) {
            if let Err(e) = self.check_consistency() {
                panic!("{e}");
            }
        }
    }
}

impl Drop for CodeHeap {
    fn drop(&mut self) {
        if self.outstanding > 0 {
            log::warn!(
                "code_heap[{:?}]: destroyed with {} blocks outstanding",
                self.kind,
                self.outstanding
            );
        }
        for seg in self.segments.drain(..) {
            self.memory.free_segment(seg.segment.handle);
        }
        self.free_list.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_memory::HostDeviceMemory;
    use proptest::prelude::*;

    fn heap(kind: CodeHeapKind, segment_size: u64, page: u64) -> (Arc<HostDeviceMemory>, CodeHeap) {
        let mem = Arc::new(HostDeviceMemory::new());
        let config = CodeHeapConfig {
            segment_size,
            code_page_size: page,
        };
        let heap = CodeHeap::new(kind, config, mem.clone()).unwrap();
        (mem, heap)
    }

    fn crosses_page(block: &CodeBlock, page: u64) -> bool {
        block.device_addr() / page != (block.device_addr() + block.size() - 1) / page
    }

    #[test]
    fn test_create_seeds_one_block() {
        let (mem, heap) = heap(CodeHeapKind::Use, 4096, 4096);
        assert_eq!(mem.segment_count(), 1);
        let blocks: Vec<_> = heap.free_blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].1, 4096);
    }

    #[test]
    fn test_size_rounded_to_granularity() {
        let (_mem, mut heap) = heap(CodeHeapKind::Pds, 4096, 4096);
        let a = heap.allocate(1).unwrap();
        assert_eq!(a.block.size(), PDS_CACHE_LINE_SIZE);
        assert_eq!(a.block.device_addr() % PDS_CACHE_LINE_SIZE, 0);
        assert!(!a.flush_cache);
    }

    #[test]
    fn test_exact_fit_then_grow() {
        let (mem, mut heap) = heap(CodeHeapKind::Use, 4096, 4096);
        let a = heap.allocate(4096).unwrap();
        assert_eq!(heap.free_blocks().count(), 0);

        let b = heap.allocate(4096).unwrap();
        assert_eq!(mem.segment_count(), 2);
        assert_ne!(a.block.segment(), b.block.segment());
        assert_eq!(heap.outstanding(), 2);
    }

    #[test]
    fn test_grow_failure_is_exhaustion() {
        let mem = Arc::new(HostDeviceMemory::with_capacity(4096));
        let config = CodeHeapConfig {
            segment_size: 4096,
            code_page_size: 4096,
        };
        let mut heap = CodeHeap::new(CodeHeapKind::Use, config, mem).unwrap();
        let _a = heap.allocate(4096).unwrap();
        let err = heap.allocate(16).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Exhausted);
    }

    #[test]
    fn test_best_fit_prefers_smallest() {
        let (_mem, mut heap) = heap(CodeHeapKind::Use, 4096, 4096);
        let a = heap.allocate(64).unwrap().block;
        let _b = heap.allocate(16).unwrap().block;
        let c = heap.allocate(256).unwrap().block;
        let _d = heap.allocate(16).unwrap().block;
        let c_addr = c.linear_addr();
        heap.free(a).unwrap();
        heap.free(c).unwrap();

        // Holes: 64 bytes, 256 bytes, and the tail. 200 fits best in the 256 hole.
        let e = heap.allocate(200).unwrap().block;
        assert_eq!(e.linear_addr(), c_addr);
    }

    #[test]
    fn test_exact_fit_wins_over_earlier_larger_block() {
        let (_mem, mut heap) = heap(CodeHeapKind::Use, 4096, 4096);
        let a = heap.allocate(128).unwrap().block;
        let _b = heap.allocate(16).unwrap().block;
        let c = heap.allocate(48).unwrap().block;
        let _d = heap.allocate(16).unwrap().block;
        let c_addr = c.linear_addr();
        heap.free(a).unwrap();
        heap.free(c).unwrap();

        let e = heap.allocate(48).unwrap().block;
        assert_eq!(e.linear_addr(), c_addr);
    }

    #[test]
    fn test_page_pad_is_returned_to_free_list() {
        // Two 1 KiB pages per segment.
        let (_mem, mut heap) = heap(CodeHeapKind::Use, 2048, 1024);
        let _a = heap.allocate(1008).unwrap().block;

        // 32 bytes at offset 1008 would cross the page.
        let b = heap.allocate(32).unwrap().block;
        assert!(!crosses_page(&b, 1024));
        assert_eq!(b.device_addr() % 1024, 0);

        let free: Vec<_> = heap.free_blocks().collect();
        assert_eq!(free.len(), 2);
        assert_eq!(free[0].1, 16);
        assert_eq!(free[1].1, 1024 - 32);
        heap.check_consistency().unwrap();
    }

    #[test]
    fn test_coalesce_in_either_order() {
        for reverse in [false, true] {
            let (_mem, mut heap) = heap(CodeHeapKind::Use, 4096, 4096);
            let a = heap.allocate(64).unwrap().block;
            let b = heap.allocate(64).unwrap().block;
            let _guard = heap.allocate(64).unwrap().block;
            let start = a.linear_addr();

            if reverse {
                heap.free(b).unwrap();
                heap.free(a).unwrap();
            } else {
                heap.free(a).unwrap();
                heap.free(b).unwrap();
            }

            let free: Vec<_> = heap.free_blocks().collect();
            assert_eq!(free[0], (start, 128));
            assert_eq!(free.len(), 2);
        }
    }

    #[test]
    fn test_no_merge_across_segments() {
        let (_mem, mut heap) = heap(CodeHeapKind::Use, 4096, 4096);
        let a = heap.allocate(4096).unwrap().block;
        let b = heap.allocate(4096).unwrap().block;
        // HostDeviceMemory places the second segment right after the first.
        assert_eq!(a.linear_addr() + 4096, b.linear_addr());

        heap.free(a).unwrap();
        heap.free(b).unwrap();
        assert_eq!(heap.free_blocks().count(), 2);
        heap.check_consistency().unwrap();
    }

    #[test]
    fn test_free_foreign_block() {
        let (_mem, mut heap_a) = heap(CodeHeapKind::Use, 4096, 4096);
        let (_mem_b, mut heap_b) = heap(CodeHeapKind::Use, 4096, 4096);
        let block = heap_b.allocate(16).unwrap().block;
        let err = heap_a.free(block).unwrap_err();
        assert!(matches!(err, HeapError::ForeignBlock { .. }));
        assert_eq!(err.class(), ErrorClass::ContractViolation);
    }

    #[test]
    fn test_double_free_detected() {
        let (_mem, mut heap) = heap(CodeHeapKind::Use, 4096, 4096);
        let a = heap.allocate(64).unwrap().block;
        let forged = CodeBlock {
            heap: a.heap,
            segment: a.segment,
            linear_addr: a.linear_addr,
            device_addr: a.device_addr,
            size: a.size,
        };
        heap.free(a).unwrap();
        assert!(matches!(heap.free(forged), Err(HeapError::DoubleFree { .. })));
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn test_reuse_requests_cache_flush() {
        let (_mem, mut heap) = heap(CodeHeapKind::Use, 4096, 4096);
        let a = heap.allocate(64).unwrap();
        assert!(!a.flush_cache);
        heap.free(a.block).unwrap();
        assert!(heap.allocate(64).unwrap().flush_cache);
    }

    #[test]
    fn test_oversized_request() {
        let (_mem, mut heap) = heap(CodeHeapKind::Use, 4096, 1024);
        assert!(matches!(heap.allocate(1025), Err(HeapError::InvalidSize { .. })));
        assert!(matches!(heap.allocate(0), Err(HeapError::InvalidSize { .. })));
    }

    #[test]
    fn test_drop_releases_segments() {
        let mem = Arc::new(HostDeviceMemory::new());
        let config = CodeHeapConfig {
            segment_size: 4096,
            code_page_size: 4096,
        };
        {
            let mut heap = CodeHeap::new(CodeHeapKind::Pds, config, mem.clone()).unwrap();
            let _ = heap.allocate(4096).unwrap();
            let _ = heap.allocate(64).unwrap();
            assert_eq!(mem.segment_count(), 2);
        }
        assert_eq!(mem.segment_count(), 0);
    }

    proptest! {
        #[test]
        fn test_free_list_soundness(
            ops in prop::collection::vec((1u64..600, any::<bool>(), any::<prop::sample::Index>()), 1..120)
        ) {
            let (_mem, mut heap) = heap(CodeHeapKind::Use, 2048, 512);
            let mut live: Vec<CodeBlock> = Vec::new();

            for (size, do_free, pick) in ops {
                if do_free && !live.is_empty() {
                    let block = live.swap_remove(pick.index(live.len()));
                    heap.free(block).unwrap();
                } else if size <= 512 {
                    let block = heap.allocate(size).unwrap().block;
                    prop_assert!(!crosses_page(&block, 512));
                    prop_assert_eq!(block.device_addr() % USE_DOUBLE_INSTRUCTION_SIZE, 0);
                    live.push(block);
                }

                heap.check_consistency().unwrap();
                let stats = heap.stats();
                let live_bytes: u64 = live.iter().map(|b| b.size()).sum();
                prop_assert_eq!(stats.allocated_bytes, live_bytes);
                prop_assert_eq!(stats.free_bytes + live_bytes, stats.segment_bytes);
                prop_assert_eq!(stats.outstanding, live.len());
            }

            for block in live.drain(..) {
                heap.free(block).unwrap();
            }
            // Everything merged back: one block per segment.
            prop_assert_eq!(heap.free_blocks().count(), heap.stats().segments);
        }
    }
}

// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device memory segments.
//!
//! The allocators in this crate never carve device memory themselves; they ask
//! a [`DeviceMemory`] implementation for fixed segments that have both a host
//! linear address and a device address, stable for the segment's lifetime.
//!
//! [`HostDeviceMemory`] backs segments with host storage and hands out device
//! addresses from a bump allocator, which is enough for tests and for the
//! simulated GPU.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use pvrmem_common::{align_up, Classify, DevAddr, ErrorClass, LinAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceMemoryError {
    #[error("out of device memory: requested 0x{requested:X} bytes, 0x{available:X} available")]
    OutOfMemory { requested: u64, available: u64 },
    #[error("invalid segment request: size 0x{size:X}, alignment 0x{alignment:X}")]
    InvalidRequest { size: u64, alignment: u64 },
    #[error("unmapped linear range 0x{addr:016X}+0x{len:X}")]
    Unmapped { addr: LinAddr, len: usize },
}

impl Classify for DeviceMemoryError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::OutOfMemory { .. } => ErrorClass::Exhausted,
            Self::InvalidRequest { .. } | Self::Unmapped { .. } => ErrorClass::ContractViolation,
        }
    }
}

/// Opaque handle identifying a segment to its allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentHandle(pub u32);

/// A contiguous grant of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub handle: SegmentHandle,
    pub linear_addr: LinAddr,
    pub device_addr: DevAddr,
    pub size: u64,
}

impl Segment {
    pub fn contains_linear(&self, addr: LinAddr) -> bool {
        addr >= self.linear_addr && addr - self.linear_addr < self.size
    }

    pub fn contains_device(&self, addr: DevAddr) -> bool {
        addr >= self.device_addr && addr - self.device_addr < self.size
    }

    /// Translate a linear address inside this segment to its device address.
    pub fn to_device(&self, addr: LinAddr) -> Option<DevAddr> {
        self.contains_linear(addr)
            .then(|| self.device_addr + (addr - self.linear_addr))
    }

    /// Translate a device address inside this segment to its linear address.
    pub fn to_linear(&self, addr: DevAddr) -> Option<LinAddr> {
        self.contains_device(addr)
            .then(|| self.linear_addr + (addr - self.device_addr))
    }
}

/// Device memory allocator contract.
pub trait DeviceMemory: Send + Sync {
    /// Allocate a segment of `size` bytes whose device address is a multiple
    /// of `alignment` (power of two).
    fn allocate_segment(&self, size: u64, alignment: u64) -> Result<Segment, DeviceMemoryError>;

    /// Return a segment. Unknown handles are ignored.
    fn free_segment(&self, handle: SegmentHandle);

    /// Write bytes through the host mapping.
    fn write(&self, addr: LinAddr, src: &[u8]) -> Result<(), DeviceMemoryError>;

    /// Read bytes through the host mapping.
    fn read(&self, addr: LinAddr, dst: &mut [u8]) -> Result<(), DeviceMemoryError>;
}

/// Linear addresses start here so that zero is never a valid mapping.
const LINEAR_BASE: LinAddr = 0x7F00_0000_0000;

/// Device allocations start at 64 MB to keep the zero page region unused.
const DEVICE_BASE: DevAddr = 0x0400_0000;

struct HostSegment {
    segment: Segment,
    data: Vec<u8>,
}

struct HostState {
    /// Keyed by linear base address.
    segments: BTreeMap<LinAddr, HostSegment>,
    next_linear: LinAddr,
    next_device: DevAddr,
    next_handle: u32,
    in_use: u64,
}

/// Host-backed [`DeviceMemory`] with an optional capacity limit.
pub struct HostDeviceMemory {
    state: Mutex<HostState>,
    capacity: u64,
}

impl HostDeviceMemory {
    pub fn new() -> Self {
        Self::with_capacity(u64::MAX)
    }

    /// Fail allocations once `capacity` bytes are outstanding.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            state: Mutex::new(HostState {
                segments: BTreeMap::new(),
                next_linear: LINEAR_BASE,
                next_device: DEVICE_BASE,
                next_handle: 1,
                in_use: 0,
            }),
            capacity,
        }
    }

    /// Bytes currently allocated.
    pub fn in_use(&self) -> u64 {
        self.state.lock().in_use
    }

    /// Number of live segments.
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Run `f` over the byte range `[addr, addr + len)` of the owning segment.
    fn with_range<R>(
        &self,
        addr: LinAddr,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, DeviceMemoryError> {
        let mut state = self.state.lock();
        let host = state
            .segments
            .range_mut(..=addr)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.segment.contains_linear(addr))
            .ok_or(DeviceMemoryError::Unmapped { addr, len })?;

        let start = (addr - host.segment.linear_addr) as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= host.data.len())
            .ok_or(DeviceMemoryError::Unmapped { addr, len })?;
        Ok(f(&mut host.data[start..end]))
    }
}

impl Default for HostDeviceMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemory for HostDeviceMemory {
    fn allocate_segment(&self, size: u64, alignment: u64) -> Result<Segment, DeviceMemoryError> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(DeviceMemoryError::InvalidRequest { size, alignment });
        }

        let mut state = self.state.lock();
        let available = self.capacity.saturating_sub(state.in_use);
        if size > available {
            return Err(DeviceMemoryError::OutOfMemory {
                requested: size,
                available,
            });
        }

        let device_addr = align_up(state.next_device, alignment);
        let linear_addr = align_up(state.next_linear, alignment.max(0x1000));
        let segment = Segment {
            handle: SegmentHandle(state.next_handle),
            linear_addr,
            device_addr,
            size,
        };

        state.next_handle += 1;
        state.next_device = device_addr + size;
        state.next_linear = linear_addr + size;
        state.in_use += size;
        state.segments.insert(
            linear_addr,
            HostSegment {
                segment,
                data: vec![0; size as usize],
            },
        );

        log::trace!(
            "device_memory: segment {:?} linear 0x{:X} device 0x{:X}..0x{:X}",
            segment.handle,
            linear_addr,
            device_addr,
            device_addr + size
        );
        Ok(segment)
    }

    fn free_segment(&self, handle: SegmentHandle) {
        let mut state = self.state.lock();
        let key = state
            .segments
            .iter()
            .find(|(_, s)| s.segment.handle == handle)
            .map(|(k, _)| *k);
        match key.and_then(|k| state.segments.remove(&k)) {
            Some(host) => {
                state.in_use -= host.segment.size;
                log::trace!("device_memory: freed segment {:?}", handle);
            }
            None => log::warn!("device_memory: free of unknown segment {:?}", handle),
        }
    }

    fn write(&self, addr: LinAddr, src: &[u8]) -> Result<(), DeviceMemoryError> {
        self.with_range(addr, src.len(), |dst| dst.copy_from_slice(src))
    }

    fn read(&self, addr: LinAddr, dst: &mut [u8]) -> Result<(), DeviceMemoryError> {
        self.with_range(addr, dst.len(), |src| dst.copy_from_slice(src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_alignment() {
        let mem = HostDeviceMemory::new();
        let a = mem.allocate_segment(0x100, 0x10).unwrap();
        let b = mem.allocate_segment(0x1000, 0x1000).unwrap();
        assert_eq!(a.device_addr % 0x10, 0);
        assert_eq!(b.device_addr % 0x1000, 0);
        assert!(b.device_addr >= a.device_addr + a.size);
        assert_ne!(a.handle, b.handle);
    }

    #[test]
    fn test_translate_round_trip() {
        let mem = HostDeviceMemory::new();
        let seg = mem.allocate_segment(0x2000, 0x1000).unwrap();
        let lin = seg.linear_addr + 0x1234;
        let dev = seg.to_device(lin).unwrap();
        assert_eq!(dev, seg.device_addr + 0x1234);
        assert_eq!(seg.to_linear(dev), Some(lin));
        assert_eq!(seg.to_device(seg.linear_addr + seg.size), None);
    }

    #[test]
    fn test_capacity_limit() {
        let mem = HostDeviceMemory::with_capacity(0x1000);
        let seg = mem.allocate_segment(0x1000, 0x1000).unwrap();
        let err = mem.allocate_segment(0x10, 0x10).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Exhausted);

        mem.free_segment(seg.handle);
        assert_eq!(mem.in_use(), 0);
        assert!(mem.allocate_segment(0x10, 0x10).is_ok());
    }

    #[test]
    fn test_invalid_request() {
        let mem = HostDeviceMemory::new();
        assert!(mem.allocate_segment(0, 0x10).is_err());
        assert!(mem.allocate_segment(0x10, 3).is_err());
    }

    #[test]
    fn test_write_read() {
        let mem = HostDeviceMemory::new();
        let seg = mem.allocate_segment(0x100, 0x10).unwrap();
        mem.write(seg.linear_addr + 8, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

        let mut buf = [0u8; 4];
        mem.read(seg.linear_addr + 8, &mut buf).unwrap();
        assert_eq!(buf, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_write_past_segment_end() {
        let mem = HostDeviceMemory::new();
        let seg = mem.allocate_segment(0x10, 0x10).unwrap();
        let err = mem.write(seg.linear_addr + 0xE, &[0; 4]).unwrap_err();
        assert!(matches!(err, DeviceMemoryError::Unmapped { .. }));
        assert!(mem.write(0x10, &[0]).is_err());
    }
}

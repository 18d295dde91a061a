// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Circular buffers feeding the GPU.
//!
//! Each [`RingBuffer`] owns one device segment. The producer reserves a
//! contiguous region, writes into it, and commits what it wrote. The hardware
//! consumes from a read cursor that only advances over kicked work, so the
//! free space is always the span from the write cursor forward to the cached
//! read cursor, less [`RING_FULL_GUARD`] bytes so that "full" and "empty"
//! never look the same.
//!
//! Offsets tracked per ring:
//!
//! | Offset                  | Advanced by                              |
//! |-------------------------|------------------------------------------|
//! | `write_offset`          | `reserve` (pad/wrap) and `commit`        |
//! | `committed_prim_offset` | `note_completed_unit`                    |
//! | `committed_hw_offset`   | `note_kicked`                            |
//! | `read_offset_copy`      | refreshed from the hardware on demand    |

use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use pvrmem_common::{
    align_up, is_aligned, page_straddle_pad, Classify, DevAddr, ErrorClass, LinAddr, Settings,
    PDS_CACHE_LINE_SIZE, RING_FULL_GUARD, USE_DOUBLE_INSTRUCTION_SIZE,
};
use thiserror::Error;

use crate::device_memory::{DeviceMemory, DeviceMemoryError, Segment};
use crate::fence::CompletionEvent;
use crate::scheduler::KickScheduler;

/// Size of a link record ("continue at start").
pub const LINK_RECORD_SIZE: u64 = 8;

/// Size of a terminate record.
pub const TERMINATE_RECORD_SIZE: u64 = 8;

/// The hardware requires each kick's control stream to start on this boundary.
pub const CONTROL_STREAM_KICK_ALIGN: u64 = 16;

/// Space every control stream reservation leaves behind it: a terminate
/// record plus the worst-case realignment before the next kick.
pub const CONTROL_STREAM_TAIL: u64 =
    TERMINATE_RECORD_SIZE + CONTROL_STREAM_KICK_ALIGN * 2;

const CTRL_OP_LINK: u32 = 0xA000_0000;
const CTRL_OP_TERMINATE: u32 = 0xF000_0000;

/// Decoded control stream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRecord {
    Link(DevAddr),
    Terminate,
}

impl ControlRecord {
    pub fn encode(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        match self {
            Self::Link(target) => {
                let hi = (target >> 32) as u32 & 0xFF;
                LittleEndian::write_u32(&mut buf[0..4], CTRL_OP_LINK | hi);
                LittleEndian::write_u32(&mut buf[4..8], target as u32);
            }
            Self::Terminate => {
                LittleEndian::write_u32(&mut buf[0..4], CTRL_OP_TERMINATE);
            }
        }
        buf
    }

    pub fn decode(buf: &[u8; 8]) -> Option<Self> {
        let word0 = LittleEndian::read_u32(&buf[0..4]);
        match word0 & 0xF000_0000 {
            CTRL_OP_LINK => {
                let hi = (word0 & 0xFF) as u64;
                let lo = LittleEndian::read_u32(&buf[4..8]) as u64;
                Some(Self::Link((hi << 32) | lo))
            }
            CTRL_OP_TERMINATE => Some(Self::Terminate),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring[{kind:?}]: no space for 0x{requested:X} bytes, kick required")]
    NoSpace { kind: RingBufferKind, requested: u64 },
    #[error("ring[{kind:?}]: 0x{requested:X} bytes still unavailable after {waits} waits")]
    Timeout {
        kind: RingBufferKind,
        requested: u64,
        waits: u32,
    },
    #[error("ring[{kind:?}]: request of 0x{requested:X} bytes can never be satisfied")]
    InvalidSize { kind: RingBufferKind, requested: u64 },
    #[error("ring[{0:?}]: a reservation is already outstanding")]
    ReservationOutstanding(RingBufferKind),
    #[error("ring[{0:?}]: no reservation outstanding")]
    NoReservation(RingBufferKind),
    #[error("ring[{0:?}]: reservation belongs to another ring or position")]
    ForeignReservation(RingBufferKind),
    #[error("ring[{kind:?}]: commit of 0x{written:X} bytes exceeds reservation of 0x{reserved:X}")]
    CommitTooLarge {
        kind: RingBufferKind,
        written: u64,
        reserved: u64,
    },
    #[error("ring[{kind:?}]: address 0x{addr:016X} outside the ring")]
    AddressOutOfRange { kind: RingBufferKind, addr: u64 },
    #[error("ring[{0:?}]: operation only valid on the control stream")]
    NotControlStream(RingBufferKind),
    #[error("ring[{kind:?}]: no room for {what} at offset 0x{offset:X}")]
    TailExhausted {
        kind: RingBufferKind,
        what: &'static str,
        offset: u64,
    },
    #[error(transparent)]
    Memory(#[from] DeviceMemoryError),
}

impl Classify for RingError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NoSpace { .. } | Self::TailExhausted { .. } => ErrorClass::Exhausted,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Memory(e) => e.class(),
            _ => ErrorClass::ContractViolation,
        }
    }
}

/// Buffer kinds. They differ in alignment and wrap policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingBufferKind {
    /// Control stream. Reserves a terminator tail and wraps through a link record.
    ControlStream,
    /// Index data. Space accounting only.
    Index,
    /// Vertex data. Space accounting only.
    Vertex,
    /// Geometry-stage USE code. Double-instruction aligned, page-bounded.
    UseCode,
    /// Geometry-stage PDS programs. Cache-line aligned, page-bounded.
    PdsCode,
    /// Pixel-stage PDS programs, read by the 3D pass at the end of the scene.
    PdsPixel,
}

impl RingBufferKind {
    pub const ALL: [Self; 6] = [
        Self::ControlStream,
        Self::Index,
        Self::Vertex,
        Self::UseCode,
        Self::PdsCode,
        Self::PdsPixel,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Per-reservation alignment for code-stream kinds.
    pub fn code_alignment(self) -> Option<u64> {
        match self {
            Self::UseCode => Some(USE_DOUBLE_INSTRUCTION_SIZE),
            Self::PdsCode | Self::PdsPixel => Some(PDS_CACHE_LINE_SIZE),
            _ => None,
        }
    }

    /// Pixel-stage data must stay in place until the 3D pass of the scene, so
    /// it cannot restart at the beginning of the buffer mid-scene.
    pub fn may_wrap(self) -> bool {
        !self.is_late_stage()
    }

    pub fn is_late_stage(self) -> bool {
        matches!(self, Self::PdsPixel)
    }

    /// Alignment of the ring's backing segment.
    fn base_alignment(self) -> u64 {
        match self {
            Self::ControlStream => CONTROL_STREAM_KICK_ALIGN,
            _ => self.code_alignment().unwrap_or(4),
        }
    }

    /// Bytes that must stay free behind every reservation.
    fn tail(self) -> u64 {
        match self {
            Self::ControlStream => CONTROL_STREAM_TAIL,
            _ => 0,
        }
    }

    /// Ring size configured for this kind.
    pub fn configured_size(self, settings: &Settings) -> u64 {
        match self {
            Self::ControlStream => settings.control_stream_size,
            Self::Index => settings.index_ring_size,
            Self::Vertex => settings.vertex_ring_size,
            Self::UseCode => settings.use_code_ring_size,
            Self::PdsCode => settings.pds_code_ring_size,
            Self::PdsPixel => settings.pds_pixel_ring_size,
        }
    }
}

/// The hardware side of a ring: where it is reading and whether it is busy.
pub trait RingConsumer {
    /// Current hardware read offset into the ring of `kind`.
    fn read_offset(&self, kind: RingBufferKind) -> u64;

    /// True when every kicked byte of `kind` has been consumed, so waiting
    /// cannot free any more space.
    fn is_idle(&self, kind: RingBufferKind) -> bool;

    /// Event signalled as the hardware makes progress.
    fn completion_event(&self) -> &dyn CompletionEvent;
}

/// Limits for a ring's blocking behaviour.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    pub code_page_size: u64,
    pub reserve_retries: u32,
    pub wait_timeout: Duration,
}

impl RingConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            code_page_size: settings.code_page_size,
            reserve_retries: settings.reserve_retries,
            wait_timeout: settings.wait_timeout(),
        }
    }
}

/// An outstanding region handed to the producer. Consumed by `commit`.
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    kind: RingBufferKind,
    offset: u64,
    linear_addr: LinAddr,
    device_addr: DevAddr,
    len: u64,
}

impl Reservation {
    pub fn kind(&self) -> RingBufferKind {
        self.kind
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn linear_addr(&self) -> LinAddr {
        self.linear_addr
    }

    pub fn device_addr(&self) -> DevAddr {
        self.device_addr
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    pad: u64,
    wrapped: bool,
}

/// One circular buffer.
pub struct RingBuffer {
    kind: RingBufferKind,
    memory: Arc<dyn DeviceMemory>,
    segment: Segment,
    limit: u64,
    config: RingConfig,

    write_offset: u64,
    committed_prim_offset: u64,
    committed_hw_offset: u64,
    read_offset_copy: u64,
    locked_length: Option<u64>,
    kick_threshold: u64,
    next_kick_start: DevAddr,
}

impl RingBuffer {
    pub fn new(
        kind: RingBufferKind,
        size: u64,
        memory: Arc<dyn DeviceMemory>,
        config: RingConfig,
    ) -> Result<Self, RingError> {
        let aligned = is_aligned(size, kind.base_alignment());
        if size < kind.tail() + RING_FULL_GUARD * 2 || !aligned {
            return Err(RingError::InvalidSize {
                kind,
                requested: size,
            });
        }

        let segment = memory.allocate_segment(size, kind.base_alignment())?;
        log::debug!(
            "ring[{:?}]: created 0x{:X} bytes at device 0x{:X}",
            kind,
            size,
            segment.device_addr
        );

        Ok(Self {
            kind,
            memory,
            segment,
            limit: size,
            config,
            write_offset: 0,
            committed_prim_offset: 0,
            committed_hw_offset: 0,
            read_offset_copy: 0,
            locked_length: None,
            kick_threshold: size / 2,
            next_kick_start: segment.device_addr,
        })
    }

    pub fn kind(&self) -> RingBufferKind {
        self.kind
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn base_linear(&self) -> LinAddr {
        self.segment.linear_addr
    }

    pub fn base_device(&self) -> DevAddr {
        self.segment.device_addr
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub fn committed_prim_offset(&self) -> u64 {
        self.committed_prim_offset
    }

    pub fn committed_hw_offset(&self) -> u64 {
        self.committed_hw_offset
    }

    pub fn read_offset_copy(&self) -> u64 {
        self.read_offset_copy
    }

    pub fn kick_threshold(&self) -> u64 {
        self.kick_threshold
    }

    pub fn is_reserved(&self) -> bool {
        self.locked_length.is_some()
    }

    /// Device address where the next kick's control stream begins.
    pub fn next_kick_start(&self) -> DevAddr {
        self.next_kick_start
    }

    /// Bytes written since the last kick, accounting for wrap.
    pub fn unkicked_bytes(&self) -> u64 {
        self.distance(self.committed_hw_offset, self.committed_prim_offset)
    }

    /// Reserve `bytes` contiguous bytes.
    ///
    /// Returns `NoSpace` when the hardware is idle and the ring is still full
    /// (only a kick can help), and `Timeout` when the hardware is busy but did
    /// not free enough space within the configured number of waits.
    pub fn reserve(
        &mut self,
        bytes: u64,
        consumer: &dyn RingConsumer,
    ) -> Result<Reservation, RingError> {
        if self.locked_length.is_some() {
            log::warn!("ring[{:?}]: reserve while a reservation is outstanding", self.kind);
            return Err(RingError::ReservationOutstanding(self.kind));
        }
        self.check_request(bytes)?;

        let placement = self.wait_for_room(bytes, consumer, Self::try_place)?;
        self.grant(bytes, placement)
    }

    /// Commit `written` bytes of `reservation`. Unused trailing bytes are abandoned.
    pub fn commit(&mut self, reservation: Reservation, written: u64) -> Result<(), RingError> {
        let reserved = self
            .locked_length
            .ok_or(RingError::NoReservation(self.kind))?;
        if reservation.kind != self.kind || reservation.offset != self.write_offset {
            return Err(RingError::ForeignReservation(self.kind));
        }
        if written > reserved {
            log::warn!(
                "ring[{:?}]: commit 0x{:X} > reserved 0x{:X}",
                self.kind,
                written,
                reserved
            );
            return Err(RingError::CommitTooLarge {
                kind: self.kind,
                written,
                reserved,
            });
        }

        self.write_offset += written;
        debug_assert!(self.write_offset <= self.limit, "commit past end of ring");
        if self.write_offset == self.limit {
            self.write_offset = 0;
        }
        self.locked_length = None;

        log::trace!(
            "ring[{:?}]: commit 0x{:X}, write now 0x{:X}",
            self.kind,
            written,
            self.write_offset
        );
        Ok(())
    }

    /// Write `data` at `offset` within an outstanding reservation.
    pub fn write(
        &self,
        reservation: &Reservation,
        offset: u64,
        data: &[u8],
    ) -> Result<(), RingError> {
        if reservation.kind != self.kind || offset + data.len() as u64 > reservation.len {
            return Err(RingError::ForeignReservation(self.kind));
        }
        self.memory.write(reservation.linear_addr + offset, data)?;
        Ok(())
    }

    /// Translate a linear address inside the ring to its device address.
    pub fn address_of(&self, linear: LinAddr) -> Result<DevAddr, RingError> {
        self.segment
            .to_device(linear)
            .ok_or(RingError::AddressOutOfRange {
                kind: self.kind,
                addr: linear,
            })
    }

    /// Translate a device address inside the ring back to its linear address.
    pub fn linear_of(&self, device: DevAddr) -> Result<LinAddr, RingError> {
        self.segment
            .to_linear(device)
            .ok_or(RingError::AddressOutOfRange {
                kind: self.kind,
                addr: device,
            })
    }

    /// Close a unit of work. Asks `scheduler` for a kick once more than half
    /// the ring holds unkicked data; returns whether it did.
    pub fn note_completed_unit(&mut self, scheduler: &dyn KickScheduler) -> bool {
        self.committed_prim_offset = self.write_offset;

        let unkicked = self.unkicked_bytes();
        if unkicked > self.kick_threshold {
            log::debug!(
                "ring[{:?}]: 0x{:X} unkicked bytes over threshold 0x{:X}, requesting kick",
                self.kind,
                unkicked,
                self.kick_threshold
            );
            scheduler.schedule_kick(self.kind.is_late_stage());
            true
        } else {
            false
        }
    }

    /// Record that everything up to the last completed unit has been submitted.
    pub fn note_kicked(&mut self, consumer: &dyn RingConsumer) {
        self.committed_hw_offset = self.committed_prim_offset;
        self.refresh_read_offset(consumer);
        log::trace!(
            "ring[{:?}]: kicked up to 0x{:X}, read 0x{:X}",
            self.kind,
            self.committed_hw_offset,
            self.read_offset_copy
        );
    }

    /// Write a terminate record at the write cursor and step over it.
    pub fn terminate_stream(&mut self) -> Result<(), RingError> {
        self.require_idle_control_stream()?;
        self.check_tail_room(TERMINATE_RECORD_SIZE, "terminate record")?;
        self.write_record(self.write_offset, ControlRecord::Terminate)?;
        self.advance(TERMINATE_RECORD_SIZE);
        Ok(())
    }

    /// Align the write cursor for the next kick's control stream and remember
    /// where that stream starts. Call right before issuing a kick.
    pub fn rebase_stream_kick_origin(&mut self) -> Result<DevAddr, RingError> {
        self.require_idle_control_stream()?;

        let pad = self.kick_pad(self.write_offset);
        if pad > 0 {
            self.check_tail_room(pad, "kick alignment")?;
            self.advance(pad);
        }
        Ok(self.mark_kick_start())
    }

    /// Terminate the current kick's control stream and realign for the next
    /// one, as a single step. Room for the terminate record and the
    /// realignment is found before anything is written, waiting on the
    /// hardware like [`reserve`](Self::reserve) when the ring is full.
    pub fn close_kick_stream(
        &mut self,
        consumer: &dyn RingConsumer,
    ) -> Result<DevAddr, RingError> {
        self.require_idle_control_stream()?;

        let needed = self.close_len(self.write_offset);
        self.wait_for_room(needed, consumer, |ring, bytes| {
            (bytes <= ring.free_space().0).then_some(())
        })?;
        self.write_record(self.write_offset, ControlRecord::Terminate)?;
        self.advance(needed);
        Ok(self.mark_kick_start())
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    /// Place `bytes` with `place`, refreshing the read cursor once and then
    /// waiting on the hardware up to `reserve_retries` times.
    fn wait_for_room<P>(
        &mut self,
        bytes: u64,
        consumer: &dyn RingConsumer,
        place: impl Fn(&Self, u64) -> Option<P>,
    ) -> Result<P, RingError> {
        let mut refreshed = false;
        let mut waits = 0;
        loop {
            if let Some(placement) = place(self, bytes) {
                return Ok(placement);
            }

            if !refreshed {
                refreshed = true;
                self.refresh_read_offset(consumer);
                continue;
            }

            if consumer.is_idle(self.kind) {
                log::debug!(
                    "ring[{:?}]: no space for 0x{:X} bytes (write 0x{:X}, read 0x{:X}, hw idle)",
                    self.kind,
                    bytes,
                    self.write_offset,
                    self.read_offset_copy
                );
                return Err(RingError::NoSpace {
                    kind: self.kind,
                    requested: bytes,
                });
            }

            if waits == self.config.reserve_retries {
                log::warn!(
                    "ring[{:?}]: gave up on 0x{:X} bytes after {} waits",
                    self.kind,
                    bytes,
                    waits
                );
                return Err(RingError::Timeout {
                    kind: self.kind,
                    requested: bytes,
                    waits,
                });
            }

            waits += 1;
            consumer.completion_event().wait(self.config.wait_timeout);
            self.refresh_read_offset(consumer);
        }
    }

    fn check_request(&self, bytes: u64) -> Result<(), RingError> {
        let too_big_for_page = self.kind.code_alignment().is_some()
            && bytes > self.config.code_page_size;
        let never_fits = bytes + self.kind.tail() + RING_FULL_GUARD > self.limit;
        if bytes == 0 || too_big_for_page || never_fits {
            return Err(RingError::InvalidSize {
                kind: self.kind,
                requested: bytes,
            });
        }
        Ok(())
    }

    fn require_idle_control_stream(&self) -> Result<(), RingError> {
        if self.kind != RingBufferKind::ControlStream {
            return Err(RingError::NotControlStream(self.kind));
        }
        if self.locked_length.is_some() {
            return Err(RingError::ReservationOutstanding(self.kind));
        }
        Ok(())
    }

    fn write_record(&self, offset: u64, record: ControlRecord) -> Result<(), RingError> {
        self.memory
            .write(self.segment.linear_addr + offset, &record.encode())?;
        Ok(())
    }

    /// Padding that brings `offset` up to the kick alignment.
    fn kick_pad(&self, offset: u64) -> u64 {
        let device = self.segment.device_addr + offset;
        align_up(device, CONTROL_STREAM_KICK_ALIGN) - device
    }

    /// Bytes a terminate record at `offset` plus the following realignment take.
    fn close_len(&self, offset: u64) -> u64 {
        TERMINATE_RECORD_SIZE + self.kick_pad(offset + TERMINATE_RECORD_SIZE)
    }

    fn mark_kick_start(&mut self) -> DevAddr {
        self.next_kick_start = self.segment.device_addr + self.write_offset;
        log::debug!(
            "ring[{:?}]: next kick starts at device 0x{:X}",
            self.kind,
            self.next_kick_start
        );
        self.next_kick_start
    }

    fn refresh_read_offset(&mut self, consumer: &dyn RingConsumer) {
        let read = consumer.read_offset(self.kind);
        debug_assert!(read < self.limit, "hardware read offset outside ring");
        self.read_offset_copy = read % self.limit;
    }

    /// Forward distance from `from` to `to` around the ring.
    fn distance(&self, from: u64, to: u64) -> u64 {
        if to >= from {
            to - from
        } else {
            self.limit - from + to
        }
    }

    /// Free bytes at the write cursor without wrapping, and at offset 0 if the
    /// producer wraps now.
    fn free_space(&self) -> (u64, u64) {
        let write = self.write_offset;
        let read = self.read_offset_copy;
        if write >= read {
            let to_end = self.limit - write;
            let at_write = if read == 0 {
                to_end.saturating_sub(RING_FULL_GUARD)
            } else {
                to_end
            };
            (at_write, read.saturating_sub(RING_FULL_GUARD))
        } else {
            ((read - write).saturating_sub(RING_FULL_GUARD), 0)
        }
    }

    /// Padding needed before a reservation of `bytes` placed at `offset`.
    fn pad_at(&self, offset: u64, bytes: u64) -> u64 {
        let Some(alignment) = self.kind.code_alignment() else {
            return 0;
        };
        let device = self.segment.device_addr + offset;
        let aligned = align_up(device, alignment);
        let page_pad = page_straddle_pad(aligned, bytes, self.config.code_page_size);
        aligned - device + page_pad
    }

    /// Everything written has been kicked and consumed, so even a ring that
    /// may not wrap mid-scene can start over.
    fn is_drained(&self) -> bool {
        self.committed_hw_offset == self.write_offset
            && self.read_offset_copy == self.write_offset
    }

    fn try_place(&self, bytes: u64) -> Option<Placement> {
        let (at_write, at_start) = self.free_space();
        let tail = self.kind.tail();

        let pad = self.pad_at(self.write_offset, bytes);
        if pad + bytes + tail <= at_write {
            return Some(Placement {
                pad,
                wrapped: false,
            });
        }

        let can_wrap = (self.kind.may_wrap() || self.is_drained())
            && self.write_offset != 0
            && self.write_offset >= self.read_offset_copy;
        if can_wrap {
            let pad = self.pad_at(0, bytes);
            if pad + bytes + tail <= at_start {
                return Some(Placement { pad, wrapped: true });
            }
        }
        None
    }

    fn grant(&mut self, bytes: u64, placement: Placement) -> Result<Reservation, RingError> {
        if placement.wrapped {
            if self.kind == RingBufferKind::ControlStream {
                debug_assert!(self.write_offset + LINK_RECORD_SIZE <= self.limit);
                let link = ControlRecord::Link(self.segment.device_addr);
                self.write_record(self.write_offset, link)?;
            }
            log::trace!(
                "ring[{:?}]: wrapping at 0x{:X} (read 0x{:X})",
                self.kind,
                self.write_offset,
                self.read_offset_copy
            );
            self.write_offset = 0;
        }
        self.write_offset += placement.pad;
        debug_assert!(self.write_offset + bytes <= self.limit);

        self.locked_length = Some(bytes);
        let offset = self.write_offset;
        log::trace!(
            "ring[{:?}]: reserved 0x{:X} bytes at 0x{:X} (pad 0x{:X})",
            self.kind,
            bytes,
            offset,
            placement.pad
        );
        Ok(Reservation {
            kind: self.kind,
            offset,
            linear_addr: self.segment.linear_addr + offset,
            device_addr: self.segment.device_addr + offset,
            len: bytes,
        })
    }

    /// Error unless `bytes` fit at the write cursor without wrapping and
    /// without closing the gap to the read cursor.
    fn check_tail_room(&self, bytes: u64, what: &'static str) -> Result<(), RingError> {
        let (room, _) = self.free_space();
        if bytes <= room {
            Ok(())
        } else {
            log::debug!(
                "ring[{:?}]: no room for {} at 0x{:X} (read 0x{:X})",
                self.kind,
                what,
                self.write_offset,
                self.read_offset_copy
            );
            Err(RingError::TailExhausted {
                kind: self.kind,
                what,
                offset: self.write_offset,
            })
        }
    }

    fn advance(&mut self, bytes: u64) {
        self.write_offset += bytes;
        if self.write_offset == self.limit {
            self.write_offset = 0;
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.memory.free_segment(self.segment.handle);
    }
}

/// One ring per [`RingBufferKind`], owned by a render context.
pub struct RingBufferSet {
    rings: Vec<RingBuffer>,
}

impl RingBufferSet {
    pub fn new(settings: &Settings, memory: Arc<dyn DeviceMemory>) -> Result<Self, RingError> {
        let config = RingConfig::from_settings(settings);
        let rings = RingBufferKind::ALL
            .iter()
            .map(|&kind| {
                RingBuffer::new(kind, kind.configured_size(settings), memory.clone(), config)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rings })
    }

    pub fn ring(&self, kind: RingBufferKind) -> &RingBuffer {
        &self.rings[kind.index()]
    }

    pub fn ring_mut(&mut self, kind: RingBufferKind) -> &mut RingBuffer {
        &mut self.rings[kind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &RingBuffer> {
        self.rings.iter()
    }

    /// Close a unit of work on every ring. Returns whether any ring asked for a kick.
    pub fn note_completed_unit(&mut self, scheduler: &dyn KickScheduler) -> bool {
        let mut requested = false;
        for ring in &mut self.rings {
            requested |= ring.note_completed_unit(scheduler);
        }
        requested
    }

    /// Record a submitted kick. Pixel-stage rings are only consumed by the
    /// final kick of a scene, so they advance only on `final_flush`.
    pub fn note_kicked(&mut self, final_flush: bool, consumer: &dyn RingConsumer) {
        for ring in &mut self.rings {
            if final_flush || !ring.kind.is_late_stage() {
                ring.note_kicked(consumer);
            }
        }
    }
}

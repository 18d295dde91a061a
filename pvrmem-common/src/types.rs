// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Device-visible address (what the GPU dereferences).
pub type DevAddr = u64;

/// Host linear address of a mapping (what the CPU writes through).
pub type LinAddr = u64;

/// Fence value recorded against a kick. Compared with wrap-around.
pub type FenceValue = u32;

/// Size of one USE instruction in bytes.
pub const USE_INSTRUCTION_SIZE: u64 = 8;

/// USE code is fetched in instruction pairs.
pub const USE_DOUBLE_INSTRUCTION_SIZE: u64 = USE_INSTRUCTION_SIZE * 2;

/// PDS programs are fetched a cache line at a time.
pub const PDS_CACHE_LINE_SIZE: u64 = 64;

/// Default code page size. Code blocks may not straddle a page boundary
/// because the hardware program counter only carries the in-page offset.
pub const CODE_PAGE_SIZE: u64 = 0x1_0000;

/// Bytes the ring allocator always keeps free so a full ring never looks empty.
pub const RING_FULL_GUARD: u64 = 4;

/// Align a value up to the given alignment (power of two).
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Check if a value is a multiple of `alignment` (power of two).
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Round `value` up to a multiple of `granule`, which need not be a power of two.
#[inline]
pub const fn round_up(value: u64, granule: u64) -> u64 {
    value.div_ceil(granule) * granule
}

/// Bytes of padding needed so that `[addr + pad, addr + pad + size)` does not
/// cross a `page_size` boundary. Zero when the range already fits in one page.
///
/// Callers must ensure `size <= page_size`.
#[inline]
pub const fn page_straddle_pad(addr: u64, size: u64, page_size: u64) -> u64 {
    let page_offset = addr & (page_size - 1);
    if size == 0 || page_offset + size <= page_size {
        0
    } else {
        page_size - page_offset
    }
}

/// Wrap-aware "has `value` reached `threshold`" for 32-bit kick counters.
#[inline]
pub const fn fence_reached(value: FenceValue, threshold: FenceValue) -> bool {
    (value.wrapping_sub(threshold) as i32) >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(0, 16));
        assert!(is_aligned(0x40, 16));
        assert!(!is_aligned(0x44, 16));
        assert!(is_aligned(0x44, 4));
    }

    #[test]
    fn test_round_up_non_power_of_two() {
        assert_eq!(round_up(0, 12), 0);
        assert_eq!(round_up(1, 12), 12);
        assert_eq!(round_up(24, 12), 24);
        assert_eq!(round_up(25, 12), 36);
    }

    #[test]
    fn test_page_straddle_pad() {
        assert_eq!(page_straddle_pad(0, 0x100, 0x1000), 0);
        assert_eq!(page_straddle_pad(0xF00, 0x100, 0x1000), 0);
        assert_eq!(page_straddle_pad(0xF10, 0x100, 0x1000), 0xF0);
        assert_eq!(page_straddle_pad(0x1F10, 0x1000, 0x1000), 0xF0);
    }

    #[test]
    fn test_fence_reached_wraparound() {
        assert!(fence_reached(5, 3));
        assert!(fence_reached(3, 3));
        assert!(!fence_reached(2, 3));
        assert!(fence_reached(0, u32::MAX));
        assert!(!fence_reached(u32::MAX, 0));
    }
}

// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::types::CODE_PAGE_SIZE;

/// Runtime settings, populated from the config INI by the binary.
#[derive(Debug, Clone)]
pub struct Settings {
    // Rings
    pub control_stream_size: u64,
    pub index_ring_size: u64,
    pub vertex_ring_size: u64,
    pub use_code_ring_size: u64,
    pub pds_code_ring_size: u64,
    pub pds_pixel_ring_size: u64,
    pub reserve_retries: u32,

    // Code heaps
    pub code_page_size: u64,
    pub code_segment_size: u64,

    // Kick tracking
    pub wait_timeout_us: u64,
    pub wait_retries: u32,
    pub max_attachments: u32,

    // Simulation
    pub sim_units: u32,
    pub sim_gpu_latency_us: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_stream_size: 0x8000,
            index_ring_size: 0x2_0000,
            vertex_ring_size: 0x4_0000,
            use_code_ring_size: 0x1_0000,
            pds_code_ring_size: 0x8000,
            pds_pixel_ring_size: 0x8000,
            reserve_retries: 16,
            code_page_size: CODE_PAGE_SIZE,
            code_segment_size: 0x1_0000,
            wait_timeout_us: 1_000,
            wait_retries: 100,
            max_attachments: 1 << 16,
            sim_units: 1_000,
            sim_gpu_latency_us: 50,
        }
    }
}

impl Settings {
    pub fn wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_micros(self.wait_timeout_us)
    }
}

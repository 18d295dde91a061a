// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;
mod gpu_sim;
mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pvrmem_gpu::device_memory::HostDeviceMemory;
use pvrmem_gpu::fence::{AttachmentPointId, KickEvent};
use pvrmem_gpu::render_context::RenderContext;

use crate::gpu_sim::SimGpu;
use crate::workload::Workload;

/// pvrmem - GPU memory lifecycle simulator
#[derive(Parser, Debug)]
#[command(
    name = "pvrmem",
    version,
    about = "Streams a synthetic workload through ring buffers, code heaps and kick tracking"
)]
struct Args {
    /// Path to config file (default: auto-detect pvrmem.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of work units to run (overrides the config)
    #[arg(short, long)]
    units: Option<u32>,

    /// Seed for the synthetic workload
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("pvrmem - GPU memory lifecycle simulator");

    let mut settings = config::load_config(args.config.as_ref());
    if let Some(units) = args.units {
        settings.sim_units = units;
    }
    info!(
        "Units: {}, GPU latency: {}us, seed: {}",
        settings.sim_units, settings.sim_gpu_latency_us, args.seed
    );

    let memory = Arc::new(HostDeviceMemory::new());
    let event = Arc::new(KickEvent::new());
    let gpu = SimGpu::start(
        event.clone(),
        Duration::from_micros(settings.sim_gpu_latency_us),
    )
    .context("Failed to start simulated GPU")?;

    let ctx = RenderContext::new(AttachmentPointId(1), &settings, memory.clone(), event)
        .context("Failed to create render context")?;

    let start = Instant::now();
    let mut workload = Workload::new(ctx, &gpu, args.seed);
    for unit in 0..settings.sim_units {
        workload
            .run_unit()
            .with_context(|| format!("Unit {} failed", unit))?;
    }
    let stats = workload.finish()?;
    let elapsed = start.elapsed();

    info!(
        "Ran {} units in {:.1?}: {} kicks ({} final), {} ring stalls",
        stats.units, elapsed, stats.kicks, stats.final_kicks, stats.ring_stalls
    );
    info!(
        "Programs: {} uploaded, {} replaced, {} deleted, {} reclaimed",
        stats.uploads, stats.replacements, stats.deletions, stats.reclaimed
    );
    info!("GPU ran {} kicks", gpu.kicks_run());

    drop(gpu);
    if memory.in_use() != 0 {
        log::warn!("{} bytes of device memory still allocated", memory.in_use());
    }
    Ok(())
}

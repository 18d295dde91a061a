// SPDX-FileCopyrightText: 2025 pvrmem contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::Ini;
use log::{debug, info, warn};
use pvrmem_common::Settings;
use std::path::PathBuf;
use std::str::FromStr;

/// Locate pvrmem.ini.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PVRMEM_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // XDG_CONFIG_HOME
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("pvrmem").join("pvrmem.ini");
        if path.exists() {
            return Some(path);
        }
    }

    // ~/.config/pvrmem/pvrmem.ini
    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join("pvrmem")
            .join("pvrmem.ini");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Load settings from pvrmem.ini, falling back to defaults.
pub fn load_config(path: Option<&PathBuf>) -> Settings {
    let mut settings = Settings::default();

    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return settings;
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No config found, using defaults");
                return settings;
            }
        },
    };

    info!("Loading config from: {}", config_path.display());

    let conf = match Ini::load_from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            return settings;
        }
    };

    apply(&conf, &mut settings);
    settings
}

/// Accepts decimal or `0x`-prefixed hex.
fn parse_num<T: FromStr + TryFrom<u64>>(value: &str) -> Option<T> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .ok()
            .and_then(|v| T::try_from(v).ok()),
        None => value.parse().ok(),
    }
}

fn read<T: FromStr + TryFrom<u64> + std::fmt::Debug>(
    conf: &Ini,
    section: &str,
    key: &str,
    target: &mut T,
) {
    let Some(value) = conf.section(Some(section)).and_then(|s| s.get(key)) else {
        return;
    };
    match parse_num(value) {
        Some(v) => {
            *target = v;
            debug!("[{}] {} = {:?}", section, key, target);
        }
        None => warn!("[{}] {}: invalid value {:?}", section, key, value),
    }
}

fn apply(conf: &Ini, settings: &mut Settings) {
    // [Rings]
    read(conf, "Rings", "control_stream_size", &mut settings.control_stream_size);
    read(conf, "Rings", "index_ring_size", &mut settings.index_ring_size);
    read(conf, "Rings", "vertex_ring_size", &mut settings.vertex_ring_size);
    read(conf, "Rings", "use_code_ring_size", &mut settings.use_code_ring_size);
    read(conf, "Rings", "pds_code_ring_size", &mut settings.pds_code_ring_size);
    read(conf, "Rings", "pds_pixel_ring_size", &mut settings.pds_pixel_ring_size);
    read(conf, "Rings", "reserve_retries", &mut settings.reserve_retries);

    // [CodeHeap]
    read(conf, "CodeHeap", "code_page_size", &mut settings.code_page_size);
    read(conf, "CodeHeap", "segment_size", &mut settings.code_segment_size);

    // [Kick]
    read(conf, "Kick", "wait_timeout_us", &mut settings.wait_timeout_us);
    read(conf, "Kick", "wait_retries", &mut settings.wait_retries);
    read(conf, "Kick", "max_attachments", &mut settings.max_attachments);

    // [Simulation]
    read(conf, "Simulation", "units", &mut settings.sim_units);
    read(conf, "Simulation", "gpu_latency_us", &mut settings.sim_gpu_latency_us);
}

//! Diagnostic snapshots and the scoped reporting session.
//!
//! Postmortem debugging of device hangs needs the allocator layout, the
//! binary cache contents and the dispatch counters as they were when the
//! process died. [`DiagnosticSession`] is a drop guard the embedding
//! application holds for the lifetime of a device session: its report is
//! written on *any* exit path — normal return, early return, or a
//! propagated fatal error — with no reliance on process signal handling.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use crate::error::{LoaderError, Result};
use crate::loader::EpochLoader;

/// One DRAM channel's region layout and allocation state.
#[derive(Debug, Serialize)]
pub struct ChannelUsage {
    pub channel: u8,
    pub sync_base: u64,
    pub queue_table_base: u64,
    pub epoch_zero_base: u64,
    pub binaries_base: u64,
    pub binaries_top: u64,
    pub blobs_top: u64,
    pub binary_cursor: u64,
}

/// Binary cache occupancy, most recently used first.
#[derive(Debug, Serialize)]
pub struct CacheEntry {
    pub name: String,
    pub slot: u32,
}

#[derive(Debug, Serialize)]
pub struct DeviceDiagnostics {
    pub device: u32,
    pub current_generation: u64,
    pub synchronized_generation: u64,
    pub channels: Vec<ChannelUsage>,
    pub binary_cache: Vec<CacheEntry>,
}

/// Full snapshot written by a diagnostic session.
#[derive(Debug, Serialize)]
pub struct DiagnosticReport {
    pub devices: Vec<DeviceDiagnostics>,
    pub event_counters: BTreeMap<String, u64>,
}

impl EpochLoader {
    /// Snapshot allocator, cache and counter state across all devices.
    pub fn diagnostics(&self) -> DiagnosticReport {
        let state = self.lock();
        let mut devices: Vec<DeviceDiagnostics> = Vec::new();
        for (device, control) in state.controls.iter() {
            let manager = &state.dram[device];
            let channels = manager
                .channels()
                .iter()
                .enumerate()
                .map(|(index, allocator)| {
                    let regions = allocator.regions();
                    ChannelUsage {
                        channel: index as u8,
                        sync_base: regions.sync_base,
                        queue_table_base: regions.queue_table_base,
                        epoch_zero_base: regions.epoch_zero_base,
                        binaries_base: regions.binaries_base,
                        binaries_top: regions.binaries_top,
                        blobs_top: regions.blobs_top,
                        binary_cursor: allocator.binary_cursor(),
                    }
                })
                .collect();
            let binary_cache = control
                .cache_entries()
                .into_iter()
                .map(|(name, slot)| CacheEntry { name, slot })
                .collect();
            devices.push(DeviceDiagnostics {
                device: *device,
                current_generation: control.current_generation(),
                synchronized_generation: control.synchronized_generation(),
                channels,
                binary_cache,
            });
        }
        devices.sort_by_key(|d| d.device);
        DiagnosticReport {
            devices,
            event_counters: state.counters.snapshot(),
        }
    }
}

/// Scoped diagnostic session: writes a JSON report when dropped.
pub struct DiagnosticSession {
    loader: Arc<EpochLoader>,
    path: PathBuf,
    flushed: bool,
}

impl DiagnosticSession {
    pub fn new(loader: Arc<EpochLoader>, path: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            path: path.into(),
            flushed: false,
        }
    }

    /// Write the report now. Later drops won't write again.
    pub fn flush(&mut self) -> Result<()> {
        let report = self.loader.diagnostics();
        let rendered = serde_json::to_string_pretty(&report)
            .map_err(|e| LoaderError::Config(format!("diagnostic serialization failed: {}", e)))?;
        std::fs::write(&self.path, rendered)
            .map_err(|e| LoaderError::Config(format!("writing {} failed: {}", self.path.display(), e)))?;
        debug!("diagnostic report written to {}", self.path.display());
        self.flushed = true;
        Ok(())
    }
}

impl Drop for DiagnosticSession {
    fn drop(&mut self) {
        if !self.flushed {
            if let Err(e) = self.flush() {
                warn!("diagnostic flush on drop failed: {}", e);
            }
        }
    }
}

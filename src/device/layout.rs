//! Per-device core and DRAM-channel layout.
//!
//! The layout answers three questions the runtime keeps asking:
//!
//! - which grid cells hold a present core, and of what kind;
//! - which DRAM channel a core's binaries and queues are served from
//!   (fixed by the firmware's core→channel wiring, so the host must
//!   reproduce it exactly);
//! - how many cores share each channel, which sizes the per-channel
//!   binary and pointer-update-blob regions.
//!
//! Layouts are immutable after construction. Changing core counts
//! invalidates every address the device was initialized with, so a new
//! layout means a full re-init of the device.

use std::collections::HashMap;

use crate::device::coords::CoreCoord;
use crate::device::transport::DeviceId;
use crate::error::{LoaderError, Result};

/// Kind of a present routing core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreKind {
    /// A compute core. Runs epoch binaries.
    Worker,
    /// A bridging/network core. Has a command queue and overlay images
    /// but no kernel binaries.
    Network,
}

/// Immutable description of one chip.
#[derive(Debug, Clone)]
pub struct DeviceLayout {
    device: DeviceId,
    workers: Vec<CoreCoord>,
    network: Vec<CoreCoord>,
    kinds: HashMap<CoreCoord, CoreKind>,
    /// core → (channel, subchannel)
    channel_map: HashMap<CoreCoord, (u8, u8)>,
    /// Per channel, the cores it serves, workers first, in registration
    /// order. The position of a core in this list is its blob-region
    /// index within the channel.
    channel_cores: Vec<Vec<CoreCoord>>,
    /// Routing coordinate of each channel's DRAM port.
    dram_cores: Vec<CoreCoord>,
    bank_bytes: u64,
    /// Whether the host has a direct memory mapping to this chip.
    /// Remote chips need ordered pointer updates.
    mmio: bool,
}

impl DeviceLayout {
    pub fn new(
        device: DeviceId,
        workers: Vec<CoreCoord>,
        network: Vec<CoreCoord>,
        channel_map: HashMap<CoreCoord, (u8, u8)>,
        dram_cores: Vec<CoreCoord>,
        bank_bytes: u64,
        mmio: bool,
    ) -> Result<Self> {
        if dram_cores.is_empty() {
            return Err(LoaderError::Config("device has no DRAM channels".into()));
        }
        let num_channels = dram_cores.len();
        let mut kinds = HashMap::new();
        let mut channel_cores = vec![Vec::new(); num_channels];
        for (list, kind) in [(&workers, CoreKind::Worker), (&network, CoreKind::Network)] {
            for core in list.iter() {
                if kinds.insert(*core, kind).is_some() {
                    return Err(LoaderError::Config(format!(
                        "core {} listed twice in device {} layout",
                        core, device
                    )));
                }
                let (channel, _) = *channel_map.get(core).ok_or_else(|| {
                    LoaderError::Config(format!(
                        "core {} has no DRAM channel mapping",
                        core
                    ))
                })?;
                if channel as usize >= num_channels {
                    return Err(LoaderError::Config(format!(
                        "core {} mapped to channel {} but device has {}",
                        core, channel, num_channels
                    )));
                }
                channel_cores[channel as usize].push(*core);
            }
        }
        Ok(Self {
            device,
            workers,
            network,
            kinds,
            channel_map,
            channel_cores,
            dram_cores,
            bank_bytes,
            mmio,
        })
    }

    /// Convenience constructor: a rectangular worker block starting at
    /// (1, 1), with cores assigned to channels round-robin by column and
    /// one DRAM port per channel in column 0.
    pub fn rectangular(
        device: DeviceId,
        worker_rows: u8,
        worker_cols: u8,
        num_channels: u8,
        bank_bytes: u64,
        mmio: bool,
    ) -> Result<Self> {
        let mut workers = Vec::new();
        let mut channel_map = HashMap::new();
        for y in 0..worker_rows {
            for x in 0..worker_cols {
                let core = CoreCoord::new(x + 1, y + 1);
                channel_map.insert(core, (x % num_channels, 0));
                workers.push(core);
            }
        }
        let dram_cores = (0..num_channels).map(|ch| CoreCoord::new(0, ch)).collect();
        Self::new(device, workers, Vec::new(), channel_map, dram_cores, bank_bytes, mmio)
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn is_mmio(&self) -> bool {
        self.mmio
    }

    #[inline]
    pub fn bank_bytes(&self) -> u64 {
        self.bank_bytes
    }

    #[inline]
    pub fn num_channels(&self) -> u8 {
        self.dram_cores.len() as u8
    }

    pub fn workers(&self) -> &[CoreCoord] {
        &self.workers
    }

    pub fn network_cores(&self) -> &[CoreCoord] {
        &self.network
    }

    /// Kind of the core at a coordinate, or `None` when no core is
    /// present there.
    pub fn core_kind(&self, core: CoreCoord) -> Option<CoreKind> {
        self.kinds.get(&core).copied()
    }

    /// DRAM channel serving a core.
    pub fn dram_channel_for_core(&self, core: CoreCoord) -> Result<(u8, u8)> {
        self.channel_map.get(&core).copied().ok_or_else(|| {
            LoaderError::Config(format!("core {} has no DRAM channel mapping", core))
        })
    }

    /// Routing coordinate of a channel's DRAM port.
    pub fn dram_core_for_channel(&self, channel: u8) -> Result<CoreCoord> {
        self.dram_cores
            .get(channel as usize)
            .copied()
            .ok_or_else(|| LoaderError::Config(format!("no DRAM channel {}", channel)))
    }

    /// Worker and network core counts per channel, in channel order.
    /// These are the allocator's region-sizing inputs.
    pub fn cores_per_channel(&self) -> Vec<(u16, u16)> {
        self.channel_cores
            .iter()
            .map(|cores| {
                let workers = cores
                    .iter()
                    .filter(|c| self.kinds[c] == CoreKind::Worker)
                    .count() as u16;
                (workers, cores.len() as u16 - workers)
            })
            .collect()
    }

    /// Position of a core within its channel's core list; indexes the
    /// channel's pointer-update-blob region.
    pub fn core_index_in_channel(&self, core: CoreCoord) -> Result<u32> {
        let (channel, _) = self.dram_channel_for_core(core)?;
        self.channel_cores[channel as usize]
            .iter()
            .position(|c| *c == core)
            .map(|i| i as u32)
            .ok_or_else(|| {
                LoaderError::Config(format!("core {} missing from channel {} list", core, channel))
            })
    }

    /// All present cores (workers then network cores).
    pub fn active_cores(&self) -> impl Iterator<Item = CoreCoord> + '_ {
        self.workers.iter().chain(self.network.iter()).copied()
    }
}

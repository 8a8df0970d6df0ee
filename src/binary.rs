//! Epoch binaries and the program registry.
//!
//! An *epoch binary* is the set of per-core images (kernel, stream
//! overlay, runtime config) for one epoch on one chip. Images are built
//! by the compile pipeline; the runtime's job is to place them in DRAM
//! (once — placements survive cache hits) and ship them.
//!
//! Static firmware (the control-processor and router images every epoch
//! shares) is process-wide: loaded once, then shared read-only by every
//! per-epoch binary object.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use log::debug;

use crate::device::coords::CoreCoord;
use crate::device::layout::DeviceLayout;
use crate::device::transport::{DeviceId, DramAddr};
use crate::dram::{CONFIG_BASE, NETWORK_CONFIG_BASE, NETWORK_FW_BLOCK_BYTES, OVERLAY_BASE, WORKER_FW_BLOCK_BYTES};
use crate::error::{LoaderError, Result};

/// Core-local address the control-processor firmware loads at.
pub const CORE_CONTROL_FW_BASE: u64 = 0x2000;
/// Core-local address the router firmware loads at.
pub const CORE_ROUTER_FW_BASE: u64 = 0x6000;
/// Core-local address of the overlay bootstrap image.
pub const CORE_OVERLAY_INIT_BASE: u64 = 0xA000;

/// Words in a placeholder kernel image for cores with no op mapped.
const EMPTY_KERNEL_WORDS: usize = 32;

/// Process-wide static firmware image set. Read-only after construction.
#[derive(Debug, Default)]
pub struct FirmwareImages {
    pub control_fw: Vec<u32>,
    pub router_fw: Vec<u32>,
    pub overlay_init: Vec<u32>,
}

static FIRMWARE: OnceLock<Arc<FirmwareImages>> = OnceLock::new();

impl FirmwareImages {
    /// Install the firmware set. The first caller wins; later calls get
    /// the already-installed set back.
    pub fn install(images: FirmwareImages) -> Arc<FirmwareImages> {
        FIRMWARE.get_or_init(|| Arc::new(images)).clone()
    }

    /// The installed firmware set, if any.
    pub fn installed() -> Option<Arc<FirmwareImages>> {
        FIRMWARE.get().cloned()
    }
}

/// DRAM placement of one core's binary block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub channel: u8,
    pub subchannel: u8,
    pub block_addr: DramAddr,
}

/// Images for a single core within one epoch.
#[derive(Debug, Clone)]
pub struct CoreBinary {
    pub core: CoreCoord,
    /// Kernel image; empty on network cores.
    pub kernel: Vec<u32>,
    /// Stream-overlay configuration image.
    pub overlay: Vec<u32>,
    /// Runtime configuration image.
    pub config: Vec<u32>,
    /// Filled in on first layout, left alone on cache hits.
    pub placement: Option<Placement>,
}

impl CoreBinary {
    pub fn worker(core: CoreCoord, kernel: Vec<u32>, overlay: Vec<u32>, config: Vec<u32>) -> Result<Self> {
        let bin = Self {
            core,
            kernel,
            overlay,
            config,
            placement: None,
        };
        bin.check_worker_sizes()?;
        Ok(bin)
    }

    /// Placeholder images for a worker core with no op mapped this epoch.
    pub fn empty_worker(core: CoreCoord) -> Self {
        Self {
            core,
            kernel: vec![0; EMPTY_KERNEL_WORDS],
            overlay: vec![0; EMPTY_KERNEL_WORDS],
            config: vec![0; EMPTY_KERNEL_WORDS],
            placement: None,
        }
    }

    /// Placeholder images for a network core.
    pub fn empty_network(core: CoreCoord) -> Self {
        Self {
            core,
            kernel: Vec::new(),
            overlay: vec![0; EMPTY_KERNEL_WORDS],
            config: vec![0; EMPTY_KERNEL_WORDS],
            placement: None,
        }
    }

    fn check_worker_sizes(&self) -> Result<()> {
        let kernel_bytes = self.kernel.len() as u64 * 4;
        let overlay_bytes = self.overlay.len() as u64 * 4;
        let config_bytes = self.config.len() as u64 * 4;
        if kernel_bytes > OVERLAY_BASE
            || overlay_bytes > CONFIG_BASE - OVERLAY_BASE
            || config_bytes > WORKER_FW_BLOCK_BYTES - CONFIG_BASE
        {
            return Err(LoaderError::Config(format!(
                "core {} images exceed the per-core DRAM block",
                self.core
            )));
        }
        Ok(())
    }

    fn check_network_sizes(&self) -> Result<()> {
        let overlay_bytes = self.overlay.len() as u64 * 4;
        let config_bytes = self.config.len() as u64 * 4;
        if overlay_bytes > NETWORK_CONFIG_BASE
            || config_bytes > NETWORK_FW_BLOCK_BYTES - NETWORK_CONFIG_BASE
        {
            return Err(LoaderError::Config(format!(
                "network core {} images exceed the per-core DRAM block",
                self.core
            )));
        }
        Ok(())
    }
}

/// All per-core images for one epoch on one chip.
#[derive(Debug, Clone, Default)]
pub struct EpochBinary {
    pub workers: Vec<CoreBinary>,
    pub network: Vec<CoreBinary>,
}

impl EpochBinary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker_image(&mut self, image: CoreBinary) -> Result<()> {
        image.check_worker_sizes()?;
        self.workers.push(image);
        Ok(())
    }

    /// Give every worker core not yet covered a placeholder image and
    /// every network core its overlay/config images, so each active core
    /// receives a binary block and a valid command.
    pub fn pad_to_layout(&mut self, layout: &DeviceLayout) -> Result<()> {
        for core in layout.workers() {
            if !self.workers.iter().any(|b| b.core == *core) {
                self.workers.push(CoreBinary::empty_worker(*core));
            }
        }
        for core in layout.network_cores() {
            if !self.network.iter().any(|b| b.core == *core) {
                self.network.push(CoreBinary::empty_network(*core));
            }
        }
        for image in &self.network {
            image.check_network_sizes()?;
        }
        debug!(
            "epoch binary padded to {} worker + {} network images",
            self.workers.len(),
            self.network.len()
        );
        Ok(())
    }

    /// Forget placements, forcing a fresh layout on next dispatch.
    pub fn clear_placements(&mut self) {
        for image in self.workers.iter_mut().chain(self.network.iter_mut()) {
            image.placement = None;
        }
    }
}

/// Registry entry for a compiled epoch program. Created once at
/// registration, looked up by name for every dispatch. Only the binary's
/// placement fields mutate afterwards.
#[derive(Debug, Clone)]
pub struct ProgramInfo {
    /// Graph/program name the epoch was generated from.
    pub name: String,
    /// Compiled epoch identifier.
    pub epoch_id: u32,
    /// Target chip.
    pub target_device: DeviceId,
    pub binary: EpochBinary,
    /// Enable device-side performance tracing for this epoch.
    pub perf_trace: bool,
    /// Per-core traffic-decoupling masks; absent cores read as zero.
    pub decouple_masks: HashMap<CoreCoord, u16>,
}

impl ProgramInfo {
    pub fn new(name: impl Into<String>, epoch_id: u32, target_device: DeviceId) -> Self {
        Self {
            name: name.into(),
            epoch_id,
            target_device,
            binary: EpochBinary::new(),
            perf_trace: false,
            decouple_masks: HashMap::new(),
        }
    }

    pub fn decouple_mask(&self, core: CoreCoord) -> u16 {
        self.decouple_masks.get(&core).copied().unwrap_or(0)
    }
}

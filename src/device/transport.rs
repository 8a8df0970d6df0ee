//! Transport abstraction over the physical link to the device.
//!
//! The runtime never touches PCIe, NoC routing, or TLB management
//! directly; it goes through this trait. Implementations must honor two
//! ordering obligations:
//!
//! - `fence()` orders all previously issued writes before any later ones
//!   (store-fence semantics on the host side of the link).
//! - A write issued with `ordered_with_previous = true` must not be
//!   reordered ahead of the preceding write, even when the two target
//!   different physical links (relevant for remote, non-memory-mapped
//!   chips where independent links can otherwise race).
//!
//! Reads are synchronous and return data that was visible on the device
//! at some point after the call began.

use std::fmt;

use crate::device::coords::CoreCoord;
use crate::error::Result;

/// Identifier of one chip within the cluster.
pub type DeviceId = u32;

/// A byte address within a DRAM channel (or a core-local address space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DramAddr(pub u64);

impl DramAddr {
    /// Address `bytes` past this one.
    #[inline]
    pub fn offset(self, bytes: u64) -> DramAddr {
        DramAddr(self.0 + bytes)
    }
}

impl fmt::Display for DramAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// One DRAM bank on one chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DramTarget {
    pub device: DeviceId,
    pub channel: u8,
    pub subchannel: u8,
}

impl DramTarget {
    pub fn new(device: DeviceId, channel: u8) -> Self {
        Self {
            device,
            channel,
            subchannel: 0,
        }
    }
}

/// Address-space-aware access to device memory.
pub trait Transport: Send + Sync {
    /// Write words to DRAM. `ordered_with_previous` requests ordering
    /// against the immediately preceding write on this device.
    fn write_dram(
        &self,
        target: DramTarget,
        addr: DramAddr,
        words: &[u32],
        ordered_with_previous: bool,
    ) -> Result<()>;

    /// Read `len` words from DRAM.
    fn read_dram(&self, target: DramTarget, addr: DramAddr, len: usize) -> Result<Vec<u32>>;

    /// Write words into a core's local memory.
    fn write_core(
        &self,
        device: DeviceId,
        core: CoreCoord,
        addr: DramAddr,
        words: &[u32],
    ) -> Result<()>;

    /// Read words from a core's local memory.
    fn read_core(
        &self,
        device: DeviceId,
        core: CoreCoord,
        addr: DramAddr,
        len: usize,
    ) -> Result<Vec<u32>>;

    /// Host→device memory barrier: every prior DRAM write to `device` is
    /// visible to the device before this call returns.
    fn memory_barrier(&self, device: DeviceId) -> Result<()>;

    /// Host-side store fence between data writes and the pointer writes
    /// that publish them.
    fn fence(&self);

    /// Write the same words into the local memory of every listed core.
    fn broadcast_to_cores(
        &self,
        device: DeviceId,
        cores: &[CoreCoord],
        addr: DramAddr,
        words: &[u32],
    ) -> Result<()> {
        for core in cores {
            self.write_core(device, *core, addr, words)?;
        }
        Ok(())
    }
}

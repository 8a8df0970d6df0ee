//! DRAM region layout and allocation.
//!
//! Every DRAM channel on a chip carries the same fixed metadata layout,
//! computed once from the number of cores the channel serves:
//!
//! ```text
//!   bank top ────────────────────────────────────────────
//!             pointer-update blobs   (blob_bytes × slots × cores)
//!             epoch binaries         (binary_slot_bytes × bin slots)
//!   8 MiB ──  metadata limit ────────────────────────────
//!             epoch-zero start table (one slot per grid cell)
//!             command queue table    (one queue per grid cell)
//!             broadcast-sync slots
//!   ~6 MiB ─  metadata base ─────────────────────────────
//!             (reserved for other backend users)
//! ```
//!
//! The device firmware hard-codes the same offsets, so any change to core
//! counts or slot geometry invalidates an initialized device and requires
//! a full re-layout.
//!
//! Binary allocation is a monotonically increasing cursor within the
//! binary region. There is no free list: binaries are uniform-size per
//! core type, so overwriting an evicted cache slot is just reseeking the
//! cursor to that slot's known start offset.

use log::{debug, trace};

use crate::device::command::{
    update_blob_bytes, COMMAND_SLOT_BYTES, GRID, QUEUE_HEADER_BYTES, SYNC_SLOTS, SYNC_SLOT_BYTES,
};
use crate::device::coords::CoreCoord;
use crate::device::layout::{CoreKind, DeviceLayout};
use crate::device::transport::{DramAddr, DramTarget};
use crate::error::{LoaderError, Result};
use crate::queue::EpochQueue;

/// Bottom of the epoch metadata area. Everything below belongs to other
/// backend users.
pub const DRAM_METADATA_BASE: u64 = 6 * 1024 * 1024 + 100 * 1024;
/// Top of the epoch metadata area; the binary region starts here.
pub const DRAM_METADATA_LIMIT: u64 = 8 * 1024 * 1024;

/// Bytes of DRAM one worker core's epoch binaries occupy.
pub const WORKER_FW_BLOCK_BYTES: u64 = 0x2_0000;
/// Offset of the kernel image within a worker block.
pub const KERNEL_BASE: u64 = 0x0;
/// Offset of the stream-overlay image within a worker block.
pub const OVERLAY_BASE: u64 = 0x1_0000;
/// Offset of the runtime-config image within a worker block.
pub const CONFIG_BASE: u64 = 0x1_E000;

/// Bytes of DRAM one network core's epoch binaries occupy.
pub const NETWORK_FW_BLOCK_BYTES: u64 = 0x8000;
/// Offset of the runtime-config image within a network block.
pub const NETWORK_CONFIG_BASE: u64 = 0x6000;

/// Slot geometry the region layout is computed from.
#[derive(Debug, Clone, Copy)]
pub struct RegionParams {
    pub command_slots: u32,
    pub binary_slots: u32,
    pub blob_entries: u32,
    pub blob_slots: u32,
}

impl RegionParams {
    pub fn from_config(config: &crate::config::RuntimeConfig) -> Self {
        Self {
            command_slots: config.command_slots,
            binary_slots: config.binary_cache_slots,
            blob_entries: config.update_blob_entries,
            blob_slots: config.update_blob_slots,
        }
    }
}

/// Region boundaries of one channel, all strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Regions {
    pub sync_base: u64,
    pub queue_table_base: u64,
    pub epoch_zero_base: u64,
    pub binaries_base: u64,
    pub binaries_top: u64,
    pub blobs_top: u64,
}

/// Allocator for one (device, channel) pair.
#[derive(Debug, Clone)]
pub struct ChannelAllocator {
    regions: Regions,
    queue_entry_bytes: u64,
    binary_slot_bytes: u64,
    binary_slots: u32,
    blob_bytes: u64,
    blob_slots: u32,
    binary_cursor: u64,
}

impl ChannelAllocator {
    /// Compute the channel layout for the given core counts. Fails when
    /// the metadata area or the bank cannot hold the derived regions.
    pub fn new(params: &RegionParams, workers: u16, network: u16, bank_bytes: u64) -> Result<Self> {
        let queue_entry_bytes =
            params.command_slots as u64 * COMMAND_SLOT_BYTES as u64 + QUEUE_HEADER_BYTES as u64;
        let epoch_zero_bytes = GRID.cells() as u64 * COMMAND_SLOT_BYTES as u64;
        let epoch_zero_base = DRAM_METADATA_LIMIT - epoch_zero_bytes;
        let table_bytes = GRID.cells() as u64 * queue_entry_bytes;
        let queue_table_base = epoch_zero_base
            .checked_sub(table_bytes)
            .ok_or_else(|| LoaderError::Capacity("command queue table exceeds metadata area".into()))?;
        let sync_base = queue_table_base
            .checked_sub(SYNC_SLOTS as u64 * SYNC_SLOT_BYTES as u64)
            .ok_or_else(|| LoaderError::Capacity("sync slots exceed metadata area".into()))?;
        if sync_base < DRAM_METADATA_BASE {
            return Err(LoaderError::Capacity(format!(
                "queue table region needs {} bytes below 0x{:x} but only 0x{:x} is reserved",
                DRAM_METADATA_LIMIT - sync_base,
                DRAM_METADATA_LIMIT,
                DRAM_METADATA_LIMIT - DRAM_METADATA_BASE,
            )));
        }

        let binary_slot_bytes = WORKER_FW_BLOCK_BYTES * workers as u64
            + NETWORK_FW_BLOCK_BYTES * network as u64;
        let binaries_top =
            DRAM_METADATA_LIMIT + binary_slot_bytes * params.binary_slots as u64;
        let blob_bytes = update_blob_bytes(params.blob_entries);
        let blobs_top = binaries_top
            + blob_bytes * params.blob_slots as u64 * (workers as u64 + network as u64);
        if blobs_top > bank_bytes {
            return Err(LoaderError::Capacity(format!(
                "binary/blob regions end at 0x{:x}, past bank capacity 0x{:x}",
                blobs_top, bank_bytes
            )));
        }

        debug!(
            "channel layout: {} workers, {} network cores, binaries 0x{:x}..0x{:x}, blobs ..0x{:x}",
            workers, network, DRAM_METADATA_LIMIT, binaries_top, blobs_top
        );

        Ok(Self {
            regions: Regions {
                sync_base,
                queue_table_base,
                epoch_zero_base,
                binaries_base: DRAM_METADATA_LIMIT,
                binaries_top,
                blobs_top,
            },
            queue_entry_bytes,
            binary_slot_bytes,
            binary_slots: params.binary_slots,
            blob_bytes,
            blob_slots: params.blob_slots,
            binary_cursor: DRAM_METADATA_LIMIT,
        })
    }

    #[inline]
    pub fn regions(&self) -> Regions {
        self.regions
    }

    /// Bytes one binary cache slot spans in this channel.
    #[inline]
    pub fn binary_slot_bytes(&self) -> u64 {
        self.binary_slot_bytes
    }

    /// Current binary allocation cursor.
    #[inline]
    pub fn binary_cursor(&self) -> u64 {
        self.binary_cursor
    }

    /// Fixed address of a grid cell's command queue.
    pub fn command_queue_address(&self, core: CoreCoord) -> DramAddr {
        DramAddr(self.regions.queue_table_base + GRID.cell_index(core) as u64 * self.queue_entry_bytes)
    }

    /// Fixed address of a grid cell's epoch-zero table entry.
    pub fn epoch_zero_entry_address(&self, core: CoreCoord) -> DramAddr {
        DramAddr(self.regions.epoch_zero_base + GRID.cell_index(core) as u64 * COMMAND_SLOT_BYTES as u64)
    }

    /// Address of a broadcast-sync flag slot.
    pub fn sync_slot_address(&self, slot: u32) -> Result<DramAddr> {
        if slot >= SYNC_SLOTS {
            return Err(LoaderError::Misuse(format!(
                "sync slot {} out of range ({})",
                slot, SYNC_SLOTS
            )));
        }
        Ok(DramAddr(self.regions.sync_base + slot as u64 * SYNC_SLOT_BYTES as u64))
    }

    /// Reset the binary cursor to the start of a cache slot, in
    /// preparation for overwriting an evicted binary.
    pub fn seek_binary_slot(&mut self, slot: u32) -> Result<()> {
        if slot >= self.binary_slots {
            return Err(LoaderError::Misuse(format!(
                "binary slot {} out of range ({})",
                slot, self.binary_slots
            )));
        }
        self.binary_cursor = self.regions.binaries_base + slot as u64 * self.binary_slot_bytes;
        Ok(())
    }

    /// Allocate `bytes` of binary space at the cursor. Monotonic within a
    /// slot; exhausting the region is fatal.
    pub fn alloc_binary(&mut self, bytes: u64) -> Result<DramAddr> {
        if bytes % 4 != 0 {
            return Err(LoaderError::Misuse(format!(
                "binary allocation of {} bytes is not word aligned",
                bytes
            )));
        }
        let start = self.binary_cursor;
        let end = start + bytes;
        if end > self.regions.binaries_top {
            return Err(LoaderError::Capacity(format!(
                "binary region exhausted: cursor 0x{:x} + 0x{:x} past 0x{:x}",
                start, bytes, self.regions.binaries_top
            )));
        }
        self.binary_cursor = end;
        trace!("alloc_binary {} bytes at 0x{:x}", bytes, start);
        Ok(DramAddr(start))
    }

    /// Address of one pointer-update blob slot belonging to the
    /// `core_index`-th core served by this channel.
    pub fn update_blob_address(&self, core_index: u32, slot: u32) -> Result<DramAddr> {
        if slot >= self.blob_slots {
            return Err(LoaderError::Misuse(format!(
                "update blob slot {} out of range ({})",
                slot, self.blob_slots
            )));
        }
        let addr = self.regions.binaries_top
            + core_index as u64 * self.blob_slots as u64 * self.blob_bytes
            + slot as u64 * self.blob_bytes;
        if addr + self.blob_bytes > self.regions.blobs_top {
            return Err(LoaderError::Capacity(format!(
                "update blob for core index {} slot {} past region top",
                core_index, slot
            )));
        }
        Ok(DramAddr(addr))
    }
}

/// Per-device DRAM bookkeeping: one allocator per channel plus the
/// queue-placement policy.
#[derive(Debug)]
pub struct DramManager {
    layout: DeviceLayout,
    channels: Vec<ChannelAllocator>,
}

impl DramManager {
    pub fn new(layout: &DeviceLayout, params: &RegionParams) -> Result<Self> {
        let mut channels = Vec::new();
        for (workers, network) in layout.cores_per_channel() {
            channels.push(ChannelAllocator::new(
                params,
                workers,
                network,
                layout.bank_bytes(),
            )?);
        }
        Ok(Self {
            layout: layout.clone(),
            channels,
        })
    }

    #[inline]
    pub fn channels(&self) -> &[ChannelAllocator] {
        &self.channels
    }

    pub fn channel(&self, channel: u8) -> Result<&ChannelAllocator> {
        self.channels
            .get(channel as usize)
            .ok_or_else(|| LoaderError::Config(format!("no DRAM channel {}", channel)))
    }

    pub fn channel_mut(&mut self, channel: u8) -> Result<&mut ChannelAllocator> {
        self.channels
            .get_mut(channel as usize)
            .ok_or_else(|| LoaderError::Config(format!("no DRAM channel {}", channel)))
    }

    /// Reseek every channel's binary cursor to the start of a cache slot.
    pub fn seek_binary_slot(&mut self, slot: u32) -> Result<()> {
        for channel in &mut self.channels {
            channel.seek_binary_slot(slot)?;
        }
        Ok(())
    }

    /// Bind a command queue to its DRAM home. Worker queues all land on
    /// channel 0 unless `distribute_tables` is set; network-core queues
    /// always follow the core→channel map.
    pub fn allocate_command_queue(
        &mut self,
        queue: &mut EpochQueue,
        distribute_tables: bool,
    ) -> Result<()> {
        let core = queue.routing_core().ok_or_else(|| {
            LoaderError::Misuse("cannot allocate DRAM for an inactive queue".into())
        })?;
        let is_worker = self.layout.core_kind(core) == Some(CoreKind::Worker);
        let (channel, subchannel) = if is_worker && !distribute_tables {
            (0, 0)
        } else {
            self.layout.dram_channel_for_core(core)?
        };
        let addr = self.channel(channel)?.command_queue_address(core);
        queue.bind_dram(
            DramTarget {
                device: self.layout.device(),
                channel,
                subchannel,
            },
            addr,
        );
        trace!(
            "queue for core {} bound to device {} channel {} at {}",
            core,
            self.layout.device(),
            channel,
            addr
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::command::DEFAULT_UPDATE_BLOB_ENTRIES;

    fn params() -> RegionParams {
        RegionParams {
            command_slots: 256,
            binary_slots: 32,
            blob_entries: DEFAULT_UPDATE_BLOB_ENTRIES,
            blob_slots: 256,
        }
    }

    #[test]
    fn regions_are_strictly_increasing() {
        for (workers, network) in [(0u16, 0u16), (1, 0), (8, 2), (16, 4)] {
            let alloc = ChannelAllocator::new(&params(), workers, network, 1 << 31).unwrap();
            let r = alloc.regions();
            assert!(r.sync_base >= DRAM_METADATA_BASE);
            assert!(r.sync_base < r.queue_table_base);
            assert!(r.queue_table_base < r.epoch_zero_base);
            assert!(r.epoch_zero_base < r.binaries_base);
            assert!(r.binaries_base <= r.binaries_top);
            assert!(r.binaries_top <= r.blobs_top);
        }
    }

    #[test]
    fn region_sizes_scale_linearly_with_core_count() {
        let one = ChannelAllocator::new(&params(), 1, 0, 1 << 31).unwrap();
        let four = ChannelAllocator::new(&params(), 4, 0, 1 << 31).unwrap();
        let bin_one = one.regions().binaries_top - one.regions().binaries_base;
        let bin_four = four.regions().binaries_top - four.regions().binaries_base;
        assert_eq!(bin_four, bin_one * 4);
        let blob_one = one.regions().blobs_top - one.regions().binaries_top;
        let blob_four = four.regions().blobs_top - four.regions().binaries_top;
        assert_eq!(blob_four, blob_one * 4);
    }

    #[test]
    fn queue_addresses_are_disjoint_per_cell() {
        let alloc = ChannelAllocator::new(&params(), 4, 0, 1 << 31).unwrap();
        let a = alloc.command_queue_address(CoreCoord::new(0, 0));
        let b = alloc.command_queue_address(CoreCoord::new(1, 0));
        assert_eq!(b.0 - a.0, 256 * 64 + 32);
        let last = alloc.command_queue_address(CoreCoord::new(GRID.cols - 1, GRID.rows - 1));
        assert!(last.0 + 256 * 64 + 32 <= alloc.regions().epoch_zero_base);
    }

    #[test]
    fn binary_allocation_is_monotonic_until_exhaustion() {
        let mut alloc = ChannelAllocator::new(&params(), 1, 0, 1 << 31).unwrap();
        let first = alloc.alloc_binary(WORKER_FW_BLOCK_BYTES).unwrap();
        assert_eq!(first.0, alloc.regions().binaries_base);
        // Slot 0 is exactly one worker block; the next allocation must
        // come from another slot.
        alloc.seek_binary_slot(1).unwrap();
        let second = alloc.alloc_binary(WORKER_FW_BLOCK_BYTES).unwrap();
        assert_eq!(second.0, first.0 + WORKER_FW_BLOCK_BYTES);
        // Seeking back overwrites the first slot's offsets exactly.
        alloc.seek_binary_slot(0).unwrap();
        assert_eq!(alloc.alloc_binary(WORKER_FW_BLOCK_BYTES).unwrap(), first);
    }

    #[test]
    fn binary_region_exhaustion_is_fatal() {
        let mut alloc = ChannelAllocator::new(&params(), 1, 0, 1 << 31).unwrap();
        alloc.seek_binary_slot(31).unwrap();
        alloc.alloc_binary(WORKER_FW_BLOCK_BYTES).unwrap();
        assert!(matches!(
            alloc.alloc_binary(4),
            Err(LoaderError::Capacity(_))
        ));
    }

    #[test]
    fn misaligned_binary_allocation_rejected() {
        let mut alloc = ChannelAllocator::new(&params(), 1, 0, 1 << 31).unwrap();
        assert!(matches!(
            alloc.alloc_binary(6),
            Err(LoaderError::Misuse(_))
        ));
    }

    #[test]
    fn blob_addresses_partition_by_core_then_slot() {
        let alloc = ChannelAllocator::new(&params(), 2, 0, 1 << 31).unwrap();
        let blob = update_blob_bytes(DEFAULT_UPDATE_BLOB_ENTRIES);
        let c0s0 = alloc.update_blob_address(0, 0).unwrap();
        let c0s1 = alloc.update_blob_address(0, 1).unwrap();
        let c1s0 = alloc.update_blob_address(1, 0).unwrap();
        assert_eq!(c0s0.0, alloc.regions().binaries_top);
        assert_eq!(c0s1.0 - c0s0.0, blob);
        assert_eq!(c1s0.0 - c0s0.0, blob * 256);
        assert!(alloc.update_blob_address(0, 256).is_err());
    }

    #[test]
    fn oversized_bank_requirement_is_fatal() {
        // A tiny bank cannot hold the binary region.
        let err = ChannelAllocator::new(&params(), 8, 0, 16 * 1024 * 1024);
        assert!(matches!(err, Err(LoaderError::Capacity(_))));
    }

    #[test]
    fn oversized_queue_table_is_fatal() {
        let big = RegionParams {
            command_slots: 4096,
            ..params()
        };
        assert!(matches!(
            ChannelAllocator::new(&big, 1, 0, 1 << 31),
            Err(LoaderError::Capacity(_))
        ));
    }

    #[test]
    fn sync_slots_sit_below_queue_table() {
        let alloc = ChannelAllocator::new(&params(), 1, 0, 1 << 31).unwrap();
        let first = alloc.sync_slot_address(0).unwrap();
        let last = alloc.sync_slot_address(SYNC_SLOTS - 1).unwrap();
        assert_eq!(first.0, alloc.regions().sync_base);
        assert!(last.0 + SYNC_SLOT_BYTES as u64 <= alloc.regions().queue_table_base);
        assert!(alloc.sync_slot_address(SYNC_SLOTS).is_err());
    }
}

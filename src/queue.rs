//! DRAM-backed circular command queues.
//!
//! One queue per grid cell. The authoritative read/write pointers live in
//! the queue's DRAM header; the host keeps local shadows and only pays a
//! device round trip when the shadows say the queue might be full (or
//! when eviction decisions need fresh retirement data).
//!
//! # Write-combining
//!
//! With a write-combine window configured, pushed commands accumulate in
//! a host-side pending list and go out as one combined transfer. A flush
//! is triggered when the window fills, when the next slot would wrap to
//! index 0 (combined transfers must stay physically adjacent), or when
//! the host staging buffer limit is reached. The flush is two-phase:
//! commands first, then — after a store fence — the write pointer, because
//! the device polls the pointer to learn that new entries are valid.
//!
//! # Reference retirement
//!
//! Every occupied slot remembers which binary and epoch identifier its
//! command referenced. When a read-pointer refresh observes the device
//! has consumed slots, the per-binary, per-epoch-bucket and
//! per-update-blob reference counts are decremented, which is what makes
//! cache eviction and alias-hazard detection safe.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::trace;

use crate::device::command::{
    CommandWords, FW_MAILBOX_OFFSET, FW_READY_MAGIC, QUEUE_HEADER_BYTES, RD_PTR_OFFSET,
    WR_PTR_OFFSET,
};
use crate::device::coords::CoreCoord;
use crate::device::transport::{DramAddr, DramTarget, Transport};
use crate::error::{LoaderError, Result};
use crate::qptr::QueuePtr;

/// Host staging buffer capacity for one combined transfer.
pub const HOST_STAGING_BYTES: u32 = 1024;

/// Busy-poll until `ready` reports true, spinning the calling thread.
/// There is no blocking primitive here on purpose: device latencies are
/// short and the polled state has no interrupt path.
pub(crate) fn busy_poll<F>(timeout: Option<Duration>, what: &str, mut ready: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let start = Instant::now();
    loop {
        if ready()? {
            return Ok(());
        }
        if let Some(limit) = timeout {
            if start.elapsed() > limit {
                return Err(LoaderError::Timeout {
                    what: what.to_string(),
                    seconds: limit.as_secs(),
                });
            }
        }
        std::hint::spin_loop();
    }
}

/// One grid cell's command queue.
#[derive(Debug)]
pub struct EpochQueue {
    /// Present routing core, or `None` for an inactive grid cell.
    routing_core: Option<CoreCoord>,
    slots: u32,
    slot_bytes: u32,
    /// Remote (not directly memory-mapped) chips need pointer updates
    /// ordered against the preceding data write.
    remote: bool,
    dram: Option<(DramTarget, DramAddr)>,
    ptrs: QueuePtr,
    pending: VecDeque<CommandWords>,
    wc_window: u32,
    flushed_cmds: bool,
    /// Wrapped-epoch-id window; identifiers alias modulo this value.
    epoch_window: u32,
    binaries_in_slot: Vec<Option<String>>,
    epoch_ids_in_slot: Vec<Option<u32>>,
    blobs_in_slot: Vec<Option<String>>,
    num_valid_cmds: u32,
    /// Scratch flag used by the dispatch fan-out to know which queues
    /// already received a valid command this round.
    pub(crate) valid_cmd_sent: bool,
    loop_start_wr: Option<u32>,
    loop_depth: u32,
    poll_timeout: Option<Duration>,
}

impl EpochQueue {
    pub fn new(
        routing_core: Option<CoreCoord>,
        slots: u32,
        slot_bytes: u32,
        remote: bool,
        epoch_window: u32,
        poll_timeout: Option<Duration>,
    ) -> Self {
        Self {
            routing_core,
            slots,
            slot_bytes,
            remote,
            dram: None,
            ptrs: QueuePtr::new(slots),
            pending: VecDeque::new(),
            wc_window: 0,
            flushed_cmds: false,
            epoch_window,
            binaries_in_slot: vec![None; slots as usize],
            epoch_ids_in_slot: vec![None; slots as usize],
            blobs_in_slot: vec![None; slots as usize],
            num_valid_cmds: 0,
            valid_cmd_sent: false,
            loop_start_wr: None,
            loop_depth: 0,
            poll_timeout,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.routing_core.is_some()
    }

    #[inline]
    pub fn routing_core(&self) -> Option<CoreCoord> {
        self.routing_core
    }

    #[inline]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Queue footprint in DRAM: header plus all slots.
    pub fn size_bytes(&self) -> u32 {
        QUEUE_HEADER_BYTES + self.slots * self.slot_bytes
    }

    /// Bind this queue to its DRAM home. Done once by the allocator.
    pub fn bind_dram(&mut self, target: DramTarget, addr: DramAddr) {
        self.dram = Some((target, addr));
    }

    fn dram(&self) -> Result<(DramTarget, DramAddr)> {
        self.dram.ok_or_else(|| {
            LoaderError::Misuse(format!(
                "queue {} used before DRAM allocation",
                self.describe()
            ))
        })
    }

    fn describe(&self) -> String {
        match self.routing_core {
            Some(core) => format!("{}", core),
            None => "<inactive>".to_string(),
        }
    }

    /// Configure the write-combine window. Zero disables combining.
    pub fn set_wc_window(&mut self, window: u32) -> Result<()> {
        if window > self.slots {
            return Err(LoaderError::Misuse(format!(
                "write-combine window {} exceeds queue capacity {}",
                window, self.slots
            )));
        }
        self.wc_window = window;
        Ok(())
    }

    #[inline]
    pub fn wc_window(&self) -> u32 {
        self.wc_window
    }

    /// Zero the DRAM header (pointers and firmware mailbox) and reset the
    /// host shadows.
    pub fn init_header(&mut self, transport: &dyn Transport) -> Result<()> {
        let (target, addr) = self.dram()?;
        transport.write_dram(target, addr, &[0u32; 8], false)?;
        self.ptrs = QueuePtr::new(self.slots);
        Ok(())
    }

    /// Occupancy from the host-shadowed pointers. No device round trip.
    #[inline]
    pub fn occupancy(&self) -> u32 {
        self.ptrs.occupancy()
    }

    /// Number of commands accumulated in the write-combine buffer.
    #[inline]
    pub fn pending_len(&self) -> u32 {
        self.pending.len() as u32
    }

    #[inline]
    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[inline]
    pub fn num_valid_cmds(&self) -> u32 {
        self.num_valid_cmds
    }

    #[inline]
    pub fn write_ptr_raw(&self) -> u32 {
        self.ptrs.wr()
    }

    #[inline]
    pub fn read_ptr_raw(&self) -> u32 {
        self.ptrs.rd()
    }

    /// Record which epoch the next pushed command belongs to, for binary
    /// reference counting and alias detection. With write-combining the
    /// DRAM write pointer lags, so the pending length is folded in.
    pub fn assign_epoch_to_next_slot(&mut self, binary: &str, epoch_id: u32) {
        let raw = if self.wc_window > 0 {
            self.ptrs.wr() + self.pending_len()
        } else {
            self.ptrs.wr()
        };
        let slot = self.ptrs.slot_of(raw) as usize;
        self.binaries_in_slot[slot] = Some(binary.to_string());
        self.epoch_ids_in_slot[slot] = Some(epoch_id);
        self.num_valid_cmds += 1;
    }

    /// Record that the next pushed command references an external
    /// pointer-update blob.
    pub fn assign_blob_to_next_slot(&mut self, key: &str) {
        let raw = if self.wc_window > 0 {
            self.ptrs.wr() + self.pending_len()
        } else {
            self.ptrs.wr()
        };
        let slot = self.ptrs.slot_of(raw) as usize;
        self.blobs_in_slot[slot] = Some(key.to_string());
    }

    /// Refresh the read pointer from DRAM, retiring the references of
    /// every slot the device consumed since the last refresh. Returns the
    /// new raw read pointer.
    pub fn sync_read_ptr(
        &mut self,
        transport: &dyn Transport,
        per_binary: &mut HashMap<String, u32>,
        per_epoch: &mut HashMap<u32, u32>,
        blob_refs: &mut HashMap<String, u32>,
    ) -> Result<u32> {
        let (target, addr) = self.dram()?;
        let device_rd = transport.read_dram(target, addr.offset(RD_PTR_OFFSET), 1)?[0];
        let consumed = self.ptrs.distance(self.ptrs.rd(), device_rd);
        for step in 0..consumed {
            let slot = self.ptrs.slot_of(self.ptrs.rd() + step) as usize;
            if let Some(epoch_id) = self.epoch_ids_in_slot[slot].take() {
                let bucket = epoch_id % self.epoch_window;
                if let Some(count) = per_epoch.get_mut(&bucket) {
                    *count = count.saturating_sub(1);
                }
                if let Some(name) = self.binaries_in_slot[slot].take() {
                    if let Some(count) = per_binary.get_mut(&name) {
                        *count = count.saturating_sub(1);
                    }
                }
                self.num_valid_cmds = self.num_valid_cmds.saturating_sub(1);
            }
            if let Some(key) = self.blobs_in_slot[slot].take() {
                if let Some(count) = blob_refs.get_mut(&key) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        self.ptrs.set_rd(device_rd)?;
        Ok(device_rd)
    }

    /// Occupancy after a forced read-pointer refresh.
    pub fn occupancy_on_device(
        &mut self,
        transport: &dyn Transport,
        per_binary: &mut HashMap<String, u32>,
        per_epoch: &mut HashMap<u32, u32>,
        blob_refs: &mut HashMap<String, u32>,
    ) -> Result<u32> {
        self.sync_read_ptr(transport, per_binary, per_epoch, blob_refs)?;
        Ok(self.ptrs.occupancy())
    }

    /// Whether the queue is full, checking local shadows first and only
    /// paying a device round trip when they say full.
    pub fn is_full_on_device(
        &mut self,
        transport: &dyn Transport,
        per_binary: &mut HashMap<String, u32>,
        per_epoch: &mut HashMap<u32, u32>,
        blob_refs: &mut HashMap<String, u32>,
    ) -> Result<bool> {
        if !self.ptrs.is_full() {
            return Ok(false);
        }
        if self.loop_depth > 0 && Some(self.ptrs.rd()) == self.loop_start_wr {
            // The device is parked on the loop-start command and every
            // slot is occupied: the loop body cannot fit.
            return Err(LoaderError::Capacity(format!(
                "queue {} ({} slots) cannot fit the device loop's commands",
                self.describe(),
                self.slots
            )));
        }
        self.sync_read_ptr(transport, per_binary, per_epoch, blob_refs)?;
        Ok(self.ptrs.is_full())
    }

    /// Whether the queue is empty on the device, checking local shadows
    /// first.
    pub fn is_empty_on_device(
        &mut self,
        transport: &dyn Transport,
        per_binary: &mut HashMap<String, u32>,
        per_epoch: &mut HashMap<u32, u32>,
        blob_refs: &mut HashMap<String, u32>,
    ) -> Result<bool> {
        if self.ptrs.is_empty() {
            return Ok(true);
        }
        self.sync_read_ptr(transport, per_binary, per_epoch, blob_refs)?;
        Ok(self.ptrs.is_empty())
    }

    /// Spin until at least `needed` slots are free.
    pub fn wait_for_free_space(
        &mut self,
        transport: &dyn Transport,
        needed: u32,
        per_binary: &mut HashMap<String, u32>,
        per_epoch: &mut HashMap<u32, u32>,
        blob_refs: &mut HashMap<String, u32>,
    ) -> Result<()> {
        if needed > self.slots {
            return Err(LoaderError::Misuse(format!(
                "waiting for {} free slots in a {}-slot queue",
                needed, self.slots
            )));
        }
        if self.ptrs.free_space() >= needed {
            return Ok(());
        }
        let what = format!("{} free slots in queue {}", needed, self.describe());
        let timeout = self.poll_timeout;
        busy_poll(timeout, &what, || {
            self.sync_read_ptr(transport, per_binary, per_epoch, blob_refs)?;
            Ok(self.ptrs.free_space() >= needed)
        })
    }

    /// Push one command: straight to DRAM, or into the write-combine
    /// buffer (flushing when a trigger fires).
    pub fn push_command(
        &mut self,
        cmd: CommandWords,
        transport: &dyn Transport,
        per_binary: &mut HashMap<String, u32>,
        per_epoch: &mut HashMap<u32, u32>,
        blob_refs: &mut HashMap<String, u32>,
    ) -> Result<()> {
        if !self.is_active() {
            return Err(LoaderError::Misuse(
                "cannot push a command to an inactive queue".into(),
            ));
        }
        if self.wc_window == 0 {
            return self.push_single(cmd, transport);
        }

        self.pending.push_back(cmd);
        if self.ptrs.wraps_between(self.ptrs.wr(), self.pending_len()) {
            return Err(LoaderError::Misuse(format!(
                "write-combine buffer on queue {} would straddle the slot wrap",
                self.describe()
            )));
        }

        let staging_limit = HOST_STAGING_BYTES / self.slot_bytes;
        let window_full = self.pending_len() == self.wc_window;
        let next_slot_wraps =
            self.ptrs.slot_of(self.ptrs.wr() + self.pending_len()) == 0;
        let staging_full = self.pending_len() == staging_limit;
        if window_full || next_slot_wraps || staging_full {
            trace!(
                "queue {} write-combine flush: pending={} window_full={} wrap={} staging={}",
                self.describe(),
                self.pending_len(),
                window_full,
                next_slot_wraps,
                staging_full
            );
            self.flush_commands(transport, per_binary, per_epoch, blob_refs)?;
            self.flush_write_pointer(transport, true)?;
        }
        Ok(())
    }

    fn entry_addr(&self, base: DramAddr, slot: u32) -> DramAddr {
        base.offset(QUEUE_HEADER_BYTES as u64 + slot as u64 * self.slot_bytes as u64)
    }

    fn padded(&self, cmd: &CommandWords) -> Vec<u32> {
        let mut words = cmd.to_vec();
        words.resize(self.slot_bytes as usize / 4, 0);
        words
    }

    fn push_single(&mut self, cmd: CommandWords, transport: &dyn Transport) -> Result<()> {
        let (target, addr) = self.dram()?;
        let slot = self.ptrs.advance_wr(1)?;
        let words = self.padded(&cmd);
        transport.write_dram(target, self.entry_addr(addr, slot), &words, false)?;
        // The pointer update must never be observed before the entry it
        // advances past, including across remote-chip links.
        transport.fence();
        transport.write_dram(
            target,
            addr.offset(WR_PTR_OFFSET),
            &[self.ptrs.wr()],
            self.remote,
        )?;
        Ok(())
    }

    /// Phase one of a write-combined flush: wait for space and write all
    /// pending entries as one transfer. The device-visible write pointer
    /// is not touched.
    pub fn flush_commands(
        &mut self,
        transport: &dyn Transport,
        per_binary: &mut HashMap<String, u32>,
        per_epoch: &mut HashMap<u32, u32>,
        blob_refs: &mut HashMap<String, u32>,
    ) -> Result<()> {
        let count = self.pending_len();
        if count == 0 {
            return Ok(());
        }
        if self.flushed_cmds {
            return Err(LoaderError::Misuse(
                "flush_commands called again without an intervening flush_write_pointer".into(),
            ));
        }
        if self.wc_window == 0 {
            return Err(LoaderError::Misuse(
                "flush_commands requires write-combining to be enabled".into(),
            ));
        }
        if count > self.wc_window {
            return Err(LoaderError::Misuse(format!(
                "write-combine occupancy {} exceeds window {}",
                count, self.wc_window
            )));
        }

        self.wait_for_free_space(transport, count, per_binary, per_epoch, blob_refs)?;

        let (target, addr) = self.dram()?;
        if self.ptrs.wraps_between(self.ptrs.wr(), count) {
            return Err(LoaderError::Misuse(format!(
                "write pointer wrapped during write-combined flush on queue {}",
                self.describe()
            )));
        }
        let first_slot = self.ptrs.advance_wr(count)?;
        let mut combined = Vec::with_capacity(count as usize * self.slot_bytes as usize / 4);
        for cmd in &self.pending {
            combined.extend_from_slice(&self.padded(cmd));
        }
        transport.write_dram(target, self.entry_addr(addr, first_slot), &combined, false)?;
        self.flushed_cmds = true;
        Ok(())
    }

    /// Phase two: publish the advanced write pointer after a fence and
    /// drop the pending entries. Rejected without a preceding
    /// `flush_commands`.
    pub fn flush_write_pointer(&mut self, transport: &dyn Transport, ordered: bool) -> Result<()> {
        if !self.flushed_cmds {
            return Err(LoaderError::Misuse(
                "flush_write_pointer called without a preceding flush_commands".into(),
            ));
        }
        let (target, addr) = self.dram()?;
        transport.fence();
        transport.write_dram(
            target,
            addr.offset(WR_PTR_OFFSET),
            &[self.ptrs.wr()],
            self.remote && ordered,
        )?;
        self.pending.clear();
        self.flushed_cmds = false;
        Ok(())
    }

    /// Record the write pointer at a device-loop start, for loop-capacity
    /// checking. Nested loops keep the outermost watermark.
    pub fn record_loop_start(&mut self) {
        self.loop_depth += 1;
        if self.loop_depth == 1 {
            self.loop_start_wr = Some(self.ptrs.wr());
        }
    }

    /// Clear the loop watermark at loop end.
    pub fn clear_loop_start(&mut self) {
        self.loop_depth = self.loop_depth.saturating_sub(1);
        if self.loop_depth == 0 {
            self.loop_start_wr = None;
        }
    }

    /// Poll the firmware mailbox until the device marks this queue
    /// serviced. Times out to a fatal error (device likely needs reset).
    pub fn wait_for_firmware_init(
        &self,
        transport: &dyn Transport,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let (target, addr) = self.dram()?;
        let what = format!("firmware init of queue {}", self.describe());
        busy_poll(timeout, &what, || {
            let word = transport.read_dram(target, addr.offset(FW_MAILBOX_OFFSET), 1)?[0];
            Ok(word == FW_READY_MAGIC)
        })
    }
}

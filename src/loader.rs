//! Top-level epoch dispatch orchestration.
//!
//! [`EpochLoader`] owns one [`EpochControl`] and one DRAM manager per
//! chip and exposes the epoch-level operations the surrounding runtime
//! drives: register programs, allocate queues, dispatch, synchronize,
//! loop on device, and update io-queue headers.
//!
//! Dispatch ordering is load-bearing and fixed:
//!
//! 1. cache lookup; on a miss, lay out per-core DRAM placements and
//!    transmit all binary images, then a host→device barrier — commands
//!    must never race ahead of the binaries they invoke;
//! 2. wait for queue readiness and resolve identifier-aliasing hazards;
//! 3. push one valid command per imaged core and a not-valid command to
//!    every other active core, so stale cores don't replay an old epoch;
//! 4. advance the generation counter.
//!
//! All controller state mutation happens under one lock, so a dispatch
//! thread and an io-queue-update thread cannot interleave partial
//! updates. All waiting is busy-polling (host shadows first, then device
//! memory); these calls can occupy the thread for device-latency-bound
//! stretches.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, trace};

use crate::binary::{FirmwareImages, ProgramInfo, CORE_CONTROL_FW_BASE, CORE_OVERLAY_INIT_BASE, CORE_ROUTER_FW_BASE};
use crate::config::RuntimeConfig;
use crate::control::{AliasAvoidance, AliasSyncTracker, EpochControl};
use crate::device::command::{
    end_program_command, invalid_command, loop_end_command, loop_start_command,
    queue_update_command, valid_command, HeaderUpdateMask, PointerUpdateCommand, QueueHeader,
    SYNC_SLOTS,
};
use crate::device::coords::CoreCoord;
use crate::device::layout::DeviceLayout;
use crate::device::transport::{DeviceId, DramAddr, DramTarget, Transport};
use crate::dram::{
    DramManager, RegionParams, CONFIG_BASE, KERNEL_BASE, NETWORK_CONFIG_BASE,
    NETWORK_FW_BLOCK_BYTES, OVERLAY_BASE, WORKER_FW_BLOCK_BYTES,
};
use crate::error::{LoaderError, Result};
use crate::queue::busy_poll;
use crate::varinst::{
    merge_commutative, merge_local_global, translate_instructions, PendingUpdate, SyncScope,
    UpdateCommandInfo,
};

/// Location of one io-queue buffer in device DRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLocation {
    pub channel: u8,
    pub address: u64,
}

/// Workload registry entry for one io queue.
#[derive(Debug, Clone)]
pub struct IoQueueInfo {
    pub name: String,
    /// Base name shared with an aliased view of the same storage.
    pub alias: Option<String>,
    pub target_device: DeviceId,
    pub buffers: Vec<BufferLocation>,
    /// Consumer cores per buffer, parallel to `buffers`.
    pub consumers: Vec<BTreeSet<CoreCoord>>,
    /// Producer cores per buffer, parallel to `buffers`.
    pub producers: Vec<BTreeSet<CoreCoord>>,
}

impl IoQueueInfo {
    /// Name under which cached headers and in-use marks are shared
    /// between aliased views.
    pub fn base_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// A masked io-queue header update request.
#[derive(Debug, Clone)]
pub struct QueueSettingsUpdate {
    pub queue: String,
    pub header: QueueHeader,
    pub mask: HeaderUpdateMask,
    pub scope: SyncScope,
}

/// Dispatch-path event counters, exposed for diagnostics.
#[derive(Debug, Default, Clone)]
pub struct EventCounters(BTreeMap<&'static str, u64>);

impl EventCounters {
    fn incr(&mut self, key: &'static str) {
        *self.0.entry(key).or_insert(0) += 1;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.0.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }
}

pub(crate) struct LoaderState {
    pub(crate) controls: HashMap<DeviceId, EpochControl>,
    pub(crate) dram: HashMap<DeviceId, DramManager>,
    pub(crate) layouts: HashMap<DeviceId, DeviceLayout>,
    programs: HashMap<String, ProgramInfo>,
    io_queues: HashMap<String, IoQueueInfo>,
    alias_trackers: HashMap<DeviceId, AliasSyncTracker>,
    /// Rotating (channel, slot) location of the next broadcast-sync flag.
    sync_flags: HashMap<DeviceId, (u8, u32)>,
    in_device_loop: bool,
    pub(crate) counters: EventCounters,
    sent_end_program: bool,
}

/// Host-side runtime dispatching epochs onto a cluster of grid chips.
pub struct EpochLoader {
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
    state: Mutex<LoaderState>,
}

impl EpochLoader {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: RuntimeConfig,
        layouts: Vec<DeviceLayout>,
    ) -> Result<Self> {
        config.validate()?;
        let params = RegionParams::from_config(&config);
        let mut controls = HashMap::new();
        let mut dram = HashMap::new();
        let mut layout_map = HashMap::new();
        for layout in layouts {
            let device = layout.device();
            if layout_map.contains_key(&device) {
                return Err(LoaderError::Config(format!(
                    "device {} listed twice",
                    device
                )));
            }
            controls.insert(device, EpochControl::new(&layout, &config)?);
            dram.insert(device, DramManager::new(&layout, &params)?);
            layout_map.insert(device, layout);
        }
        info!("epoch loader managing {} devices", layout_map.len());
        Ok(Self {
            transport,
            config,
            state: Mutex::new(LoaderState {
                controls,
                dram,
                layouts: layout_map,
                programs: HashMap::new(),
                io_queues: HashMap::new(),
                alias_trackers: HashMap::new(),
                sync_flags: HashMap::new(),
                in_device_loop: false,
                counters: EventCounters::default(),
                sent_end_program: false,
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a compiled epoch program. Cores without an image in the
    /// binary receive not-valid markers at dispatch; callers that want
    /// every core imaged can pad the binary first
    /// (see [`crate::binary::EpochBinary::pad_to_layout`]).
    pub fn register_program(&self, info: ProgramInfo) -> Result<()> {
        let mut state = self.lock();
        let layout = state.layouts.get(&info.target_device).ok_or_else(|| {
            LoaderError::Config(format!("unknown target device {}", info.target_device))
        })?;
        if state.programs.contains_key(&info.name) {
            return Err(LoaderError::Misuse(format!(
                "epoch program '{}' registered twice",
                info.name
            )));
        }
        for image in info.binary.workers.iter().chain(info.binary.network.iter()) {
            if layout.core_kind(image.core).is_none() {
                return Err(LoaderError::Config(format!(
                    "program '{}' has a binary for absent core {}",
                    info.name, image.core
                )));
            }
        }
        if let Some(control) = state.controls.get_mut(&info.target_device) {
            control.register_binary(&info.name);
        }
        debug!(
            "registered epoch program '{}' (id {}) for device {}",
            info.name, info.epoch_id, info.target_device
        );
        state.programs.insert(info.name.clone(), info);
        Ok(())
    }

    /// Register an io queue with its buffer locations and fan-out sets.
    pub fn register_io_queue(&self, info: IoQueueInfo) -> Result<()> {
        if info.consumers.len() != info.buffers.len() || info.producers.len() != info.buffers.len()
        {
            return Err(LoaderError::Config(format!(
                "io queue '{}': consumer/producer sets must parallel the buffer list",
                info.name
            )));
        }
        let mut state = self.lock();
        if !state.layouts.contains_key(&info.target_device) {
            return Err(LoaderError::Config(format!(
                "io queue '{}' targets unknown device {}",
                info.name, info.target_device
            )));
        }
        state.io_queues.insert(info.name.clone(), info);
        Ok(())
    }

    /// Allocate every active command queue in DRAM, zero its header, and
    /// zero the broadcast-sync slots.
    pub fn create_and_allocate_queues(&self, distribute_tables: bool) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        for (device, control) in state.controls.iter_mut() {
            let manager = state.dram.get_mut(device).expect("manager per control");
            control.allocate_and_init_queues(manager, &*self.transport, distribute_tables)?;
            for channel in 0..state.layouts[device].num_channels() {
                let allocator = manager.channel(channel)?;
                for slot in 0..SYNC_SLOTS {
                    self.transport.write_dram(
                        DramTarget::new(*device, channel),
                        allocator.sync_slot_address(slot)?,
                        &[0u32; 8],
                        false,
                    )?;
                }
            }
            self.transport.memory_barrier(*device)?;
        }
        Ok(())
    }

    /// Wait for the device firmware to report every worker queue
    /// serviced. Escalates to fatal on timeout: the device likely needs a
    /// reset.
    pub fn wait_for_firmware_init(&self) -> Result<()> {
        let state = self.lock();
        let timeout = self.config.poll_timeout();
        for control in state.controls.values() {
            for &index in control.active_queue_indices() {
                control
                    .queue(index)
                    .wait_for_firmware_init(&*self.transport, timeout)?;
            }
        }
        Ok(())
    }

    /// Broadcast the shared static firmware images to every core, with
    /// optional read-back verification.
    pub fn send_static_firmware(&self) -> Result<()> {
        let images = FirmwareImages::installed().ok_or_else(|| {
            LoaderError::Misuse("static firmware images were never installed".into())
        })?;
        let state = self.lock();
        for layout in state.layouts.values() {
            let device = layout.device();
            let workers = layout.workers();
            let network = layout.network_cores();
            self.transport.broadcast_to_cores(
                device,
                workers,
                DramAddr(CORE_CONTROL_FW_BASE),
                &images.control_fw,
            )?;
            self.transport.broadcast_to_cores(
                device,
                network,
                DramAddr(CORE_ROUTER_FW_BASE),
                &images.router_fw,
            )?;
            let all: Vec<CoreCoord> = layout.active_cores().collect();
            self.transport.broadcast_to_cores(
                device,
                &all,
                DramAddr(CORE_OVERLAY_INIT_BASE),
                &images.overlay_init,
            )?;
            self.transport.memory_barrier(device)?;

            if self.config.verify_binaries {
                for core in workers {
                    let read = self.transport.read_core(
                        device,
                        *core,
                        DramAddr(CORE_CONTROL_FW_BASE),
                        images.control_fw.len(),
                    )?;
                    if read != images.control_fw {
                        return Err(LoaderError::VerifyFailed(format!(
                            "control firmware mismatch on device {} core {}",
                            device, core
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatch an epoch program: place and send its binaries as needed,
    /// then (unless preloading) push its commands. See the module docs
    /// for the ordering contract.
    pub fn dispatch(&self, name: &str, preload: bool) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        if !state.programs.contains_key(name) {
            return Err(LoaderError::UnknownProgram(name.to_string()));
        }

        let cache_hit = self.lay_out_binaries(state, name, preload)?;
        debug!(
            "epoch '{}': binary {} (preload={})",
            name,
            if cache_hit { "reused" } else { "sent" },
            preload
        );
        if !cache_hit {
            self.send_binaries(state, name)?;
        }

        if preload {
            if cache_hit {
                return Err(LoaderError::Misuse(format!(
                    "preload of '{}' hit the cache; preloads are for cold binaries",
                    name
                )));
            }
        } else {
            self.wait_for_queues_ready(state, name)?;
            self.send_commands(state, name)?;
        }
        state.counters.incr("epoch_count");
        Ok(())
    }

    /// Resolve the binary cache slot for a program and, on a miss,
    /// compute DRAM placements for every per-core image. Returns whether
    /// the binary was already resident.
    fn lay_out_binaries(&self, state: &mut LoaderState, name: &str, preload: bool) -> Result<bool> {
        let LoaderState {
            programs,
            controls,
            dram,
            layouts,
            counters,
            in_device_loop,
            ..
        } = state;
        let info = programs.get_mut(name).expect("checked by caller");
        let control = controls.get_mut(&info.target_device).expect("control per device");
        let manager = dram.get_mut(&info.target_device).expect("manager per device");
        let layout = &layouts[&info.target_device];

        let (cache_hit, slot) = if self.config.enable_epoch_caching {
            let pin = *in_device_loop;
            let lookup =
                control.slot_for_epoch_binary(&info.name, &*self.transport, preload, pin)?;
            (lookup.hit, lookup.slot)
        } else {
            (false, control.next_binary_slot_uncached())
        };

        if cache_hit {
            counters.incr("epoch_cache_hit");
            return Ok(true);
        }

        manager.seek_binary_slot(slot)?;
        for image in info.binary.workers.iter_mut() {
            let (channel, subchannel) = layout.dram_channel_for_core(image.core)?;
            let block_addr = manager.channel_mut(channel)?.alloc_binary(WORKER_FW_BLOCK_BYTES)?;
            image.placement = Some(crate::binary::Placement {
                channel,
                subchannel,
                block_addr,
            });
            trace!(
                "epoch '{}': core {} binaries at channel {} {}",
                name,
                image.core,
                channel,
                block_addr
            );
        }
        for image in info.binary.network.iter_mut() {
            let (channel, subchannel) = layout.dram_channel_for_core(image.core)?;
            let block_addr = manager.channel_mut(channel)?.alloc_binary(NETWORK_FW_BLOCK_BYTES)?;
            image.placement = Some(crate::binary::Placement {
                channel,
                subchannel,
                block_addr,
            });
        }
        counters.incr(if preload {
            "epoch_cache_preload"
        } else {
            "epoch_cache_miss"
        });
        Ok(false)
    }

    /// Transmit every image of a laid-out binary, then a host→device
    /// barrier so commands cannot race ahead of the binaries.
    fn send_binaries(&self, state: &mut LoaderState, name: &str) -> Result<()> {
        let info = state.programs.get(name).expect("checked by caller");
        let device = info.target_device;

        let mut send = |channel: u8, base: DramAddr, offset: u64, words: &[u32]| -> Result<()> {
            if words.is_empty() {
                return Ok(());
            }
            self.transport.write_dram(
                DramTarget::new(device, channel),
                base.offset(offset),
                words,
                false,
            )
        };

        for image in &info.binary.workers {
            let placement = image.placement.ok_or_else(|| {
                LoaderError::Misuse(format!("core {} binary has no placement", image.core))
            })?;
            send(placement.channel, placement.block_addr, KERNEL_BASE, &image.kernel)?;
            send(placement.channel, placement.block_addr, OVERLAY_BASE, &image.overlay)?;
            send(placement.channel, placement.block_addr, CONFIG_BASE, &image.config)?;
        }
        for image in &info.binary.network {
            let placement = image.placement.ok_or_else(|| {
                LoaderError::Misuse(format!("core {} binary has no placement", image.core))
            })?;
            send(placement.channel, placement.block_addr, 0, &image.overlay)?;
            send(placement.channel, placement.block_addr, NETWORK_CONFIG_BASE, &image.config)?;
        }

        // Commands referencing these binaries may target a different
        // channel; the barrier orders across all of them.
        self.transport.memory_barrier(device)?;

        if self.config.verify_binaries {
            for image in &info.binary.workers {
                let placement = image.placement.expect("placed above");
                let read = self.transport.read_dram(
                    DramTarget::new(device, placement.channel),
                    placement.block_addr.offset(KERNEL_BASE),
                    image.kernel.len(),
                )?;
                if read != image.kernel {
                    return Err(LoaderError::VerifyFailed(format!(
                        "kernel image mismatch for '{}' core {}",
                        name, image.core
                    )));
                }
            }
        }
        Ok(())
    }

    /// Wait until every queue can take a push, then detect and resolve
    /// identifier-aliasing hazards for the program about to dispatch.
    fn wait_for_queues_ready(&self, state: &mut LoaderState, name: &str) -> Result<()> {
        let timeout = self.config.poll_timeout();
        let device;
        let epoch_id;
        {
            let info = &state.programs[name];
            device = info.target_device;
            epoch_id = info.epoch_id;
        }

        {
            let control = state.controls.get_mut(&device).expect("control per device");
            busy_poll(timeout, "epoch queues not full", || {
                control.all_queues_not_full(&*self.transport)
            })?;
        }

        if self.config.allow_epoch_aliasing {
            return Ok(());
        }

        let control = state.controls.get_mut(&device).expect("control per device");
        let tracker = state.alias_trackers.entry(device).or_default();
        let wrapped = epoch_id % control.epoch_window();
        let avoidance = if state.in_device_loop || control.write_combine_enabled() {
            AliasAvoidance::FullGridSync
        } else {
            AliasAvoidance::HostStall
        };

        if control.has_alias_hazard(tracker, wrapped, epoch_id, name, avoidance) {
            state.counters.incr("epoch_id_alias_hazards");
            match avoidance {
                AliasAvoidance::FullGridSync => {
                    Self::insert_sync_on_cores(
                        &*self.transport,
                        &state.layouts[&device],
                        state.controls.get_mut(&device).expect("control"),
                        state.dram.get_mut(&device).expect("manager"),
                        state.sync_flags.entry(device).or_insert((0, 0)),
                        None,
                    )?;
                    state.counters.incr("full_grid_syncs");
                    let tracker = state.alias_trackers.get_mut(&device).expect("tracker");
                    tracker.mark_synced();
                    if state.in_device_loop {
                        tracker.loop_requires_sync = true;
                    }
                }
                AliasAvoidance::HostStall => {
                    let transport = &*self.transport;
                    busy_poll(timeout, "aliasing epoch to retire", || {
                        control.update_read_ptrs_for_live(transport)?;
                        Ok(!control.has_alias_hazard(
                            tracker,
                            wrapped,
                            epoch_id,
                            name,
                            AliasAvoidance::HostStall,
                        ))
                    })?;
                }
            }
        }

        state
            .alias_trackers
            .get_mut(&device)
            .expect("tracker")
            .note_dispatch(wrapped, epoch_id);
        Ok(())
    }

    /// Push one valid command per imaged core and a not-valid command to
    /// every other active core, then advance the generation.
    fn send_commands(&self, state: &mut LoaderState, name: &str) -> Result<()> {
        let LoaderState {
            programs,
            controls,
            layouts,
            ..
        } = state;
        let info = programs.get(name).expect("checked by caller");
        let control = controls.get_mut(&info.target_device).expect("control per device");
        let layout = &layouts[&info.target_device];

        for image in info.binary.workers.iter().chain(info.binary.network.iter()) {
            let placement = image.placement.ok_or_else(|| {
                LoaderError::Misuse(format!("core {} binary has no placement", image.core))
            })?;
            let index = EpochControl::queue_index(image.core);
            if !control.queue(index).is_active() {
                return Err(LoaderError::Misuse(format!(
                    "binary image targets inactive core {}",
                    image.core
                )));
            }
            let dram_core = layout.dram_core_for_channel(placement.channel)?;
            let cmd = valid_command(
                dram_core,
                placement.block_addr,
                info.perf_trace,
                info.decouple_mask(image.core),
            );
            control.account_valid_command(index, &info.name, info.epoch_id);
            control.queue_mut(index).valid_cmd_sent = true;
            control.push_command(index, cmd, &*self.transport)?;
        }

        // Cores without an image this round get a not-valid marker so
        // they do not replay a stale epoch.
        let indices = control.active_queue_indices().to_vec();
        for index in indices {
            if control.queue(index).valid_cmd_sent {
                control.queue_mut(index).valid_cmd_sent = false;
            } else {
                control.push_command(index, invalid_command(), &*self.transport)?;
            }
        }

        control.advance_generation();
        trace!(
            "epoch '{}' dispatched, generation now {}",
            name,
            control.current_generation()
        );
        Ok(())
    }

    /// Block (poll) until every queue on the program's device has
    /// drained, then advance the synchronized generation.
    pub fn wait_for_completion(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        let device = state
            .programs
            .get(name)
            .ok_or_else(|| LoaderError::UnknownProgram(name.to_string()))?
            .target_device;
        Self::wait_for_progress_inner(&mut state, &*self.transport, device, 0)
    }

    /// Block until every queue on `device` has at most `remaining`
    /// commands outstanding.
    pub fn wait_for_progress(&self, device: DeviceId, remaining: u32) -> Result<()> {
        let mut state = self.lock();
        Self::wait_for_progress_inner(&mut state, &*self.transport, device, remaining)
    }

    fn wait_for_progress_inner(
        state: &mut LoaderState,
        transport: &dyn Transport,
        device: DeviceId,
        remaining: u32,
    ) -> Result<()> {
        let control = state
            .controls
            .get_mut(&device)
            .ok_or_else(|| LoaderError::Config(format!("unknown device {}", device)))?;
        if control.is_epoch_in_progress() {
            debug!(
                "device {}: waiting for generation {} (last synced {})",
                device,
                control.current_generation(),
                control.synchronized_generation()
            );
            control.wait_for_commands_remaining(remaining, transport)?;
            if remaining == 0 {
                control.clear_queues_in_use();
            }
            state.counters.incr("epoch_barrier");
        }
        Ok(())
    }

    /// Enter or leave device-side-looping mode. Entering turns on
    /// write-combining (when configured); leaving flushes, releases every
    /// cache pin, and re-disables write-combining.
    pub fn set_device_looping(&self, in_loop: bool) -> Result<()> {
        let mut state = self.lock();
        state.in_device_loop = in_loop;
        if self.config.enable_write_combine {
            for control in state.controls.values_mut() {
                control.set_write_combine(in_loop, &*self.transport)?;
            }
        }
        if !in_loop {
            debug!("leaving device loop: clearing pinned binaries");
            for control in state.controls.values_mut() {
                control.clear_all_pins();
            }
        }
        Ok(())
    }

    pub fn in_device_loop(&self) -> bool {
        self.lock().in_device_loop
    }

    /// Broadcast a loop-start command to every active core on every
    /// device, recording per-queue watermarks for capacity checking.
    pub fn send_loop_start(&self, loops: u32) -> Result<()> {
        if !self.config.enable_device_looping {
            return Err(LoaderError::Misuse(
                "device looping is disabled by configuration".into(),
            ));
        }
        let cmd = loop_start_command(loops)?;
        let mut state = self.lock();
        let timeout = self.config.poll_timeout();
        for control in state.controls.values_mut() {
            if !control.write_combine_enabled() {
                busy_poll(timeout, "queues before loop start", || {
                    control.all_queues_not_full(&*self.transport)
                })?;
            }
            control.record_loop_watermarks();
            control.push_to_all_active(&cmd, &*self.transport)?;
        }
        Ok(())
    }

    /// Broadcast a loop-end command and clear the loop watermarks.
    pub fn send_loop_end(&self) -> Result<()> {
        let cmd = loop_end_command();
        let mut state = self.lock();
        let timeout = self.config.poll_timeout();
        for control in state.controls.values_mut() {
            if !control.write_combine_enabled() {
                busy_poll(timeout, "queues before loop end", || {
                    control.all_queues_not_full(&*self.transport)
                })?;
            }
            control.push_to_all_active(&cmd, &*self.transport)?;
            control.clear_loop_watermarks();
        }
        Ok(())
    }

    /// If a hazard sync happened inside the first loop iteration, some
    /// cores could re-enter the body and alias against stragglers from
    /// the previous iteration; insert another full-grid sync per flagged
    /// device.
    pub fn resolve_loop_alias_syncs(&self) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        for (device, tracker) in state.alias_trackers.iter_mut() {
            if !tracker.loop_requires_sync {
                continue;
            }
            debug!("device {}: inserting deferred loop alias sync", device);
            Self::insert_sync_on_cores(
                &*self.transport,
                &state.layouts[device],
                state.controls.get_mut(device).expect("control"),
                state.dram.get_mut(device).expect("manager"),
                state.sync_flags.entry(*device).or_insert((0, 0)),
                None,
            )?;
            state.counters.incr("full_grid_syncs");
            tracker.mark_synced();
            tracker.loop_requires_sync = false;
        }
        Ok(())
    }

    /// Broadcast an end-program command to every active core on every
    /// device.
    pub fn send_end_program(&self) -> Result<()> {
        let cmd = end_program_command();
        let mut state = self.lock();
        for (device, control) in state.controls.iter_mut() {
            debug!("device {}: sending end-program commands", device);
            control.push_to_all_active(&cmd, &*self.transport)?;
        }
        state.sent_end_program = true;
        Ok(())
    }

    pub fn end_program_sent(&self) -> bool {
        self.lock().sent_end_program
    }

    /// Flush every device's write-combine buffers to DRAM.
    pub fn flush_all_write_combined(&self) -> Result<()> {
        let mut state = self.lock();
        for control in state.controls.values_mut() {
            control.flush_all_write_combined(&*self.transport)?;
        }
        Ok(())
    }

    /// Mark io queues as in use by queued epochs, steering later header
    /// updates through the device path.
    pub fn mark_io_queues_in_use(&self, names: &[String]) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        for name in names {
            let info = state
                .io_queues
                .get(name)
                .ok_or_else(|| LoaderError::UnknownQueue(name.clone()))?;
            let base = info.base_name().to_string();
            state
                .controls
                .get_mut(&info.target_device)
                .expect("control per device")
                .set_queue_in_use(&base);
        }
        Ok(())
    }

    /// Apply masked header updates to io queues: skipped when the cached
    /// header already matches (settings reuse), pushed through device
    /// commands when the queue is in use, written host-direct otherwise.
    pub fn update_queue_settings(&self, updates: &[QueueSettingsUpdate]) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        for update in updates {
            let info = state
                .io_queues
                .get(&update.queue)
                .ok_or_else(|| LoaderError::UnknownQueue(update.queue.clone()))?
                .clone();
            let base = info.base_name().to_string();
            let control = state
                .controls
                .get_mut(&info.target_device)
                .expect("control per device");

            if self.config.enable_queue_settings_reuse
                && control.cached_header_matches(&base, &update.header, update.mask)
            {
                trace!("queue '{}': header update skipped (reuse)", update.queue);
                continue;
            }
            control.set_cached_header_masked(&base, &update.header, update.mask);

            let from_device =
                self.config.enable_hw_queue_update && control.is_queue_in_use(&base);
            if from_device {
                self.update_header_from_device(state, &info, update)?;
            } else {
                self.update_header_from_host(&info, update)?;
            }
        }
        Ok(())
    }

    /// Host-direct header write: the masked words go straight to every
    /// buffer's header in DRAM.
    fn update_header_from_host(
        &self,
        info: &IoQueueInfo,
        update: &QueueSettingsUpdate,
    ) -> Result<()> {
        // (word offset, word count) regions selected by the mask.
        let mut regions: Vec<(u64, usize, usize)> = Vec::new();
        if update.mask.has_full() {
            regions.push((0, 0, 8));
        } else {
            if update.mask.has(HeaderUpdateMask::GLOBAL_RD) {
                regions.push((0, 0, 1));
            }
            if update.mask.has(HeaderUpdateMask::GLOBAL_WR) {
                regions.push((4, 1, 1));
            }
            if update.mask.has(HeaderUpdateMask::LOCAL_SETTINGS) {
                regions.push((8, 2, 3));
            } else if update.mask.has(HeaderUpdateMask::LOCAL_RD) {
                regions.push((8, 2, 1));
            }
        }
        for buffer in &info.buffers {
            for &(byte_offset, word_index, count) in &regions {
                self.transport.write_dram(
                    DramTarget::new(info.target_device, buffer.channel),
                    DramAddr(buffer.address + byte_offset),
                    &update.header.words[word_index..word_index + count],
                    false,
                )?;
            }
        }
        Ok(())
    }

    /// Device-path header update: a queue-update command per buffer to
    /// every syncing core (inline), or one command referencing a DRAM
    /// blob of buffer addresses (external) when the queue has more
    /// buffers than the inline threshold.
    fn update_header_from_device(
        &self,
        state: &mut LoaderState,
        info: &IoQueueInfo,
        update: &QueueSettingsUpdate,
    ) -> Result<()> {
        let mask = update.mask.0;
        if info.buffers.len() as u32 <= self.config.inline_update_threshold {
            let layout = &state.layouts[&info.target_device];
            let control = state
                .controls
                .get_mut(&info.target_device)
                .expect("control per device");
            for (buffer_index, buffer) in info.buffers.iter().enumerate() {
                let buffer_core = layout.dram_core_for_channel(buffer.channel)?;
                let readers = sync_cores_for_buffer(info, buffer_index, update.scope);
                let total = readers.len() as u8;
                for (reader_index, reader) in readers.iter().enumerate() {
                    let cmd = queue_update_command(
                        buffer_core,
                        DramAddr(buffer.address),
                        1,
                        reader_index as u8,
                        total,
                        mask,
                        &update.header,
                    );
                    let index = EpochControl::queue_index(*reader);
                    control.wait_for_queue_slot(index, &*self.transport)?;
                    control.push_command(index, cmd, &*self.transport)?;
                }
            }
        } else {
            let groups = {
                let layout = &state.layouts[&info.target_device];
                blob_groups(info, update.scope, self.config.update_blob_entries, layout)?
            };
            self.emit_external_update_groups(state, info, &groups, |header_addr, dram_core, group| {
                queue_update_command(
                    dram_core,
                    header_addr,
                    group.buffers as u8,
                    group.reader_index,
                    group.num_readers,
                    mask,
                    &update.header,
                )
            })?;
        }
        Ok(())
    }

    /// Emit pending pointer-variable updates as device commands, running
    /// the merge passes first (when enabled), and mirroring the device's
    /// future arithmetic onto the cached host headers.
    pub fn update_queue_pointers_on_device(
        &self,
        pending: &[PendingUpdate],
        vars: &HashMap<String, u32>,
        iterations: u32,
    ) -> Result<()> {
        if !self.config.enable_device_looping {
            return Err(LoaderError::Misuse(
                "on-device pointer updates require device looping".into(),
            ));
        }
        let mut state = self.lock();
        let state = &mut *state;

        let mut commands = translate_instructions(pending, vars)?;

        // Keep the host's view of the headers in sync with what the
        // device will do, across all loop iterations.
        for command in &commands {
            for queue in &command.queues {
                let info = state
                    .io_queues
                    .get(queue)
                    .ok_or_else(|| LoaderError::UnknownQueue(queue.clone()))?;
                let base = info.base_name().to_string();
                let control = state
                    .controls
                    .get_mut(&info.target_device)
                    .expect("control per device");
                command.apply_to_header(control.cached_header(&base), iterations);
            }
        }

        if self.config.enable_varinst_merge {
            merge_commutative(&mut commands);
            merge_local_global(&mut commands);
        }

        for command in &commands {
            self.emit_pointer_update(state, command)?;
        }
        Ok(())
    }

    fn emit_pointer_update(&self, state: &mut LoaderState, command: &UpdateCommandInfo) -> Result<()> {
        let total_buffers: usize = command
            .queues
            .iter()
            .map(|q| state.io_queues.get(q).map_or(0, |i| i.buffers.len()))
            .sum();
        if total_buffers as u32 <= self.config.inline_update_threshold {
            self.emit_pointer_update_inline(state, command)
        } else {
            // External blobs must not mix devices; split by target.
            let mut by_device: BTreeMap<DeviceId, Vec<String>> = BTreeMap::new();
            for queue in &command.queues {
                let info = state
                    .io_queues
                    .get(queue)
                    .ok_or_else(|| LoaderError::UnknownQueue(queue.clone()))?;
                by_device.entry(info.target_device).or_default().push(queue.clone());
            }
            for queues in by_device.values() {
                self.emit_pointer_update_external(state, command, queues)?;
            }
            Ok(())
        }
    }

    fn emit_pointer_update_inline(
        &self,
        state: &mut LoaderState,
        command: &UpdateCommandInfo,
    ) -> Result<()> {
        let wire_mask = command.field_mask.wire_mask()?;
        for queue in &command.queues {
            let info = state
                .io_queues
                .get(queue)
                .ok_or_else(|| LoaderError::UnknownQueue(queue.clone()))?
                .clone();
            let layout = &state.layouts[&info.target_device];
            let control = state
                .controls
                .get_mut(&info.target_device)
                .expect("control per device");
            for (buffer_index, buffer) in info.buffers.iter().enumerate() {
                let buffer_core = layout.dram_core_for_channel(buffer.channel)?;
                let readers = sync_cores_for_buffer(&info, buffer_index, command.sync_scope);
                let total = readers.len() as u8;
                for (reader_index, reader) in readers.iter().enumerate() {
                    let cmd = PointerUpdateCommand {
                        addr: DramAddr(buffer.address),
                        dram_core: buffer_core,
                        num_buffers: 1,
                        reader_index: reader_index as u8,
                        num_readers: total,
                        update_mask: wire_mask,
                        opcode: command.opcode,
                        operand_0: command.operand_0,
                        operand_1: command.operand_1,
                    }
                    .encode();
                    let index = EpochControl::queue_index(*reader);
                    control.wait_for_queue_slot(index, &*self.transport)?;
                    control.push_command(index, cmd, &*self.transport)?;
                }
            }
        }
        Ok(())
    }

    fn emit_pointer_update_external(
        &self,
        state: &mut LoaderState,
        command: &UpdateCommandInfo,
        queues: &[String],
    ) -> Result<()> {
        let wire_mask = command.field_mask.wire_mask()?;
        let first = state
            .io_queues
            .get(&queues[0])
            .ok_or_else(|| LoaderError::UnknownQueue(queues[0].clone()))?;
        let merged = IoQueueInfo {
            name: format!("ptr-update:{}", queues.join(",")),
            alias: None,
            target_device: first.target_device,
            buffers: Vec::new(),
            consumers: Vec::new(),
            producers: Vec::new(),
        };
        let mut merged = merged;
        for queue in queues {
            let info = state
                .io_queues
                .get(queue)
                .ok_or_else(|| LoaderError::UnknownQueue(queue.clone()))?;
            merged.buffers.extend(info.buffers.iter().copied());
            merged.consumers.extend(info.consumers.iter().cloned());
            merged.producers.extend(info.producers.iter().cloned());
        }
        let groups = {
            let layout = &state.layouts[&merged.target_device];
            blob_groups(&merged, command.sync_scope, self.config.update_blob_entries, layout)?
        };
        self.emit_external_update_groups(state, &merged, &groups, |blob_addr, dram_core, group| {
            PointerUpdateCommand {
                addr: blob_addr,
                dram_core,
                num_buffers: group.buffers,
                reader_index: group.reader_index,
                num_readers: group.num_readers,
                update_mask: wire_mask,
                opcode: command.opcode,
                operand_0: command.operand_0,
                operand_1: command.operand_1,
            }
            .encode()
        })
    }

    /// Shared external-blob emission: per buffer group, place the blob of
    /// header addresses through the per-queue blob cache (writing it to
    /// DRAM only on a miss) and push one referencing command to each
    /// syncing core.
    fn emit_external_update_groups<F>(
        &self,
        state: &mut LoaderState,
        info: &IoQueueInfo,
        groups: &[BlobGroup],
        mut build_command: F,
    ) -> Result<()>
    where
        F: FnMut(DramAddr, CoreCoord, &GroupContext) -> crate::device::command::CommandWords,
    {
        let device = info.target_device;
        let pin = state.in_device_loop;
        for (group_index, group) in groups.iter().enumerate() {
            let key = format!("{}#{}", group.cache_key, group_index);
            let num_readers = group.sync_cores.len() as u8;
            for (reader_index, core) in group.sync_cores.iter().enumerate() {
                let layout = &state.layouts[&device];
                let (channel, _) = layout.dram_channel_for_core(*core)?;
                let core_index = layout.core_index_in_channel(*core)?;
                let dram_core = layout.dram_core_for_channel(channel)?;
                let queue_index = EpochControl::queue_index(*core);

                let control = state.controls.get_mut(&device).expect("control per device");
                let lookup =
                    control.slot_for_update_blob(queue_index, &key, &*self.transport, pin)?;
                let manager = state.dram.get(&device).expect("manager per device");
                let blob_addr = manager
                    .channel(channel)?
                    .update_blob_address(core_index, lookup.slot)?;
                if !lookup.hit {
                    self.transport.write_dram(
                        DramTarget::new(device, channel),
                        blob_addr,
                        &group.words,
                        false,
                    )?;
                    self.transport.fence();
                    trace!(
                        "update blob '{}' written to channel {} at {}",
                        key,
                        channel,
                        blob_addr
                    );
                }

                let context = GroupContext {
                    buffers: group.num_buffers,
                    reader_index: reader_index as u8,
                    num_readers,
                };
                let cmd = build_command(blob_addr, dram_core, &context);
                let control = state.controls.get_mut(&device).expect("control per device");
                control.wait_for_queue_slot(queue_index, &*self.transport)?;
                control.account_blob_command(queue_index, &key);
                control.push_command(queue_index, cmd, &*self.transport)?;
            }
        }
        Ok(())
    }

    /// Insert an on-device synchronization across `cores` (or the whole
    /// grid when `None`): every core receives a queue-update command
    /// bound to the same rotating sync-flag slot, and the firmware lets
    /// none proceed until all have arrived.
    fn insert_sync_on_cores(
        transport: &dyn Transport,
        layout: &DeviceLayout,
        control: &mut EpochControl,
        manager: &DramManager,
        sync_flag: &mut (u8, u32),
        cores: Option<&BTreeSet<CoreCoord>>,
    ) -> Result<()> {
        let all: BTreeSet<CoreCoord> = match cores {
            Some(set) => set.clone(),
            None => layout.active_cores().collect(),
        };
        info!(
            "device {}: inserting on-device sync across {} cores",
            layout.device(),
            all.len()
        );
        let (channel, slot) = *sync_flag;
        let sync_core = layout.dram_core_for_channel(channel)?;
        let flag_addr = manager.channel(channel)?.sync_slot_address(slot)?;
        let mut header = QueueHeader::default();
        header.words[0] = sync_core.x as u32;
        header.words[1] = sync_core.y as u32;
        header.words[2] = slot;

        let total = all.len() as u8;
        for (reader_index, core) in all.iter().enumerate() {
            let cmd = queue_update_command(
                sync_core,
                flag_addr,
                1,
                reader_index as u8,
                total,
                HeaderUpdateMask::NULL.0,
                &header,
            );
            let index = EpochControl::queue_index(*core);
            control.wait_for_queue_slot(index, transport)?;
            control.push_command(index, cmd, transport)?;
        }

        // Rotate channel-first, then slot.
        sync_flag.0 += 1;
        if sync_flag.0 == layout.num_channels() {
            sync_flag.0 = 0;
            sync_flag.1 = (sync_flag.1 + 1) % SYNC_SLOTS;
        }
        Ok(())
    }

    /// Event counter snapshot for diagnostics.
    pub fn event_counters(&self) -> BTreeMap<String, u64> {
        self.lock().counters.snapshot()
    }
}

/// One external blob's worth of buffer addresses.
struct BlobGroup {
    cache_key: String,
    words: Vec<u32>,
    num_buffers: u16,
    sync_cores: BTreeSet<CoreCoord>,
}

struct GroupContext {
    buffers: u16,
    reader_index: u8,
    num_readers: u8,
}

fn sync_cores_for_buffer(
    info: &IoQueueInfo,
    buffer_index: usize,
    scope: SyncScope,
) -> BTreeSet<CoreCoord> {
    let mut cores = BTreeSet::new();
    if matches!(scope, SyncScope::Consumers | SyncScope::Both) {
        cores.extend(info.consumers[buffer_index].iter().copied());
    }
    if matches!(scope, SyncScope::Producers | SyncScope::Both) {
        cores.extend(info.producers[buffer_index].iter().copied());
    }
    cores
}

/// Split a queue's buffers into blob-sized groups, each with its address
/// words and the union of its buffers' sync cores. Each buffer occupies
/// two blob words, packed the same way as the command address words:
/// low 32 address bits, then core Y/X with the high 16 address bits.
fn blob_groups(
    info: &IoQueueInfo,
    scope: SyncScope,
    blob_entries: u32,
    layout: &DeviceLayout,
) -> Result<Vec<BlobGroup>> {
    let mut groups = Vec::new();
    let mut index = 0usize;
    while index < info.buffers.len() {
        let end = (index + blob_entries as usize).min(info.buffers.len());
        let mut words = Vec::with_capacity((end - index) * 2);
        let mut sync_cores = BTreeSet::new();
        for buffer_index in index..end {
            let buffer = &info.buffers[buffer_index];
            let core = layout.dram_core_for_channel(buffer.channel)?;
            words.push((buffer.address & 0xffff_ffff) as u32);
            words.push(
                ((core.y as u32 & 0x3f) << 22)
                    | ((core.x as u32 & 0x3f) << 16)
                    | ((buffer.address >> 32) & 0xffff) as u32,
            );
            sync_cores.extend(sync_cores_for_buffer(info, buffer_index, scope));
        }
        groups.push(BlobGroup {
            cache_key: format!("{}:{:?}", info.base_name(), scope),
            words,
            num_buffers: (end - index) as u16,
            sync_cores,
        });
        index = end;
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::CoreBinary;
    use crate::device::command::{opcode_bits, Opcode, COMMAND_SLOT_BYTES, QUEUE_HEADER_BYTES, WR_PTR_OFFSET};
    use crate::device::sim::SimTransport;
    use crate::varinst::{Operand, PointerUpdateInstruction, PointerVarOp};
    use crate::device::command::HeaderField;

    fn test_layout() -> DeviceLayout {
        let workers = vec![
            CoreCoord::new(1, 1),
            CoreCoord::new(2, 1),
            CoreCoord::new(1, 2),
            CoreCoord::new(2, 2),
        ];
        let network = vec![CoreCoord::new(3, 1)];
        let mut channel_map = HashMap::new();
        channel_map.insert(CoreCoord::new(1, 1), (0, 0));
        channel_map.insert(CoreCoord::new(1, 2), (0, 0));
        channel_map.insert(CoreCoord::new(2, 1), (1, 0));
        channel_map.insert(CoreCoord::new(2, 2), (1, 0));
        channel_map.insert(CoreCoord::new(3, 1), (0, 0));
        DeviceLayout::new(
            0,
            workers,
            network,
            channel_map,
            vec![CoreCoord::new(0, 0), CoreCoord::new(0, 1)],
            1 << 31,
            true,
        )
        .unwrap()
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            enable_epoch_caching: true,
            poll_timeout_secs: Some(1),
            ..RuntimeConfig::default()
        }
    }

    fn make_loader(config: RuntimeConfig) -> (EpochLoader, Arc<SimTransport>, DeviceLayout) {
        let layout = test_layout();
        let sim = Arc::new(SimTransport::new());
        let loader = EpochLoader::new(sim.clone(), config, vec![layout.clone()]).unwrap();
        loader.create_and_allocate_queues(true).unwrap();
        (loader, sim, layout)
    }

    fn worker_program(name: &str, epoch_id: u32, layout: &DeviceLayout) -> ProgramInfo {
        let mut info = ProgramInfo::new(name, epoch_id, 0);
        for (i, core) in layout.workers().iter().enumerate() {
            info.binary
                .add_worker_image(
                    CoreBinary::worker(
                        *core,
                        vec![epoch_id + i as u32; 16],
                        vec![0xAB; 8],
                        vec![0xCD; 4],
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        info
    }

    fn queue_base(layout: &DeviceLayout, config: &RuntimeConfig, core: CoreCoord) -> (DramTarget, DramAddr) {
        let (channel, _) = layout.dram_channel_for_core(core).unwrap();
        let manager = DramManager::new(layout, &RegionParams::from_config(config)).unwrap();
        let addr = manager.channel(channel).unwrap().command_queue_address(core);
        (DramTarget::new(0, channel), addr)
    }

    fn slot_opcode(
        sim: &SimTransport,
        layout: &DeviceLayout,
        config: &RuntimeConfig,
        core: CoreCoord,
        slot: u32,
    ) -> u32 {
        let (target, base) = queue_base(layout, config, core);
        let addr = base.offset(QUEUE_HEADER_BYTES as u64 + slot as u64 * COMMAND_SLOT_BYTES as u64);
        let words = sim.read_dram(target, addr, 2).unwrap();
        opcode_bits(&words)
    }

    fn drain_device(sim: &SimTransport, layout: &DeviceLayout, config: &RuntimeConfig) {
        for core in layout.active_cores() {
            let (target, base) = queue_base(layout, config, core);
            let wr = sim.read_dram(target, base.offset(WR_PTR_OFFSET), 1).unwrap()[0];
            sim.write_dram(target, base, &[wr], false).unwrap();
        }
    }

    #[test]
    fn end_to_end_dispatch_and_completion() {
        let config = test_config();
        let (loader, sim, layout) = make_loader(config.clone());
        loader
            .register_program(worker_program("graph_0", 1, &layout))
            .unwrap();
        loader.dispatch("graph_0", false).unwrap();

        // Binaries land at increasing offsets within each channel's
        // cache slot 0.
        {
            let state = loader.lock();
            let info = &state.programs["graph_0"];
            let mut per_channel: HashMap<u8, Vec<u64>> = HashMap::new();
            for image in &info.binary.workers {
                let placement = image.placement.unwrap();
                per_channel
                    .entry(placement.channel)
                    .or_default()
                    .push(placement.block_addr.0);
            }
            for addrs in per_channel.values() {
                assert_eq!(addrs.len(), 2);
                assert_eq!(addrs[1] - addrs[0], WORKER_FW_BLOCK_BYTES);
            }
            // Binary transmission happened before any command write (the
            // barrier count is at least the per-device dispatch barrier).
            assert!(sim.barriers() >= 1);
        }

        // Each worker core got a valid command; the network core got a
        // not-valid marker.
        for core in layout.workers() {
            assert_eq!(
                slot_opcode(&sim, &layout, &config, *core, 0),
                Opcode::Valid as u32
            );
        }
        assert_eq!(
            slot_opcode(&sim, &layout, &config, CoreCoord::new(3, 1), 0),
            Opcode::NotValid as u32
        );

        {
            let state = loader.lock();
            let control = &state.controls[&0];
            assert_eq!(control.current_generation(), 1);
            assert_eq!(control.synchronized_generation(), 0);
        }

        // Completion blocks (and here times out) until the device drains.
        assert!(matches!(
            loader.wait_for_completion("graph_0"),
            Err(LoaderError::Timeout { .. })
        ));
        drain_device(&sim, &layout, &config);
        loader.wait_for_completion("graph_0").unwrap();
        let state = loader.lock();
        assert_eq!(state.controls[&0].synchronized_generation(), 1);
    }

    #[test]
    fn dispatch_of_unregistered_program_fails() {
        let (loader, _, _) = make_loader(test_config());
        assert!(matches!(
            loader.dispatch("nope", false),
            Err(LoaderError::UnknownProgram(_))
        ));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let (loader, _, layout) = make_loader(test_config());
        loader
            .register_program(worker_program("g", 1, &layout))
            .unwrap();
        assert!(matches!(
            loader.register_program(worker_program("g", 1, &layout)),
            Err(LoaderError::Misuse(_))
        ));
    }

    #[test]
    fn preload_sends_binaries_without_commands() {
        let config = test_config();
        let (loader, sim, layout) = make_loader(config.clone());
        loader
            .register_program(worker_program("graph_0", 1, &layout))
            .unwrap();
        loader.dispatch("graph_0", true).unwrap();

        // No commands were pushed anywhere.
        for core in layout.active_cores() {
            let (target, base) = queue_base(&layout, &config, core);
            assert_eq!(
                sim.read_dram(target, base.offset(WR_PTR_OFFSET), 1).unwrap()[0],
                0
            );
        }
        // But the kernel image is resident.
        {
            let state = loader.lock();
            let info = &state.programs["graph_0"];
            let placement = info.binary.workers[0].placement.unwrap();
            let words = sim
                .read_dram(
                    DramTarget::new(0, placement.channel),
                    placement.block_addr.offset(KERNEL_BASE),
                    16,
                )
                .unwrap();
            assert_eq!(words, info.binary.workers[0].kernel);
            assert_eq!(state.counters.get("epoch_cache_preload"), 1);
        }

        // The later real dispatch reuses the resident binary.
        loader.dispatch("graph_0", false).unwrap();
        let state = loader.lock();
        assert_eq!(state.counters.get("epoch_cache_hit"), 1);
    }

    #[test]
    fn second_preload_of_resident_binary_is_misuse() {
        let (loader, _, layout) = make_loader(test_config());
        loader
            .register_program(worker_program("g", 1, &layout))
            .unwrap();
        loader.dispatch("g", true).unwrap();
        assert!(matches!(
            loader.dispatch("g", true),
            Err(LoaderError::Misuse(_))
        ));
    }

    #[test]
    fn cache_hit_keeps_placements() {
        let config = test_config();
        let (loader, sim, layout) = make_loader(config.clone());
        loader
            .register_program(worker_program("g", 1, &layout))
            .unwrap();
        loader.dispatch("g", false).unwrap();
        let first = loader.lock().programs["g"].binary.workers[0].placement.unwrap();

        drain_device(&sim, &layout, &config);
        loader.wait_for_completion("g").unwrap();
        loader.dispatch("g", false).unwrap();
        let state = loader.lock();
        assert_eq!(state.counters.get("epoch_cache_hit"), 1);
        assert_eq!(
            state.programs["g"].binary.workers[0].placement.unwrap(),
            first
        );
    }

    #[test]
    fn aliasing_hazard_stalls_host_until_retirement() {
        let mut config = test_config();
        config.epoch_id_bits = 2; // window 3: ids 1 and 4 alias
        let (loader, sim, layout) = make_loader(config.clone());
        loader.register_program(worker_program("a", 1, &layout)).unwrap();
        loader.register_program(worker_program("b", 4, &layout)).unwrap();

        loader.dispatch("a", false).unwrap();
        // A distinct epoch aliasing into the same wrapped bucket while
        // "a" is unretired stalls the host until the poll times out.
        assert!(matches!(
            loader.dispatch("b", false),
            Err(LoaderError::Timeout { .. })
        ));
        assert_eq!(loader.event_counters()["epoch_id_alias_hazards"], 1);

        // Once the device retires "a", the same dispatch goes through.
        drain_device(&sim, &layout, &config);
        loader.dispatch("b", false).unwrap();
    }

    #[test]
    fn same_epoch_reentry_is_never_a_hazard() {
        let mut config = test_config();
        config.epoch_id_bits = 2;
        let (loader, _, layout) = make_loader(config);
        loader.register_program(worker_program("a", 5, &layout)).unwrap();
        loader.dispatch("a", false).unwrap();
        // Same id, same epoch, still in flight: safe to re-enter.
        loader.dispatch("a", false).unwrap();
        let counters = loader.event_counters();
        assert_eq!(counters.get("epoch_id_alias_hazards").copied().unwrap_or(0), 0);
    }

    #[test]
    fn device_loop_hazard_resolved_by_full_grid_sync() {
        let mut config = test_config();
        config.epoch_id_bits = 2;
        config.enable_device_looping = true;
        let (loader, sim, layout) = make_loader(config.clone());
        loader.register_program(worker_program("a", 1, &layout)).unwrap();
        loader.register_program(worker_program("b", 4, &layout)).unwrap();
        loader.set_device_looping(true).unwrap();

        loader.dispatch("a", false).unwrap();
        loader.dispatch("b", false).unwrap();

        let counters = loader.event_counters();
        assert_eq!(counters["epoch_id_alias_hazards"], 1);
        assert_eq!(counters["full_grid_syncs"], 1);
        // Slot 1 on every active core carries the broadcast sync command
        // (a queue-update bound to the rotating sync flag).
        for core in layout.active_cores() {
            assert_eq!(
                slot_opcode(&sim, &layout, &config, core, 1),
                Opcode::QueueUpdate as u32
            );
        }
        // The deferred in-loop sync fires once, then clears its flag.
        loader.resolve_loop_alias_syncs().unwrap();
        assert_eq!(loader.event_counters()["full_grid_syncs"], 2);
        loader.resolve_loop_alias_syncs().unwrap();
        assert_eq!(loader.event_counters()["full_grid_syncs"], 2);
    }

    #[test]
    fn loop_commands_broadcast_to_all_cores() {
        let mut config = test_config();
        config.enable_device_looping = true;
        let (loader, sim, layout) = make_loader(config.clone());
        loader.send_loop_start(5).unwrap();
        loader.send_loop_end().unwrap();
        for core in layout.active_cores() {
            assert_eq!(
                slot_opcode(&sim, &layout, &config, core, 0),
                Opcode::LoopStart as u32
            );
            assert_eq!(
                slot_opcode(&sim, &layout, &config, core, 1),
                Opcode::LoopEnd as u32
            );
        }
        let state = loader.lock();
        assert_eq!(state.controls[&0].current_generation(), 2);
    }

    #[test]
    fn loop_start_requires_feature() {
        let (loader, _, _) = make_loader(test_config());
        assert!(matches!(
            loader.send_loop_start(2),
            Err(LoaderError::Misuse(_))
        ));
    }

    #[test]
    fn end_program_reaches_every_core() {
        let config = test_config();
        let (loader, sim, layout) = make_loader(config.clone());
        loader.send_end_program().unwrap();
        assert!(loader.end_program_sent());
        for core in layout.active_cores() {
            assert_eq!(
                slot_opcode(&sim, &layout, &config, core, 0),
                Opcode::EndProgram as u32
            );
        }
    }

    fn io_queue(name: &str, buffers: &[(u8, u64)], consumer: CoreCoord) -> IoQueueInfo {
        IoQueueInfo {
            name: name.to_string(),
            alias: None,
            target_device: 0,
            buffers: buffers
                .iter()
                .map(|(channel, address)| BufferLocation {
                    channel: *channel,
                    address: *address,
                })
                .collect(),
            consumers: buffers.iter().map(|_| [consumer].into_iter().collect()).collect(),
            producers: buffers.iter().map(|_| BTreeSet::new()).collect(),
        }
    }

    #[test]
    fn queue_settings_update_from_host_writes_masked_words() {
        let (loader, sim, _) = make_loader(test_config());
        loader
            .register_io_queue(io_queue("q0", &[(0, 0x10_0000), (1, 0x10_0000)], CoreCoord::new(1, 1)))
            .unwrap();
        let mut header = QueueHeader::default();
        header.set_field(HeaderField::GlobalRdptr, 7);
        header.set_field(HeaderField::GlobalWrptr, 9);
        loader
            .update_queue_settings(&[QueueSettingsUpdate {
                queue: "q0".to_string(),
                header,
                mask: HeaderUpdateMask::NULL.with(HeaderUpdateMask::GLOBAL_RD),
                scope: SyncScope::Consumers,
            }])
            .unwrap();
        for channel in [0u8, 1] {
            let words = sim
                .read_dram(DramTarget::new(0, channel), DramAddr(0x10_0000), 2)
                .unwrap();
            assert_eq!(words[0], 7);
            // The write-pointer word is masked out.
            assert_eq!(words[1], 0);
        }
    }

    #[test]
    fn queue_settings_reuse_skips_matching_updates() {
        let mut config = test_config();
        config.enable_queue_settings_reuse = true;
        let (loader, sim, _) = make_loader(config);
        loader
            .register_io_queue(io_queue("q0", &[(0, 0x10_0000)], CoreCoord::new(1, 1)))
            .unwrap();
        let mut header = QueueHeader::default();
        header.set_field(HeaderField::GlobalRdptr, 7);
        let update = QueueSettingsUpdate {
            queue: "q0".to_string(),
            header,
            mask: HeaderUpdateMask::NULL.with(HeaderUpdateMask::GLOBAL_RD),
            scope: SyncScope::Consumers,
        };
        loader.update_queue_settings(std::slice::from_ref(&update)).unwrap();
        let written = sim.words_written();
        loader.update_queue_settings(std::slice::from_ref(&update)).unwrap();
        // Nothing new hit the device.
        assert_eq!(sim.words_written(), written);
    }

    #[test]
    fn in_use_queue_updates_go_through_device_commands() {
        let mut config = test_config();
        config.enable_hw_queue_update = true;
        let (loader, sim, layout) = make_loader(config.clone());
        let consumer = CoreCoord::new(1, 1);
        loader
            .register_io_queue(io_queue("q0", &[(0, 0x10_0000)], consumer))
            .unwrap();
        loader.mark_io_queues_in_use(&["q0".to_string()]).unwrap();
        let mut header = QueueHeader::default();
        header.set_field(HeaderField::GlobalRdptr, 3);
        loader
            .update_queue_settings(&[QueueSettingsUpdate {
                queue: "q0".to_string(),
                header,
                mask: HeaderUpdateMask::NULL.with(HeaderUpdateMask::GLOBAL_RD),
                scope: SyncScope::Consumers,
            }])
            .unwrap();
        // The consumer core's queue carries the update command; the
        // header itself was not host-written.
        assert_eq!(
            slot_opcode(&sim, &layout, &config, consumer, 0),
            Opcode::QueueUpdate as u32
        );
        assert_eq!(
            sim.read_dram(DramTarget::new(0, 0), DramAddr(0x10_0000), 1).unwrap()[0],
            0
        );
    }

    #[test]
    fn pointer_updates_inline_and_mirror_host_cache() {
        let mut config = test_config();
        config.enable_device_looping = true;
        let (loader, sim, layout) = make_loader(config.clone());
        let consumer = CoreCoord::new(2, 2);
        loader
            .register_io_queue(io_queue("q0", &[(0, 0x20_0000)], consumer))
            .unwrap();
        let pending = [PendingUpdate {
            instruction: PointerUpdateInstruction {
                variable: "rd".to_string(),
                op: PointerVarOp::IncWrap {
                    amount: Operand::Const(2),
                    wrap: Operand::Const(8),
                },
            },
            field: HeaderField::GlobalRdptr,
            queues: ["q0".to_string()].into_iter().collect(),
        }];
        loader
            .update_queue_pointers_on_device(&pending, &HashMap::new(), 3)
            .unwrap();
        assert_eq!(
            slot_opcode(&sim, &layout, &config, consumer, 0),
            Opcode::PointerUpdate as u32
        );
        // Host cache mirrors three iterations of (x+2)%8.
        let mut state = loader.lock();
        let cached = state.controls.get_mut(&0).unwrap().cached_header("q0");
        assert_eq!(cached.field(HeaderField::GlobalRdptr), 6);
    }

    #[test]
    fn pointer_updates_above_threshold_use_external_blob() {
        let mut config = test_config();
        config.enable_device_looping = true;
        let (loader, sim, layout) = make_loader(config.clone());
        let consumer = CoreCoord::new(1, 1);
        loader
            .register_io_queue(io_queue(
                "big",
                &[(0, 0x20_0000), (0, 0x21_0000), (0, 0x22_0000)],
                consumer,
            ))
            .unwrap();
        let pending = [PendingUpdate {
            instruction: PointerUpdateInstruction {
                variable: "rd".to_string(),
                op: PointerVarOp::Inc {
                    amount: Operand::Const(1),
                },
            },
            field: HeaderField::GlobalRdptr,
            queues: ["big".to_string()].into_iter().collect(),
        }];
        loader
            .update_queue_pointers_on_device(&pending, &HashMap::new(), 1)
            .unwrap();

        // One command, referencing a blob in the consumer's channel.
        assert_eq!(
            slot_opcode(&sim, &layout, &config, consumer, 0),
            Opcode::PointerUpdate as u32
        );
        let manager = DramManager::new(&layout, &RegionParams::from_config(&config)).unwrap();
        let core_index = layout.core_index_in_channel(consumer).unwrap();
        let blob_addr = manager
            .channel(0)
            .unwrap()
            .update_blob_address(core_index, 0)
            .unwrap();
        let blob = sim.read_dram(DramTarget::new(0, 0), blob_addr, 6).unwrap();
        assert_eq!(blob[0], 0x20_0000);
        assert_eq!(blob[2], 0x21_0000);
        assert_eq!(blob[4], 0x22_0000);
    }

    #[test]
    fn pointer_updates_require_device_looping() {
        let (loader, _, _) = make_loader(test_config());
        assert!(matches!(
            loader.update_queue_pointers_on_device(&[], &HashMap::new(), 1),
            Err(LoaderError::Misuse(_))
        ));
    }

    #[test]
    fn padded_program_images_every_active_core() {
        let config = test_config();
        let (loader, sim, layout) = make_loader(config.clone());
        let mut info = ProgramInfo::new("full", 2, 0);
        info.binary.pad_to_layout(&layout).unwrap();
        loader.register_program(info).unwrap();
        loader.dispatch("full", false).unwrap();
        // With every core imaged there are no not-valid markers.
        for core in layout.active_cores() {
            assert_eq!(
                slot_opcode(&sim, &layout, &config, core, 0),
                Opcode::Valid as u32
            );
        }
    }
}

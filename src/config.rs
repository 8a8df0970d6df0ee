//! Runtime configuration.
//!
//! Configuration is resolved once, at loader construction, and threaded
//! explicitly through constructors — no call site reads the environment
//! on its own. Sources in priority order:
//!
//! 1. `GRIDLOADER_*` environment variables
//! 2. A `gridloader.toml` config file (project directory first, then the
//!    user config directory)
//! 3. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # gridloader.toml
//!
//! # Command queue slots per core (must be a power of two)
//! command_slots = 256
//!
//! # Epoch binary cache capacity per DRAM channel
//! binary_cache_slots = 32
//!
//! # Use the approximate-MRU eviction policy instead of LRU
//! mru_binary_cache = false
//! ```

use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, Result};

/// Immutable runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Command queue slots per core. Must be a power of two.
    pub command_slots: u32,
    /// Epoch binary cache capacity (slots per DRAM channel).
    pub binary_cache_slots: u32,
    /// Buffer addresses one pointer-update blob can list.
    pub update_blob_entries: u32,
    /// Pointer-update blob slots per core.
    pub update_blob_slots: u32,
    /// Desired write-combine window, clamped to the queue size.
    pub wc_window_target: u32,
    /// Allow write-combining on directly memory-mapped chips.
    pub wc_enable_mmio: bool,
    /// Bits of the wrapped epoch identifier field.
    pub epoch_id_bits: u32,
    /// Read binaries back after writing and compare.
    pub verify_binaries: bool,
    /// Queues with at most this many buffers get inline update commands;
    /// larger queues go through an external DRAM blob.
    pub inline_update_threshold: u32,
    /// Reuse device-resident epoch binaries across dispatches.
    pub enable_epoch_caching: bool,
    /// Preload epoch binaries ahead of their first dispatch.
    pub enable_epoch_preloading: bool,
    /// Skip io-queue header updates whose cached value already matches.
    pub enable_queue_settings_reuse: bool,
    /// Approximate-MRU eviction instead of LRU.
    pub mru_binary_cache: bool,
    /// Update io-queue headers from the device instead of the host when
    /// the queue is in use.
    pub enable_hw_queue_update: bool,
    /// Device-side program looping.
    pub enable_device_looping: bool,
    /// Merge redundant pointer-update commands before emission.
    pub enable_varinst_merge: bool,
    /// Write-combine epoch commands while looping on device.
    pub enable_write_combine: bool,
    /// Skip epoch-identifier alias hazard avoidance entirely.
    pub allow_epoch_aliasing: bool,
    /// Busy-poll budget in seconds; `None` polls forever.
    pub poll_timeout_secs: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_slots: 256,
            binary_cache_slots: 32,
            update_blob_entries: 120,
            update_blob_slots: 256,
            wc_window_target: 0xFFFF,
            wc_enable_mmio: false,
            epoch_id_bits: 5,
            verify_binaries: false,
            inline_update_threshold: 2,
            enable_epoch_caching: false,
            enable_epoch_preloading: false,
            enable_queue_settings_reuse: false,
            mru_binary_cache: false,
            enable_hw_queue_update: false,
            enable_device_looping: false,
            enable_varinst_merge: false,
            enable_write_combine: false,
            allow_epoch_aliasing: false,
            poll_timeout_secs: Some(30),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from all sources and validate it.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_first_file();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// The wrapped-epoch-identifier window: identifiers alias modulo this
    /// value. One value of the field is reserved as the idle marker.
    pub fn epoch_id_window(&self) -> u32 {
        (1u32 << self.epoch_id_bits) - 1
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout_secs.map(Duration::from_secs)
    }

    /// Apply a named optimization level, mirroring the feature bundles
    /// the runtime has always shipped:
    ///
    /// - 0: no optimizations
    /// - 1: epoch caching + preloading
    /// - 2: + queue-settings reuse + approximate-MRU binary cache
    /// - 3: + device-side io-queue updates
    /// - 4: + device looping, merged pointer updates, write-combining
    ///   (MRU cache off — incompatible with looping)
    pub fn set_optimization_level(&mut self, level: u8) {
        info!("optimization level set to {}", level);
        if level >= 1 {
            self.enable_epoch_caching = true;
            self.enable_epoch_preloading = true;
        }
        if level >= 2 {
            self.enable_queue_settings_reuse = true;
            self.mru_binary_cache = true;
        }
        if level >= 3 {
            self.enable_hw_queue_update = true;
        }
        if level >= 4 {
            self.enable_device_looping = true;
            self.enable_varinst_merge = true;
            self.enable_write_combine = true;
            self.mru_binary_cache = false;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_slots == 0 || !self.command_slots.is_power_of_two() {
            return Err(LoaderError::Config(format!(
                "command_slots must be a nonzero power of two, got {}",
                self.command_slots
            )));
        }
        if self.binary_cache_slots == 0 {
            return Err(LoaderError::Config("binary_cache_slots must be nonzero".into()));
        }
        if self.update_blob_slots == 0 || self.update_blob_entries == 0 {
            return Err(LoaderError::Config("update blob geometry must be nonzero".into()));
        }
        if !(1..=16).contains(&self.epoch_id_bits) {
            return Err(LoaderError::Config(format!(
                "epoch_id_bits must be in 1..=16, got {}",
                self.epoch_id_bits
            )));
        }
        if self.inline_update_threshold == 0 {
            return Err(LoaderError::Config(
                "inline_update_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Load the first config file found: project-local `gridloader.toml`,
    /// then the user config directory. Defaults when neither exists.
    fn from_first_file() -> Self {
        if let Some(config) = Self::load_from_file(Path::new("gridloader.toml")) {
            return config;
        }
        if let Some(dir) = dirs::config_dir() {
            let path = dir.join("gridloader").join("config.toml");
            if let Some(config) = Self::load_from_file(&path) {
                return config;
            }
        }
        Self::default()
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    info!("loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    warn!("failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Apply `GRIDLOADER_*` overrides through a lookup function (the real
    /// environment in production, a map in tests).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_u32(key: &str, value: &str) -> Option<u32> {
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("ignoring non-numeric {}={}", key, value);
                    None
                }
            }
        }
        fn parse_bool(value: &str) -> bool {
            matches!(value, "1" | "true" | "TRUE" | "yes")
        }

        let numeric: [(&str, &mut u32); 7] = [
            ("GRIDLOADER_COMMAND_SLOTS", &mut self.command_slots),
            ("GRIDLOADER_BINARY_CACHE_SLOTS", &mut self.binary_cache_slots),
            ("GRIDLOADER_UPDATE_BLOB_ENTRIES", &mut self.update_blob_entries),
            ("GRIDLOADER_UPDATE_BLOB_SLOTS", &mut self.update_blob_slots),
            ("GRIDLOADER_WC_WINDOW_SIZE", &mut self.wc_window_target),
            ("GRIDLOADER_EPOCH_ID_BITS", &mut self.epoch_id_bits),
            (
                "GRIDLOADER_INLINE_UPDATE_THRESHOLD",
                &mut self.inline_update_threshold,
            ),
        ];
        for (key, slot) in numeric {
            if let Some(value) = lookup(key) {
                if let Some(parsed) = parse_u32(key, &value) {
                    info!("using {}={} from environment", key, parsed);
                    *slot = parsed;
                }
            }
        }

        let boolean: [(&str, &mut bool); 6] = [
            ("GRIDLOADER_WC_ENABLE_MMIO", &mut self.wc_enable_mmio),
            ("GRIDLOADER_VERIFY_BINARIES", &mut self.verify_binaries),
            ("GRIDLOADER_DEVICE_LOOPING", &mut self.enable_device_looping),
            ("GRIDLOADER_VARINST_MERGE", &mut self.enable_varinst_merge),
            ("GRIDLOADER_WRITE_COMBINE", &mut self.enable_write_combine),
            ("GRIDLOADER_ALLOW_EPOCH_ALIASING", &mut self.allow_epoch_aliasing),
        ];
        for (key, slot) in boolean {
            if let Some(value) = lookup(key) {
                *slot = parse_bool(&value);
                info!("using {}={} from environment", key, *slot);
            }
        }

        if let Some(value) = lookup("GRIDLOADER_POLL_TIMEOUT_SECS") {
            match value.parse::<u64>() {
                Ok(0) => self.poll_timeout_secs = None,
                Ok(v) => self.poll_timeout_secs = Some(v),
                Err(_) => warn!("ignoring non-numeric GRIDLOADER_POLL_TIMEOUT_SECS={}", value),
            }
        }
    }

    /// Generate a sample config file.
    pub fn sample_config() -> String {
        let rendered = toml::to_string_pretty(&Self::default()).unwrap_or_default();
        format!(
            "# gridloader configuration\n# Place at ./gridloader.toml or in the user config directory.\n\n{}",
            rendered
        )
    }
}

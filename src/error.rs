//! Error types for the dispatch runtime.
//!
//! Errors fall into three families:
//!
//! - **Invariant/configuration violations** (`Config`, `Capacity`,
//!   `PinnedEviction`): the device cannot function with the requested
//!   setup. Callers are expected to treat these as fatal for the device
//!   session.
//! - **Transient waits that exceeded their budget** (`Timeout`): a
//!   busy-poll on device state ran past the configured deadline. Usually
//!   means the device needs a reset.
//! - **Programming-model misuse** (`Misuse`, `UnknownProgram`,
//!   `UnknownQueue`): a caller bug, not a runtime condition to recover
//!   from.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    /// Invalid or inconsistent runtime configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A DRAM region or cache ran out of space. Not recoverable.
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// The eviction policy selected a pinned binary as its victim.
    /// More binaries are pinned than the cache can hold.
    #[error("cache '{cache}': pinned binary '{name}' would be evicted")]
    PinnedEviction { cache: String, name: String },

    /// A busy-poll on device state exceeded the configured timeout.
    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    /// API misuse: operating on uninitialized state, flushing out of
    /// order, pushing to an inactive queue.
    #[error("misuse: {0}")]
    Misuse(String),

    /// Dispatch of a program that was never registered.
    #[error("epoch program not registered: {0}")]
    UnknownProgram(String),

    /// Reference to a queue missing from the workload registry.
    #[error("io queue not registered: {0}")]
    UnknownQueue(String),

    /// The transport failed to move data to or from the device.
    #[error("transport error: {0}")]
    Transport(String),

    /// Read-back verification of a written binary found a mismatch.
    #[error("binary verification failed: {0}")]
    VerifyFailed(String),
}

pub type Result<T> = std::result::Result<T, LoaderError>;

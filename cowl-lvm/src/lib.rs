//! Filtered LVM command layer for the cowl chain engine.
//!
//! Block storage domains are LVM volume groups on shared SAN devices, one
//! VG per domain, one LV per volume. Everything goes through the `lvm`
//! binary; this crate owns how it is invoked:
//!
//!  - every command embeds a `--config` devices filter listing exactly the
//!    multipath devices currently in use, so a rogue local disk can never
//!    be scanned or grabbed ([`LvmCache`]);
//!  - commands are capped by a bounded slot counter and retried on the
//!    documented transient failures (stale filter in read-write mode, any
//!    failure in read-only mode);
//!  - the read-only/read-write toggle drains in-flight commands before
//!    flipping `locking_type`, so lock-free probing never races a write;
//!  - report queries (`lvs`/`vgs`/`pvs`) are parsed from
//!    `--reportformat json` into typed rows ([`LogicalVolume`],
//!    [`VolumeGroup`], [`PhysicalVolume`]);
//!  - [`filter`] builds the wanted filter from a device list and judges an
//!    existing filter against it.

mod cmd;
pub mod filter;
mod ops;
mod report;

use std::io;

pub use cmd::{CommandOutput, LvmCache, LvmCacheConfig, Runner, SystemRunner};
pub use report::{LogicalVolume, PhysicalVolume, VolumeGroup};

/// Result type for LVM operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the LVM command layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The `lvm` binary exited non-zero after all applicable retries.
    #[error("lvm {verb} failed (rc={rc}): {stderr}")]
    Command {
        /// The lvm sub-command that failed.
        verb: String,
        /// Exit code, or -1 when killed by a signal.
        rc: i32,
        /// Filtered stderr.
        stderr: String,
    },

    /// The report JSON could not be decoded.
    #[error("malformed lvm report: {0}")]
    Report(String),

    /// No VG with the given name is visible through the current filter.
    #[error("volume group not found: {0}")]
    VgNotFound(String),

    /// No LV with the given name exists in the VG.
    #[error("logical volume not found: {vg}/{lv}")]
    LvNotFound {
        /// Volume group name.
        vg: String,
        /// Logical volume name.
        lv: String,
    },

    /// A filter string is not of the `a|regex|` / `r|regex|` form.
    #[error("invalid lvm filter item: {0:?}")]
    InvalidFilter(String),

    /// Failed to spawn or wait for the `lvm` binary.
    #[error(transparent)]
    Io(#[from] io::Error),
}

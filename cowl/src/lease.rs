//! Cluster-wide locks on shared storage, backed by sanlock.
//!
//! Two kinds of lock live on every domain: the per-host delta lease in the
//! `ids` area, which fences dead hosts, and paxos resources in the
//! `leases` area — offset 0 holds the SDM lease that authorises one host
//! to mutate the domain, later slots hold per-volume leases. The engine
//! only ever initialises a volume lease once, at volume creation; its
//! contents are sanlock's after that.
//!
//! The adapter shells out to the `sanlock` binary; the alignment and
//! sector size of every invocation come from the domain and bound the
//! host count per the sanlock lockspace geometry.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::{Error, Result};

/// Resource name of the Storage Domain Master lease.
pub const SDM_LEASE_NAME: &str = "SDM";

/// Offset of the SDM lease inside the leases area.
pub const SDM_LEASE_OFFSET: u64 = 0;

/// Lease slots reserved at the start of the leases area (SDM plus spares).
pub const RESERVED_LEASE_SLOTS: u64 = 4;

/// sanlock lockspace alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Alignment {
    /// 1 MiB.
    M1,
    /// 2 MiB.
    M2,
    /// 4 MiB.
    M4,
    /// 8 MiB.
    M8,
}

impl Alignment {
    /// Alignment in bytes.
    pub const fn bytes(self) -> u64 {
        match self {
            Self::M1 => 1 << 20,
            Self::M2 => 2 << 20,
            Self::M4 => 4 << 20,
            Self::M8 => 8 << 20,
        }
    }

    /// The `-A` argument form.
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::M1 => "1M",
            Self::M2 => "2M",
            Self::M4 => "4M",
            Self::M8 => "8M",
        }
    }

    /// Decodes an alignment from bytes.
    pub fn from_bytes(bytes: u64) -> Result<Self> {
        match bytes {
            0x10_0000 => Ok(Self::M1),
            0x20_0000 => Ok(Self::M2),
            0x40_0000 => Ok(Self::M4),
            0x80_0000 => Ok(Self::M8),
            other => Err(Error::InvalidParameter {
                name: "alignment",
                value: other.to_string(),
            }),
        }
    }
}

/// Maximum host count for a `(block size, alignment)` pair.
///
/// Unsupported combinations are rejected at domain creation.
pub fn max_hosts(block_size: u64, alignment: Alignment) -> Result<u32> {
    match (block_size, alignment) {
        (512, Alignment::M1) => Ok(2000),
        (4096, Alignment::M1) => Ok(250),
        (4096, Alignment::M2) => Ok(500),
        (4096, Alignment::M4) => Ok(1000),
        (4096, Alignment::M8) => Ok(2000),
        _ => Err(Error::UnsupportedLockConfig {
            block_size,
            alignment: alignment.bytes(),
        }),
    }
}

/// Acquisition mode for a paxos resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResourceMode {
    /// Concurrent holders across hosts.
    Shared,
    /// Single holder across hosts.
    Exclusive,
}

/// Owner row decoded from a resource dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Lockspace the resource belongs to.
    pub lockspace: String,
    /// Resource name.
    pub resource: String,
    /// Owner host id, 0 when free.
    pub owner: u32,
    /// Owner host generation.
    pub generation: u64,
}

/// Executes an assembled `sanlock` argv; a seam for tests.
pub trait LockRunner: Send + Sync + std::fmt::Debug {
    /// Runs `argv[0]` with `argv[1..]` and captures its output.
    fn run(&self, argv: &[String]) -> io::Result<std::process::Output>;
}

/// [`LockRunner`] that spawns the real binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLockRunner;

impl LockRunner for SystemLockRunner {
    fn run(&self, argv: &[String]) -> io::Result<std::process::Output> {
        Command::new(&argv[0]).args(&argv[1..]).output()
    }
}

/// [`LockRunner`] that reports success without running anything; used by
/// on-disk tests that have no sanlock daemon.
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct NullLockRunner;

#[cfg(test)]
impl LockRunner for NullLockRunner {
    fn run(&self, _argv: &[String]) -> io::Result<std::process::Output> {
        use std::os::unix::process::ExitStatusExt as _;
        Ok(std::process::Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

/// The cluster lock of one storage domain.
#[derive(Debug)]
pub struct ClusterLock {
    lockspace: String,
    ids_path: PathBuf,
    leases_path: PathBuf,
    alignment: Alignment,
    block_size: u64,
    host_id: Mutex<Option<u32>>,
    runner: Arc<dyn LockRunner>,
}

impl ClusterLock {
    /// Binds a domain's lock areas, validating the geometry.
    ///
    /// `runner` is the command seam; production callers pass
    /// [`SystemLockRunner`].
    pub fn new(
        sd_uuid: Uuid,
        ids_path: impl Into<PathBuf>,
        leases_path: impl Into<PathBuf>,
        alignment: Alignment,
        block_size: u64,
        runner: Arc<dyn LockRunner>,
    ) -> Result<Self> {
        max_hosts(block_size, alignment)?;
        Ok(Self {
            lockspace: sd_uuid.to_string(),
            ids_path: ids_path.into(),
            leases_path: leases_path.into(),
            alignment,
            block_size,
            host_id: Mutex::new(None),
            runner,
        })
    }

    /// The leases-area offset of the volume lease bound to a metadata
    /// slot.
    pub const fn volume_lease_offset(&self, slot: u64) -> u64 {
        (RESERVED_LEASE_SLOTS + slot) * self.alignment.bytes()
    }

    /// Path of the leases area.
    pub fn leases_path(&self) -> &Path {
        &self.leases_path
    }

    /// Formats the domain's lockspace, writing the ids area.
    pub fn init_lockspace(&self) -> Result<()> {
        info!(lockspace = %self.lockspace, "initializing lockspace");
        let spec = format!("{}:0:{}:0", self.lockspace, self.ids_path.display());
        self.run(&["direct", "init", "-s", &spec])?;
        Ok(())
    }

    /// Formats (or clobbers) one paxos resource in the leases area.
    ///
    /// This is the only writer of lease contents in the engine; it runs
    /// once per volume at creation and never again.
    pub fn write_resource(&self, name: &str, offset: u64) -> Result<()> {
        let spec = self.resource_spec(name, offset, false);
        self.run(&["direct", "init", "-r", &spec])?;
        Ok(())
    }

    /// Formats a paxos resource living outside the domain leases area —
    /// file domains keep one `.lease` sidecar per volume.
    pub fn write_resource_at(&self, path: &Path, name: &str, offset: u64) -> Result<()> {
        let spec = format!("{}:{}:{}:{}", self.lockspace, name, path.display(), offset);
        self.run(&["direct", "init", "-r", &spec])?;
        Ok(())
    }

    /// Joins the lockspace with this host's id, acquiring the delta lease.
    pub fn acquire_host_id(&self, host_id: u32) -> Result<()> {
        info!(lockspace = %self.lockspace, host_id, "acquiring host id");
        let spec = format!(
            "{}:{}:{}:0",
            self.lockspace,
            host_id,
            self.ids_path.display()
        );
        self.run(&["client", "add_lockspace", "-s", &spec])?;
        *self.host_id.lock() = Some(host_id);
        Ok(())
    }

    /// Leaves the lockspace, dropping the delta lease.
    pub fn release_host_id(&self) -> Result<()> {
        let Some(host_id) = *self.host_id.lock() else {
            return Err(Error::ClusterLock("host id not acquired".to_owned()));
        };
        let spec = format!(
            "{}:{}:{}:0",
            self.lockspace,
            host_id,
            self.ids_path.display()
        );
        self.run(&["client", "rem_lockspace", "-s", &spec])?;
        *self.host_id.lock() = None;
        Ok(())
    }

    /// Acquires the SDM lease, making this host the domain master.
    pub fn acquire_domain_lock(&self) -> Result<()> {
        self.acquire(SDM_LEASE_NAME, SDM_LEASE_OFFSET, ResourceMode::Exclusive)
    }

    /// Releases the SDM lease.
    pub fn release_domain_lock(&self) -> Result<()> {
        self.release(SDM_LEASE_NAME, SDM_LEASE_OFFSET)
    }

    /// Acquires a paxos resource for this process.
    pub fn acquire(&self, name: &str, offset: u64, mode: ResourceMode) -> Result<()> {
        if self.host_id.lock().is_none() {
            return Err(Error::ClusterLock(
                "cannot acquire resource before host id".to_owned(),
            ));
        }
        let spec = self.resource_spec(name, offset, mode == ResourceMode::Shared);
        let pid = std::process::id().to_string();
        self.run(&["client", "acquire", "-r", &spec, "-p", &pid])?;
        Ok(())
    }

    /// Releases a paxos resource held by this process.
    pub fn release(&self, name: &str, offset: u64) -> Result<()> {
        let spec = self.resource_spec(name, offset, false);
        let pid = std::process::id().to_string();
        self.run(&["client", "release", "-r", &spec, "-p", &pid])?;
        Ok(())
    }

    /// Reads the current owner of a paxos resource.
    pub fn read_resource(&self, name: &str, offset: u64) -> Result<ResourceInfo> {
        let dump = format!("{}:{}:{}", self.leases_path.display(), offset, self.alignment.bytes());
        let out = self.run(&["direct", "dump", &dump])?;
        parse_dump(&out, name).ok_or_else(|| {
            Error::ClusterLock(format!("resource {name} not found at offset {offset}"))
        })
    }

    fn resource_spec(&self, name: &str, offset: u64, shared: bool) -> String {
        let mut spec = format!(
            "{}:{}:{}:{}",
            self.lockspace,
            name,
            self.leases_path.display(),
            offset
        );
        if shared {
            spec.push_str(":SH");
        }
        spec
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut argv = Vec::with_capacity(args.len() + 5);
        argv.push("sanlock".to_owned());
        argv.extend(args.iter().map(|a| (*a).to_owned()));
        argv.push("-Z".to_owned());
        argv.push(self.block_size.to_string());
        argv.push("-A".to_owned());
        argv.push(self.alignment.as_arg().to_owned());

        let output = self.runner.run(&argv).map_err(Error::Io)?;
        if !output.status.success() {
            return Err(Error::ClusterLock(format!(
                "sanlock {} failed (rc={}): {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Pulls the row for `resource` out of a `sanlock direct dump` listing.
///
/// Dump rows are whitespace columns:
/// `offset lockspace resource timestamp own gen lver`.
fn parse_dump(dump: &str, resource: &str) -> Option<ResourceInfo> {
    for line in dump.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 6 || cols[2] != resource {
            continue;
        }
        return Some(ResourceInfo {
            lockspace: cols[1].to_owned(),
            resource: cols[2].to_owned(),
            owner: cols[4].parse().unwrap_or(0),
            generation: cols[5].parse().unwrap_or(0),
        });
    }
    None
}

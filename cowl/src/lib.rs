//! Host-side virtual disk chain engine.
//!
//! `cowl` manages virtual disks as ordered chains of copy-on-write
//! overlays rooted at a RAW base or a shared template, on two storage
//! backends: file (NFS/local filesystem) and block (LVM on shared SAN).
//! It owns the on-disk volume representation, the text metadata sidecars
//! describing every overlay, the chain algorithms (create, snapshot,
//! merge, copy/move, sparsify, reconcile, delete), and the multi-host
//! mutual-exclusion discipline (in-process reader/writer locks plus
//! sanlock leases on shared storage).
//!
//! It is a library: an RPC layer or agent drives it transactionally
//! through [`hsm::Hsm`], and every external effect goes through stable
//! adapters over `qemu-img`, `lvm`, `sanlock` and `fallocate`.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cowl::hsm::Hsm;
//! use cowl::lease::Alignment;
//! use cowl::sd::{DomainClass, StorageDomain};
//! use cowl::{Context, DomainVersion, EngineConfig};
//! use uuid::Uuid;
//!
//! let ctx = Context::new(EngineConfig::default());
//! let hsm = Hsm::new(Arc::clone(&ctx));
//!
//! let sd = Uuid::new_v4();
//! let dom = StorageDomain::create_file(
//!     &ctx,
//!     "/srv/storage/mnt/server:_export",
//!     sd,
//!     DomainVersion::V5,
//!     DomainClass::Data,
//!     0, // detect block size
//!     Alignment::M1,
//! )
//! .expect("domain creation failed");
//! hsm.attach_domain(dom);
//! ```

mod config;
mod error;
mod proc;

pub mod hsm;
pub mod image;
pub mod iopool;
pub mod lease;
pub mod qemuimg;
pub mod rm;
pub mod sd;
pub mod task;
pub mod volume;

use std::sync::Arc;

pub use config::{COW_OVERHEAD, EngineConfig, MEGAB};
use cowl_lvm::LvmCache;
pub use cowl_meta::{
    BLANK_UUID, DiskType, DomainVersion, Legality, VolumeFormat, VolumeMetadata, VolumeRole,
    VolumeType,
};
pub use error::{Error, ErrorCollector, Result};

use crate::iopool::IoPools;
use crate::lease::{LockRunner, SystemLockRunner};
use crate::rm::ResourceManager;

/// Shared engine state injected into every call.
///
/// The per-process singletons — resource manager, per-domain I/O pools,
/// the LVM command cache, the cluster-lock command seam — live here and
/// nowhere else, so embedders control initialization order and tests
/// substitute the external-command seams.
#[derive(Debug)]
pub struct Context {
    config: EngineConfig,
    rm: ResourceManager,
    pools: IoPools,
    lvm: Arc<LvmCache>,
    lock_runner: Arc<dyn LockRunner>,
}

impl Context {
    /// Creates a context driving the real `lvm` and `sanlock` binaries.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let lvm = Arc::new(LvmCache::system(config.lvm_config()));
        Self::with_adapters(config, lvm, Arc::new(SystemLockRunner))
    }

    /// Creates a context over caller-supplied command adapters.
    pub fn with_adapters(
        config: EngineConfig,
        lvm: Arc<LvmCache>,
        lock_runner: Arc<dyn LockRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rm: ResourceManager::new(),
            pools: IoPools::new(config.io_threads),
            config,
            lvm,
            lock_runner,
        })
    }

    /// Engine tunables.
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The in-process resource manager.
    pub const fn rm(&self) -> &ResourceManager {
        &self.rm
    }

    /// The per-domain I/O pool registry.
    pub const fn pools(&self) -> &IoPools {
        &self.pools
    }

    /// The LVM command cache.
    pub const fn lvm(&self) -> &Arc<LvmCache> {
        &self.lvm
    }

    /// The sanlock command seam.
    pub const fn lock_runner(&self) -> &Arc<dyn LockRunner> {
        &self.lock_runner
    }

    /// Joins worker pools; call once the embedding service stops.
    pub fn shutdown(&self) {
        self.pools.shutdown();
    }

    /// Context with a no-op cluster-lock seam, for on-disk tests that
    /// have no sanlock daemon.
    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Arc<Self> {
        let config = EngineConfig::default();
        let lvm = Arc::new(LvmCache::system(config.lvm_config()));
        Self::with_adapters(config, lvm, Arc::new(lease::NullLockRunner))
    }
}

//! Storage domain manifests: a mounted (file) or attached (block) domain
//! and the volume-level operations it owns.

mod block;
mod file;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cowl_meta::{
    BLANK_UUID, BLOCK_SIZE_4K, BLOCK_SIZE_512, DiskType, DomainVersion, Legality, TAG_VOL_UNINIT,
    VolumeFormat, VolumeMetadata, VolumeRole, VolumeType, round_up, validate_create_volume_params,
};
use tracing::{info, warn};
use uuid::Uuid;

pub use block::{BlockDomain, RESERVED_LVS, SlotReservation};
pub use file::{FileDomain, LEASE_FILEOFFSET, META_FILEEXT};

use crate::config::{COW_OVERHEAD, MEGAB};
use crate::lease::{Alignment, ClusterLock, max_hosts};
use crate::qemuimg::{self, Qcow2Compat};
use crate::task::Task;
use crate::volume::{self, Prepare, Volume};
use crate::{Context, Error, Result};

/// Domain payload class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DomainClass {
    /// Regular VM data.
    Data,
    /// ISO library.
    Iso,
    /// Backup/export target.
    Backup,
}

impl DomainClass {
    /// The token persisted in domain metadata.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Data => "Data",
            Self::Iso => "Iso",
            Self::Backup => "Backup",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "Data" => Ok(Self::Data),
            "Iso" => Ok(Self::Iso),
            "Backup" => Ok(Self::Backup),
            other => Err(Error::InvalidParameter {
                name: "domain_class",
                value: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for DomainClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two storage backends a domain can sit on.
#[derive(Debug)]
#[non_exhaustive]
pub enum Backend {
    /// NFS or local filesystem.
    File(FileDomain),
    /// LVM VG on shared SAN.
    Block(BlockDomain),
}

/// Volume-creation request, capacity in bytes.
#[derive(Debug, Clone)]
pub struct CreateVolumeArgs {
    /// Image the volume joins.
    pub img_uuid: Uuid,
    /// Virtual capacity in bytes.
    pub capacity: u64,
    /// On-disk format.
    pub vol_format: VolumeFormat,
    /// Allocation policy.
    pub preallocate: VolumeType,
    /// Payload role tag.
    pub disk_type: DiskType,
    /// UUID of the new volume.
    pub vol_uuid: Uuid,
    /// Description, at most 210 bytes.
    pub desc: String,
    /// Image of the source volume (template image when snapshotting a
    /// template), or blank.
    pub src_img_uuid: Uuid,
    /// Parent volume, or blank for a base volume.
    pub src_vol_uuid: Uuid,
    /// Optional initial allocation in bytes.
    pub initial_size: Option<u64>,
}

/// A mounted or attached storage domain.
pub struct StorageDomain {
    ctx: Arc<Context>,
    sd_uuid: Uuid,
    version: DomainVersion,
    class: DomainClass,
    block_size: u64,
    alignment: Alignment,
    backend: Backend,
    lock: ClusterLock,
}

impl fmt::Debug for StorageDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageDomain")
            .field("sd_uuid", &self.sd_uuid)
            .field("version", &self.version)
            .field("class", &self.class)
            .field("block", &self.is_block())
            .finish_non_exhaustive()
    }
}

/// Checks a `(version, block size, alignment)` combination.
fn validate_geometry(version: DomainVersion, block_size: u64, alignment: Alignment) -> Result<()> {
    if version < DomainVersion::V5 && (block_size != BLOCK_SIZE_512 || alignment != Alignment::M1) {
        return Err(Error::UnsupportedLockConfig {
            block_size,
            alignment: alignment.bytes(),
        });
    }
    if !version.supported_block_sizes().contains(&block_size) {
        return Err(Error::BlockSizeMismatch {
            sd: BLANK_UUID,
            declared: block_size,
            detected: 0,
        });
    }
    max_hosts(block_size, alignment)?;
    Ok(())
}

impl StorageDomain {
    /// Formats a new file domain under `repo` and mounts it.
    ///
    /// `block_size` 0 on a v5 domain means "detect from the filesystem".
    pub fn create_file(
        ctx: &Arc<Context>,
        repo: impl Into<std::path::PathBuf>,
        sd_uuid: Uuid,
        version: DomainVersion,
        class: DomainClass,
        block_size: u64,
        alignment: Alignment,
    ) -> Result<Arc<Self>> {
        let io = crate::iopool::FileIo::new(ctx.pools().get(sd_uuid));
        let backend = FileDomain::new(sd_uuid, repo, io);
        backend.create_layout()?;

        let block_size = if block_size == 0 && version == DomainVersion::V5 {
            backend.io().fs_block_size(&backend.domain_dir())?.min(BLOCK_SIZE_4K)
        } else {
            block_size
        };
        validate_geometry(version, block_size, alignment)?;

        let record = domain_record(sd_uuid, version, class, block_size, alignment);
        backend
            .io()
            .write_then_rename(&backend.metadata_path(), record, 0o660)?;

        info!(%sd_uuid, %version, %class, "created file domain");
        Self::attach_file_backend(ctx, backend)
    }

    /// Mounts an existing file domain from its on-disk record.
    pub fn attach_file(
        ctx: &Arc<Context>,
        repo: impl Into<std::path::PathBuf>,
        sd_uuid: Uuid,
    ) -> Result<Arc<Self>> {
        let io = crate::iopool::FileIo::new(ctx.pools().get(sd_uuid));
        let backend = FileDomain::new(sd_uuid, repo, io);
        Self::attach_file_backend(ctx, backend)
    }

    fn attach_file_backend(ctx: &Arc<Context>, backend: FileDomain) -> Result<Arc<Self>> {
        let text = backend.io().read_to_string(&backend.metadata_path())?;
        let record = parse_domain_record(&text)?;

        let mut block_size = record.block_size;
        if record.version == DomainVersion::V5 {
            let detected = backend
                .io()
                .fs_block_size(&backend.domain_dir())?
                .min(BLOCK_SIZE_4K);
            if block_size == 0 {
                block_size = detected;
            } else if block_size == BLOCK_SIZE_4K && detected == BLOCK_SIZE_512 {
                // Metadata writes go through atomic renames, so a 512-byte
                // declaration works on any filesystem; a 4K declaration
                // needs the storage to actually provide it.
                return Err(Error::BlockSizeMismatch {
                    sd: record.sd_uuid,
                    declared: block_size,
                    detected,
                });
            }
        }
        validate_geometry(record.version, block_size, record.alignment)?;

        let lock = ClusterLock::new(
            record.sd_uuid,
            backend.ids_path(),
            backend.leases_path(),
            record.alignment,
            block_size,
            Arc::clone(ctx.lock_runner()),
        )?;
        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            sd_uuid: record.sd_uuid,
            version: record.version,
            class: record.class,
            block_size,
            alignment: record.alignment,
            backend: Backend::File(backend),
            lock,
        }))
    }

    /// Creates a new block domain: a VG over `devices` with the reserved
    /// LVs and domain tags.
    pub fn create_block(
        ctx: &Arc<Context>,
        sd_uuid: Uuid,
        devices: &[&str],
        version: DomainVersion,
        class: DomainClass,
        block_size: u64,
        alignment: Alignment,
    ) -> Result<Arc<Self>> {
        validate_geometry(version, block_size, alignment)?;

        let lvm = Arc::clone(ctx.lvm());
        let vg = sd_uuid.to_string();
        let tags = domain_tags(version, class, block_size, alignment);
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        lvm.create_vg(&vg, devices, &tag_refs)?;
        for (lv, size) in [
            ("metadata", 512 * MEGAB),
            ("ids", 8 * MEGAB),
            ("leases", 2048 * MEGAB),
            ("inbox", 16 * MEGAB),
            ("outbox", 16 * MEGAB),
            ("master", 1024 * MEGAB),
        ] {
            lvm.create_lv(&vg, lv, size, &[], true)?;
        }

        info!(%sd_uuid, %version, %class, "created block domain");
        Self::attach_block(ctx, sd_uuid)
    }

    /// Attaches an existing block domain from its VG tags.
    pub fn attach_block(ctx: &Arc<Context>, sd_uuid: Uuid) -> Result<Arc<Self>> {
        let lvm = Arc::clone(ctx.lvm());
        let vg = lvm.get_vg(&sd_uuid.to_string())?;
        let (version, class, block_size, alignment) = parse_domain_tags(&vg.tags)?;
        validate_geometry(version, block_size, alignment)?;

        let backend = BlockDomain::new(sd_uuid, lvm);
        let lock = ClusterLock::new(
            sd_uuid,
            backend.lv_path("ids"),
            backend.lv_path("leases"),
            alignment,
            block_size,
            Arc::clone(ctx.lock_runner()),
        )?;
        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            sd_uuid,
            version,
            class,
            block_size,
            alignment,
            backend: Backend::Block(backend),
            lock,
        }))
    }

    /// Domain UUID.
    pub const fn sd_uuid(&self) -> Uuid {
        self.sd_uuid
    }

    /// Domain format version.
    pub const fn version(&self) -> DomainVersion {
        self.version
    }

    /// Domain class.
    pub const fn class(&self) -> DomainClass {
        self.class
    }

    /// Storage block size in bytes.
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Lease alignment.
    pub const fn alignment(&self) -> Alignment {
        self.alignment
    }

    /// The engine context this domain was attached through.
    pub const fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// The backend variant.
    pub const fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Whether this is a block (LVM) domain.
    pub const fn is_block(&self) -> bool {
        matches!(self.backend, Backend::Block(_))
    }

    /// Whether this is a backup domain (fake templates allowed).
    pub const fn is_backup(&self) -> bool {
        matches!(self.class, DomainClass::Backup)
    }

    /// The domain's cluster lock.
    pub const fn cluster_lease(&self) -> &ClusterLock {
        &self.lock
    }

    /// Whether volumes of this domain carry sanlock leases.
    pub const fn has_volume_leases(&self) -> bool {
        (self.version.number() >= 3) && !matches!(self.class, DomainClass::Iso)
    }

    /// qcow2 compat level for new overlays.
    pub fn qcow2_compat(&self) -> Qcow2Compat {
        if self.version.number() >= 4 {
            Qcow2Compat::from_config(&self.ctx.config().qcow2_compat)
                .unwrap_or(Qcow2Compat::V1_1)
        } else {
            Qcow2Compat::V0_10
        }
    }

    /// Whether the backend keeps unwritten ranges unallocated.
    pub const fn supports_sparseness(&self) -> bool {
        matches!(self.backend, Backend::File(_))
    }

    /// Whether `qemu-img convert` onto this domain should allow
    /// out-of-order writes for the given destination format.
    pub const fn recommends_unordered_writes(&self, format: VolumeFormat) -> bool {
        matches!(format, VolumeFormat::Raw) && !self.supports_sparseness()
    }

    /// Hard ceiling for a volume of `capacity` in the given format,
    /// qcow2 metadata overhead included.
    pub fn max_volume_size(&self, capacity: u64, format: VolumeFormat) -> u64 {
        match format {
            VolumeFormat::Cow => {
                let padded = (capacity as f64 * COW_OVERHEAD) as u64;
                round_up(padded, MEGAB)
            }
            _ => capacity,
        }
    }

    /// Binds an existing volume, verifying it is discoverable.
    pub fn produce_volume(self: &Arc<Self>, img_uuid: Uuid, vol_uuid: Uuid) -> Result<Volume> {
        let vol = Volume::new(Arc::clone(self), img_uuid, vol_uuid);
        vol.get_metadata()?;
        Ok(vol)
    }

    /// `volume → image` map for every live volume in the domain.
    pub fn get_all_volumes(&self) -> Result<HashMap<Uuid, Uuid>> {
        match &self.backend {
            Backend::File(f) => f.all_volumes(),
            Backend::Block(b) => b.all_volumes(),
        }
    }

    /// UUIDs of the volumes of one image.
    pub fn get_vols_of_image(&self, img_uuid: Uuid) -> Result<Vec<Uuid>> {
        match &self.backend {
            Backend::File(f) => f.list_image_volumes(img_uuid),
            Backend::Block(b) => b.list_image_volumes(img_uuid),
        }
    }

    /// Activates the given volumes of an image (no-op on file domains).
    pub fn activate_volumes(&self, vols: &[Uuid]) -> Result<()> {
        if let Backend::Block(b) = &self.backend {
            let names: Vec<String> = vols.iter().map(Uuid::to_string).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            b.lvm().activate_lvs(b.vg(), &refs)?;
        }
        Ok(())
    }

    /// Deactivates every volume of an image (no-op on file domains).
    pub fn deactivate_image(&self, img_uuid: Uuid) -> Result<()> {
        if let Backend::Block(b) = &self.backend {
            let vols = b.list_image_volumes(img_uuid)?;
            let names: Vec<String> = vols.iter().map(Uuid::to_string).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            b.lvm().deactivate_lvs(b.vg(), &refs)?;
        }
        Ok(())
    }

    /// Creates a volume per the creation contract and returns it bound.
    ///
    /// Ordering: storage allocation, preallocation, parent clone,
    /// permissions, metadata record last (the commit point), then the
    /// lease resource. Compensations for every stage are pushed on the
    /// task.
    pub fn create_volume(self: &Arc<Self>, args: CreateVolumeArgs, task: &Task) -> Result<Volume> {
        validate_create_volume_params(
            args.vol_format,
            args.src_vol_uuid,
            Some(args.preallocate),
        )?;
        if args.capacity == 0 {
            return Err(Error::InvalidParameter {
                name: "capacity",
                value: "0".to_owned(),
            });
        }
        if let Some(initial) = args.initial_size {
            if initial > args.capacity {
                return Err(Error::InvalidParameter {
                    name: "initial_size",
                    value: initial.to_string(),
                });
            }
            let allowed = match (&self.backend, args.vol_format, args.preallocate) {
                (Backend::File(_), VolumeFormat::Raw, VolumeType::Preallocated) => true,
                (Backend::Block(_), VolumeFormat::Cow, _) => true,
                _ => false,
            };
            if !allowed {
                return Err(Error::InvalidParameter {
                    name: "initial_size",
                    value: initial.to_string(),
                });
            }
        }

        if self.volume_artifacts_exist(args.img_uuid, args.vol_uuid)? {
            return Err(Error::VolumeAlreadyExists(args.vol_uuid));
        }

        // Resolve and validate the parent before touching storage.
        let parent = if args.src_vol_uuid == BLANK_UUID {
            None
        } else {
            let parent_img = if args.src_img_uuid == BLANK_UUID {
                args.img_uuid
            } else {
                args.src_img_uuid
            };
            let parent = self.produce_volume(parent_img, args.src_vol_uuid)?;
            let parent_cap = parent.capacity()?;
            if round_up(args.capacity, 4096) < round_up(parent_cap, 4096) {
                return Err(Error::InvalidParameter {
                    name: "capacity",
                    value: format!("{} < parent {parent_cap}", args.capacity),
                });
            }
            Some(parent)
        };

        info!(
            sd = %self.sd_uuid, img = %args.img_uuid, vol = %args.vol_uuid,
            format = %args.vol_format, capacity = args.capacity,
            "creating volume"
        );

        match &self.backend {
            Backend::File(_) => self.create_file_volume(&args, parent.as_ref(), task),
            Backend::Block(_) => self.create_block_volume(&args, parent.as_ref(), task),
        }
        .map_err(|e| match e {
            classified @ (Error::VolumeAlreadyExists(_)
            | Error::InvalidParameter { .. }
            | Error::ActionStopped) => classified,
            other => Error::VolumeCreationError {
                vol: args.vol_uuid,
                reason: other.to_string(),
            },
        })?;

        // Snapshot: the parent stops being the writable end of the chain.
        if let Some(parent) = &parent {
            if parent.is_leaf()? {
                parent.set_internal()?;
            }
        }

        self.produce_volume(args.img_uuid, args.vol_uuid)
    }

    fn volume_artifacts_exist(&self, img_uuid: Uuid, vol_uuid: Uuid) -> Result<bool> {
        match &self.backend {
            Backend::File(f) => f.io().path_exists(&f.vol_path(img_uuid, vol_uuid)),
            Backend::Block(b) => Ok(b.find_lv(vol_uuid).is_ok()),
        }
    }

    fn create_file_volume(
        self: &Arc<Self>,
        args: &CreateVolumeArgs,
        parent: Option<&Volume>,
        task: &Task,
    ) -> Result<()> {
        let Backend::File(f) = &self.backend else {
            unreachable!("file create on block domain");
        };
        let vol_path = f.vol_path(args.img_uuid, args.vol_uuid);
        f.io().create_dir_all(&f.image_dir(args.img_uuid))?;

        // A template from another image is hard-linked into this image
        // first, so the overlay's relative backing path resolves here.
        if let Some(parent) = parent {
            if parent.img_uuid() != args.img_uuid {
                parent.share_into(args.img_uuid)?;
            }
        }

        {
            let io = f.io().clone();
            let path = vol_path.clone();
            let meta = FileDomain::meta_path(&vol_path);
            task.push_recovery("halfbaked volume rollback", move || {
                let meta_exists = io.path_exists(&meta).unwrap_or(true);
                if !meta_exists {
                    let _ = io.unlink(&path);
                    let _ = io.unlink(&FileDomain::lease_path(&path));
                }
            });
        }

        match args.vol_format {
            VolumeFormat::Raw => {
                let alloc = args.initial_size.unwrap_or(args.capacity);
                exclusive_truncate(f, &vol_path, args.capacity, args.vol_uuid)?;
                if args.preallocate == VolumeType::Preallocated && alloc > 0 {
                    volume::fallocate(&vol_path, alloc, task)?;
                }
            }
            VolumeFormat::Cow => {
                exclusive_truncate(f, &vol_path, 0, args.vol_uuid)?;
                if let Some(parent) = parent {
                    parent.prepare(Prepare::read_only())?;
                    let backing = volume::backing_volume_path(args.img_uuid, parent.vol_uuid());
                    let result = qemuimg::create_qcow2(
                        &vol_path,
                        args.capacity,
                        self.qcow2_compat(),
                        Some((std::path::Path::new(&backing), parent.qemu_format()?)),
                    );
                    parent.teardown(true)?;
                    result?;
                } else {
                    qemuimg::create_qcow2(&vol_path, args.capacity, self.qcow2_compat(), None)?;
                }
            }
            VolumeFormat::Unknown => unreachable!("rejected by parameter validation"),
        }

        f.io().chmod(&vol_path, volume::VOLUME_PERMISSIONS_RW)?;

        // Metadata is the commit point; push its own rollback first.
        {
            let io = f.io().clone();
            let meta = FileDomain::meta_path(&vol_path);
            task.push_recovery("create volume metadata rollback", move || {
                let _ = io.unlink(&meta);
            });
        }
        let md = self.new_metadata_record(args, parent)?;
        f.write_metadata_text(args.img_uuid, args.vol_uuid, md.serialize(self.version)?)?;

        if self.has_volume_leases() {
            let lease_path = FileDomain::lease_path(&vol_path);
            f.io().truncate(&lease_path, 0, 0o660, false)?;
            self.lock.write_resource_at(
                &lease_path,
                &args.vol_uuid.to_string(),
                LEASE_FILEOFFSET,
            )?;
        }
        Ok(())
    }

    fn create_block_volume(
        self: &Arc<Self>,
        args: &CreateVolumeArgs,
        parent: Option<&Volume>,
        task: &Task,
    ) -> Result<()> {
        let Backend::Block(b) = &self.backend else {
            unreachable!("block create on file domain");
        };
        let config = self.ctx.config();
        let extent = config.extent_size();
        let lv_size = match args.vol_format {
            VolumeFormat::Raw => round_up(args.capacity, extent),
            VolumeFormat::Cow => {
                let initial = args.initial_size.unwrap_or(config.min_chunk());
                round_up(initial.max(config.min_chunk()), extent)
            }
            VolumeFormat::Unknown => unreachable!("rejected by parameter validation"),
        };

        let reservation = b.allocate_slot(self.sd_uuid, self.version)?;
        let slot = reservation.slot;
        let parent_uuid = parent.map_or(BLANK_UUID, Volume::vol_uuid);
        let tags = BlockDomain::initial_tags(args.img_uuid, parent_uuid, slot);
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();

        let vg = b.vg().to_owned();
        let lv = args.vol_uuid.to_string();
        b.lvm().create_lv(&vg, &lv, lv_size, &tag_refs, true)?;
        // The MD_ tag marks the slot used from here on.
        drop(reservation);

        {
            let lvm = Arc::clone(b.lvm());
            let vg_name = vg.clone();
            let lv_name = lv.clone();
            task.push_recovery("halfbaked volume rollback", move || {
                if let Ok(found) = lvm.get_lv(&vg_name, &lv_name) {
                    if found.tags.iter().any(|t| t == TAG_VOL_UNINIT) {
                        let _ = lvm.remove_lv(&vg_name, &lv_name);
                    }
                }
            });
        }

        if args.vol_format == VolumeFormat::Cow {
            let vol_path = b.vol_path(args.vol_uuid);
            if let Some(parent) = parent {
                parent.prepare(Prepare::read_only())?;
                let backing = format!("../{vg}/{parent_vol}", parent_vol = parent.vol_uuid());
                let result = qemuimg::create_qcow2(
                    &vol_path,
                    args.capacity,
                    self.qcow2_compat(),
                    Some((std::path::Path::new(&backing), parent.qemu_format()?)),
                );
                parent.teardown(true)?;
                result?;
            } else {
                qemuimg::create_qcow2(&vol_path, args.capacity, self.qcow2_compat(), None)?;
            }
        }

        let md = self.new_metadata_record(args, parent)?;
        b.write_slot(slot, &md.serialize(self.version)?)?;

        if self.has_volume_leases() {
            self.lock.write_resource(
                &args.vol_uuid.to_string(),
                self.lock.volume_lease_offset(slot),
            )?;
        }

        // Committed: drop the initializing marker.
        b.lvm().change_lv_tags(&vg, &lv, &[TAG_VOL_UNINIT], &[])?;
        Ok(())
    }

    fn new_metadata_record(
        &self,
        args: &CreateVolumeArgs,
        parent: Option<&Volume>,
    ) -> Result<VolumeMetadata> {
        Ok(VolumeMetadata {
            ctime: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            description: args.desc.clone(),
            disktype: args.disk_type,
            domain: self.sd_uuid,
            format: args.vol_format,
            image: args.img_uuid,
            legality: Legality::Legal,
            puuid: parent.map_or(BLANK_UUID, Volume::vol_uuid),
            capacity: args.capacity,
            vol_type: args.preallocate,
            role: VolumeRole::Leaf,
            generation: cowl_meta::DEFAULT_GENERATION,
        })
    }

    /// Deletes every volume of an image, leaf first.
    pub fn delete_image(
        self: &Arc<Self>,
        img_uuid: Uuid,
        post_zero: bool,
        discard: bool,
        task: &Task,
    ) -> Result<()> {
        let vols = self.get_vols_of_image(img_uuid)?;
        if vols.is_empty() {
            warn!(sd = %self.sd_uuid, img = %img_uuid, "delete of empty image");
            return Ok(());
        }

        // Leaf-first order: repeatedly remove volumes nothing points at.
        let mut parents: HashMap<Uuid, Uuid> = HashMap::new();
        for vol in &vols {
            let md = Volume::new(Arc::clone(self), img_uuid, *vol).get_metadata()?;
            parents.insert(*vol, md.puuid);
        }
        let mut remaining: Vec<Uuid> = vols;
        while !remaining.is_empty() {
            let childless: Vec<Uuid> = remaining
                .iter()
                .copied()
                .filter(|v| !remaining.iter().any(|other| parents.get(other) == Some(v)))
                .collect();
            if childless.is_empty() {
                return Err(Error::ImageIsNotLegalChain(img_uuid));
            }
            for vol in childless {
                let mut volume = Volume::new(Arc::clone(self), img_uuid, vol);
                // A template link from another image shares its inode with
                // the template's home; only the links may go, never the
                // metadata state.
                let md = volume.get_metadata()?;
                if md.role == VolumeRole::Shared && md.image != img_uuid {
                    if let Backend::File(f) = &self.backend {
                        let path = f.vol_path(img_uuid, vol);
                        f.io().unlink(&path)?;
                        f.io().unlink(&FileDomain::meta_path(&path))?;
                        f.io().unlink(&FileDomain::lease_path(&path))?;
                    }
                } else {
                    volume.delete(post_zero, true, discard, task)?;
                }
                remaining.retain(|v| *v != vol);
            }
        }

        if let Backend::File(f) = &self.backend {
            f.io().remove_dir_all(&f.image_dir(img_uuid))?;
        }
        Ok(())
    }

    /// Deletes an image after zeroing its payloads.
    pub fn zero_image(
        self: &Arc<Self>,
        img_uuid: Uuid,
        discard: bool,
        task: &Task,
    ) -> Result<()> {
        self.delete_image(img_uuid, true, discard, task)
    }

    /// Re-creates the hard links realising a template inside an image
    /// directory (file domains; block volumes are shared by reference).
    ///
    /// `vol_uuid` is a hint: the template itself, or any volume of the
    /// image whose chain base references one.
    pub fn template_relink(self: &Arc<Self>, img_uuid: Uuid, vol_uuid: Uuid) -> Result<()> {
        let Backend::File(f) = &self.backend else {
            return Ok(());
        };
        let Some(template) = self.referenced_template(img_uuid, vol_uuid)? else {
            return Ok(());
        };
        let Some(home_img) = self.find_volume_home(template)? else {
            return Err(Error::VolumeDoesNotExist(template));
        };
        if home_img == img_uuid {
            return Ok(());
        }
        let src = f.vol_path(home_img, template);
        let dst = f.vol_path(img_uuid, template);
        info!(sd = %self.sd_uuid, img = %img_uuid, vol = %template, "relinking template");
        for (from, to) in [
            (src.clone(), dst.clone()),
            (FileDomain::meta_path(&src), FileDomain::meta_path(&dst)),
            (FileDomain::lease_path(&src), FileDomain::lease_path(&dst)),
        ] {
            if f.io().path_exists(&from)? {
                f.io().unlink(&to)?;
                f.io().hard_link(&from, &to)?;
            }
        }
        Ok(())
    }

    /// The template an image references: a linked shared volume, the
    /// hint itself when it lives in another image, or the dangling
    /// parent of the chain base.
    fn referenced_template(
        self: &Arc<Self>,
        img_uuid: Uuid,
        hint: Uuid,
    ) -> Result<Option<Uuid>> {
        let vols = self.get_vols_of_image(img_uuid)?;
        for vol in &vols {
            let md = Volume::new(Arc::clone(self), img_uuid, *vol).get_metadata()?;
            if md.image != img_uuid {
                return Ok(Some(*vol));
            }
            if md.puuid != BLANK_UUID && !vols.contains(&md.puuid) {
                return Ok(Some(md.puuid));
            }
        }
        if !vols.contains(&hint) {
            if let Some(home) = self.find_volume_home(hint)? {
                if home != img_uuid {
                    return Ok(Some(hint));
                }
            }
        }
        Ok(None)
    }

    /// The image whose metadata record owns the volume (file domains).
    fn find_volume_home(&self, vol_uuid: Uuid) -> Result<Option<Uuid>> {
        let Backend::File(f) = &self.backend else {
            return Ok(None);
        };
        for img in f.list_images()? {
            let Ok(text) = f.read_metadata_text(img, vol_uuid) else {
                continue;
            };
            if let Ok(md) = VolumeMetadata::parse(&text) {
                if md.image == img {
                    return Ok(Some(img));
                }
            }
        }
        Ok(None)
    }
}

fn exclusive_truncate(
    f: &FileDomain,
    path: &std::path::Path,
    size: u64,
    vol_uuid: Uuid,
) -> Result<()> {
    f.io()
        .truncate(path, size, volume::VOLUME_PERMISSIONS_RW, true)
        .map_err(|e| match e {
            Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::AlreadyExists => {
                Error::VolumeAlreadyExists(vol_uuid)
            }
            other => other,
        })
}

/// Serialized domain record (file domains).
fn domain_record(
    sd_uuid: Uuid,
    version: DomainVersion,
    class: DomainClass,
    block_size: u64,
    alignment: Alignment,
) -> String {
    format!(
        "SDUUID={sd_uuid}\nVERSION={version}\nCLASS={class}\n\
         BLOCK_SIZE={block_size}\nALIGNMENT={alignment}\nEOF\n",
        alignment = alignment.bytes()
    )
}

#[derive(Debug)]
struct DomainRecord {
    sd_uuid: Uuid,
    version: DomainVersion,
    class: DomainClass,
    block_size: u64,
    alignment: Alignment,
}

fn parse_domain_record(text: &str) -> Result<DomainRecord> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in text.lines() {
        if line == "EOF" {
            break;
        }
        if let Some((key, value)) = line.split_once('=') {
            fields.insert(key, value);
        }
    }
    let get = |key: &'static str| {
        fields.get(key).copied().ok_or(Error::InvalidParameter {
            name: "domain_record",
            value: format!("missing {key}"),
        })
    };
    let sd_uuid = get("SDUUID")?.parse().map_err(|_| Error::InvalidParameter {
        name: "SDUUID",
        value: fields.get("SDUUID").copied().unwrap_or_default().to_owned(),
    })?;
    let version = DomainVersion::from_number(get("VERSION")?.parse().unwrap_or(u32::MAX))?;
    let class = DomainClass::parse(get("CLASS")?)?;
    let block_size = get("BLOCK_SIZE")?.parse().unwrap_or(0);
    let alignment = Alignment::from_bytes(get("ALIGNMENT")?.parse().unwrap_or(0))?;
    Ok(DomainRecord {
        sd_uuid,
        version,
        class,
        block_size,
        alignment,
    })
}

/// Domain descriptor tags on a block domain's VG.
fn domain_tags(
    version: DomainVersion,
    class: DomainClass,
    block_size: u64,
    alignment: Alignment,
) -> Vec<String> {
    vec![
        format!("MDT_VERSION_{version}"),
        format!("MDT_CLASS_{class}"),
        format!("MDT_BLOCK_SIZE_{block_size}"),
        format!("MDT_ALIGNMENT_{}", alignment.bytes()),
    ]
}

fn parse_domain_tags(tags: &[String]) -> Result<(DomainVersion, DomainClass, u64, Alignment)> {
    let mut version = None;
    let mut class = None;
    let mut block_size = None;
    let mut alignment = None;
    for tag in tags {
        if let Some(v) = tag.strip_prefix("MDT_VERSION_") {
            version = DomainVersion::from_number(v.parse().unwrap_or(u32::MAX)).ok();
        } else if let Some(v) = tag.strip_prefix("MDT_CLASS_") {
            class = DomainClass::parse(v).ok();
        } else if let Some(v) = tag.strip_prefix("MDT_BLOCK_SIZE_") {
            block_size = v.parse().ok();
        } else if let Some(v) = tag.strip_prefix("MDT_ALIGNMENT_") {
            alignment = v.parse().ok().and_then(|b| Alignment::from_bytes(b).ok());
        }
    }
    match (version, class, block_size, alignment) {
        (Some(v), Some(c), Some(b), Some(a)) => Ok((v, c, b, a)),
        _ => Err(Error::InvalidParameter {
            name: "domain_tags",
            value: tags.join(","),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn domain_record_roundtrip() {
        let sd = Uuid::new_v4();
        let text = domain_record(sd, DomainVersion::V5, DomainClass::Data, 512, Alignment::M1);
        let record = parse_domain_record(&text).unwrap();
        assert_eq!(record.sd_uuid, sd);
        assert_eq!(record.version, DomainVersion::V5);
        assert_eq!(record.class, DomainClass::Data);
        assert_eq!(record.block_size, 512);
        assert_eq!(record.alignment, Alignment::M1);
    }

    #[test]
    fn domain_tags_roundtrip() {
        let tags = domain_tags(DomainVersion::V4, DomainClass::Backup, 512, Alignment::M1);
        let (version, class, block_size, alignment) = parse_domain_tags(&tags).unwrap();
        assert_eq!(version, DomainVersion::V4);
        assert_eq!(class, DomainClass::Backup);
        assert_eq!(block_size, 512);
        assert_eq!(alignment, Alignment::M1);
    }

    #[test]
    fn legacy_versions_require_512_1m() {
        assert!(validate_geometry(DomainVersion::V4, 4096, Alignment::M1).is_err());
        assert!(validate_geometry(DomainVersion::V4, 512, Alignment::M2).is_err());
        validate_geometry(DomainVersion::V4, 512, Alignment::M1).unwrap();
        validate_geometry(DomainVersion::V5, 4096, Alignment::M8).unwrap();
    }

    #[test]
    fn max_volume_size_padding() {
        let ctx = Context::new_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let dom = StorageDomain::create_file(
            &ctx,
            dir.path(),
            Uuid::new_v4(),
            DomainVersion::V5,
            DomainClass::Data,
            512,
            Alignment::M1,
        )
        .unwrap();
        assert_eq!(dom.max_volume_size(10 * MEGAB, VolumeFormat::Raw), 10 * MEGAB);
        let cow = dom.max_volume_size(10 * MEGAB, VolumeFormat::Cow);
        assert!(cow >= 11 * MEGAB);
        assert_eq!(cow % MEGAB, 0);
    }
}

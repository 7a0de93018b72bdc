//! The volume manifest: one COW overlay (or RAW base) and its metadata,
//! payload, and lease.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use cowl_meta::{
    BLANK_UUID, BLOCK_SIZE_512, DiskType, Legality, REMOVED_IMAGE_PREFIX, TAG_PREFIX_IMAGE,
    TAG_PREFIX_PARENT, VolumeFormat, VolumeMetadata, VolumeRole, VolumeType, round_up,
};
use rand::Rng as _;
use rand::distr::Alphanumeric;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ErrorCollector;
use crate::qemuimg::{self, Format};
use crate::sd::{Backend, FileDomain, StorageDomain};
use crate::task::Task;
use crate::{Error, Result, proc};

/// Mode bits of a writable volume artifact.
pub const VOLUME_PERMISSIONS_RW: u32 = 0o660;

/// Mode bits of a read-only (internal/shared) volume artifact.
pub const VOLUME_PERMISSIONS_RO: u32 = 0o440;

/// Length of the random part in `_remove_me_` names.
const RENAME_RANDOM_LEN: usize = 8;

/// The relative backing path stored in a child's qcow2 header.
///
/// Volumes of an image sit in one directory, so the parent is reachable
/// as `../<imgUUID>/<parentUUID>` and the recorded basename equals the
/// parent UUID.
pub fn backing_volume_path(img_uuid: Uuid, vol_uuid: Uuid) -> String {
    format!("../{img_uuid}/{vol_uuid}")
}

/// `_remove_me_<random>_<uuid>` rename target for deleted payloads.
pub fn deleted_volume_name(vol_uuid: Uuid) -> String {
    let random: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(RENAME_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{REMOVED_IMAGE_PREFIX}{random}_{vol_uuid}")
}

/// Preallocates `length` bytes at the head of `path` with the
/// `fallocate` utility; abortable through `task`.
pub fn fallocate(path: &std::path::Path, length: u64, task: &Task) -> Result<()> {
    let mut cmd = Command::new("fallocate");
    cmd.arg("-l").arg(length.to_string()).arg(path);
    proc::run_abortable(cmd, "fallocate", task)?;
    Ok(())
}

/// How [`Volume::prepare`] should ready the volume.
#[derive(Debug, Clone, Copy)]
pub struct Prepare {
    /// Grant write access to this volume.
    pub rw: bool,
    /// Only this volume, not its parent chain.
    pub justme: bool,
    /// Grant write access along the whole chain.
    pub chainrw: bool,
    /// Rewrite permissions to match the requested access.
    pub setrw: bool,
    /// Skip the legality check (deletion paths).
    pub force: bool,
}

impl Prepare {
    /// Read-only access to this volume alone.
    pub const fn read_only() -> Self {
        Self {
            rw: false,
            justme: true,
            chainrw: false,
            setrw: false,
            force: false,
        }
    }

    /// Read-only access to the whole chain.
    pub const fn read_chain() -> Self {
        Self {
            rw: false,
            justme: false,
            chainrw: false,
            setrw: false,
            force: false,
        }
    }

    /// Read-write on the tip, read-only parents.
    pub const fn read_write() -> Self {
        Self {
            rw: true,
            justme: false,
            chainrw: false,
            setrw: true,
            force: false,
        }
    }

    /// Read-write along the whole chain (rebase, inter-domain copy).
    pub const fn read_write_chain() -> Self {
        Self {
            rw: true,
            justme: false,
            chainrw: true,
            setrw: true,
            force: false,
        }
    }

    /// Marks the prepare as forced (ignores ILLEGAL).
    pub const fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Restricts the prepare to this volume.
    pub const fn only_self(mut self) -> Self {
        self.justme = true;
        self
    }
}

/// One volume of an image on a storage domain.
#[derive(Debug, Clone)]
pub struct Volume {
    dom: Arc<StorageDomain>,
    img_uuid: Uuid,
    vol_uuid: Uuid,
}

impl Volume {
    /// Binds without validation; [`StorageDomain::produce_volume`] is the
    /// checked path.
    pub(crate) const fn new(dom: Arc<StorageDomain>, img_uuid: Uuid, vol_uuid: Uuid) -> Self {
        Self {
            dom,
            img_uuid,
            vol_uuid,
        }
    }

    /// The owning domain.
    pub const fn dom(&self) -> &Arc<StorageDomain> {
        &self.dom
    }

    /// The owning image.
    pub const fn img_uuid(&self) -> Uuid {
        self.img_uuid
    }

    /// This volume's UUID.
    pub const fn vol_uuid(&self) -> Uuid {
        self.vol_uuid
    }

    /// Payload path: a file or an LV device node.
    pub fn path(&self) -> PathBuf {
        match self.dom.backend() {
            Backend::File(f) => f.vol_path(self.img_uuid, self.vol_uuid),
            Backend::Block(b) => b.vol_path(self.vol_uuid),
        }
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Reads and decodes the metadata record.
    pub fn get_metadata(&self) -> Result<VolumeMetadata> {
        let text = match self.dom.backend() {
            Backend::File(f) => f.read_metadata_text(self.img_uuid, self.vol_uuid)?,
            Backend::Block(b) => {
                let slot = b.md_slot(self.vol_uuid)?;
                b.read_slot(slot)?
            }
        };
        VolumeMetadata::parse(&text).map_err(|e| Error::VolumeMetadataReadError {
            vol: self.vol_uuid,
            reason: e.to_string(),
        })
    }

    /// Atomically replaces the metadata record.
    pub fn set_metadata(&self, md: &VolumeMetadata) -> Result<()> {
        let text = md
            .serialize(self.dom.version())
            .map_err(|e| Error::VolumeMetadataWriteError {
                vol: self.vol_uuid,
                reason: e.to_string(),
            })?;
        match self.dom.backend() {
            Backend::File(f) => f.write_metadata_text(self.img_uuid, self.vol_uuid, text),
            Backend::Block(b) => {
                let slot = b.md_slot(self.vol_uuid)?;
                b.write_slot(slot, &text)
                    .map_err(|e| Error::VolumeMetadataWriteError {
                        vol: self.vol_uuid,
                        reason: e.to_string(),
                    })
            }
        }
    }

    /// Read-modify-write on the metadata record.
    pub fn update_metadata(&self, f: impl FnOnce(&mut VolumeMetadata)) -> Result<VolumeMetadata> {
        let mut md = self.get_metadata()?;
        f(&mut md);
        self.set_metadata(&md)?;
        Ok(md)
    }

    /// Removes the metadata record (file sidecar or slot contents).
    pub fn remove_metadata(&self) -> Result<()> {
        match self.dom.backend() {
            Backend::File(f) => f
                .io()
                .unlink(&FileDomain::meta_path(&self.path())),
            Backend::Block(b) => {
                let slot = b.md_slot(self.vol_uuid)?;
                b.clear_slot(slot)
            }
        }
    }

    /// Bumps the conflicting-writer generation, wrapping at the cap.
    pub fn bump_generation(&self) -> Result<u32> {
        let md = self.update_metadata(|md| md.generation = md.next_generation())?;
        Ok(md.generation)
    }

    // ------------------------------------------------------------------
    // Attribute shorthands
    // ------------------------------------------------------------------

    /// Virtual capacity in bytes.
    pub fn capacity(&self) -> Result<u64> {
        Ok(self.get_metadata()?.capacity)
    }

    /// On-disk format.
    pub fn format(&self) -> Result<VolumeFormat> {
        Ok(self.get_metadata()?.format)
    }

    /// Allocation policy.
    pub fn vol_type(&self) -> Result<VolumeType> {
        Ok(self.get_metadata()?.vol_type)
    }

    /// Role in the chain.
    pub fn role(&self) -> Result<VolumeRole> {
        Ok(self.get_metadata()?.role)
    }

    /// Parent volume UUID, or blank.
    pub fn get_parent(&self) -> Result<Uuid> {
        Ok(self.get_metadata()?.puuid)
    }

    /// Payload role tag.
    pub fn disk_type(&self) -> Result<DiskType> {
        Ok(self.get_metadata()?.disktype)
    }

    /// Whether this volume is the writable chain end.
    pub fn is_leaf(&self) -> Result<bool> {
        Ok(self.role()? == VolumeRole::Leaf)
    }

    /// Whether this volume is a shared template.
    pub fn is_shared(&self) -> Result<bool> {
        Ok(self.role()? == VolumeRole::Shared)
    }

    /// Whether this volume is an internal chain layer.
    pub fn is_internal(&self) -> Result<bool> {
        Ok(self.role()? == VolumeRole::Internal)
    }

    /// Whether reads may be served from this volume.
    pub fn is_legal(&self) -> Result<bool> {
        Ok(self.get_metadata()?.legality == Legality::Legal)
    }

    /// Whether this is a placeholder template.
    pub fn is_fake(&self) -> Result<bool> {
        Ok(self.get_metadata()?.legality == Legality::Fake)
    }

    /// The qemu format of the payload.
    pub fn qemu_format(&self) -> Result<Format> {
        match self.format()? {
            VolumeFormat::Raw => Ok(Format::Raw),
            VolumeFormat::Cow => Ok(Format::Qcow2),
            VolumeFormat::Unknown => Err(Error::InvalidParameter {
                name: "format",
                value: "UNKNOWN".to_owned(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Attribute mutation
    // ------------------------------------------------------------------

    /// Sets the legality marker.
    pub fn set_legality(&self, legality: Legality) -> Result<()> {
        info!(vol = %self.vol_uuid, ?legality, "setting legality");
        self.update_metadata(|md| md.legality = legality)?;
        Ok(())
    }

    /// Sets the allocation policy recorded in metadata.
    pub fn set_type(&self, vol_type: VolumeType) -> Result<()> {
        self.update_metadata(|md| md.vol_type = vol_type)?;
        Ok(())
    }

    /// Demotes the volume to an internal, read-only chain layer.
    pub fn set_internal(&self) -> Result<()> {
        self.update_metadata(|md| md.role = VolumeRole::Internal)?;
        self.set_rw(false)
    }

    /// Marks the volume as a shared template.
    pub fn set_shared(&self) -> Result<()> {
        self.update_metadata(|md| md.role = VolumeRole::Shared)?;
        self.set_rw(false)
    }

    /// Promotes the volume to the writable chain end.
    pub fn set_leaf(&self) -> Result<()> {
        self.update_metadata(|md| md.role = VolumeRole::Leaf)?;
        self.set_rw(true)
    }

    /// Updates the parent pointer in the metadata record.
    pub fn set_parent_meta(&self, puuid: Uuid) -> Result<()> {
        self.update_metadata(|md| md.puuid = puuid)?;
        Ok(())
    }

    /// Updates the `PU_` tag (block domains; file domains keep no tags).
    pub fn set_parent_tag(&self, puuid: Uuid) -> Result<()> {
        let Backend::Block(b) = self.dom.backend() else {
            return Ok(());
        };
        let old = self.get_parent()?;
        let del = format!("{TAG_PREFIX_PARENT}{old}");
        let add = format!("{TAG_PREFIX_PARENT}{puuid}");
        b.lvm().change_lv_tags(
            b.vg(),
            &self.vol_uuid.to_string(),
            &[del.as_str()],
            &[add.as_str()],
        )?;
        Ok(())
    }

    /// Updates the parent pointer everywhere it is recorded.
    pub fn set_parent(&self, puuid: Uuid) -> Result<()> {
        self.set_parent_tag(puuid)?;
        self.set_parent_meta(puuid)
    }

    /// Applies read-write or read-only access to the payload.
    pub fn set_rw(&self, rw: bool) -> Result<()> {
        match self.dom.backend() {
            Backend::File(f) => f.io().chmod(
                &self.path(),
                if rw {
                    VOLUME_PERMISSIONS_RW
                } else {
                    VOLUME_PERMISSIONS_RO
                },
            ),
            Backend::Block(b) => {
                b.lvm()
                    .set_lv_writable(b.vg(), &self.vol_uuid.to_string(), rw)?;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Chain navigation
    // ------------------------------------------------------------------

    /// The parent volume, when one exists.
    pub fn get_parent_volume(&self) -> Result<Option<Volume>> {
        let puuid = self.get_parent()?;
        if puuid == BLANK_UUID {
            return Ok(None);
        }
        Ok(Some(Self::new(
            Arc::clone(&self.dom),
            self.img_uuid,
            puuid,
        )))
    }

    /// Volumes of this image whose parent is this volume.
    pub fn get_children(&self) -> Result<Vec<Uuid>> {
        let mut children = Vec::new();
        for vol in self.dom.get_vols_of_image(self.img_uuid)? {
            if vol == self.vol_uuid {
                continue;
            }
            let sibling = Self::new(Arc::clone(&self.dom), self.img_uuid, vol);
            if sibling.get_parent()? == self.vol_uuid {
                children.push(vol);
            }
        }
        Ok(children)
    }

    /// Returns the volume to LEAF when its last child detached.
    pub fn recheck_if_leaf(&self) -> Result<bool> {
        if self.is_shared()? {
            return Ok(false);
        }
        if self.is_internal()? && self.get_children()?.is_empty() {
            info!(vol = %self.vol_uuid, "volume has no children again, promoting to leaf");
            self.set_leaf()?;
            return Ok(true);
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Sizes
    // ------------------------------------------------------------------

    /// Logical size of the payload in bytes (file length or LV size).
    pub fn size(&self) -> Result<u64> {
        match self.dom.backend() {
            Backend::File(f) => f.io().size(&self.path()),
            Backend::Block(b) => Ok(b.find_lv(self.vol_uuid)?.size),
        }
    }

    /// On-disk allocation in bytes.
    pub fn apparent_size(&self) -> Result<u64> {
        match self.dom.backend() {
            Backend::File(f) => f.io().apparent_size(&self.path()),
            Backend::Block(b) => Ok(b.find_lv(self.vol_uuid)?.size),
        }
    }

    /// Whether the volume grows in configured chunks (thin block COW).
    pub fn chunked(&self) -> Result<bool> {
        Ok(self.dom.is_block() && self.format()? == VolumeFormat::Cow)
    }

    /// The size this volume should be shrunk to, in bytes.
    ///
    /// RAW volumes are their capacity. COW on file reports the current
    /// apparent size (file COW volumes are not reduced). COW on block is
    /// the qcow2 end offset plus one chunk, extent-rounded and capped at
    /// capacity.
    pub fn optimal_size(&self) -> Result<u64> {
        let md = self.get_metadata()?;
        match (md.format, self.dom.backend()) {
            (VolumeFormat::Raw, _) | (VolumeFormat::Unknown, _) => Ok(md.capacity),
            (VolumeFormat::Cow, Backend::File(_)) => self.apparent_size(),
            (VolumeFormat::Cow, Backend::Block(_)) => {
                let config = self.dom.ctx().config();
                let end = qemuimg::check(&self.path())?
                    .image_end_offset
                    .unwrap_or(self.apparent_size()?);
                let padded = round_up(end + config.chunk_size(), config.extent_size());
                Ok(padded.min(md.capacity).max(config.min_chunk()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Prepare / teardown
    // ------------------------------------------------------------------

    /// Readies the volume (and by default its parent chain) for I/O.
    pub fn prepare(&self, args: Prepare) -> Result<()> {
        let md = self.get_metadata()?;
        if !args.force && md.legality == Legality::Illegal {
            return Err(Error::VolumeDoesNotExist(self.vol_uuid));
        }
        if args.setrw {
            self.set_rw(args.rw)?;
        }
        if let Backend::Block(b) = self.dom.backend() {
            let name = self.vol_uuid.to_string();
            b.lvm().activate_lvs(b.vg(), &[name.as_str()])?;
        }
        if !args.justme {
            if let Some(parent) = self.get_parent_volume()? {
                let parent_args = Prepare {
                    rw: args.chainrw,
                    justme: false,
                    chainrw: args.chainrw,
                    setrw: args.setrw,
                    force: args.force,
                };
                parent.prepare(parent_args)?;
            }
        }
        Ok(())
    }

    /// Releases what [`Volume::prepare`] took; a no-op on file domains.
    pub fn teardown(&self, justme: bool) -> Result<()> {
        if let Backend::Block(b) = self.dom.backend() {
            let name = self.vol_uuid.to_string();
            b.lvm().deactivate_lvs(b.vg(), &[name.as_str()])?;
        }
        if !justme {
            if let Some(parent) = self.get_parent_volume()? {
                parent.teardown(false)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Storage growth
    // ------------------------------------------------------------------

    /// Grows the underlying storage to `new_size_blk × 512` bytes.
    pub fn extend(&self, new_size_blk: u64, task: &Task) -> Result<()> {
        let new_size = new_size_blk * BLOCK_SIZE_512;
        match self.dom.backend() {
            Backend::File(f) => {
                let current = f.io().size(&self.path())?;
                if new_size <= current {
                    return Ok(());
                }
                if self.vol_type()? == VolumeType::Preallocated {
                    fallocate(&self.path(), new_size, task)?;
                } else {
                    f.io()
                        .truncate(&self.path(), new_size, VOLUME_PERMISSIONS_RW, false)?;
                }
                Ok(())
            }
            Backend::Block(b) => {
                let extent = self.dom.ctx().config().extent_size();
                let rounded = round_up(new_size, extent);
                if rounded <= b.find_lv(self.vol_uuid)?.size {
                    return Ok(());
                }
                b.lvm()
                    .extend_lv(b.vg(), &self.vol_uuid.to_string(), rounded)?;
                Ok(())
            }
        }
    }

    /// Shrinks the underlying storage to `new_size_blk × 512` bytes.
    ///
    /// Never reduces below the qcow2 tail: callers compute the target via
    /// [`Volume::optimal_size`].
    pub fn reduce(&self, new_size_blk: u64) -> Result<()> {
        let new_size = new_size_blk * BLOCK_SIZE_512;
        match self.dom.backend() {
            Backend::File(f) => {
                let current = f.io().size(&self.path())?;
                if new_size >= current {
                    return Ok(());
                }
                f.io()
                    .truncate(&self.path(), new_size, VOLUME_PERMISSIONS_RW, false)
            }
            Backend::Block(b) => {
                let extent = self.dom.ctx().config().extent_size();
                let rounded = round_up(new_size, extent);
                if rounded >= b.find_lv(self.vol_uuid)?.size {
                    return Ok(());
                }
                b.lvm()
                    .reduce_lv(b.vg(), &self.vol_uuid.to_string(), rounded)?;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Rebase
    // ------------------------------------------------------------------

    /// Repoints this overlay at `new_parent` and records the new linkage.
    ///
    /// With `rollback`, a compensation that restores the previous backing
    /// pointer and parent records is pushed on the task first.
    pub fn rebase(
        &self,
        new_parent: Uuid,
        backing: &str,
        backing_format: Option<Format>,
        unsafe_mode: bool,
        rollback: bool,
        task: &Task,
    ) -> Result<()> {
        if rollback {
            let me = self.clone();
            let old_parent = self.get_parent()?;
            task.push_recovery("rebase rollback", move || {
                if old_parent == BLANK_UUID {
                    return;
                }
                let old_backing = backing_volume_path(me.img_uuid, old_parent);
                let rollback_task = Task::new();
                let format = match me.qemu_format() {
                    Ok(format) => format,
                    Err(_) => return,
                };
                if qemuimg::rebase(
                    &me.path(),
                    &old_backing,
                    format,
                    None,
                    true,
                    &rollback_task,
                )
                .is_err()
                {
                    warn!(vol = %me.vol_uuid, "rebase rollback failed");
                    return;
                }
                let _ = me.set_parent(old_parent);
            });
        }

        qemuimg::rebase(
            &self.path(),
            backing,
            self.qemu_format()?,
            backing_format,
            unsafe_mode,
            task,
        )?;
        self.set_parent(new_parent)
    }

    // ------------------------------------------------------------------
    // Rename / share / delete
    // ------------------------------------------------------------------

    /// Renames the volume and its sidecars, updating this handle.
    pub fn rename(&mut self, new_uuid: Uuid, task: &Task, recovery: bool) -> Result<()> {
        info!(vol = %self.vol_uuid, %new_uuid, "renaming volume");
        match self.dom.backend() {
            Backend::File(f) => {
                let old_path = self.path();
                let new_path = f.vol_path(self.img_uuid, new_uuid);
                let pairs = [
                    (old_path.clone(), new_path.clone()),
                    (
                        FileDomain::meta_path(&old_path),
                        FileDomain::meta_path(&new_path),
                    ),
                    (
                        FileDomain::lease_path(&old_path),
                        FileDomain::lease_path(&new_path),
                    ),
                ];
                for (i, (from, to)) in pairs.iter().enumerate() {
                    let lease = i == 2;
                    if lease && !f.io().path_exists(from)? {
                        continue;
                    }
                    if recovery {
                        let io = f.io().clone();
                        let back_from = to.clone();
                        let back_to = from.clone();
                        task.push_recovery(
                            format!("rename rollback: {}", back_from.display()),
                            move || {
                                let _ = io.rename(&back_from, &back_to);
                            },
                        );
                    }
                    f.io().rename(from, to)?;
                }
            }
            Backend::Block(b) => {
                let old_name = self.vol_uuid.to_string();
                let new_name = new_uuid.to_string();
                if recovery {
                    let lvm = Arc::clone(b.lvm());
                    let vg = b.vg().to_owned();
                    let back_from = new_name.clone();
                    let back_to = old_name.clone();
                    task.push_recovery(format!("rename rollback: {back_from}"), move || {
                        let _ = lvm.rename_lv(&vg, &back_from, &back_to);
                    });
                }
                b.lvm().rename_lv(b.vg(), &old_name, &new_name)?;
            }
        }
        self.vol_uuid = new_uuid;
        Ok(())
    }

    /// Renames the volume aside under a `_remove_me_` name so a garbage
    /// collector can find it; drops image membership first on block
    /// domains. The handle is dead afterwards.
    pub fn rename_to_garbage(&mut self, task: &Task) -> Result<String> {
        let garbage = deleted_volume_name(self.vol_uuid);
        info!(vol = %self.vol_uuid, %garbage, "renaming volume aside");
        match self.dom.backend() {
            Backend::File(f) => {
                let old_path = self.path();
                let new_path = f.image_dir(self.img_uuid).join(&garbage);
                for (from, to) in [
                    (old_path.clone(), new_path.clone()),
                    (
                        FileDomain::meta_path(&old_path),
                        FileDomain::meta_path(&new_path),
                    ),
                    (
                        FileDomain::lease_path(&old_path),
                        FileDomain::lease_path(&new_path),
                    ),
                ] {
                    if !f.io().path_exists(&from)? {
                        continue;
                    }
                    let io = f.io().clone();
                    let back_from = to.clone();
                    let back_to = from.clone();
                    task.push_recovery(
                        format!("garbage rename rollback: {}", back_from.display()),
                        move || {
                            let _ = io.rename(&back_from, &back_to);
                        },
                    );
                    f.io().rename(&from, &to)?;
                }
            }
            Backend::Block(b) => {
                let old_name = self.vol_uuid.to_string();
                let image_tag = format!("{TAG_PREFIX_IMAGE}{}", self.img_uuid);
                b.lvm()
                    .change_lv_tags(b.vg(), &old_name, &[image_tag.as_str()], &[])?;
                {
                    let lvm = Arc::clone(b.lvm());
                    let vg = b.vg().to_owned();
                    let back_from = garbage.clone();
                    let back_to = old_name.clone();
                    let tag = image_tag.clone();
                    task.push_recovery(format!("garbage rename rollback: {back_from}"), move || {
                        let _ = lvm.rename_lv(&vg, &back_from, &back_to);
                        let _ = lvm.change_lv_tags(&vg, &back_to, &[], &[tag.as_str()]);
                    });
                }
                b.lvm().rename_lv(b.vg(), &old_name, &garbage)?;
            }
        }
        Ok(garbage)
    }

    /// Hard-links the payload, record and lease into another image
    /// directory (file template sharing; block volumes share by
    /// reference).
    pub fn share_into(&self, dst_img: Uuid) -> Result<()> {
        let Backend::File(f) = self.dom.backend() else {
            return Ok(());
        };
        let src = self.path();
        let dst_dir = f.image_dir(dst_img);
        f.io().create_dir_all(&dst_dir)?;
        let dst = f.vol_path(dst_img, self.vol_uuid);
        for (from, to) in [
            (src.clone(), dst.clone()),
            (FileDomain::meta_path(&src), FileDomain::meta_path(&dst)),
            (FileDomain::lease_path(&src), FileDomain::lease_path(&dst)),
        ] {
            if !f.io().path_exists(&from)? {
                continue;
            }
            if f.io().path_exists(&to)? {
                f.io().unlink(&to)?;
            }
            f.io().hard_link(&from, &to)?;
        }
        Ok(())
    }

    /// Overwrites the payload with zeroes before deletion.
    pub fn zero(&self, task: &Task) -> Result<()> {
        info!(vol = %self.vol_uuid, "zeroing volume payload");
        match self.dom.backend() {
            Backend::File(f) => f.io().zero(&self.path()),
            Backend::Block(_) => {
                let mut cmd = Command::new("blkdiscard");
                cmd.arg("-z").arg(self.path());
                proc::run_abortable(cmd, "blkdiscard", task)?;
                Ok(())
            }
        }
    }

    /// Issues a discard for the payload (block domains only).
    pub fn discard(&self, task: &Task) -> Result<()> {
        if !self.dom.is_block() {
            return Err(Error::DiscardNotSupported(self.dom.sd_uuid()));
        }
        let mut cmd = Command::new("blkdiscard");
        cmd.arg(self.path());
        proc::run_abortable(cmd, "blkdiscard", task)?;
        Ok(())
    }

    /// Checks that an unforced delete is allowed.
    fn validate_delete(&self) -> Result<()> {
        if self.is_shared()? {
            return Err(Error::InvalidParameter {
                name: "vol_uuid",
                value: format!("{} is shared", self.vol_uuid),
            });
        }
        let children = self.get_children()?;
        if !children.is_empty() {
            return Err(Error::InvalidParameter {
                name: "vol_uuid",
                value: format!("{} has children", self.vol_uuid),
            });
        }
        Ok(())
    }

    /// Deletes the volume: lineage fix-up, ILLEGAL mark, payload and
    /// lease removal, metadata removal.
    ///
    /// Every cleanup step runs even after one fails; the first captured
    /// error is raised at the end. A partially deleted volume stays
    /// ILLEGAL and is never used to satisfy reads.
    pub fn delete(&mut self, post_zero: bool, force: bool, discard: bool, task: &Task) -> Result<()> {
        info!(vol = %self.vol_uuid, post_zero, force, discard, "deleting volume");
        if discard && !self.dom.is_block() {
            return Err(Error::DiscardNotSupported(self.dom.sd_uuid()));
        }
        if !force {
            self.validate_delete()?;
        }

        self.set_legality(Legality::Illegal)?;

        let mut cleanup = ErrorCollector::new();

        // Blank our parent record so the parent can become leaf again.
        let parent = match self.get_parent() {
            Ok(parent) => parent,
            Err(e) => {
                cleanup.push(e);
                BLANK_UUID
            }
        };
        cleanup.run(|| self.set_parent(BLANK_UUID));
        if parent != BLANK_UUID {
            let parent_vol = Self::new(Arc::clone(&self.dom), self.img_uuid, parent);
            cleanup.run(|| parent_vol.recheck_if_leaf().map(|_| ()));
        }

        match self.dom.backend() {
            Backend::File(f) => {
                let path = self.path();
                if post_zero {
                    cleanup.run(|| self.zero(task));
                }
                cleanup.run(|| f.io().unlink(&path));
                cleanup.run(|| f.io().unlink(&FileDomain::lease_path(&path)));
                cleanup.run(|| self.remove_metadata());
            }
            Backend::Block(b) => {
                let vg = b.vg().to_owned();
                let lv = self.vol_uuid.to_string();
                let slot = b.md_slot(self.vol_uuid).ok();

                // Unhook from image enumeration first, then rename aside
                // so a crashed delete leaves a garbage-collectable LV.
                let image_tag = format!("{TAG_PREFIX_IMAGE}{}", self.img_uuid);
                cleanup.run(|| {
                    b.lvm()
                        .change_lv_tags(&vg, &lv, &[image_tag.as_str()], &[])
                        .map_err(Error::from)
                });
                let removed_name = deleted_volume_name(self.vol_uuid);
                let mut current_name = lv.clone();
                cleanup.run(|| {
                    b.lvm().rename_lv(&vg, &lv, &removed_name)?;
                    current_name = removed_name.clone();
                    Ok(())
                });
                if post_zero {
                    cleanup.run(|| {
                        b.lvm().activate_lvs(&vg, &[current_name.as_str()])?;
                        let mut cmd = Command::new("blkdiscard");
                        cmd.arg("-z").arg(b.lv_path(&current_name));
                        proc::run_abortable(cmd, "blkdiscard", task)?;
                        Ok(())
                    });
                } else if discard {
                    cleanup.run(|| {
                        b.lvm().activate_lvs(&vg, &[current_name.as_str()])?;
                        let mut cmd = Command::new("blkdiscard");
                        cmd.arg(b.lv_path(&current_name));
                        proc::run_abortable(cmd, "blkdiscard", task)?;
                        Ok(())
                    });
                }
                cleanup.run(|| {
                    b.lvm().deactivate_lvs(&vg, &[current_name.as_str()])?;
                    b.lvm().remove_lv(&vg, &current_name)?;
                    Ok(())
                });
                if let Some(slot) = slot {
                    cleanup.run(|| b.clear_slot(slot));
                }
            }
        }

        cleanup.into_result()
    }

    /// Volume parameters snapshot used by the chain engine.
    pub fn volume_params(&self) -> Result<VolumeParams> {
        let md = self.get_metadata()?;
        Ok(VolumeParams {
            vol_uuid: self.vol_uuid,
            // The record's image, not the handle's: a template produced
            // through a chain's image directory still reports its home.
            img_uuid: md.image,
            capacity: md.capacity,
            format: md.format,
            prealloc: md.vol_type,
            disk_type: md.disktype,
            description: md.description,
            parent: md.puuid,
            apparent_size: self.apparent_size()?,
        })
    }

}

/// Snapshot of the attributes the chain engine consumes.
#[derive(Debug, Clone)]
pub struct VolumeParams {
    /// Volume UUID.
    pub vol_uuid: Uuid,
    /// Owning image.
    pub img_uuid: Uuid,
    /// Virtual capacity in bytes.
    pub capacity: u64,
    /// On-disk format.
    pub format: VolumeFormat,
    /// Allocation policy.
    pub prealloc: VolumeType,
    /// Payload role tag.
    pub disk_type: DiskType,
    /// Description text.
    pub description: String,
    /// Parent volume UUID.
    pub parent: Uuid,
    /// On-disk allocation in bytes.
    pub apparent_size: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn backing_path_basename_is_parent_uuid() {
        let img = Uuid::new_v4();
        let vol = Uuid::new_v4();
        let backing = backing_volume_path(img, vol);
        assert_eq!(backing, format!("../{img}/{vol}"));
        assert_eq!(backing.rsplit('/').next().unwrap(), vol.to_string());
    }

    #[test]
    fn deleted_names_carry_prefix_and_uuid() {
        let vol = Uuid::new_v4();
        let name = deleted_volume_name(vol);
        assert!(name.starts_with(REMOVED_IMAGE_PREFIX));
        assert!(name.ends_with(&format!("_{vol}")));
        assert_ne!(deleted_volume_name(vol), name);
    }

    #[test]
    fn prepare_presets() {
        let ro = Prepare::read_only();
        assert!(!ro.rw && ro.justme);
        let rw_chain = Prepare::read_write_chain();
        assert!(rw_chain.rw && rw_chain.chainrw && rw_chain.setrw && !rw_chain.justme);
        assert!(Prepare::read_only().forced().force);
    }
}

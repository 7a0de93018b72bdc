//! The chain engine: discovery, snapshots, merge, copy/move across
//! domains, reconciliation, sparsify, size estimation.

use std::collections::{HashMap, HashSet};
use std::process::Command;
use std::sync::Arc;

use cowl_meta::{
    BLANK_UUID, BLOCK_SIZE_512, Legality, VolumeFormat, VolumeType, round_up,
};
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::COW_OVERHEAD;
use crate::qemuimg::{self, Convert, Format, Preallocation};
use crate::rm::{IMAGE_NAMESPACE, LockMode, namespace};
use crate::sd::{Backend, CreateVolumeArgs, FileDomain, StorageDomain};
use crate::task::Task;
use crate::volume::{Prepare, Volume, VolumeParams, backing_volume_path};
use crate::{Context, Error, Result, proc};

/// Copy or move between domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CopyOp {
    /// Leave the source in place.
    Copy,
    /// Delete the source after the commit point (best effort).
    Move,
}

/// Which part of two matching chains [`Image::sync_data`] copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncType {
    /// Every volume.
    All,
    /// Everything but the leaves.
    Internal,
    /// Only the leaves.
    Leaf,
}

/// The image/chain engine.
///
/// Stateless apart from the fake-template creation lock; every call
/// names the domains it works on.
#[derive(Debug)]
pub struct Image {
    ctx: Arc<Context>,
    fake_template_lock: Mutex<()>,
}

impl Image {
    /// Creates an engine bound to a context.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            fake_template_lock: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Chain discovery
    // ------------------------------------------------------------------

    /// The parent-first volume chain of an image, shared template
    /// excluded.
    ///
    /// With `vol_uuid` the walk starts there; otherwise the image's LEAF
    /// is located first. Cycles and missing leaves fail with
    /// [`Error::ImageIsNotLegalChain`].
    pub fn get_chain(
        &self,
        dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        vol_uuid: Option<Uuid>,
    ) -> Result<Vec<Volume>> {
        let start = match vol_uuid {
            Some(vol) => {
                let vol = dom.produce_volume(img_uuid, vol)?;
                // A template image is its single shared volume.
                if vol.is_shared()? {
                    return Ok(vec![vol]);
                }
                vol
            }
            None => {
                let uuids = dom.get_vols_of_image(img_uuid)?;
                if uuids.is_empty() {
                    return Err(Error::ImageDoesNotExist {
                        img: img_uuid,
                        sd: dom.sd_uuid(),
                    });
                }
                if uuids.len() == 1 {
                    let only = dom.produce_volume(img_uuid, uuids[0])?;
                    if only.is_shared()? {
                        return Ok(vec![only]);
                    }
                }
                let mut leaf = None;
                for vol in &uuids {
                    let candidate = dom.produce_volume(img_uuid, *vol)?;
                    if candidate.is_leaf()? {
                        leaf = Some(candidate);
                        break;
                    }
                }
                leaf.ok_or(Error::ImageIsNotLegalChain(img_uuid))?
            }
        };

        let mut chain: Vec<Volume> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut current = start;
        loop {
            if current.is_shared()? {
                break;
            }
            seen.insert(current.vol_uuid());
            let parent = current.get_parent()?;
            chain.insert(0, current);

            if parent == BLANK_UUID {
                break;
            }
            if seen.contains(&parent) {
                warn!(img = %img_uuid, %parent, "cycle in volume chain");
                return Err(Error::ImageIsNotLegalChain(img_uuid));
            }
            current = dom.produce_volume(img_uuid, parent)?;
        }
        Ok(chain)
    }

    /// The shared template the image is rooted at, if any.
    pub fn get_template(&self, dom: &Arc<StorageDomain>, img_uuid: Uuid) -> Result<Option<Volume>> {
        let chain = self.get_chain(dom, img_uuid, None)?;
        let Some(base) = chain.first() else {
            return Ok(None);
        };
        if let Some(parent) = base.get_parent_volume()? {
            return Ok(Some(parent));
        }
        if base.is_shared()? {
            return Ok(Some(base.clone()));
        }
        Ok(None)
    }

    /// Whether every volume of the image is LEGAL and none is FAKE.
    ///
    /// Produce failures count as illegal; an image with no volumes is
    /// vacuously legal (nothing to overwrite).
    pub fn is_legal(&self, dom: &Arc<StorageDomain>, img_uuid: Uuid) -> bool {
        let Ok(vols) = dom.get_vols_of_image(img_uuid) else {
            return false;
        };
        for vol in vols {
            let legal = dom
                .produce_volume(img_uuid, vol)
                .and_then(|v| Ok(v.is_legal()? && !v.is_fake()?));
            if !legal.unwrap_or(false) {
                return false;
            }
        }
        true
    }

    /// Checks the whole chain, template included.
    pub fn validate_volume_chain(&self, dom: &Arc<StorageDomain>, img_uuid: Uuid) -> Result<()> {
        if !self.is_legal(dom, img_uuid) {
            return Err(Error::ImageIsNotLegalChain(img_uuid));
        }
        let chain = self.get_chain(dom, img_uuid, None)?;
        if let Some(base) = chain.first() {
            if let Some(template) = base.get_parent_volume()? {
                if !template.is_legal()? || template.is_fake()? {
                    return Err(Error::ImageIsNotLegalChain(img_uuid));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Size estimation
    // ------------------------------------------------------------------

    /// 512-block allocation needed to convert `src_vol` into a qcow2
    /// volume on `dst_dom`.
    ///
    /// qemu's measurement plus one utilization chunk, capped at the
    /// destination's maximum volume size. The source must be prepared.
    pub fn estimate_qcow2_size_blk(
        &self,
        src_vol: &Volume,
        dst_dom: &Arc<StorageDomain>,
    ) -> Result<u64> {
        let capacity = src_vol.capacity()?;
        let measure = qemuimg::measure(&src_vol.path(), src_vol.qemu_format()?, Format::Qcow2)?;
        let chunk = self.ctx.config().chunk_size();
        let estimate_blk = (measure.required + chunk) / BLOCK_SIZE_512;
        let max_blk = dst_dom.max_volume_size(capacity, VolumeFormat::Cow) / BLOCK_SIZE_512;
        Ok(estimate_blk.min(max_blk))
    }

    /// 512-block estimate for a whole chain: the sum of apparent sizes
    /// (template included), capped at `capacity_blk`, padded for qcow2
    /// metadata.
    pub fn estimate_chain_size_blk(
        &self,
        dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        vol_uuid: Uuid,
        capacity_blk: u64,
    ) -> Result<u64> {
        let chain = self.get_chain(dom, img_uuid, Some(vol_uuid))?;
        let mut size_blk = 0;
        if let Some(base) = chain.first() {
            if let Some(template) = base.get_parent_volume()? {
                size_blk += template.apparent_size()? / BLOCK_SIZE_512;
            }
        }
        for vol in &chain {
            size_blk += vol.apparent_size()? / BLOCK_SIZE_512;
        }
        size_blk = size_blk.min(capacity_blk);
        Ok((size_blk as f64 * COW_OVERHEAD) as u64)
    }

    // ------------------------------------------------------------------
    // Copy / move
    // ------------------------------------------------------------------

    /// Creates a placeholder template on a backup domain that lacks the
    /// real one (FAKE legality, SHARED role). Failures are logged, not
    /// raised: the copy will fail later with a clearer error if the
    /// template is truly required.
    pub fn create_fake_template(
        &self,
        dst_dom: &Arc<StorageDomain>,
        params: &VolumeParams,
        task: &Task,
    ) -> Result<()> {
        let _guard = self.fake_template_lock.lock();
        if dst_dom
            .produce_volume(params.img_uuid, params.vol_uuid)
            .is_ok()
        {
            return Ok(());
        }
        let result = (|| -> Result<()> {
            dst_dom.create_volume(
                CreateVolumeArgs {
                    img_uuid: params.img_uuid,
                    capacity: params.capacity,
                    vol_format: VolumeFormat::Cow,
                    preallocate: VolumeType::Sparse,
                    disk_type: params.disk_type,
                    vol_uuid: params.vol_uuid,
                    desc: "Fake volume".to_owned(),
                    src_img_uuid: BLANK_UUID,
                    src_vol_uuid: BLANK_UUID,
                    initial_size: None,
                },
                task,
            )?;
            let vol = dst_dom.produce_volume(params.img_uuid, params.vol_uuid)?;
            vol.set_legality(Legality::Fake)?;
            vol.set_shared()?;
            dst_dom.template_relink(params.img_uuid, params.vol_uuid)?;
            Ok(())
        })();
        if let Err(err) = result {
            warn!(img = %params.img_uuid, error = %err, "fake template creation failed");
        }
        Ok(())
    }

    /// Builds the destination chain for a copy: per-volume creation as
    /// SPARSE (no pre-zeroing), extension to the source apparent size,
    /// and re-marking PREALLOCATED where the source was.
    fn create_target_image(
        &self,
        dst_dom: &Arc<StorageDomain>,
        src_dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        task: &Task,
    ) -> Result<(Vec<Volume>, Vec<Volume>)> {
        let src_chain = self.get_chain(src_dom, img_uuid, None)?;
        info!(
            img = %img_uuid,
            chain = %chain_to_string(&src_chain),
            "source chain"
        );

        let mut template_params = None;
        let mut template_img = BLANK_UUID;
        if let Some(parent) = src_chain[0].get_parent_volume()? {
            let params = parent.volume_params()?;
            template_img = params.img_uuid;
            template_params = Some(params);
        }

        // The destination template (if any) must not move under us.
        let _template_lock = if template_img == BLANK_UUID {
            None
        } else {
            Some(self.ctx.rm().acquire(
                &namespace(IMAGE_NAMESPACE, dst_dom.sd_uuid()),
                &template_img.to_string(),
                LockMode::Shared,
                self.ctx.config().resource_timeout(),
            )?)
        };

        if let Some(params) = &template_params {
            if dst_dom.is_backup() {
                self.create_fake_template(dst_dom, params, task)?;
            }
        }

        let mut dst_chain = Vec::with_capacity(src_chain.len());
        let mut parent_img = template_img;
        for src_vol in &src_chain {
            let params = src_vol.volume_params()?;

            // Sparse targets avoid pre-zeroing on domains that cannot
            // punch holes; the data lands during the copy anyway.
            let preallocate = if dst_dom.supports_sparseness() || params.format != VolumeFormat::Raw
            {
                VolumeType::Sparse
            } else {
                VolumeType::Preallocated
            };

            dst_dom.create_volume(
                CreateVolumeArgs {
                    img_uuid,
                    capacity: params.capacity,
                    vol_format: params.format,
                    preallocate,
                    disk_type: params.disk_type,
                    vol_uuid: src_vol.vol_uuid(),
                    desc: params.description.clone(),
                    src_img_uuid: parent_img,
                    src_vol_uuid: params.parent,
                    initial_size: None,
                },
                task,
            )?;
            let dst_vol = dst_dom.produce_volume(img_uuid, src_vol.vol_uuid())?;

            let aligned = round_up(params.apparent_size, BLOCK_SIZE_512);
            dst_vol.extend(aligned / BLOCK_SIZE_512, task)?;

            if params.prealloc == VolumeType::Preallocated && preallocate != VolumeType::Preallocated
            {
                dst_vol.set_type(VolumeType::Preallocated)?;
            }
            dst_chain.push(dst_vol);

            // Only the base may point into another image.
            parent_img = img_uuid;
        }
        Ok((src_chain, dst_chain))
    }

    /// Copies every volume of the prepared chains with `qemu-img
    /// convert`.
    fn inter_images_copy(
        &self,
        dst_dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        src_chain: &[Volume],
        dst_chain: &[Volume],
        task: &Task,
    ) -> Result<()> {
        let src_leaf = src_chain.last().ok_or(Error::ImageIsNotLegalChain(img_uuid))?;
        let dst_leaf = dst_chain.last().ok_or(Error::ImageIsNotLegalChain(img_uuid))?;

        src_leaf.prepare(Prepare::read_chain())?;
        if let Err(err) = dst_leaf.prepare(Prepare::read_write_chain()) {
            let _ = src_leaf.teardown(false);
            return Err(err);
        }

        let result = (|| -> Result<()> {
            for src_vol in src_chain {
                task.check_abort()?;
                let dst_vol = dst_dom.produce_volume(img_uuid, src_vol.vol_uuid())?;

                let (backing, backing_format) = match dst_vol.get_parent_volume()? {
                    Some(parent) => (
                        Some(backing_volume_path(img_uuid, parent.vol_uuid())),
                        Some(parent.qemu_format()?),
                    ),
                    None => (None, None),
                };
                let preallocation = if dst_dom.supports_sparseness()
                    && dst_vol.vol_type()? == VolumeType::Preallocated
                {
                    Some(Preallocation::Falloc)
                } else {
                    None
                };
                let dst_format = dst_vol.format()?;

                info!(vol = %src_vol.vol_uuid(), "copying volume");
                qemuimg::convert(
                    &src_vol.path(),
                    &dst_vol.path(),
                    &Convert {
                        src_format: src_vol.qemu_format()?,
                        dst_format: dst_vol.qemu_format()?,
                        compat: dst_dom.qcow2_compat(),
                        backing,
                        backing_format,
                        preallocation,
                        unordered_writes: dst_dom.recommends_unordered_writes(dst_format),
                    },
                    task,
                )
                .map_err(|e| match e {
                    Error::ActionStopped => Error::ActionStopped,
                    other => Error::CopyImageError {
                        img: img_uuid,
                        reason: other.to_string(),
                    },
                })?;
            }
            Ok(())
        })();

        let _ = src_leaf.teardown(false);
        let _ = dst_leaf.teardown(false);
        result
    }

    /// Re-applies SHARED/INTERNAL roles from the source chain.
    fn finalize_destination_image(
        &self,
        dst_dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        src_chain: &[Volume],
    ) -> Result<()> {
        for src_vol in src_chain {
            let dst_vol = dst_dom.produce_volume(img_uuid, src_vol.vol_uuid())?;
            if src_vol.is_shared()? {
                dst_vol.set_shared()?;
            } else if src_vol.is_internal()? {
                dst_vol.set_internal()?;
            }
        }
        Ok(())
    }

    /// Copies or moves an image between domains.
    ///
    /// A failed run leaves the source intact. After the copy commits,
    /// recoveries are cleared; a MOVE then deletes the source best
    /// effort.
    pub fn move_image(
        &self,
        src_dom: &Arc<StorageDomain>,
        dst_dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        op: CopyOp,
        post_zero: bool,
        force: bool,
        discard: bool,
        task: &Task,
    ) -> Result<()> {
        info!(
            src = %src_dom.sd_uuid(), dst = %dst_dom.sd_uuid(), img = %img_uuid,
            ?op, post_zero, force, discard, "image move"
        );

        // An illegal or fake destination image is garbage to overwrite.
        let force = force || !self.is_legal(dst_dom, img_uuid);
        if force && !dst_dom.get_vols_of_image(img_uuid)?.is_empty() {
            info!(img = %img_uuid, "removing destination image before overwrite");
            dst_dom.delete_image(img_uuid, post_zero, discard, task)?;
        }

        let (src_chain, dst_chain) = self.create_target_image(dst_dom, src_dom, img_uuid, task)?;
        self.inter_images_copy(dst_dom, img_uuid, &src_chain, &dst_chain, task)?;
        self.finalize_destination_image(dst_dom, img_uuid, &src_chain)?;
        if force {
            if let Some(leaf) = dst_chain.last() {
                dst_dom.template_relink(img_uuid, leaf.vol_uuid())?;
            }
        }

        // Copy committed; nothing below may undo it.
        task.clear_recoveries();

        if op == CopyOp::Move {
            if let Err(err) = src_dom.delete_image(img_uuid, post_zero, discard, task) {
                warn!(
                    img = %img_uuid, src = %src_dom.sd_uuid(), error = %err,
                    "failed to remove source image after move"
                );
            }
        }
        info!(img = %img_uuid, ?op, "image move finished");
        Ok(())
    }

    /// Builds the destination chain only (no data copy).
    pub fn clone_structure(
        &self,
        src_dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        dst_dom: &Arc<StorageDomain>,
        task: &Task,
    ) -> Result<()> {
        self.create_target_image(dst_dom, src_dom, img_uuid, task)?;
        Ok(())
    }

    /// Copies data over two already-matching chains.
    pub fn sync_data(
        &self,
        src_dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        dst_dom: &Arc<StorageDomain>,
        sync_type: SyncType,
        task: &Task,
    ) -> Result<()> {
        let mut src_chain = self.get_chain(src_dom, img_uuid, None)?;
        let mut dst_chain = self.get_chain(dst_dom, img_uuid, None)?;

        match sync_type {
            SyncType::Internal => {
                if src_chain.pop().is_none() || dst_chain.pop().is_none() {
                    return Err(Error::ImageIsNotLegalChain(img_uuid));
                }
            }
            SyncType::Leaf => {
                src_chain = src_chain.split_off(src_chain.len().saturating_sub(1));
                dst_chain = dst_chain.split_off(dst_chain.len().saturating_sub(1));
            }
            SyncType::All => {}
        }

        if src_chain.len() != dst_chain.len() {
            return Err(Error::CopyImageError {
                img: img_uuid,
                reason: "source and destination chains differ in length".to_owned(),
            });
        }
        // Leaves were exempted above, so remaining positions must match.
        for (src, dst) in src_chain.iter().zip(&dst_chain) {
            if src.vol_uuid() != dst.vol_uuid() {
                return Err(Error::CopyImageError {
                    img: img_uuid,
                    reason: format!(
                        "chain mismatch: {} vs {}",
                        src.vol_uuid(),
                        dst.vol_uuid()
                    ),
                });
            }
        }

        self.inter_images_copy(dst_dom, img_uuid, &src_chain, &dst_chain, task)?;
        self.finalize_destination_image(dst_dom, img_uuid, &src_chain)
    }

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    /// Collapses `ancestor → … → successor` into `successor`.
    pub fn merge(
        &self,
        dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        ancestor: Uuid,
        successor: Uuid,
        post_zero: bool,
        discard: bool,
        task: &Task,
    ) -> Result<()> {
        info!(
            sd = %dom.sd_uuid(), img = %img_uuid, %ancestor, %successor,
            post_zero, discard, "merging subchain"
        );

        let vol_ids = dom.get_vols_of_image(img_uuid)?;
        if vol_ids.is_empty() {
            return Err(Error::ImageDoesNotExist {
                img: img_uuid,
                sd: dom.sd_uuid(),
            });
        }
        let mut vols: HashMap<Uuid, Volume> = HashMap::new();
        for vol in vol_ids {
            vols.insert(vol, dom.produce_volume(img_uuid, vol)?);
        }

        let src_vol = vols
            .get(&successor)
            .ok_or(Error::VolumeDoesNotExist(successor))?
            .clone();
        let dst_vol = vols
            .get(&ancestor)
            .ok_or(Error::VolumeDoesNotExist(ancestor))?
            .clone();
        let dst_parent = dst_vol.get_parent()?;
        let base_params = if dst_parent == BLANK_UUID {
            dst_vol.volume_params()?
        } else {
            vols.get(&dst_parent)
                .ok_or(Error::VolumeDoesNotExist(dst_parent))?
                .volume_params()?
        };

        let (acc_blk, chain) = self.sub_chain_size_calc(img_uuid, ancestor, successor, &vols)?;
        let capacity_blk = base_params.capacity / BLOCK_SIZE_512;
        let required_blk = (acc_blk.min(capacity_blk) as f64 * COW_OVERHEAD) as u64;

        let chain_to_remove = if dst_parent != BLANK_UUID {
            info!(src = %successor, dst = %ancestor, "internal volume merge");
            self.internal_volume_merge(&src_vol, &base_params, required_blk, &chain, task)?
        } else if base_params.format == VolumeFormat::Raw {
            info!(src = %successor, dst = %ancestor, "merge with convert");
            self.base_raw_volume_merge(dom, &src_vol, &base_params, &chain, post_zero, task)?
        } else {
            info!(src = %successor, dst = %ancestor, "four-step base cow merge");
            self.base_cow_volume_merge(dom, &src_vol, &base_params, required_blk, &chain, discard, task)?
        };

        // The block-level merge is irreversible from here.
        task.clear_recoveries();
        self.mark_illegal_sub_chain(dom, img_uuid, &chain_to_remove)?;

        if let Err(err) =
            self.remove_sub_chain(dom, img_uuid, &chain_to_remove, post_zero, discard, task)
        {
            warn!(
                img = %img_uuid, %ancestor, %successor, error = %err,
                "failed to remove merged subchain"
            );
        }

        let new_leaf = dom.produce_volume(img_uuid, successor)?;
        if let Err(err) = self.shrink_volume_to_optimal_size(&new_leaf) {
            warn!(vol = %successor, error = %err, "auto shrink after merge failed");
        }
        info!(%successor, %ancestor, "merge finished");
        Ok(())
    }

    /// Accumulated apparent size and member list of
    /// `ancestor → … → successor` (parent-first).
    fn sub_chain_size_calc(
        &self,
        img_uuid: Uuid,
        ancestor: Uuid,
        successor: Uuid,
        vols: &HashMap<Uuid, Volume>,
    ) -> Result<(u64, Vec<Uuid>)> {
        let end_parent = vols
            .get(&ancestor)
            .ok_or(Error::VolumeDoesNotExist(ancestor))?
            .get_parent()?;
        let mut chain = Vec::new();
        let mut acc_blk = 0;
        let mut seen = HashSet::new();
        let mut current = successor;
        while current != end_parent {
            if !seen.insert(current) {
                return Err(Error::ImageIsNotLegalChain(img_uuid));
            }
            let vol = vols
                .get(&current)
                .ok_or(Error::ImageIsNotLegalChain(img_uuid))?;
            chain.insert(0, current);
            acc_blk += vol.apparent_size()? / BLOCK_SIZE_512;
            current = vol.get_parent()?;
            if current == BLANK_UUID && end_parent != BLANK_UUID {
                return Err(Error::ImageIsNotLegalChain(img_uuid));
            }
        }
        Ok((acc_blk, chain))
    }

    /// Merge when the ancestor has a parent: rebase the successor onto
    /// that parent.
    fn internal_volume_merge(
        &self,
        src_vol: &Volume,
        base_params: &VolumeParams,
        required_blk: u64,
        chain: &[Uuid],
        task: &Task,
    ) -> Result<Vec<Uuid>> {
        src_vol.extend(required_blk, task)?;

        src_vol.prepare(Prepare::read_write_chain())?;
        let result = (|| {
            let backing = backing_volume_path(src_vol.img_uuid(), base_params.vol_uuid);
            src_vol.rebase(
                base_params.vol_uuid,
                &backing,
                Some(format_of(base_params.format)?),
                false,
                true,
                task,
            )
        })();
        let _ = src_vol.teardown(false);
        result?;

        let remove: Vec<Uuid> = chain
            .iter()
            .copied()
            .filter(|v| *v != src_vol.vol_uuid())
            .collect();
        self.teardown_sub_chain(src_vol.dom(), src_vol.img_uuid(), &remove);
        Ok(remove)
    }

    /// Merge into a COW base with no parent.
    ///
    /// `qemu-img rebase` cannot turn an overlay into a standalone base
    /// directly, so: create a temporary empty base, safely rebase the
    /// successor onto it (materialising all clusters), unsafely rebase
    /// onto nothing to drop the backing pointer, then delete the
    /// temporary.
    fn base_cow_volume_merge(
        &self,
        dom: &Arc<StorageDomain>,
        src_vol: &Volume,
        base_params: &VolumeParams,
        required_blk: u64,
        chain: &[Uuid],
        discard: bool,
        task: &Task,
    ) -> Result<Vec<Uuid>> {
        src_vol.extend(required_blk, task)?;

        let tmp_uuid = Uuid::new_v4();
        dom.create_volume(
            CreateVolumeArgs {
                img_uuid: src_vol.img_uuid(),
                capacity: base_params.capacity,
                vol_format: base_params.format,
                preallocate: VolumeType::Sparse,
                disk_type: base_params.disk_type,
                vol_uuid: tmp_uuid,
                desc: "New base volume".to_owned(),
                src_img_uuid: BLANK_UUID,
                src_vol_uuid: BLANK_UUID,
                initial_size: None,
            },
            task,
        )?;
        let tmp_vol = dom.produce_volume(src_vol.img_uuid(), tmp_uuid)?;
        tmp_vol.prepare(Prepare::read_write().only_self())?;

        // Prepare/teardown around every rebase: recheckIfLeaf at rebase
        // end flips internal volumes read-only.
        src_vol.prepare(Prepare::read_write_chain())?;
        let step2 = (|| {
            let backing = backing_volume_path(src_vol.img_uuid(), tmp_uuid);
            src_vol.rebase(
                tmp_uuid,
                &backing,
                Some(format_of(base_params.format)?),
                false,
                true,
                task,
            )
        })();
        let _ = src_vol.teardown(false);
        step2?;

        src_vol.prepare(Prepare::read_write_chain())?;
        let step3 = src_vol.rebase(
            BLANK_UUID,
            "",
            Some(format_of(base_params.format)?),
            true,
            false,
            task,
        );
        let _ = src_vol.teardown(false);
        step3?;

        let _ = tmp_vol.teardown(true);
        let mut tmp_vol = tmp_vol;
        tmp_vol.delete(false, true, discard, task)?;

        let remove: Vec<Uuid> = chain
            .iter()
            .copied()
            .filter(|v| *v != src_vol.vol_uuid())
            .collect();
        self.teardown_sub_chain(dom, src_vol.img_uuid(), &remove);
        Ok(remove)
    }

    /// Merge into a RAW base: convert the successor into a fresh RAW
    /// volume, swap it in by rename, and unsafely rebase the successor's
    /// children onto it.
    fn base_raw_volume_merge(
        &self,
        dom: &Arc<StorageDomain>,
        src_vol: &Volume,
        base_params: &VolumeParams,
        chain: &[Uuid],
        post_zero: bool,
        task: &Task,
    ) -> Result<Vec<Uuid>> {
        let img_uuid = src_vol.img_uuid();
        let successor = src_vol.vol_uuid();
        let src_params = src_vol.volume_params()?;
        let children = src_vol.get_children()?;

        src_vol.prepare(Prepare::read_write_chain())?;
        let merge_uuid = Uuid::new_v4();
        let converted = (|| -> Result<Volume> {
            dom.create_volume(
                CreateVolumeArgs {
                    img_uuid,
                    capacity: src_params.capacity,
                    vol_format: base_params.format,
                    preallocate: base_params.prealloc,
                    disk_type: base_params.disk_type,
                    vol_uuid: merge_uuid,
                    desc: src_params.description.clone(),
                    src_img_uuid: BLANK_UUID,
                    src_vol_uuid: BLANK_UUID,
                    initial_size: None,
                },
                task,
            )?;
            let new_vol = dom.produce_volume(img_uuid, merge_uuid)?;
            new_vol.prepare(Prepare::read_write().only_self())?;
            let result = qemuimg::convert(
                &src_vol.path(),
                &new_vol.path(),
                &Convert {
                    src_format: src_vol.qemu_format()?,
                    dst_format: format_of(base_params.format)?,
                    compat: dom.qcow2_compat(),
                    backing: None,
                    backing_format: None,
                    preallocation: None,
                    unordered_writes: dom.recommends_unordered_writes(base_params.format),
                },
                task,
            );
            let _ = new_vol.teardown(true);
            result.map_err(|_| Error::MergeSnapshotsError(merge_uuid))?;
            Ok(new_vol)
        })();
        let _ = src_vol.teardown(false);
        let new_vol = converted?;

        if !children.is_empty() {
            new_vol.set_internal()?;
        }

        // Swap: successor aside as garbage, converted volume in its
        // place.
        let mut old_vol = src_vol.clone();
        let garbage = old_vol.rename_to_garbage(task)?;
        let mut new_vol = new_vol;
        new_vol.rename(successor, task, true)?;

        for child in &children {
            let child_vol = dom.produce_volume(img_uuid, *child)?;
            child_vol.prepare(Prepare::read_write_chain().forced())?;
            let backing = backing_volume_path(img_uuid, successor);
            let rebase = child_vol.rebase(
                successor,
                &backing,
                Some(format_of(base_params.format)?),
                true,
                true,
                task,
            );
            let _ = child_vol.teardown(false);
            rebase?;
            child_vol.recheck_if_leaf()?;
        }

        self.remove_garbage(dom, img_uuid, &garbage, post_zero, task);

        let remove: Vec<Uuid> = chain
            .iter()
            .copied()
            .filter(|v| *v != successor)
            .collect();
        self.teardown_sub_chain(dom, img_uuid, &remove);
        Ok(remove)
    }

    /// Deletes a `_remove_me_` renamed payload and its sidecars.
    fn remove_garbage(
        &self,
        dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        name: &str,
        post_zero: bool,
        task: &Task,
    ) {
        let result = (|| -> Result<()> {
            match dom.backend() {
                Backend::File(f) => {
                    let path = f.image_dir(img_uuid).join(name);
                    if post_zero {
                        f.io().zero(&path)?;
                    }
                    f.io().unlink(&path)?;
                    f.io().unlink(&FileDomain::meta_path(&path))?;
                    f.io().unlink(&FileDomain::lease_path(&path))?;
                    Ok(())
                }
                Backend::Block(b) => {
                    let slot = b
                        .lvm()
                        .get_lv(b.vg(), name)
                        .ok()
                        .and_then(|lv| {
                            lv.tag_value(cowl_meta::TAG_PREFIX_MD)
                                .and_then(|v| v.parse().ok())
                        });
                    if post_zero {
                        b.lvm().activate_lvs(b.vg(), &[name])?;
                        let mut cmd = Command::new("blkdiscard");
                        cmd.arg("-z").arg(b.lv_path(name));
                        proc::run_abortable(cmd, "blkdiscard", task)?;
                    }
                    b.lvm().deactivate_lvs(b.vg(), &[name])?;
                    b.lvm().remove_lv(b.vg(), name)?;
                    if let Some(slot) = slot {
                        b.clear_slot(slot)?;
                    }
                    Ok(())
                }
            }
        })();
        if let Err(err) = result {
            warn!(img = %img_uuid, name, error = %err, "failed to remove merge garbage");
        }
    }

    /// Marks every volume of the subchain ILLEGAL.
    pub fn mark_illegal_sub_chain(
        &self,
        dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        chain: &[Uuid],
    ) -> Result<()> {
        if chain.is_empty() {
            return Ok(());
        }
        for vol in chain {
            dom.produce_volume(img_uuid, *vol)?
                .set_legality(Legality::Illegal)?;
        }
        Ok(())
    }

    /// Best-effort teardown of detached subchain members.
    fn teardown_sub_chain(&self, dom: &Arc<StorageDomain>, img_uuid: Uuid, chain: &[Uuid]) {
        for vol in chain.iter().rev() {
            let volume = Volume::new(Arc::clone(dom), img_uuid, *vol);
            if let Err(err) = volume.teardown(true) {
                warn!(img = %img_uuid, vol = %vol, error = %err, "subchain teardown failed");
            }
        }
    }

    /// Deletes the subchain, children first.
    pub fn remove_sub_chain(
        &self,
        dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        chain: &[Uuid],
        post_zero: bool,
        discard: bool,
        task: &Task,
    ) -> Result<()> {
        for vol in chain.iter().rev() {
            info!(img = %img_uuid, vol = %vol, "removing merged volume");
            let mut volume = Volume::new(Arc::clone(dom), img_uuid, *vol);
            volume.delete(post_zero, true, discard, task)?;
        }
        Ok(())
    }

    /// Shrinks a chunked volume back to its optimal size.
    fn shrink_volume_to_optimal_size(&self, vol: &Volume) -> Result<()> {
        if !vol.chunked()? {
            return Ok(());
        }
        vol.prepare(Prepare::read_only())?;
        let optimal = vol.optimal_size();
        let _ = vol.teardown(true);
        vol.reduce(optimal? / BLOCK_SIZE_512)
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Fixes volume metadata to reflect `actual`, the chain qemu
    /// actually reads.
    ///
    /// The contiguous run of current-chain volumes missing from `actual`
    /// is unlinked: if its child-most member is the leaf, the leaf is
    /// marked ILLEGAL (a live merge is mid-pivot); otherwise every child
    /// of that member is repointed at the parent of the run's head.
    pub fn sync_volume_chain(
        &self,
        dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        vol_uuid: Uuid,
        actual: &[Uuid],
    ) -> Result<()> {
        let current = self.get_chain(dom, img_uuid, Some(vol_uuid))?;
        info!(img = %img_uuid, chain = %chain_to_string(&current), "current chain");

        let mut sub_chain: Vec<Uuid> = Vec::new();
        for vol in &current {
            if !actual.contains(&vol.vol_uuid()) {
                sub_chain.push(vol.vol_uuid());
            } else if !sub_chain.is_empty() {
                break;
            }
        }
        if sub_chain.is_empty() {
            return Ok(());
        }
        info!(img = %img_uuid, ?sub_chain, "unlinking subchain");

        let dst_parent = dom.produce_volume(img_uuid, sub_chain[0])?.get_parent()?;
        let tail = dom.produce_volume(img_uuid, *sub_chain.last().unwrap_or(&sub_chain[0]))?;
        if tail.is_leaf()? {
            info!(
                vol = %tail.vol_uuid(),
                "leaf is being removed from the chain, marking ILLEGAL"
            );
            tail.set_legality(Legality::Illegal)?;
        } else {
            for child in tail.get_children()? {
                info!(vol = %child, parent = %dst_parent, "repointing child");
                dom.produce_volume(img_uuid, child)?
                    .set_parent_meta(dst_parent)?;
            }
        }
        Ok(())
    }

    /// Discovers the actual chain of an offline image from qcow2 backing
    /// pointers and syncs metadata to it.
    ///
    /// If the stated leaf is ILLEGAL (live merge completed its copy
    /// phase), it is dropped from the result.
    pub fn reconcile_volume_chain(
        &self,
        dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        leaf_vol_uuid: Uuid,
    ) -> Result<Vec<Uuid>> {
        let img_volumes = dom.get_vols_of_image(img_uuid)?;
        if img_volumes.is_empty() {
            return Err(Error::ImageDoesNotExist {
                img: img_uuid,
                sd: dom.sd_uuid(),
            });
        }
        dom.activate_volumes(&img_volumes)?;

        let result = (|| -> Result<Vec<Uuid>> {
            let mut actual: Vec<Uuid> = Vec::new();
            let mut seen = HashSet::new();
            let mut current = Some(leaf_vol_uuid);
            while let Some(vol_uuid) = current {
                if !seen.insert(vol_uuid) {
                    return Err(Error::ImageIsNotLegalChain(img_uuid));
                }
                actual.insert(0, vol_uuid);
                let vol = dom.produce_volume(img_uuid, vol_uuid)?;
                let img_info = qemuimg::info(&vol.path(), Some(vol.qemu_format()?))?;
                current = img_info
                    .backing_basename()
                    .and_then(|name| name.parse().ok());
            }

            let leaf = dom.produce_volume(img_uuid, leaf_vol_uuid)?;
            if leaf.get_metadata()?.legality == Legality::Illegal {
                actual.retain(|v| *v != leaf_vol_uuid);
            }

            if let Some(tip) = actual.last().copied() {
                self.sync_volume_chain(dom, img_uuid, tip, &actual)?;
            }
            Ok(actual)
        })();

        let _ = dom.deactivate_image(img_uuid);
        result
    }

    // ------------------------------------------------------------------
    // Sparsify
    // ------------------------------------------------------------------

    /// Converts guest free space into domain free space with
    /// `virt-sparsify`, then shrinks both working volumes.
    ///
    /// Both volumes are over-extended to the temporary volume's full
    /// capacity first: sparsification writes a guest file as large as
    /// the free space, so the worst case needs the whole virtual size.
    pub fn sparsify(
        &self,
        tmp_dom: &Arc<StorageDomain>,
        tmp_img: Uuid,
        tmp_vol_uuid: Uuid,
        dst_dom: &Arc<StorageDomain>,
        dst_img: Uuid,
        dst_vol_uuid: Uuid,
        task: &Task,
    ) -> Result<()> {
        info!(
            tmp = %tmp_vol_uuid, dst = %dst_vol_uuid, "sparsifying volume"
        );
        let tmp_vol = tmp_dom.produce_volume(tmp_img, tmp_vol_uuid)?;
        let dst_vol = dst_dom.produce_volume(dst_img, dst_vol_uuid)?;
        if dst_vol.vol_type()? != VolumeType::Sparse {
            return Err(Error::VolumeNotSparse(dst_vol_uuid));
        }
        let src_vol = tmp_vol
            .get_parent_volume()?
            .ok_or(Error::VolumeDoesNotExist(tmp_vol_uuid))?;

        tmp_vol.prepare(Prepare::read_write())?;
        let result = (|| -> Result<()> {
            dst_vol.prepare(Prepare::read_write())?;
            let inner = (|| -> Result<()> {
                let capacity_blk = tmp_vol.capacity()? / BLOCK_SIZE_512;
                tmp_vol.extend(capacity_blk, task)?;
                dst_vol.extend(capacity_blk, task)?;

                let mut cmd = Command::new("virt-sparsify");
                cmd.arg("--machine-readable")
                    .args(["--format", src_vol.qemu_format()?.as_arg()])
                    .args(["--convert", dst_vol.qemu_format()?.as_arg()])
                    .arg("--tmp")
                    .arg(format!("prebuilt:{}", tmp_vol.path().display()))
                    .arg(src_vol.path())
                    .arg(dst_vol.path());
                proc::run_abortable(cmd, "virt-sparsify", task)
                    .map_err(|e| match e {
                        Error::ActionStopped => Error::ActionStopped,
                        _ => Error::CannotSparsifyVolume(tmp_vol_uuid),
                    })?;
                Ok(())
            })();
            let _ = dst_vol.teardown(true);
            inner
        })();
        let _ = tmp_vol.teardown(true);
        result?;

        self.shrink_volume_to_optimal_size(&tmp_vol)?;
        self.shrink_volume_to_optimal_size(&dst_vol)?;
        Ok(())
    }
}

/// Maps a metadata format to the qemu argument form.
fn format_of(format: VolumeFormat) -> Result<Format> {
    match format {
        VolumeFormat::Raw => Ok(Format::Raw),
        VolumeFormat::Cow => Ok(Format::Qcow2),
        VolumeFormat::Unknown => Err(Error::InvalidParameter {
            name: "format",
            value: "UNKNOWN".to_owned(),
        }),
    }
}

/// `a < b < c` rendering for chain logs.
fn chain_to_string(chain: &[Volume]) -> String {
    chain
        .iter()
        .map(|v| v.vol_uuid().to_string())
        .collect::<Vec<_>>()
        .join(" < ")
}

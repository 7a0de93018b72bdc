//! Transactional entry points composing locks, tasks, leases and the
//! chain engine.
//!
//! Every wrapper binds a fresh [`Task`], takes the resource graph in a
//! deterministic order (image namespaces sorted, template SHARED inside
//! the engine), runs the engine call under the task so failures unwind
//! the recovery stack, and clears recoveries at the commit point.
//! Cluster-lease acquisition is explicit ([`Hsm::acquire_domain_master`])
//! so embedders decide which flows require the SDM role.

use std::collections::HashMap;
use std::sync::Arc;

use cowl_meta::{VolumeMetadata, round_up};
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::image::{CopyOp, Image, SyncType};
use crate::rm::{IMAGE_NAMESPACE, LockMode, ResourceLease, namespace};
use crate::sd::{CreateVolumeArgs, StorageDomain};
use crate::task::Task;
use crate::volume::Prepare;
use crate::{Context, Error, Result};

/// The host-side service facade over the chain engine.
#[derive(Debug)]
pub struct Hsm {
    ctx: Arc<Context>,
    image: Image,
    domains: Mutex<HashMap<Uuid, Arc<StorageDomain>>>,
}

impl Hsm {
    /// Creates the facade over a context.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            image: Image::new(Arc::clone(&ctx)),
            ctx,
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// The engine context.
    pub const fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// The underlying chain engine, for embedders composing their own
    /// transactions.
    pub const fn image_engine(&self) -> &Image {
        &self.image
    }

    /// Registers an attached domain with the cache.
    pub fn attach_domain(&self, dom: Arc<StorageDomain>) {
        info!(sd = %dom.sd_uuid(), "attaching storage domain");
        self.domains.lock().insert(dom.sd_uuid(), dom);
    }

    /// Forgets a domain.
    pub fn detach_domain(&self, sd_uuid: Uuid) {
        self.domains.lock().remove(&sd_uuid);
    }

    /// Looks up an attached domain.
    pub fn produce_domain(&self, sd_uuid: Uuid) -> Result<Arc<StorageDomain>> {
        self.domains
            .lock()
            .get(&sd_uuid)
            .cloned()
            .ok_or(Error::DomainDoesNotExist(sd_uuid))
    }

    fn lock_image(
        &self,
        dom: &Arc<StorageDomain>,
        img_uuid: Uuid,
        mode: LockMode,
    ) -> Result<ResourceLease> {
        self.ctx.rm().acquire(
            &namespace(IMAGE_NAMESPACE, dom.sd_uuid()),
            &img_uuid.to_string(),
            mode,
            self.ctx.config().resource_timeout(),
        )
    }

    /// Takes two image locks in namespace order so concurrent cross-domain
    /// operations cannot deadlock.
    fn lock_image_pair(
        &self,
        first: (&Arc<StorageDomain>, Uuid, LockMode),
        second: (&Arc<StorageDomain>, Uuid, LockMode),
    ) -> Result<(ResourceLease, ResourceLease)> {
        let key = |dom: &Arc<StorageDomain>| namespace(IMAGE_NAMESPACE, dom.sd_uuid());
        if key(first.0) <= key(second.0) {
            let a = self.lock_image(first.0, first.1, first.2)?;
            let b = self.lock_image(second.0, second.1, second.2)?;
            Ok((a, b))
        } else {
            let b = self.lock_image(second.0, second.1, second.2)?;
            let a = self.lock_image(first.0, first.1, first.2)?;
            Ok((a, b))
        }
    }

    // ------------------------------------------------------------------
    // Cluster lease
    // ------------------------------------------------------------------

    /// Joins the domain lockspace and takes the SDM lease, making this
    /// host the domain master.
    pub fn acquire_domain_master(&self, sd_uuid: Uuid, host_id: u32) -> Result<()> {
        let dom = self.produce_domain(sd_uuid)?;
        dom.cluster_lease().acquire_host_id(host_id)?;
        dom.cluster_lease().acquire_domain_lock()
    }

    /// Drops the SDM lease and leaves the lockspace.
    pub fn release_domain_master(&self, sd_uuid: Uuid) -> Result<()> {
        let dom = self.produce_domain(sd_uuid)?;
        dom.cluster_lease().release_domain_lock()?;
        dom.cluster_lease().release_host_id()
    }

    // ------------------------------------------------------------------
    // Volume operations
    // ------------------------------------------------------------------

    /// Creates a volume; returns its UUID.
    pub fn create_volume(&self, sd_uuid: Uuid, args: CreateVolumeArgs) -> Result<Uuid> {
        let dom = self.produce_domain(sd_uuid)?;
        let task = Task::new();
        let _img = self.lock_image(&dom, args.img_uuid, LockMode::Exclusive)?;
        let vol = task.run(|task| dom.create_volume(args.clone(), task))?;
        task.clear_recoveries();
        Ok(vol.vol_uuid())
    }

    /// Creates a snapshot: a COW child of `parent_vol` in the same
    /// image. The parent drops to INTERNAL.
    ///
    /// `capacity` must be at least the parent capacity (4K-rounded). On
    /// block domains the child's initial allocation comes from qemu's
    /// measurement of the parent.
    pub fn create_snapshot(
        &self,
        sd_uuid: Uuid,
        img_uuid: Uuid,
        parent_vol: Uuid,
        new_vol: Uuid,
        capacity: u64,
        desc: String,
    ) -> Result<Uuid> {
        let dom = self.produce_domain(sd_uuid)?;
        let task = Task::new();
        let _img = self.lock_image(&dom, img_uuid, LockMode::Exclusive)?;

        let parent = dom.produce_volume(img_uuid, parent_vol)?;
        let parent_md = parent.get_metadata()?;
        if round_up(capacity, 4096) < round_up(parent_md.capacity, 4096) {
            return Err(Error::InvalidParameter {
                name: "capacity",
                value: format!("{capacity} < parent {}", parent_md.capacity),
            });
        }

        let initial_size = if dom.is_block() {
            parent.prepare(Prepare::read_only())?;
            let estimate = self.image.estimate_qcow2_size_blk(&parent, &dom);
            let _ = parent.teardown(true);
            Some(estimate? * cowl_meta::BLOCK_SIZE_512)
        } else {
            None
        };

        let vol = task.run(|task| {
            dom.create_volume(
                CreateVolumeArgs {
                    img_uuid,
                    capacity,
                    vol_format: cowl_meta::VolumeFormat::Cow,
                    preallocate: cowl_meta::VolumeType::Sparse,
                    disk_type: parent_md.disktype,
                    vol_uuid: new_vol,
                    desc,
                    src_img_uuid: img_uuid,
                    src_vol_uuid: parent_vol,
                    initial_size,
                },
                task,
            )
        })?;
        task.clear_recoveries();
        Ok(vol.vol_uuid())
    }

    /// Deletes one volume.
    pub fn delete_volume(
        &self,
        sd_uuid: Uuid,
        img_uuid: Uuid,
        vol_uuid: Uuid,
        post_zero: bool,
        force: bool,
        discard: bool,
    ) -> Result<()> {
        let dom = self.produce_domain(sd_uuid)?;
        let task = Task::new();
        let _img = self.lock_image(&dom, img_uuid, LockMode::Exclusive)?;
        task.run(|task| {
            let mut vol = dom.produce_volume(img_uuid, vol_uuid)?;
            vol.delete(post_zero, force, discard, task)
        })?;
        task.clear_recoveries();
        Ok(())
    }

    /// Deletes a whole image.
    pub fn delete_image(
        &self,
        sd_uuid: Uuid,
        img_uuid: Uuid,
        post_zero: bool,
        discard: bool,
    ) -> Result<()> {
        let dom = self.produce_domain(sd_uuid)?;
        let task = Task::new();
        let _img = self.lock_image(&dom, img_uuid, LockMode::Exclusive)?;
        task.run(|task| dom.delete_image(img_uuid, post_zero, discard, task))?;
        task.clear_recoveries();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chain operations
    // ------------------------------------------------------------------

    /// The parent-first chain of an image, as UUIDs.
    pub fn get_volume_chain(&self, sd_uuid: Uuid, img_uuid: Uuid) -> Result<Vec<Uuid>> {
        let dom = self.produce_domain(sd_uuid)?;
        let _img = self.lock_image(&dom, img_uuid, LockMode::Shared)?;
        Ok(self
            .image
            .get_chain(&dom, img_uuid, None)?
            .iter()
            .map(crate::volume::Volume::vol_uuid)
            .collect())
    }

    /// Decoded metadata of one volume.
    pub fn get_volume_info(
        &self,
        sd_uuid: Uuid,
        img_uuid: Uuid,
        vol_uuid: Uuid,
    ) -> Result<VolumeMetadata> {
        let dom = self.produce_domain(sd_uuid)?;
        let _img = self.lock_image(&dom, img_uuid, LockMode::Shared)?;
        dom.produce_volume(img_uuid, vol_uuid)?.get_metadata()
    }

    /// Collapses `ancestor → … → successor` into `successor`.
    pub fn merge_snapshots(
        &self,
        sd_uuid: Uuid,
        img_uuid: Uuid,
        ancestor: Uuid,
        successor: Uuid,
        post_zero: bool,
        discard: bool,
    ) -> Result<()> {
        let dom = self.produce_domain(sd_uuid)?;
        let task = Task::new();
        let _img = self.lock_image(&dom, img_uuid, LockMode::Exclusive)?;
        task.run(|task| {
            self.image
                .merge(&dom, img_uuid, ancestor, successor, post_zero, discard, task)
        })
    }

    /// Copies or moves an image between attached domains.
    pub fn copy_image(
        &self,
        src_sd: Uuid,
        dst_sd: Uuid,
        img_uuid: Uuid,
        op: CopyOp,
        post_zero: bool,
        force: bool,
        discard: bool,
    ) -> Result<()> {
        let src_dom = self.produce_domain(src_sd)?;
        let dst_dom = self.produce_domain(dst_sd)?;
        let task = Task::new();

        let src_mode = match op {
            CopyOp::Copy => LockMode::Shared,
            CopyOp::Move => LockMode::Exclusive,
        };
        let _locks = self.lock_image_pair(
            (&src_dom, img_uuid, src_mode),
            (&dst_dom, img_uuid, LockMode::Exclusive),
        )?;

        task.run(|task| {
            self.image.move_image(
                &src_dom, &dst_dom, img_uuid, op, post_zero, force, discard, task,
            )
        })
    }

    /// Builds an image's chain on another domain without copying data.
    pub fn clone_image_structure(
        &self,
        src_sd: Uuid,
        img_uuid: Uuid,
        dst_sd: Uuid,
    ) -> Result<()> {
        let src_dom = self.produce_domain(src_sd)?;
        let dst_dom = self.produce_domain(dst_sd)?;
        let task = Task::new();
        let _locks = self.lock_image_pair(
            (&src_dom, img_uuid, LockMode::Shared),
            (&dst_dom, img_uuid, LockMode::Exclusive),
        )?;
        task.run(|task| self.image.clone_structure(&src_dom, img_uuid, &dst_dom, task))?;
        task.clear_recoveries();
        Ok(())
    }

    /// Copies data across two matching chains.
    pub fn sync_image_data(
        &self,
        src_sd: Uuid,
        img_uuid: Uuid,
        dst_sd: Uuid,
        sync_type: SyncType,
    ) -> Result<()> {
        let src_dom = self.produce_domain(src_sd)?;
        let dst_dom = self.produce_domain(dst_sd)?;
        let task = Task::new();
        let _locks = self.lock_image_pair(
            (&src_dom, img_uuid, LockMode::Shared),
            (&dst_dom, img_uuid, LockMode::Exclusive),
        )?;
        task.run(|task| {
            self.image
                .sync_data(&src_dom, img_uuid, &dst_dom, sync_type, task)
        })?;
        task.clear_recoveries();
        Ok(())
    }

    /// Reduces guest free space to domain free space.
    pub fn sparsify_volume(
        &self,
        tmp_sd: Uuid,
        tmp_img: Uuid,
        tmp_vol: Uuid,
        dst_sd: Uuid,
        dst_img: Uuid,
        dst_vol: Uuid,
    ) -> Result<()> {
        let tmp_dom = self.produce_domain(tmp_sd)?;
        let dst_dom = self.produce_domain(dst_sd)?;
        let task = Task::new();
        let _locks = self.lock_image_pair(
            (&tmp_dom, tmp_img, LockMode::Exclusive),
            (&dst_dom, dst_img, LockMode::Exclusive),
        )?;
        task.run(|task| {
            self.image
                .sparsify(&tmp_dom, tmp_img, tmp_vol, &dst_dom, dst_img, dst_vol, task)
        })
    }

    /// Syncs an offline image's chain metadata with what qemu reports.
    pub fn reconcile_volume_chain(
        &self,
        sd_uuid: Uuid,
        img_uuid: Uuid,
        leaf_vol: Uuid,
    ) -> Result<Vec<Uuid>> {
        let dom = self.produce_domain(sd_uuid)?;
        let task = Task::new();
        let _img = self.lock_image(&dom, img_uuid, LockMode::Exclusive)?;
        task.run(|_task| self.image.reconcile_volume_chain(&dom, img_uuid, leaf_vol))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cowl_meta::{
        BLANK_UUID, DiskType, DomainVersion, Legality, VolumeFormat, VolumeMetadata, VolumeRole,
        VolumeType,
    };

    use super::*;
    use crate::lease::Alignment;
    use crate::sd::{Backend, DomainClass, FileDomain};
    use crate::{MEGAB, qemuimg};

    const GIB: u64 = 1 << 30;

    fn file_hsm() -> (tempfile::TempDir, Hsm, Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new_for_tests();
        let hsm = Hsm::new(Arc::clone(&ctx));
        let sd = Uuid::new_v4();
        let dom = crate::sd::StorageDomain::create_file(
            &ctx,
            dir.path(),
            sd,
            DomainVersion::V5,
            DomainClass::Data,
            0,
            Alignment::M1,
        )
        .unwrap();
        hsm.attach_domain(dom);
        (dir, hsm, sd)
    }

    fn raw_args(img: Uuid, vol: Uuid, capacity: u64) -> CreateVolumeArgs {
        CreateVolumeArgs {
            img_uuid: img,
            capacity,
            vol_format: VolumeFormat::Raw,
            preallocate: VolumeType::Sparse,
            disk_type: DiskType::Data,
            vol_uuid: vol,
            desc: "test volume".to_owned(),
            src_img_uuid: BLANK_UUID,
            src_vol_uuid: BLANK_UUID,
            initial_size: None,
        }
    }

    fn have(binary: &str) -> bool {
        std::process::Command::new(binary)
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    /// Writes a volume's artifacts by hand: an empty payload plus a real
    /// metadata record. Lets chain-logic tests run without qemu.
    fn write_stub_volume(
        dom: &Arc<StorageDomain>,
        img: Uuid,
        vol: Uuid,
        parent: Uuid,
        format: VolumeFormat,
        role: VolumeRole,
    ) {
        let Backend::File(f) = dom.backend() else {
            panic!("stub volumes are file-domain only");
        };
        f.io().create_dir_all(&f.image_dir(img)).unwrap();
        f.io()
            .truncate(&f.vol_path(img, vol), 0, 0o660, false)
            .unwrap();
        let md = VolumeMetadata {
            ctime: 1_700_000_000,
            description: String::new(),
            disktype: DiskType::Data,
            domain: dom.sd_uuid(),
            format,
            image: img,
            legality: Legality::Legal,
            puuid: parent,
            capacity: GIB,
            vol_type: VolumeType::Sparse,
            role,
            generation: 0,
        };
        f.write_metadata_text(img, vol, md.serialize(dom.version()).unwrap())
            .unwrap();
    }

    #[test]
    fn unattached_domain_is_reported() {
        let ctx = Context::new_for_tests();
        let hsm = Hsm::new(ctx);
        assert!(matches!(
            hsm.produce_domain(Uuid::new_v4()),
            Err(Error::DomainDoesNotExist(_))
        ));
    }

    #[test]
    fn create_raw_preallocated_with_initial_size() {
        if !have("fallocate") {
            return;
        }
        let (_dir, hsm, sd) = file_hsm();
        let img = Uuid::new_v4();
        let vol = Uuid::new_v4();
        let mut args = raw_args(img, vol, 10 * MEGAB);
        args.preallocate = VolumeType::Preallocated;
        args.initial_size = Some(MEGAB);
        hsm.create_volume(sd, args).unwrap();

        let md = hsm.get_volume_info(sd, img, vol).unwrap();
        assert_eq!(md.capacity, 10 * MEGAB);
        assert_eq!(md.format, VolumeFormat::Raw);
        assert_eq!(md.vol_type, VolumeType::Preallocated);
        assert_eq!(md.role, VolumeRole::Leaf);
        assert_eq!(md.generation, 0);

        let dom = hsm.produce_domain(sd).unwrap();
        let volume = dom.produce_volume(img, vol).unwrap();
        assert_eq!(volume.size().unwrap(), 10 * MEGAB);
        let apparent = volume.apparent_size().unwrap();
        assert!(apparent >= MEGAB, "fallocated {apparent} bytes");
        assert!(apparent < 2 * MEGAB, "allocated too much: {apparent}");

        // The lease sidecar exists for every non-ISO volume.
        let Backend::File(f) = dom.backend() else {
            unreachable!();
        };
        let lease = FileDomain::lease_path(&volume.path());
        assert!(f.io().path_exists(&lease).unwrap());
    }

    #[test]
    fn create_raw_sparse_is_fully_virtual() {
        let (_dir, hsm, sd) = file_hsm();
        let img = Uuid::new_v4();
        let vol = Uuid::new_v4();
        hsm.create_volume(sd, raw_args(img, vol, 10 * MEGAB)).unwrap();

        let dom = hsm.produce_domain(sd).unwrap();
        let volume = dom.produce_volume(img, vol).unwrap();
        assert_eq!(volume.size().unwrap(), 10 * MEGAB);
        assert!(volume.apparent_size().unwrap() < MEGAB);
    }

    #[test]
    fn initial_size_rejected_for_sparse_raw() {
        let (_dir, hsm, sd) = file_hsm();
        let mut args = raw_args(Uuid::new_v4(), Uuid::new_v4(), 10 * MEGAB);
        args.initial_size = Some(MEGAB);
        assert!(matches!(
            hsm.create_volume(sd, args),
            Err(Error::InvalidParameter { name: "initial_size", .. })
        ));
    }

    #[test]
    fn initial_size_above_capacity_rejected() {
        let (_dir, hsm, sd) = file_hsm();
        let mut args = raw_args(Uuid::new_v4(), Uuid::new_v4(), 10 * MEGAB);
        args.preallocate = VolumeType::Preallocated;
        args.initial_size = Some(11 * MEGAB);
        assert!(matches!(
            hsm.create_volume(sd, args),
            Err(Error::InvalidParameter { name: "initial_size", .. })
        ));
    }

    #[test]
    fn raw_snapshot_rejected() {
        let (_dir, hsm, sd) = file_hsm();
        let img = Uuid::new_v4();
        let base = Uuid::new_v4();
        hsm.create_volume(sd, raw_args(img, base, 10 * MEGAB)).unwrap();

        let mut args = raw_args(img, Uuid::new_v4(), 10 * MEGAB);
        args.src_img_uuid = img;
        args.src_vol_uuid = base;
        assert!(hsm.create_volume(sd, args).is_err());
    }

    #[test]
    fn duplicate_volume_rejected() {
        let (_dir, hsm, sd) = file_hsm();
        let img = Uuid::new_v4();
        let vol = Uuid::new_v4();
        hsm.create_volume(sd, raw_args(img, vol, 10 * MEGAB)).unwrap();
        assert!(matches!(
            hsm.create_volume(sd, raw_args(img, vol, 10 * MEGAB)),
            Err(Error::VolumeAlreadyExists(_))
        ));
    }

    #[test]
    fn snapshot_capacity_below_parent_rejected() {
        let (_dir, hsm, sd) = file_hsm();
        let img = Uuid::new_v4();
        let base = Uuid::new_v4();
        hsm.create_volume(sd, raw_args(img, base, GIB)).unwrap();

        let err = hsm
            .create_snapshot(sd, img, base, Uuid::new_v4(), GIB - 4096, "snap".to_owned())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { name: "capacity", .. }));
    }

    #[test]
    fn chain_discovery_from_stub_volumes() {
        let (_dir, hsm, sd) = file_hsm();
        let dom = hsm.produce_domain(sd).unwrap();
        let img = Uuid::new_v4();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        write_stub_volume(&dom, img, a, BLANK_UUID, VolumeFormat::Raw, VolumeRole::Internal);
        write_stub_volume(&dom, img, b, a, VolumeFormat::Cow, VolumeRole::Internal);
        write_stub_volume(&dom, img, c, b, VolumeFormat::Cow, VolumeRole::Leaf);

        assert_eq!(hsm.get_volume_chain(sd, img).unwrap(), vec![a, b, c]);
    }

    #[test]
    fn chain_without_leaf_is_illegal() {
        let (_dir, hsm, sd) = file_hsm();
        let dom = hsm.produce_domain(sd).unwrap();
        let img = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        write_stub_volume(&dom, img, a, BLANK_UUID, VolumeFormat::Raw, VolumeRole::Internal);
        write_stub_volume(&dom, img, b, a, VolumeFormat::Cow, VolumeRole::Internal);

        assert!(matches!(
            hsm.get_volume_chain(sd, img),
            Err(Error::ImageIsNotLegalChain(_))
        ));
    }

    #[test]
    fn chain_cycle_is_detected() {
        let (_dir, hsm, sd) = file_hsm();
        let dom = hsm.produce_domain(sd).unwrap();
        let img = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        write_stub_volume(&dom, img, a, b, VolumeFormat::Cow, VolumeRole::Internal);
        write_stub_volume(&dom, img, b, a, VolumeFormat::Cow, VolumeRole::Leaf);

        assert!(matches!(
            hsm.get_volume_chain(sd, img),
            Err(Error::ImageIsNotLegalChain(_))
        ));
    }

    #[test]
    fn template_image_chain_is_the_template() {
        let (_dir, hsm, sd) = file_hsm();
        let dom = hsm.produce_domain(sd).unwrap();
        let img = Uuid::new_v4();
        let t = Uuid::new_v4();
        write_stub_volume(&dom, img, t, BLANK_UUID, VolumeFormat::Raw, VolumeRole::Shared);

        assert_eq!(hsm.get_volume_chain(sd, img).unwrap(), vec![t]);
    }

    #[test]
    fn sync_chain_repoints_children_of_removed_run() {
        let (_dir, hsm, sd) = file_hsm();
        let dom = hsm.produce_domain(sd).unwrap();
        let img = Uuid::new_v4();
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        write_stub_volume(&dom, img, a, BLANK_UUID, VolumeFormat::Raw, VolumeRole::Internal);
        write_stub_volume(&dom, img, b, a, VolumeFormat::Cow, VolumeRole::Internal);
        write_stub_volume(&dom, img, c, b, VolumeFormat::Cow, VolumeRole::Internal);
        write_stub_volume(&dom, img, d, c, VolumeFormat::Cow, VolumeRole::Leaf);

        hsm.image_engine()
            .sync_volume_chain(&dom, img, d, &[a, d])
            .unwrap();

        let d_md = hsm.get_volume_info(sd, img, d).unwrap();
        assert_eq!(d_md.puuid, a);
        assert_eq!(d_md.legality, Legality::Legal);
    }

    #[test]
    fn sync_chain_marks_removed_leaf_illegal() {
        let (_dir, hsm, sd) = file_hsm();
        let dom = hsm.produce_domain(sd).unwrap();
        let img = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        write_stub_volume(&dom, img, a, BLANK_UUID, VolumeFormat::Raw, VolumeRole::Internal);
        write_stub_volume(&dom, img, b, a, VolumeFormat::Cow, VolumeRole::Leaf);

        hsm.image_engine()
            .sync_volume_chain(&dom, img, b, &[a])
            .unwrap();
        let b_md = hsm.get_volume_info(sd, img, b).unwrap();
        assert_eq!(b_md.legality, Legality::Illegal);
    }

    #[test]
    fn sync_chain_with_matching_chains_is_a_noop() {
        let (_dir, hsm, sd) = file_hsm();
        let dom = hsm.produce_domain(sd).unwrap();
        let img = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        write_stub_volume(&dom, img, a, BLANK_UUID, VolumeFormat::Raw, VolumeRole::Internal);
        write_stub_volume(&dom, img, b, a, VolumeFormat::Cow, VolumeRole::Leaf);

        hsm.image_engine()
            .sync_volume_chain(&dom, img, b, &[a, b])
            .unwrap();
        assert_eq!(hsm.get_volume_chain(sd, img).unwrap(), vec![a, b]);
    }

    #[test]
    fn delete_volume_removes_artifacts() {
        let (_dir, hsm, sd) = file_hsm();
        let img = Uuid::new_v4();
        let vol = Uuid::new_v4();
        hsm.create_volume(sd, raw_args(img, vol, 10 * MEGAB)).unwrap();
        hsm.delete_volume(sd, img, vol, false, false, false).unwrap();

        let dom = hsm.produce_domain(sd).unwrap();
        assert!(dom.get_vols_of_image(img).unwrap().is_empty());
        assert!(dom.produce_volume(img, vol).is_err());
    }

    #[test]
    fn deleting_last_child_promotes_parent_to_leaf() {
        let (_dir, hsm, sd) = file_hsm();
        let dom = hsm.produce_domain(sd).unwrap();
        let img = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        write_stub_volume(&dom, img, a, BLANK_UUID, VolumeFormat::Raw, VolumeRole::Internal);
        write_stub_volume(&dom, img, b, a, VolumeFormat::Cow, VolumeRole::Leaf);

        hsm.delete_volume(sd, img, b, false, true, false).unwrap();
        let a_md = hsm.get_volume_info(sd, img, a).unwrap();
        assert_eq!(a_md.role, VolumeRole::Leaf);
    }

    #[test]
    fn discard_on_file_domain_is_unsupported() {
        let (_dir, hsm, sd) = file_hsm();
        let img = Uuid::new_v4();
        let vol = Uuid::new_v4();
        hsm.create_volume(sd, raw_args(img, vol, 10 * MEGAB)).unwrap();
        assert!(matches!(
            hsm.delete_volume(sd, img, vol, false, false, true),
            Err(Error::DiscardNotSupported(_))
        ));
    }

    // ------------------------------------------------------------------
    // Scenarios driving the real qemu-img
    // ------------------------------------------------------------------

    /// Builds A(raw) ← B(cow) ← C(cow) with real snapshots.
    fn build_snapshot_chain(hsm: &Hsm, sd: Uuid) -> (Uuid, Uuid, Uuid, Uuid) {
        let img = Uuid::new_v4();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        hsm.create_volume(sd, raw_args(img, a, GIB)).unwrap();
        hsm.create_snapshot(sd, img, a, b, GIB, "first snapshot".to_owned())
            .unwrap();
        hsm.create_snapshot(sd, img, b, c, 2 * GIB, "second snapshot".to_owned())
            .unwrap();
        (img, a, b, c)
    }

    #[test]
    fn snapshot_chain_roles_and_backing() {
        if !qemuimg::available() {
            return;
        }
        let (_dir, hsm, sd) = file_hsm();
        let (img, a, b, c) = build_snapshot_chain(&hsm, sd);

        assert_eq!(hsm.get_volume_chain(sd, img).unwrap(), vec![a, b, c]);
        assert_eq!(
            hsm.get_volume_info(sd, img, a).unwrap().role,
            VolumeRole::Internal
        );
        assert_eq!(
            hsm.get_volume_info(sd, img, b).unwrap().role,
            VolumeRole::Internal
        );
        let c_md = hsm.get_volume_info(sd, img, c).unwrap();
        assert_eq!(c_md.role, VolumeRole::Leaf);
        assert_eq!(c_md.capacity, 2 * GIB);

        let dom = hsm.produce_domain(sd).unwrap();
        let c_vol = dom.produce_volume(img, c).unwrap();
        let info = qemuimg::info(&c_vol.path(), Some(qemuimg::Format::Qcow2)).unwrap();
        assert_eq!(info.backing_basename(), Some(b.to_string().as_str()));
    }

    #[test]
    fn internal_merge_collapses_subchain() {
        if !qemuimg::available() {
            return;
        }
        let (_dir, hsm, sd) = file_hsm();
        let (img, a, b, c) = build_snapshot_chain(&hsm, sd);

        hsm.merge_snapshots(sd, img, b, c, false, false).unwrap();

        assert_eq!(hsm.get_volume_chain(sd, img).unwrap(), vec![a, c]);
        assert!(hsm.get_volume_info(sd, img, b).is_err(), "B must be gone");
        let c_md = hsm.get_volume_info(sd, img, c).unwrap();
        assert_eq!(c_md.puuid, a);
        assert_eq!(c_md.capacity, 2 * GIB);
        assert_eq!(c_md.role, VolumeRole::Leaf);

        let dom = hsm.produce_domain(sd).unwrap();
        let c_vol = dom.produce_volume(img, c).unwrap();
        let info = qemuimg::info(&c_vol.path(), Some(qemuimg::Format::Qcow2)).unwrap();
        assert_eq!(info.backing_basename(), Some(a.to_string().as_str()));
    }

    #[test]
    fn base_cow_merge_produces_standalone_base() {
        if !qemuimg::available() {
            return;
        }
        let (_dir, hsm, sd) = file_hsm();
        let img = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut args = raw_args(img, a, GIB);
        args.vol_format = VolumeFormat::Cow;
        hsm.create_volume(sd, args).unwrap();
        hsm.create_snapshot(sd, img, a, b, GIB, "snap".to_owned()).unwrap();

        hsm.merge_snapshots(sd, img, a, b, false, false).unwrap();

        assert_eq!(hsm.get_volume_chain(sd, img).unwrap(), vec![b]);
        let b_md = hsm.get_volume_info(sd, img, b).unwrap();
        assert_eq!(b_md.puuid, BLANK_UUID);

        let dom = hsm.produce_domain(sd).unwrap();
        let b_vol = dom.produce_volume(img, b).unwrap();
        let info = qemuimg::info(&b_vol.path(), Some(qemuimg::Format::Qcow2)).unwrap();
        assert!(info.backing_filename.is_none());
    }

    #[test]
    fn reconcile_after_out_of_band_rebase() {
        if !qemuimg::available() {
            return;
        }
        let (_dir, hsm, sd) = file_hsm();
        let img = Uuid::new_v4();
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        hsm.create_volume(sd, raw_args(img, a, GIB)).unwrap();
        hsm.create_snapshot(sd, img, a, b, GIB, String::new()).unwrap();
        hsm.create_snapshot(sd, img, b, c, GIB, String::new()).unwrap();
        hsm.create_snapshot(sd, img, c, d, GIB, String::new()).unwrap();

        // A live merge dropped B and C behind the engine's back.
        let dom = hsm.produce_domain(sd).unwrap();
        let d_vol = dom.produce_volume(img, d).unwrap();
        let task = Task::new();
        qemuimg::rebase(
            &d_vol.path(),
            &crate::volume::backing_volume_path(img, a),
            qemuimg::Format::Qcow2,
            Some(qemuimg::Format::Raw),
            true,
            &task,
        )
        .unwrap();

        let actual = hsm.reconcile_volume_chain(sd, img, d).unwrap();
        assert_eq!(actual, vec![a, d]);
        let d_md = hsm.get_volume_info(sd, img, d).unwrap();
        assert_eq!(d_md.puuid, a);
        assert_eq!(d_md.legality, Legality::Legal);
    }

    #[test]
    fn copy_image_preserves_template_and_chain() {
        if !qemuimg::available() {
            return;
        }
        let (_src_dir, hsm, src_sd) = file_hsm();
        let dst_dir = tempfile::tempdir().unwrap();
        let ctx = Arc::clone(hsm.ctx());
        let dst_sd = Uuid::new_v4();
        let dst_dom = crate::sd::StorageDomain::create_file(
            &ctx,
            dst_dir.path(),
            dst_sd,
            DomainVersion::V5,
            DomainClass::Data,
            0,
            Alignment::M1,
        )
        .unwrap();
        hsm.attach_domain(dst_dom);

        // Template image: one shared RAW volume.
        let template_img = Uuid::new_v4();
        let template = Uuid::new_v4();
        hsm.create_volume(src_sd, raw_args(template_img, template, GIB))
            .unwrap();
        let src_dom = hsm.produce_domain(src_sd).unwrap();
        src_dom
            .produce_volume(template_img, template)
            .unwrap()
            .set_shared()
            .unwrap();

        // VM image: one COW leaf on top of the template.
        let img = Uuid::new_v4();
        let leaf = Uuid::new_v4();
        let mut args = raw_args(img, leaf, GIB);
        args.vol_format = VolumeFormat::Cow;
        args.src_img_uuid = template_img;
        args.src_vol_uuid = template;
        hsm.create_volume(src_sd, args).unwrap();

        // The template must land on the destination first, as on any
        // real deployment.
        hsm.copy_image(src_sd, dst_sd, template_img, CopyOp::Copy, false, false, false)
            .unwrap();
        hsm.copy_image(src_sd, dst_sd, img, CopyOp::Copy, false, false, false)
            .unwrap();

        // Destination: template SHARED, chain matching the source.
        let dst_dom = hsm.produce_domain(dst_sd).unwrap();
        let dst_template = dst_dom.produce_volume(template_img, template).unwrap();
        assert!(dst_template.is_shared().unwrap());
        assert_eq!(hsm.get_volume_chain(dst_sd, img).unwrap(), vec![leaf]);
        let dst_leaf_md = hsm.get_volume_info(dst_sd, img, leaf).unwrap();
        assert_eq!(dst_leaf_md.puuid, template);
        assert_eq!(dst_leaf_md.role, VolumeRole::Leaf);

        // Source is intact.
        assert_eq!(hsm.get_volume_chain(src_sd, img).unwrap(), vec![leaf]);
        assert!(
            src_dom
                .produce_volume(template_img, template)
                .unwrap()
                .is_shared()
                .unwrap()
        );
    }

    #[test]
    fn move_image_removes_source() {
        if !qemuimg::available() {
            return;
        }
        let (_src_dir, hsm, src_sd) = file_hsm();
        let dst_dir = tempfile::tempdir().unwrap();
        let ctx = Arc::clone(hsm.ctx());
        let dst_sd = Uuid::new_v4();
        let dst_dom = crate::sd::StorageDomain::create_file(
            &ctx,
            dst_dir.path(),
            dst_sd,
            DomainVersion::V5,
            DomainClass::Data,
            0,
            Alignment::M1,
        )
        .unwrap();
        hsm.attach_domain(dst_dom);

        let img = Uuid::new_v4();
        let vol = Uuid::new_v4();
        hsm.create_volume(src_sd, raw_args(img, vol, 10 * MEGAB)).unwrap();

        hsm.copy_image(src_sd, dst_sd, img, CopyOp::Move, false, false, false)
            .unwrap();

        assert_eq!(hsm.get_volume_chain(dst_sd, img).unwrap(), vec![vol]);
        let src_dom = hsm.produce_domain(src_sd).unwrap();
        assert!(src_dom.get_vols_of_image(img).unwrap().is_empty());
    }
}

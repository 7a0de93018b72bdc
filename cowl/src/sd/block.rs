//! Block-backed domain layout: one VG per domain on shared SAN, one LV
//! per volume.
//!
//! Volume state that file domains keep in sidecar files lives in LV tags
//! (`MD_<slot>`, `IU_<imgUUID>`, `PU_<puuid>`) and in fixed 512-byte
//! slots of the `metadata` LV. Deletion renames the LV aside with a
//! `_remove_me_` prefix and drops its `IU_` tag first, so image
//! enumeration stops seeing it before the LV disappears.

use std::collections::{HashMap, HashSet};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use cowl_lvm::{LogicalVolume, LvmCache};
use cowl_meta::{
    DomainVersion, METADATA_SIZE, REMOVED_IMAGE_PREFIX, TAG_PREFIX_IMAGE, TAG_PREFIX_MD,
    TAG_PREFIX_PARENT, TAG_VOL_UNINIT,
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{Error, Result};

/// LVs every block domain reserves for itself.
pub const RESERVED_LVS: [&str; 6] = ["metadata", "ids", "leases", "inbox", "outbox", "master"];

/// Block-backend half of a storage domain.
#[derive(Debug)]
pub struct BlockDomain {
    vg: String,
    lvm: Arc<LvmCache>,
    slots: SlotAllocator,
}

impl BlockDomain {
    /// Binds the backend to a VG (named after the domain UUID).
    pub fn new(sd_uuid: Uuid, lvm: Arc<LvmCache>) -> Self {
        Self {
            vg: sd_uuid.to_string(),
            lvm,
            slots: SlotAllocator::default(),
        }
    }

    /// The VG name.
    pub fn vg(&self) -> &str {
        &self.vg
    }

    /// The LVM command layer.
    pub const fn lvm(&self) -> &Arc<LvmCache> {
        &self.lvm
    }

    /// Device path of an LV.
    pub fn lv_path(&self, lv: &str) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.vg, lv))
    }

    /// Device path of a volume LV.
    pub fn vol_path(&self, vol_uuid: Uuid) -> PathBuf {
        self.lv_path(&vol_uuid.to_string())
    }

    /// Looks up a volume LV, its tags included.
    pub fn find_lv(&self, vol_uuid: Uuid) -> Result<LogicalVolume> {
        self.lvm
            .get_lv(&self.vg, &vol_uuid.to_string())
            .map_err(|_| Error::VolumeDoesNotExist(vol_uuid))
    }

    /// Live (committed, not removed) volume LVs of the domain.
    pub fn live_volume_lvs(&self) -> Result<Vec<LogicalVolume>> {
        Ok(self
            .lvm
            .list_lvs(&self.vg)?
            .into_iter()
            .filter(|lv| {
                !RESERVED_LVS.contains(&lv.name.as_str())
                    && !lv.name.starts_with(REMOVED_IMAGE_PREFIX)
                    && !lv.tags.iter().any(|t| t == TAG_VOL_UNINIT)
            })
            .collect())
    }

    /// Volumes of one image, discovered from `IU_` tags.
    pub fn list_image_volumes(&self, img_uuid: Uuid) -> Result<Vec<Uuid>> {
        let image_tag = format!("{TAG_PREFIX_IMAGE}{img_uuid}");
        let mut vols = Vec::new();
        for lv in self.live_volume_lvs()? {
            if lv.tags.iter().any(|t| *t == image_tag) {
                if let Ok(vol) = lv.name.parse() {
                    vols.push(vol);
                }
            }
        }
        Ok(vols)
    }

    /// `volume → image` map over the whole domain.
    pub fn all_volumes(&self) -> Result<HashMap<Uuid, Uuid>> {
        let mut all = HashMap::new();
        for lv in self.live_volume_lvs()? {
            let Ok(vol) = lv.name.parse::<Uuid>() else {
                continue;
            };
            let Some(img) = lv
                .tag_value(TAG_PREFIX_IMAGE)
                .and_then(|v| v.parse::<Uuid>().ok())
            else {
                continue;
            };
            all.insert(vol, img);
        }
        Ok(all)
    }

    /// The metadata slot bound to a volume LV.
    pub fn md_slot(&self, vol_uuid: Uuid) -> Result<u64> {
        let lv = self.find_lv(vol_uuid)?;
        lv.tag_value(TAG_PREFIX_MD)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::VolumeMetadataReadError {
                vol: vol_uuid,
                reason: "no MD_ tag".to_owned(),
            })
    }

    /// Reads the record text stored in a metadata slot.
    pub fn read_slot(&self, slot: u64) -> Result<String> {
        let mut file = std::fs::File::open(self.lv_path("metadata"))?;
        file.seek(SeekFrom::Start(slot * METADATA_SIZE))?;
        let mut buf = vec![0u8; METADATA_SIZE as usize];
        file.read_exact(&mut buf)?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    /// Replaces a metadata slot with one padded sector write.
    pub fn write_slot(&self, slot: u64, text: &str) -> Result<()> {
        if text.len() as u64 > METADATA_SIZE {
            return Err(Error::Meta(cowl_meta::Error::RecordTooLarge {
                size: text.len(),
                block_size: METADATA_SIZE,
            }));
        }
        let mut buf = vec![0u8; METADATA_SIZE as usize];
        buf[..text.len()].copy_from_slice(text.as_bytes());

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.lv_path("metadata"))?;
        file.seek(SeekFrom::Start(slot * METADATA_SIZE))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    /// Clears a metadata slot.
    pub fn clear_slot(&self, slot: u64) -> Result<()> {
        self.write_slot(slot, "")
    }

    /// Reserves the lowest free metadata slot.
    ///
    /// The reservation keeps the slot out of later scans until the caller
    /// binds it with an `MD_` tag (then the tag itself marks it used) or
    /// drops the reservation.
    pub fn allocate_slot(&self, sd_uuid: Uuid, version: DomainVersion) -> Result<SlotReservation<'_>> {
        let mut used: HashSet<u64> = HashSet::new();
        for lv in self.lvm.list_lvs(&self.vg)? {
            if let Some(slot) = lv.tag_value(TAG_PREFIX_MD).and_then(|v| v.parse().ok()) {
                used.insert(slot);
            }
        }
        self.slots
            .reserve(version.first_metadata_slot(), &used)
            .ok_or(Error::NoFreeMetadataSlot(sd_uuid))
    }

    /// Tag set for a fresh, not-yet-committed volume LV.
    pub fn initial_tags(img_uuid: Uuid, parent: Uuid, slot: u64) -> Vec<String> {
        vec![
            TAG_VOL_UNINIT.to_owned(),
            format!("{TAG_PREFIX_MD}{slot}"),
            format!("{TAG_PREFIX_IMAGE}{img_uuid}"),
            format!("{TAG_PREFIX_PARENT}{parent}"),
        ]
    }
}

/// In-process guard against concurrent slot scans handing out the same
/// slot.
#[derive(Debug, Default)]
pub struct SlotAllocator {
    reserved: Mutex<HashSet<u64>>,
}

impl SlotAllocator {
    fn reserve(&self, first_slot: u64, used: &HashSet<u64>) -> Option<SlotReservation<'_>> {
        let mut reserved = self.reserved.lock();
        let mut slot = first_slot;
        // The metadata LV bounds the slot count; a full scan that finds
        // nothing below the used maximum settles on max+1.
        loop {
            if !used.contains(&slot) && !reserved.contains(&slot) {
                reserved.insert(slot);
                return Some(SlotReservation {
                    allocator: self,
                    slot,
                });
            }
            slot = slot.checked_add(1)?;
        }
    }

    fn release(&self, slot: u64) {
        self.reserved.lock().remove(&slot);
    }
}

/// A reserved metadata slot; released on drop.
#[derive(Debug)]
pub struct SlotReservation<'a> {
    allocator: &'a SlotAllocator,
    /// The reserved slot index.
    pub slot: u64,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        self.allocator.release(self.slot);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn slots_start_at_version_base() {
        let allocator = SlotAllocator::default();
        let used = HashSet::new();
        let v4 = allocator
            .reserve(DomainVersion::V4.first_metadata_slot(), &used)
            .unwrap();
        assert_eq!(v4.slot, 4);
        drop(v4);
        let v5 = allocator
            .reserve(DomainVersion::V5.first_metadata_slot(), &used)
            .unwrap();
        assert_eq!(v5.slot, 1);
    }

    #[test]
    fn lowest_free_slot_wins() {
        let allocator = SlotAllocator::default();
        let used: HashSet<u64> = [1, 2, 4].into_iter().collect();
        let reservation = allocator.reserve(1, &used).unwrap();
        assert_eq!(reservation.slot, 3);
    }

    #[test]
    fn concurrent_reservations_do_not_collide() {
        let allocator = SlotAllocator::default();
        let used = HashSet::new();
        let first = allocator.reserve(1, &used).unwrap();
        let second = allocator.reserve(1, &used).unwrap();
        assert_ne!(first.slot, second.slot);
    }

    #[test]
    fn dropping_reservation_frees_the_slot() {
        let allocator = SlotAllocator::default();
        let used = HashSet::new();
        let slot = {
            let reservation = allocator.reserve(1, &used).unwrap();
            reservation.slot
        };
        let again = allocator.reserve(1, &used).unwrap();
        assert_eq!(again.slot, slot);
    }

    #[test]
    fn initial_tags_cover_the_invariant_set() {
        let img = Uuid::new_v4();
        let parent = Uuid::nil();
        let tags = BlockDomain::initial_tags(img, parent, 7);
        assert!(tags.contains(&TAG_VOL_UNINIT.to_owned()));
        assert!(tags.contains(&"MD_7".to_owned()));
        assert!(tags.contains(&format!("IU_{img}")));
        assert!(tags.contains(&format!("PU_{parent}")));
    }
}

//! File-backed domain layout: one directory tree per domain on an NFS or
//! local mount.
//!
//! ```text
//! <repo>/<sdUUID>/images/<imgUUID>/<volUUID>        payload
//! <repo>/<sdUUID>/images/<imgUUID>/<volUUID>.meta   metadata record
//! <repo>/<sdUUID>/images/<imgUUID>/<volUUID>.lease  lease slot
//! <repo>/<sdUUID>/dom_md/metadata                   domain record
//! <repo>/<sdUUID>/dom_md/{ids,leases,inbox,outbox}  lock areas
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::iopool::FileIo;
use crate::{Error, Result};

/// Extension of metadata sidecars.
pub const META_FILEEXT: &str = ".meta";

/// Extension of lease sidecars.
pub const LEASE_FILEEXT: &str = ".lease";

/// Lease slot offset inside a volume lease file.
pub const LEASE_FILEOFFSET: u64 = 0;

/// File-backend half of a storage domain.
#[derive(Debug, Clone)]
pub struct FileDomain {
    sd_uuid: Uuid,
    repo: PathBuf,
    io: FileIo,
}

impl FileDomain {
    /// Binds the backend to a repository mount.
    pub fn new(sd_uuid: Uuid, repo: impl Into<PathBuf>, io: FileIo) -> Self {
        Self {
            sd_uuid,
            repo: repo.into(),
            io,
        }
    }

    /// The pooled I/O adapter.
    pub const fn io(&self) -> &FileIo {
        &self.io
    }

    /// `<repo>/<sdUUID>`.
    pub fn domain_dir(&self) -> PathBuf {
        self.repo.join(self.sd_uuid.to_string())
    }

    /// `<repo>/<sdUUID>/images`.
    pub fn images_dir(&self) -> PathBuf {
        self.domain_dir().join("images")
    }

    /// `<repo>/<sdUUID>/images/<imgUUID>`.
    pub fn image_dir(&self, img_uuid: Uuid) -> PathBuf {
        self.images_dir().join(img_uuid.to_string())
    }

    /// Payload path of a volume.
    pub fn vol_path(&self, img_uuid: Uuid, vol_uuid: Uuid) -> PathBuf {
        self.image_dir(img_uuid).join(vol_uuid.to_string())
    }

    /// Metadata sidecar of a payload path.
    pub fn meta_path(vol_path: &Path) -> PathBuf {
        sidecar(vol_path, META_FILEEXT)
    }

    /// Lease sidecar of a payload path.
    pub fn lease_path(vol_path: &Path) -> PathBuf {
        sidecar(vol_path, LEASE_FILEEXT)
    }

    /// `<repo>/<sdUUID>/dom_md`.
    pub fn dom_md_dir(&self) -> PathBuf {
        self.domain_dir().join("dom_md")
    }

    /// Domain metadata record path.
    pub fn metadata_path(&self) -> PathBuf {
        self.dom_md_dir().join("metadata")
    }

    /// Host-id lease area.
    pub fn ids_path(&self) -> PathBuf {
        self.dom_md_dir().join("ids")
    }

    /// Paxos lease area (SDM lease at offset 0).
    pub fn leases_path(&self) -> PathBuf {
        self.dom_md_dir().join("leases")
    }

    /// Creates the directory skeleton of a fresh domain.
    pub fn create_layout(&self) -> Result<()> {
        self.io.create_dir_all(&self.images_dir())?;
        self.io.create_dir_all(&self.dom_md_dir())?;
        for area in ["ids", "leases", "inbox", "outbox"] {
            self.io
                .truncate(&self.dom_md_dir().join(area), 0, 0o660, false)?;
        }
        Ok(())
    }

    /// Volumes of one image, discovered from `*.meta` sidecars.
    pub fn list_image_volumes(&self, img_uuid: Uuid) -> Result<Vec<Uuid>> {
        let dir = self.image_dir(img_uuid);
        if !self.io.path_exists(&dir)? {
            return Ok(Vec::new());
        }
        let mut vols = Vec::new();
        for name in self.io.list_dir(&dir)? {
            if let Some(stem) = name.strip_suffix(META_FILEEXT) {
                if let Ok(vol) = stem.parse() {
                    vols.push(vol);
                }
            }
        }
        Ok(vols)
    }

    /// All image directories in the domain.
    pub fn list_images(&self) -> Result<Vec<Uuid>> {
        let dir = self.images_dir();
        if !self.io.path_exists(&dir)? {
            return Ok(Vec::new());
        }
        let mut images = Vec::new();
        for name in self.io.list_dir(&dir)? {
            if let Ok(img) = name.parse() {
                images.push(img);
            }
        }
        Ok(images)
    }

    /// `volume → image` map over the whole domain.
    pub fn all_volumes(&self) -> Result<HashMap<Uuid, Uuid>> {
        let mut all = HashMap::new();
        for img in self.list_images()? {
            for vol in self.list_image_volumes(img)? {
                all.insert(vol, img);
            }
        }
        Ok(all)
    }

    /// Reads a volume's metadata record text.
    pub fn read_metadata_text(&self, img_uuid: Uuid, vol_uuid: Uuid) -> Result<String> {
        let path = Self::meta_path(&self.vol_path(img_uuid, vol_uuid));
        self.io.read_to_string(&path).map_err(|e| match e {
            Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound => {
                Error::VolumeDoesNotExist(vol_uuid)
            }
            other => other,
        })
    }

    /// Atomically replaces a volume's metadata record.
    pub fn write_metadata_text(&self, img_uuid: Uuid, vol_uuid: Uuid, text: String) -> Result<()> {
        let path = Self::meta_path(&self.vol_path(img_uuid, vol_uuid));
        self.io
            .write_then_rename(&path, text, crate::volume::VOLUME_PERMISSIONS_RW)
            .map_err(|e| Error::VolumeMetadataWriteError {
                vol: vol_uuid,
                reason: e.to_string(),
            })
    }
}

fn sidecar(vol_path: &Path, ext: &str) -> PathBuf {
    let mut name = vol_path.as_os_str().to_owned();
    name.push(ext);
    PathBuf::from(name)
}

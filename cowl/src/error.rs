//! Error types for chain engine operations.

use std::io;

use uuid::Uuid;

/// Alias for `Result<T, cowl::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by chain engine operations.
///
/// Variants map onto the engine's failure taxonomy: caller mistakes
/// (invalid parameter, incorrect format), missing objects, stale views,
/// backend I/O, integrity violations, concurrency conflicts and
/// unsupported operations. [`Error::code`] yields the stable identifier
/// reported to callers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller violated a declared precondition.
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Offending value, rendered.
        value: String,
    },

    /// A volume with this UUID already exists in the image.
    #[error("volume already exists: {0}")]
    VolumeAlreadyExists(Uuid),

    /// Creating the volume failed after parameter validation.
    #[error("volume creation failed for {vol}: {reason}")]
    VolumeCreationError {
        /// The volume being created.
        vol: Uuid,
        /// What went wrong.
        reason: String,
    },

    /// The volume does not exist in the domain.
    #[error("volume does not exist: {0}")]
    VolumeDoesNotExist(Uuid),

    /// The image has no volumes in the domain.
    #[error("image {img} does not exist in domain {sd}")]
    ImageDoesNotExist {
        /// Image UUID.
        img: Uuid,
        /// Domain UUID.
        sd: Uuid,
    },

    /// The storage domain is not attached.
    #[error("storage domain does not exist: {0}")]
    DomainDoesNotExist(Uuid),

    /// The image's parent chain is broken: no leaf, a cycle, or a
    /// dangling parent pointer.
    #[error("image {0} is not a legal chain")]
    ImageIsNotLegalChain(Uuid),

    /// Reading a metadata record failed.
    #[error("cannot read metadata of volume {vol}: {reason}")]
    VolumeMetadataReadError {
        /// The volume whose record failed to decode.
        vol: Uuid,
        /// What went wrong.
        reason: String,
    },

    /// Writing a metadata record failed.
    #[error("cannot write metadata of volume {vol}: {reason}")]
    VolumeMetadataWriteError {
        /// The volume whose record failed to persist.
        vol: Uuid,
        /// What went wrong.
        reason: String,
    },

    /// Deletion left the volume partially removed; a later run can retry.
    #[error("cannot delete volume {0}")]
    CannotDeleteVolume(Uuid),

    /// Collapsing a subchain failed.
    #[error("merging snapshots into {0} failed")]
    MergeSnapshotsError(Uuid),

    /// Copying an image between domains failed.
    #[error("copy image {img} failed: {reason}")]
    CopyImageError {
        /// Image UUID.
        img: Uuid,
        /// What went wrong.
        reason: String,
    },

    /// The destination volume of a sparsify is not sparse.
    #[error("volume {0} is not sparse")]
    VolumeNotSparse(Uuid),

    /// The sparsify helper failed.
    #[error("cannot sparsify volume {0}")]
    CannotSparsifyVolume(Uuid),

    /// Discard was requested on a backend that cannot discard.
    #[error("discard is not supported on domain {0}")]
    DiscardNotSupported(Uuid),

    /// The `(block size, alignment)` pair has no host-count mapping.
    #[error("unsupported block size {block_size} with alignment {alignment}")]
    UnsupportedLockConfig {
        /// Declared block size in bytes.
        block_size: u64,
        /// Declared alignment in bytes.
        alignment: u64,
    },

    /// The domain declares a block size other than the storage's.
    #[error("domain {sd} declares block size {declared}, storage reports {detected}")]
    BlockSizeMismatch {
        /// Domain UUID.
        sd: Uuid,
        /// Block size stored in domain metadata.
        declared: u64,
        /// Block size probed from the storage.
        detected: u64,
    },

    /// Waiting for a resource lock exceeded the configured timeout.
    #[error("timed out acquiring {namespace}/{name}")]
    ResourceTimeout {
        /// Lock namespace.
        namespace: String,
        /// Resource name.
        name: String,
    },

    /// The block domain has no free metadata slot.
    #[error("no free metadata slot in domain {0}")]
    NoFreeMetadataSlot(Uuid),

    /// The operation was aborted through its task.
    #[error("action stopped")]
    ActionStopped,

    /// An external command failed.
    #[error("{cmd} failed (rc={rc}): {stderr}")]
    Command {
        /// The command that failed.
        cmd: String,
        /// Exit code, or -1 when killed by a signal.
        rc: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// Cluster lock (sanlock) failure.
    #[error("cluster lock: {0}")]
    ClusterLock(String),

    /// Error from the LVM command layer.
    #[error(transparent)]
    Lvm(#[from] cowl_lvm::Error),

    /// Error from the metadata codec.
    #[error(transparent)]
    Meta(#[from] cowl_meta::Error),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Stable error code reported in operation results.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameter { .. } => "InvalidParameter",
            Self::VolumeAlreadyExists(_) => "VolumeAlreadyExists",
            Self::VolumeCreationError { .. } => "VolumeCreationError",
            Self::VolumeDoesNotExist(_) => "VolumeDoesNotExist",
            Self::ImageDoesNotExist { .. } => "ImageDoesNotExist",
            Self::DomainDoesNotExist(_) => "DomainDoesNotExist",
            Self::ImageIsNotLegalChain(_) => "ImageIsNotLegalChain",
            Self::VolumeMetadataReadError { .. } => "VolumeMetadataReadError",
            Self::VolumeMetadataWriteError { .. } => "VolumeMetadataWriteError",
            Self::CannotDeleteVolume(_) => "CannotDeleteVolume",
            Self::MergeSnapshotsError(_) => "MergeSnapshotsError",
            Self::CopyImageError { .. } => "CopyImageError",
            Self::VolumeNotSparse(_) => "VolumeNotSparse",
            Self::CannotSparsifyVolume(_) => "CannotSparsifyVolume",
            Self::DiscardNotSupported(_) => "DiscardNotSupported",
            Self::UnsupportedLockConfig { .. } => "UnsupportedLockConfig",
            Self::BlockSizeMismatch { .. } => "BlockSizeMismatch",
            Self::ResourceTimeout { .. } => "ResourceTimeout",
            Self::NoFreeMetadataSlot(_) => "NoFreeMetadataSlot",
            Self::ActionStopped => "ActionStopped",
            Self::Command { .. } => "Command",
            Self::ClusterLock(_) => "ClusterLock",
            Self::Lvm(_) => "Lvm",
            Self::Meta(_) => "Meta",
            Self::Io(_) => "Io",
        }
    }

    /// Whether the failure came from a cooperative abort.
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::ActionStopped)
    }
}

/// Collects cleanup errors, keeping the first while cleanup continues.
///
/// Deletion and merge teardown try every step even after one fails, then
/// re-raise the first captured error so as much garbage as possible is
/// gone before the caller hears about the problem.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    first: Option<Error>,
    count: usize,
}

impl ErrorCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure, keeping only the first as the primary error.
    pub fn push(&mut self, err: Error) {
        tracing::warn!(error = %err, "cleanup step failed, continuing");
        self.count += 1;
        if self.first.is_none() {
            self.first = Some(err);
        }
    }

    /// Runs a cleanup step, recording a failure without propagating it.
    pub fn run(&mut self, step: impl FnOnce() -> Result<()>) {
        if let Err(err) = step() {
            self.push(err);
        }
    }

    /// Number of failed steps.
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Whether no step failed.
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns `Ok(())` when clean, or the first captured error.
    pub fn into_result(self) -> Result<()> {
        match self.first {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            Error::VolumeAlreadyExists(Uuid::nil()).code(),
            "VolumeAlreadyExists"
        );
        assert_eq!(Error::ActionStopped.code(), "ActionStopped");
    }

    #[test]
    fn collector_keeps_first_error() {
        let mut collector = ErrorCollector::new();
        collector.run(|| Err(Error::VolumeDoesNotExist(Uuid::nil())));
        collector.run(|| Err(Error::ActionStopped));
        collector.run(|| Ok(()));
        assert_eq!(collector.len(), 2);
        let err = collector.into_result().unwrap_err();
        assert!(matches!(err, Error::VolumeDoesNotExist(_)));
    }

    #[test]
    fn empty_collector_is_ok() {
        assert!(ErrorCollector::new().into_result().is_ok());
    }
}

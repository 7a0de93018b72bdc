//! Volume metadata record codec for the cowl chain engine.
//!
//! Every virtual-disk volume carries a small text sidecar describing its
//! type, format, role in the chain, parent linkage, capacity and
//! generation. On file domains the record lives in a `<volume>.meta` file;
//! on block domains it occupies one 512-byte slot of the domain's metadata
//! LV. Either way the record must fit in a single block so readers never
//! observe a torn write.
//!
//! The wire form is `KEY=value` lines terminated by a bare `EOF` line:
//!
//! ```text
//! CTIME=1440935038
//! DESCRIPTION=
//! DISKTYPE=DATA
//! DOMAIN=75f8a1bb-4504-4314-91ca-d9365a30692b
//! FORMAT=COW
//! IMAGE=75f8a1bb-4504-4314-91ca-d9365a30692b
//! LEGALITY=LEGAL
//! PUUID=00000000-0000-0000-0000-000000000000
//! CAP=10737418240
//! TYPE=SPARSE
//! VOLTYPE=LEAF
//! GEN=0
//! EOF
//! ```
//!
//! Domain versions 4 and below store `SIZE` (512-byte blocks) and a fixed
//! `MTIME=0`; version 5 stores `CAP` (bytes) and drops both legacy keys.

mod record;

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

pub use record::VolumeMetadata;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from metadata parsing, serialization and parameter validation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The record has no `EOF` terminator line.
    #[error("metadata record is truncated (no EOF terminator)")]
    Truncated,

    /// A mandatory key is absent from the record.
    #[error("metadata record is missing key {0}")]
    MissingField(&'static str),

    /// A key is present but its value cannot be decoded.
    #[error("invalid metadata value for {key}: {value:?}")]
    InvalidField {
        /// The offending key.
        key: &'static str,
        /// The raw value as read from storage.
        value: String,
    },

    /// The description exceeds [`DESCRIPTION_SIZE`] bytes.
    #[error("description is {0} bytes, limit is {DESCRIPTION_SIZE}")]
    DescriptionTooLong(usize),

    /// The generation counter is outside `0..=`[`MAX_GENERATION`].
    #[error("generation {0} out of range 0..={MAX_GENERATION}")]
    GenerationOutOfRange(u32),

    /// The capacity is zero or not representable.
    #[error("capacity {0} out of range")]
    CapacityOutOfRange(u64),

    /// The serialized record would overflow one metadata block.
    #[error("serialized record is {size} bytes, block is {block_size}")]
    RecordTooLarge {
        /// Serialized record length in bytes.
        size: usize,
        /// Metadata block size the record must fit into.
        block_size: u64,
    },

    /// The requested volume format is not valid for the operation.
    #[error("incorrect volume format: {0}")]
    IncorrectFormat(String),

    /// The requested allocation type is not valid for the operation.
    #[error("incorrect volume type: {0}")]
    IncorrectType(String),

    /// The given value is not a supported domain version.
    #[error("unsupported domain version {0}")]
    UnsupportedVersion(u32),
}

/// Sentinel UUID meaning "no parent" / "unknown".
pub const BLANK_UUID: Uuid = Uuid::nil();

/// Legacy block unit; `SIZE` values count these.
pub const BLOCK_SIZE_512: u64 = 512;

/// 4K block size used by modern block devices.
pub const BLOCK_SIZE_4K: u64 = 4096;

/// Metadata slot size on block domains. A record never exceeds this, so a
/// single-sector write replaces it atomically.
pub const METADATA_SIZE: u64 = 512;

/// Upper bound on the description field, in bytes.
///
/// Big enough for engine-side JSON descriptions while leaving headroom for
/// the fixed-width keys inside one 512-byte slot.
pub const DESCRIPTION_SIZE: usize = 210;

/// Generation counter wraps back to 0 after this value. Kept at three
/// ASCII digits so the worst-case record size stays fixed.
pub const MAX_GENERATION: u32 = 999;

/// Generation assumed when the `GEN` key is absent from an old record.
pub const DEFAULT_GENERATION: u32 = 0;

/// Prefix given to payloads renamed aside before removal.
pub const REMOVED_IMAGE_PREFIX: &str = "_remove_me_";

/// Prefix for payloads renamed aside and queued for zeroing.
pub const ZEROED_IMAGE_PREFIX: &str = "_remove_me_ZERO_";

/// Tag present on a block volume whose metadata record has not been
/// committed yet; such LVs are garbage, not volumes.
pub const TAG_VOL_UNINIT: &str = "COWL_VOL_INITIALIZING";

/// LV tag prefix binding a metadata slot index.
pub const TAG_PREFIX_MD: &str = "MD_";

/// LV tag prefix recording image membership.
pub const TAG_PREFIX_IMAGE: &str = "IU_";

/// LV tag prefix recording the parent volume UUID.
pub const TAG_PREFIX_PARENT: &str = "PU_";

/// Rounds `n` up to the next multiple of `align`.
pub const fn round_up(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align
}

/// Converts a byte count to 512-byte blocks, rounding up.
pub const fn bytes_to_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE_512)
}

/// Converts a 512-byte block count to bytes.
pub const fn blocks_to_bytes(blocks: u64) -> u64 {
    blocks * BLOCK_SIZE_512
}

/// Storage domain format version.
///
/// Only versions 0/2/3/4/5 were ever shipped; version 1 does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DomainVersion {
    /// Initial format.
    V0,
    /// Adds domain classes.
    V2,
    /// Adds per-volume leases.
    V3,
    /// Adds the generation counter and 4-char disk types.
    V4,
    /// Byte-denominated capacity, 4K block support, slot 0 freed.
    V5,
}

impl DomainVersion {
    /// All versions this engine can attach.
    pub const ALL: [Self; 5] = [Self::V0, Self::V2, Self::V3, Self::V4, Self::V5];

    /// Decodes a numeric domain version.
    pub fn from_number(n: u32) -> Result<Self> {
        match n {
            0 => Ok(Self::V0),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            4 => Ok(Self::V4),
            5 => Ok(Self::V5),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }

    /// The numeric form persisted in domain metadata.
    pub const fn number(self) -> u32 {
        match self {
            Self::V0 => 0,
            Self::V2 => 2,
            Self::V3 => 3,
            Self::V4 => 4,
            Self::V5 => 5,
        }
    }

    /// Whether volume records store `CAP` in bytes (`SIZE` in blocks
    /// otherwise).
    pub const fn uses_capacity_bytes(self) -> bool {
        matches!(self, Self::V5)
    }

    /// First usable metadata slot on block domains. Slots below this are
    /// reserved for the domain itself.
    pub const fn first_metadata_slot(self) -> u64 {
        match self {
            Self::V5 => 1,
            _ => 4,
        }
    }

    /// Storage block sizes a domain of this version may declare.
    pub const fn supported_block_sizes(self) -> &'static [u64] {
        match self {
            Self::V5 => &[BLOCK_SIZE_512, BLOCK_SIZE_4K],
            _ => &[BLOCK_SIZE_512],
        }
    }
}

impl fmt::Display for DomainVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Volume allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeType {
    /// Storage fully allocated at creation.
    Preallocated,
    /// Storage allocated on demand.
    Sparse,
    /// Carried by legacy records only.
    Unknown,
}

/// On-disk volume format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    /// Flat image, byte-for-byte.
    Raw,
    /// qcow2 copy-on-write overlay.
    Cow,
    /// Carried by legacy records only.
    Unknown,
}

/// Role of a volume inside its image chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeRole {
    /// Writable end of the chain.
    Leaf,
    /// Read-only middle layer.
    Internal,
    /// Template base referenced by multiple images.
    Shared,
}

/// Legality marker guarding reads.
///
/// `Illegal` volumes are mid-deletion or detached and are never used to
/// satisfy reads; `Fake` marks placeholder templates on backup domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Legality {
    /// Normal state.
    Legal,
    /// Excluded from chains; safe to delete.
    Illegal,
    /// Placeholder template, content-free.
    Fake,
}

/// Payload role carried in the `DISKTYPE` key, a closed set of 4-char tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    /// Guest data disk.
    Data,
    /// ISO image.
    Isof,
    /// Memory dump.
    Memd,
    /// Memory dump metadata.
    Memm,
    /// OVF store.
    Ovfs,
    /// Hosted-engine VM disk.
    Hevd,
    /// Hosted-engine sanlock disk.
    Hesd,
    /// Hosted-engine metadata disk.
    Hemd,
    /// Hosted-engine configuration image.
    Heci,
}

macro_rules! str_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? } key $key:literal) => {
        impl $ty {
            /// The exact token persisted in metadata.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidField {
                        key: $key,
                        value: other.to_owned(),
                    }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(VolumeType {
    Preallocated => "PREALLOCATED",
    Sparse => "SPARSE",
    Unknown => "UNKNOWN",
} key "TYPE");

str_enum!(VolumeFormat {
    Raw => "RAW",
    Cow => "COW",
    Unknown => "UNKNOWN",
} key "FORMAT");

str_enum!(VolumeRole {
    Leaf => "LEAF",
    Internal => "INTERNAL",
    Shared => "SHARED",
} key "VOLTYPE");

str_enum!(Legality {
    Legal => "LEGAL",
    Illegal => "ILLEGAL",
    Fake => "FAKE",
} key "LEGALITY");

str_enum!(DiskType {
    Data => "DATA",
    Isof => "ISOF",
    Memd => "MEMD",
    Memm => "MEMM",
    Ovfs => "OVFS",
    Hevd => "HEVD",
    Hesd => "HESD",
    Hemd => "HEMD",
    Heci => "HECI",
} key "DISKTYPE");

/// Checks the cross-field rules of a volume-creation request.
///
/// Snapshots (a non-blank `src_vol`) must be COW; `Unknown` format or
/// allocation are read-compat values, never valid on create.
pub fn validate_create_volume_params(
    vol_format: VolumeFormat,
    src_vol: Uuid,
    preallocate: Option<VolumeType>,
) -> Result<()> {
    match vol_format {
        VolumeFormat::Unknown => {
            return Err(Error::IncorrectFormat(vol_format.to_string()));
        }
        VolumeFormat::Raw if src_vol != BLANK_UUID => {
            return Err(Error::IncorrectFormat(format!(
                "cannot create RAW snapshot of {src_vol}"
            )));
        }
        _ => {}
    }

    if preallocate == Some(VolumeType::Unknown) {
        return Err(Error::IncorrectType(VolumeType::Unknown.to_string()));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn domain_version_numbers_roundtrip() {
        for v in DomainVersion::ALL {
            assert_eq!(DomainVersion::from_number(v.number()).unwrap(), v);
        }
        assert!(DomainVersion::from_number(1).is_err());
        assert!(DomainVersion::from_number(6).is_err());
    }

    #[test]
    fn slot_base_per_version() {
        assert_eq!(DomainVersion::V4.first_metadata_slot(), 4);
        assert_eq!(DomainVersion::V3.first_metadata_slot(), 4);
        assert_eq!(DomainVersion::V5.first_metadata_slot(), 1);
    }

    #[test]
    fn block_sizes_per_version() {
        assert_eq!(DomainVersion::V4.supported_block_sizes(), &[512]);
        assert_eq!(DomainVersion::V5.supported_block_sizes(), &[512, 4096]);
    }

    #[test]
    fn enum_tokens_roundtrip() {
        for role in [VolumeRole::Leaf, VolumeRole::Internal, VolumeRole::Shared] {
            assert_eq!(role.as_str().parse::<VolumeRole>().unwrap(), role);
        }
        for dt in ["DATA", "ISOF", "MEMD", "MEMM", "OVFS", "HEVD", "HESD", "HEMD", "HECI"] {
            assert_eq!(dt.parse::<DiskType>().unwrap().as_str(), dt);
        }
        assert!("SWAP".parse::<DiskType>().is_err());
    }

    #[test]
    fn raw_snapshot_rejected() {
        let parent = Uuid::new_v4();
        let err = validate_create_volume_params(VolumeFormat::Raw, parent, None).unwrap_err();
        assert!(matches!(err, Error::IncorrectFormat(_)));
    }

    #[test]
    fn cow_snapshot_accepted() {
        let parent = Uuid::new_v4();
        validate_create_volume_params(VolumeFormat::Cow, parent, Some(VolumeType::Sparse))
            .unwrap();
    }

    #[test]
    fn unknown_prealloc_rejected() {
        let err =
            validate_create_volume_params(VolumeFormat::Raw, BLANK_UUID, Some(VolumeType::Unknown))
                .unwrap_err();
        assert!(matches!(err, Error::IncorrectType(_)));
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(bytes_to_blocks(1), 1);
        assert_eq!(bytes_to_blocks(512), 1);
        assert_eq!(bytes_to_blocks(513), 2);
        assert_eq!(blocks_to_bytes(3), 1536);
    }
}

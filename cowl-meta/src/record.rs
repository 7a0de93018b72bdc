//! The `KEY=value` volume metadata record.

use uuid::Uuid;

use crate::{
    BLANK_UUID, BLOCK_SIZE_512, DEFAULT_GENERATION, DESCRIPTION_SIZE, DiskType, DomainVersion,
    Error, Legality, MAX_GENERATION, METADATA_SIZE, Result, VolumeFormat, VolumeRole, VolumeType,
};

/// Terminator line closing every record.
const EOF_MARKER: &str = "EOF";

/// Decoded volume metadata record.
///
/// Capacity is always held in bytes; the codec converts to legacy
/// 512-block `SIZE` values when serializing for domain versions ≤ 4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMetadata {
    /// Creation time, seconds since the epoch.
    pub ctime: u64,
    /// Free-form text or JSON, at most [`DESCRIPTION_SIZE`] bytes.
    pub description: String,
    /// Payload role tag.
    pub disktype: DiskType,
    /// Owning storage domain.
    pub domain: Uuid,
    /// On-disk format.
    pub format: VolumeFormat,
    /// Owning image.
    pub image: Uuid,
    /// Read-eligibility marker.
    pub legality: Legality,
    /// Parent volume, or [`BLANK_UUID`] for a base.
    pub puuid: Uuid,
    /// Virtual capacity in bytes.
    pub capacity: u64,
    /// Allocation policy.
    pub vol_type: VolumeType,
    /// Role in the chain.
    pub role: VolumeRole,
    /// Conflicting-writer detection counter, `0..=`[`MAX_GENERATION`].
    pub generation: u32,
}

impl VolumeMetadata {
    /// Decodes a record from its on-disk text form.
    ///
    /// Unknown keys are ignored for forward compatibility. A missing `GEN`
    /// defaults to [`DEFAULT_GENERATION`]; when both legacy `SIZE` and
    /// modern `CAP` appear, `CAP` wins.
    pub fn parse(text: &str) -> Result<Self> {
        let mut ctime = None;
        let mut description = None;
        let mut disktype = None;
        let mut domain = None;
        let mut format = None;
        let mut image = None;
        let mut legality = None;
        let mut puuid = None;
        let mut size_blk: Option<u64> = None;
        let mut cap_bytes: Option<u64> = None;
        let mut vol_type = None;
        let mut role = None;
        let mut generation = None;
        let mut terminated = false;

        for line in text.lines() {
            if line == EOF_MARKER {
                terminated = true;
                break;
            }
            let Some((key, value)) = line.split_once('=') else {
                // Tolerate stray blank lines in hand-edited records.
                if line.trim().is_empty() {
                    continue;
                }
                return Err(Error::InvalidField {
                    key: "record",
                    value: line.to_owned(),
                });
            };
            match key {
                "CTIME" => ctime = Some(parse_u64("CTIME", value)?),
                "DESCRIPTION" => description = Some(value.to_owned()),
                "DISKTYPE" => disktype = Some(value.parse()?),
                "DOMAIN" => domain = Some(parse_uuid("DOMAIN", value)?),
                "FORMAT" => format = Some(value.parse()?),
                "IMAGE" => image = Some(parse_uuid("IMAGE", value)?),
                "LEGALITY" => legality = Some(value.parse()?),
                "PUUID" => puuid = Some(parse_uuid("PUUID", value)?),
                "SIZE" => size_blk = Some(parse_u64("SIZE", value)?),
                "CAP" => cap_bytes = Some(parse_u64("CAP", value)?),
                "TYPE" => vol_type = Some(value.parse()?),
                "VOLTYPE" => role = Some(value.parse()?),
                "GEN" => generation = Some(parse_u32("GEN", value)?),
                // MTIME is always written as 0 on v4 domains and unused.
                "MTIME" => {}
                _ => {}
            }
        }

        if !terminated {
            return Err(Error::Truncated);
        }

        let capacity = match (cap_bytes, size_blk) {
            (Some(cap), _) => cap,
            (None, Some(blk)) => blk * BLOCK_SIZE_512,
            (None, None) => return Err(Error::MissingField("CAP")),
        };

        Ok(Self {
            ctime: ctime.ok_or(Error::MissingField("CTIME"))?,
            description: description.unwrap_or_default(),
            disktype: disktype.ok_or(Error::MissingField("DISKTYPE"))?,
            domain: domain.ok_or(Error::MissingField("DOMAIN"))?,
            format: format.ok_or(Error::MissingField("FORMAT"))?,
            image: image.ok_or(Error::MissingField("IMAGE"))?,
            legality: legality.ok_or(Error::MissingField("LEGALITY"))?,
            puuid: puuid.unwrap_or(BLANK_UUID),
            capacity,
            vol_type: vol_type.ok_or(Error::MissingField("TYPE"))?,
            role: role.ok_or(Error::MissingField("VOLTYPE"))?,
            generation: generation.unwrap_or(DEFAULT_GENERATION),
        })
    }

    /// Encodes the record for a domain of the given version.
    ///
    /// Keys are emitted in a fixed order so records are comparable
    /// byte-for-byte, and the result is checked against the metadata block
    /// size so a single sector write always replaces it atomically.
    pub fn serialize(&self, version: DomainVersion) -> Result<String> {
        self.validate()?;

        let mut out = String::with_capacity(METADATA_SIZE as usize);
        push_kv(&mut out, "CTIME", &self.ctime.to_string());
        push_kv(&mut out, "DESCRIPTION", &self.description);
        push_kv(&mut out, "DISKTYPE", self.disktype.as_str());
        push_kv(&mut out, "DOMAIN", &self.domain.to_string());
        push_kv(&mut out, "FORMAT", self.format.as_str());
        push_kv(&mut out, "IMAGE", &self.image.to_string());
        push_kv(&mut out, "LEGALITY", self.legality.as_str());
        if !version.uses_capacity_bytes() {
            push_kv(&mut out, "MTIME", "0");
        }
        push_kv(&mut out, "PUUID", &self.puuid.to_string());
        if version.uses_capacity_bytes() {
            push_kv(&mut out, "CAP", &self.capacity.to_string());
        } else {
            let blocks = self.capacity.div_ceil(BLOCK_SIZE_512);
            push_kv(&mut out, "SIZE", &blocks.to_string());
        }
        push_kv(&mut out, "TYPE", self.vol_type.as_str());
        push_kv(&mut out, "VOLTYPE", self.role.as_str());
        push_kv(&mut out, "GEN", &self.generation.to_string());
        out.push_str(EOF_MARKER);
        out.push('\n');

        if out.len() as u64 > METADATA_SIZE {
            return Err(Error::RecordTooLarge {
                size: out.len(),
                block_size: METADATA_SIZE,
            });
        }
        Ok(out)
    }

    /// Checks the field bounds that keep the record within one block.
    pub fn validate(&self) -> Result<()> {
        if self.description.len() > DESCRIPTION_SIZE {
            return Err(Error::DescriptionTooLong(self.description.len()));
        }
        if self.description.contains('\n') {
            return Err(Error::InvalidField {
                key: "DESCRIPTION",
                value: self.description.clone(),
            });
        }
        if self.generation > MAX_GENERATION {
            return Err(Error::GenerationOutOfRange(self.generation));
        }
        if self.capacity == 0 || self.capacity > i64::MAX as u64 {
            return Err(Error::CapacityOutOfRange(self.capacity));
        }
        Ok(())
    }

    /// The generation following this record's, wrapping after
    /// [`MAX_GENERATION`].
    pub const fn next_generation(&self) -> u32 {
        if self.generation >= MAX_GENERATION {
            0
        } else {
            self.generation + 1
        }
    }
}

fn push_kv(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    out.push_str(value);
    out.push('\n');
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| Error::InvalidField {
        key,
        value: value.to_owned(),
    })
}

fn parse_u32(key: &'static str, value: &str) -> Result<u32> {
    value.parse().map_err(|_| Error::InvalidField {
        key,
        value: value.to_owned(),
    })
}

fn parse_uuid(key: &'static str, value: &str) -> Result<Uuid> {
    value.parse().map_err(|_| Error::InvalidField {
        key,
        value: value.to_owned(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> VolumeMetadata {
        VolumeMetadata {
            ctime: 1_440_935_038,
            description: "test volume".to_owned(),
            disktype: DiskType::Data,
            domain: Uuid::new_v4(),
            format: VolumeFormat::Cow,
            image: Uuid::new_v4(),
            legality: Legality::Legal,
            puuid: Uuid::new_v4(),
            capacity: 10 << 30,
            vol_type: VolumeType::Sparse,
            role: VolumeRole::Leaf,
            generation: 7,
        }
    }

    #[test]
    fn roundtrip_v5() {
        let md = sample();
        let text = md.serialize(DomainVersion::V5).unwrap();
        assert!(text.contains("CAP="));
        assert!(!text.contains("SIZE="));
        assert!(!text.contains("MTIME="));
        assert_eq!(VolumeMetadata::parse(&text).unwrap(), md);
    }

    #[test]
    fn roundtrip_v4_in_blocks() {
        let md = sample();
        let text = md.serialize(DomainVersion::V4).unwrap();
        assert!(text.contains("SIZE="));
        assert!(text.contains("MTIME=0\n"));
        assert!(!text.contains("CAP="));
        assert_eq!(VolumeMetadata::parse(&text).unwrap(), md);
    }

    #[test]
    fn cap_wins_over_size() {
        let mut md = sample();
        md.capacity = 4096;
        let mut text = md.serialize(DomainVersion::V5).unwrap();
        // A record migrated from v4 may still carry the legacy key.
        text = text.replace("CAP=4096\n", "SIZE=999\nCAP=4096\n");
        assert_eq!(VolumeMetadata::parse(&text).unwrap().capacity, 4096);
    }

    #[test]
    fn unknown_keys_tolerated() {
        let md = sample();
        let text = md
            .serialize(DomainVersion::V5)
            .unwrap()
            .replace("EOF", "FUTURE_KEY=whatever\nEOF");
        assert_eq!(VolumeMetadata::parse(&text).unwrap(), md);
    }

    #[test]
    fn generation_defaults_to_zero() {
        let md = sample();
        let text = md.serialize(DomainVersion::V5).unwrap().replace("GEN=7\n", "");
        assert_eq!(VolumeMetadata::parse(&text).unwrap().generation, 0);
    }

    #[test]
    fn missing_eof_is_truncated() {
        let md = sample();
        let text = md.serialize(DomainVersion::V5).unwrap().replace("EOF\n", "");
        assert!(matches!(VolumeMetadata::parse(&text), Err(Error::Truncated)));
    }

    #[test]
    fn description_limit_enforced() {
        let mut md = sample();
        md.description = "x".repeat(DESCRIPTION_SIZE + 1);
        assert!(matches!(
            md.serialize(DomainVersion::V5),
            Err(Error::DescriptionTooLong(_))
        ));
    }

    #[test]
    fn description_newline_rejected() {
        let mut md = sample();
        md.description = "a\nb".to_owned();
        assert!(md.serialize(DomainVersion::V5).is_err());
    }

    #[test]
    fn generation_bound_enforced() {
        let mut md = sample();
        md.generation = MAX_GENERATION + 1;
        assert!(matches!(
            md.serialize(DomainVersion::V5),
            Err(Error::GenerationOutOfRange(_))
        ));
    }

    #[test]
    fn generation_wraps() {
        let mut md = sample();
        md.generation = MAX_GENERATION;
        assert_eq!(md.next_generation(), 0);
        md.generation = 0;
        assert_eq!(md.next_generation(), 1);
    }

    #[test]
    fn worst_case_record_fits_one_block() {
        // Maximum-width values for every fixed field plus a full-length
        // description must stay within the 512-byte slot on both layouts.
        let md = VolumeMetadata {
            ctime: 9_999_999_999,
            description: "x".repeat(DESCRIPTION_SIZE),
            disktype: DiskType::Ovfs,
            domain: Uuid::new_v4(),
            format: VolumeFormat::Cow,
            image: Uuid::new_v4(),
            legality: Legality::Illegal,
            puuid: Uuid::new_v4(),
            capacity: i64::MAX as u64,
            vol_type: VolumeType::Preallocated,
            role: VolumeRole::Internal,
            generation: MAX_GENERATION,
        };
        for version in [DomainVersion::V4, DomainVersion::V5] {
            let text = md.serialize(version).unwrap();
            assert!(
                text.len() as u64 <= METADATA_SIZE,
                "{version}: {} bytes",
                text.len()
            );
        }
    }

    #[test]
    fn full_description_always_fits() {
        // The fixed fields must leave room for a maximum-length
        // description in every layout.
        let md = VolumeMetadata {
            ctime: 9_999_999_999,
            description: String::new(),
            disktype: DiskType::Ovfs,
            domain: Uuid::new_v4(),
            format: VolumeFormat::Cow,
            image: Uuid::new_v4(),
            legality: Legality::Illegal,
            puuid: Uuid::new_v4(),
            capacity: i64::MAX as u64,
            vol_type: VolumeType::Preallocated,
            role: VolumeRole::Internal,
            generation: MAX_GENERATION,
        };
        for version in [DomainVersion::V4, DomainVersion::V5] {
            let fixed = md.serialize(version).unwrap().len();
            assert!(fixed + DESCRIPTION_SIZE <= METADATA_SIZE as usize);
        }
    }
}

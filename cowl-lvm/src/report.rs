//! Typed rows decoded from `--reportformat json` output.

use serde::Deserialize;

use crate::{Error, Result};

/// One logical volume as reported by `lvs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolume {
    /// LV name.
    pub name: String,
    /// Owning VG name.
    pub vg_name: String,
    /// Size in bytes.
    pub size: u64,
    /// Raw attribute string (`lv_attr`).
    pub attr: String,
    /// Tags attached to the LV.
    pub tags: Vec<String>,
}

impl LogicalVolume {
    /// Whether the LV is active (device node present).
    pub fn active(&self) -> bool {
        self.attr.as_bytes().get(4) == Some(&b'a')
    }

    /// The first tag with the given prefix, with the prefix stripped.
    pub fn tag_value(&self, prefix: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| t.strip_prefix(prefix))
    }

    /// Whether any tag with the given prefix exists.
    pub fn has_tag_prefix(&self, prefix: &str) -> bool {
        self.tags.iter().any(|t| t.starts_with(prefix))
    }
}

/// One volume group as reported by `vgs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroup {
    /// VG name.
    pub name: String,
    /// Total size in bytes.
    pub size: u64,
    /// Free space in bytes.
    pub free: u64,
    /// Extent size in bytes.
    pub extent_size: u64,
    /// Number of backing PVs.
    pub pv_count: u64,
    /// Tags attached to the VG.
    pub tags: Vec<String>,
}

/// One physical volume as reported by `pvs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalVolume {
    /// Device path.
    pub name: String,
    /// Owning VG, empty when unassigned.
    pub vg_name: String,
    /// Size in bytes.
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct ReportDoc {
    #[serde(default)]
    report: Vec<ReportEntry>,
}

#[derive(Debug, Deserialize)]
struct ReportEntry {
    #[serde(default)]
    lv: Vec<LvRow>,
    #[serde(default)]
    vg: Vec<VgRow>,
    #[serde(default)]
    pv: Vec<PvRow>,
}

#[derive(Debug, Deserialize)]
struct LvRow {
    lv_name: String,
    vg_name: String,
    lv_size: String,
    #[serde(default)]
    lv_attr: String,
    #[serde(default)]
    lv_tags: String,
}

#[derive(Debug, Deserialize)]
struct VgRow {
    vg_name: String,
    vg_size: String,
    vg_free: String,
    vg_extent_size: String,
    #[serde(default)]
    pv_count: String,
    #[serde(default)]
    vg_tags: String,
}

#[derive(Debug, Deserialize)]
struct PvRow {
    pv_name: String,
    #[serde(default)]
    vg_name: String,
    pv_size: String,
}

/// Decodes `lvs --reportformat json` output.
pub(crate) fn parse_lvs(json: &str) -> Result<Vec<LogicalVolume>> {
    let doc: ReportDoc = serde_json::from_str(json).map_err(|e| Error::Report(e.to_string()))?;
    doc.report
        .into_iter()
        .flat_map(|entry| entry.lv)
        .map(|row| {
            Ok(LogicalVolume {
                name: row.lv_name,
                vg_name: row.vg_name,
                size: parse_size("lv_size", &row.lv_size)?,
                attr: row.lv_attr,
                tags: split_tags(&row.lv_tags),
            })
        })
        .collect()
}

/// Decodes `vgs --reportformat json` output.
pub(crate) fn parse_vgs(json: &str) -> Result<Vec<VolumeGroup>> {
    let doc: ReportDoc = serde_json::from_str(json).map_err(|e| Error::Report(e.to_string()))?;
    doc.report
        .into_iter()
        .flat_map(|entry| entry.vg)
        .map(|row| {
            Ok(VolumeGroup {
                name: row.vg_name,
                size: parse_size("vg_size", &row.vg_size)?,
                free: parse_size("vg_free", &row.vg_free)?,
                extent_size: parse_size("vg_extent_size", &row.vg_extent_size)?,
                pv_count: row.pv_count.parse().unwrap_or(0),
                tags: split_tags(&row.vg_tags),
            })
        })
        .collect()
}

/// Decodes `pvs --reportformat json` output.
pub(crate) fn parse_pvs(json: &str) -> Result<Vec<PhysicalVolume>> {
    let doc: ReportDoc = serde_json::from_str(json).map_err(|e| Error::Report(e.to_string()))?;
    doc.report
        .into_iter()
        .flat_map(|entry| entry.pv)
        .map(|row| {
            Ok(PhysicalVolume {
                name: row.pv_name,
                vg_name: row.vg_name,
                size: parse_size("pv_size", &row.pv_size)?,
            })
        })
        .collect()
}

/// Parses a `--units b --nosuffix` size column.
fn parse_size(field: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .trim_end_matches('B')
        .parse()
        .map_err(|_| Error::Report(format!("bad {field}: {value:?}")))
}

fn split_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .filter(|t| !t.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_lv_report() {
        let json = r#"{"report":[{"lv":[
            {"lv_name":"vol1","vg_name":"sd1","lv_size":"1073741824",
             "lv_attr":"-wi-a-----","lv_tags":"MD_5,IU_img1,PU_blank"},
            {"lv_name":"metadata","vg_name":"sd1","lv_size":"536870912",
             "lv_attr":"-wi-------","lv_tags":""}
        ]}]}"#;
        let lvs = parse_lvs(json).unwrap();
        assert_eq!(lvs.len(), 2);
        assert_eq!(lvs[0].size, 1 << 30);
        assert!(lvs[0].active());
        assert_eq!(lvs[0].tag_value("MD_"), Some("5"));
        assert!(lvs[0].has_tag_prefix("IU_"));
        assert!(!lvs[1].active());
        assert!(lvs[1].tags.is_empty());
    }

    #[test]
    fn parses_vg_report() {
        let json = r#"{"report":[{"vg":[
            {"vg_name":"sd1","vg_size":"107374182400","vg_free":"53687091200",
             "vg_extent_size":"134217728","pv_count":"2","vg_tags":"MDT_VERSION_5"}
        ]}]}"#;
        let vgs = parse_vgs(json).unwrap();
        assert_eq!(vgs[0].extent_size, 128 << 20);
        assert_eq!(vgs[0].pv_count, 2);
        assert_eq!(vgs[0].tags, vec!["MDT_VERSION_5".to_owned()]);
    }

    #[test]
    fn parses_pv_report() {
        let json = r#"{"report":[{"pv":[
            {"pv_name":"/dev/mapper/wwid1","vg_name":"sd1","pv_size":"107374182400"}
        ]}]}"#;
        let pvs = parse_pvs(json).unwrap();
        assert_eq!(pvs[0].name, "/dev/mapper/wwid1");
    }

    #[test]
    fn rejects_malformed_sizes() {
        let json = r#"{"report":[{"lv":[
            {"lv_name":"vol1","vg_name":"sd1","lv_size":"huge","lv_attr":"","lv_tags":""}
        ]}]}"#;
        assert!(matches!(parse_lvs(json), Err(Error::Report(_))));
    }
}

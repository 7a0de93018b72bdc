//! `qemu-img` adapter: create, convert, rebase, info, measure, check.
//!
//! Flag semantics are pinned here so callers never assemble qemu argv
//! themselves. All JSON output is decoded into typed results.

use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::task::Task;
use crate::{Error, Result, proc};

/// Image formats the engine drives qemu with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Format {
    /// Flat image.
    Raw,
    /// COW overlay.
    Qcow2,
}

impl Format {
    /// The `-f`/`-O` argument form.
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
        }
    }
}

/// qcow2 compatibility level for new overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Qcow2Compat {
    /// Legacy 0.10 layout, for domains predating v4.
    V0_10,
    /// Modern 1.1 layout.
    V1_1,
}

impl Qcow2Compat {
    /// The `compat=` option value.
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::V0_10 => "0.10",
            Self::V1_1 => "1.1",
        }
    }

    /// Decodes a config string.
    pub fn from_config(value: &str) -> Result<Self> {
        match value {
            "0.10" => Ok(Self::V0_10),
            "1.1" => Ok(Self::V1_1),
            other => Err(Error::InvalidParameter {
                name: "qcow2_compat",
                value: other.to_owned(),
            }),
        }
    }
}

/// Preallocation mode for `convert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Preallocation {
    /// `fallocate` the destination.
    Falloc,
    /// Allocate qcow2 metadata only.
    Metadata,
}

impl Preallocation {
    const fn as_arg(self) -> &'static str {
        match self {
            Self::Falloc => "falloc",
            Self::Metadata => "metadata",
        }
    }
}

/// Decoded `qemu-img info` output.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct ImgInfo {
    /// Reported format.
    pub format: String,
    /// Virtual size in bytes.
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    /// On-disk size in bytes.
    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,
    /// Backing file recorded in the header, if any.
    #[serde(rename = "backing-filename", default)]
    pub backing_filename: Option<String>,
    /// Cluster size, qcow2 only.
    #[serde(rename = "cluster-size", default)]
    pub cluster_size: Option<u64>,
}

impl ImgInfo {
    /// Basename of the backing file, which for chain volumes is the
    /// parent volume UUID.
    pub fn backing_basename(&self) -> Option<&str> {
        self.backing_filename
            .as_deref()
            .and_then(|b| b.rsplit('/').next())
    }
}

/// Decoded `qemu-img measure` output.
#[derive(Debug, Clone, Copy, Deserialize)]
#[non_exhaustive]
pub struct Measure {
    /// Bytes required for the conversion target.
    pub required: u64,
    /// Bytes required if fully allocated.
    #[serde(rename = "fully-allocated")]
    pub fully_allocated: u64,
}

/// Decoded `qemu-img check` output.
#[derive(Debug, Clone, Copy, Deserialize)]
#[non_exhaustive]
pub struct Check {
    /// Highest offset in use, i.e. the minimal truncation point.
    #[serde(rename = "image-end-offset", default)]
    pub image_end_offset: Option<u64>,
}

/// Options for [`convert`].
#[derive(Debug, Clone)]
pub struct Convert {
    /// Source format.
    pub src_format: Format,
    /// Destination format.
    pub dst_format: Format,
    /// qcow2 compat for the destination, when COW.
    pub compat: Qcow2Compat,
    /// Backing file the destination should point at.
    pub backing: Option<String>,
    /// Format of the backing file.
    pub backing_format: Option<Format>,
    /// Preallocation for the destination.
    pub preallocation: Option<Preallocation>,
    /// Allow out-of-order writes (faster on some destinations).
    pub unordered_writes: bool,
}

/// Creates a qcow2 overlay, optionally on top of a backing file.
pub fn create_qcow2(
    path: &Path,
    size: u64,
    compat: Qcow2Compat,
    backing: Option<(&Path, Format)>,
) -> Result<()> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["create", "-f", "qcow2"]);
    if let Some((backing_path, backing_format)) = backing {
        cmd.arg("-b").arg(backing_path);
        cmd.args(["-F", backing_format.as_arg()]);
    }
    let compat_opt = format!("compat={}", compat.as_arg());
    cmd.args(["-o", compat_opt.as_str()]);
    cmd.arg(path);
    cmd.arg(size.to_string());
    proc::run(cmd, "qemu-img create")?;
    Ok(())
}

/// Copies `src` into `dst` with the given conversion options; abortable.
pub fn convert(src: &Path, dst: &Path, options: &Convert, task: &Task) -> Result<()> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["convert", "-t", "none", "-T", "none", "-f", options.src_format.as_arg()]);
    cmd.args(["-O", options.dst_format.as_arg()]);

    let mut opts = Vec::new();
    if options.dst_format == Format::Qcow2 {
        opts.push(format!("compat={}", options.compat.as_arg()));
    }
    if let Some(backing) = &options.backing {
        opts.push(format!("backing_file={backing}"));
        if let Some(backing_format) = options.backing_format {
            opts.push(format!("backing_fmt={}", backing_format.as_arg()));
        }
    }
    if let Some(preallocation) = options.preallocation {
        opts.push(format!("preallocation={}", preallocation.as_arg()));
    }
    if !opts.is_empty() {
        let joined = opts.join(",");
        cmd.args(["-o", joined.as_str()]);
    }
    if options.unordered_writes {
        cmd.arg("-W");
    }
    cmd.arg(src);
    cmd.arg(dst);
    proc::run_abortable(cmd, "qemu-img convert", task)?;
    Ok(())
}

/// Repoints `path` at a new backing file; abortable.
///
/// Safe mode copies the differing clusters; `unsafe_mode` only rewrites
/// the header and is used when the data is already known to match, e.g.
/// detaching a merged subchain.
pub fn rebase(
    path: &Path,
    backing: &str,
    format: Format,
    backing_format: Option<Format>,
    unsafe_mode: bool,
    task: &Task,
) -> Result<()> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["rebase", "-t", "none"]);
    if unsafe_mode {
        cmd.arg("-u");
    }
    cmd.args(["-f", format.as_arg()]);
    cmd.args(["-b", backing]);
    if let Some(backing_format) = backing_format {
        if !backing.is_empty() {
            cmd.args(["-F", backing_format.as_arg()]);
        }
    }
    cmd.arg(path);
    proc::run_abortable(cmd, "qemu-img rebase", task)?;
    Ok(())
}

/// Queries image geometry and backing linkage.
pub fn info(path: &Path, format: Option<Format>) -> Result<ImgInfo> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["info", "--output", "json"]);
    if let Some(format) = format {
        cmd.args(["-f", format.as_arg()]);
    }
    cmd.arg(path);
    let out = proc::run(cmd, "qemu-img info")?;
    parse_json("qemu-img info", &out.stdout)
}

/// Measures the allocation needed to convert `path` to `out_format`.
pub fn measure(path: &Path, src_format: Format, out_format: Format) -> Result<Measure> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["measure", "--output", "json", "-f", src_format.as_arg()]);
    cmd.args(["-O", out_format.as_arg()]);
    cmd.arg(path);
    let out = proc::run(cmd, "qemu-img measure")?;
    parse_json("qemu-img measure", &out.stdout)
}

/// Checks a qcow2 image, reporting its end offset.
pub fn check(path: &Path) -> Result<Check> {
    let mut cmd = Command::new("qemu-img");
    cmd.args(["check", "--output", "json", "-f", "qcow2"]);
    cmd.arg(path);
    let out = proc::run(cmd, "qemu-img check")?;
    parse_json("qemu-img check", &out.stdout)
}

fn parse_json<T: for<'de> Deserialize<'de>>(cmd: &str, stdout: &[u8]) -> Result<T> {
    serde_json::from_slice(stdout).map_err(|e| Error::Command {
        cmd: cmd.to_owned(),
        rc: 0,
        stderr: format!("malformed json output: {e}"),
    })
}

/// Whether the `qemu-img` binary is available; tests skip without it.
#[cfg(test)]
pub fn available() -> bool {
    Command::new("qemu-img")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_info_json() {
        let json = br#"{"virtual-size":10737418240,"format":"qcow2",
            "actual-size":262144,"cluster-size":65536,
            "backing-filename":"/srv/storage/images/img/parent-uuid"}"#;
        let info: ImgInfo = parse_json("qemu-img info", json).unwrap();
        assert_eq!(info.virtual_size, 10 << 30);
        assert_eq!(info.backing_basename(), Some("parent-uuid"));
    }

    #[test]
    fn info_without_backing() {
        let json = br#"{"virtual-size":1048576,"format":"raw","actual-size":0}"#;
        let info: ImgInfo = parse_json("qemu-img info", json).unwrap();
        assert!(info.backing_filename.is_none());
        assert!(info.backing_basename().is_none());
    }

    #[test]
    fn parses_measure_json() {
        let json = br#"{"required":327680,"fully-allocated":1074135040}"#;
        let measure: Measure = parse_json("qemu-img measure", json).unwrap();
        assert_eq!(measure.required, 327_680);
    }

    #[test]
    fn compat_from_config() {
        assert_eq!(Qcow2Compat::from_config("1.1").unwrap(), Qcow2Compat::V1_1);
        assert_eq!(Qcow2Compat::from_config("0.10").unwrap(), Qcow2Compat::V0_10);
        assert!(Qcow2Compat::from_config("2.0").is_err());
    }

    #[test]
    fn create_info_roundtrip_on_real_qemu() {
        if !available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        create_qcow2(&base, 1 << 30, Qcow2Compat::V1_1, None).unwrap();
        let base_info = info(&base, Some(Format::Qcow2)).unwrap();
        assert_eq!(base_info.virtual_size, 1 << 30);
        assert!(base_info.backing_filename.is_none());

        let overlay = dir.path().join("overlay");
        create_qcow2(&overlay, 1 << 30, Qcow2Compat::V1_1, Some((&base, Format::Qcow2))).unwrap();
        let overlay_info = info(&overlay, Some(Format::Qcow2)).unwrap();
        assert_eq!(overlay_info.backing_basename(), Some("base"));
    }

    #[test]
    fn unsafe_rebase_detaches_backing_on_real_qemu() {
        if !available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        create_qcow2(&base, 1 << 20, Qcow2Compat::V1_1, None).unwrap();
        let overlay = dir.path().join("overlay");
        create_qcow2(&overlay, 1 << 20, Qcow2Compat::V1_1, Some((&base, Format::Qcow2))).unwrap();

        let task = Task::new();
        rebase(&overlay, "", Format::Qcow2, None, true, &task).unwrap();
        let overlay_info = info(&overlay, Some(Format::Qcow2)).unwrap();
        assert!(overlay_info.backing_filename.is_none());
    }
}

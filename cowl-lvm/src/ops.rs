//! Typed VG/LV operations on top of [`LvmCache`].

use tracing::info;

use crate::report::{self, LogicalVolume, PhysicalVolume, VolumeGroup};
use crate::{Error, LvmCache, Result};

/// Columns requested from `lvs`.
const LV_FIELDS: &str = "lv_name,vg_name,lv_size,lv_attr,lv_tags";
/// Columns requested from `vgs`.
const VG_FIELDS: &str = "vg_name,vg_size,vg_free,vg_extent_size,pv_count,vg_tags";
/// Columns requested from `pvs`.
const PV_FIELDS: &str = "pv_name,vg_name,pv_size";

impl LvmCache {
    /// Creates a VG over the given devices with a 128 MiB extent size.
    pub fn create_vg(&self, vg: &str, devices: &[&str], tags: &[&str]) -> Result<()> {
        info!(vg, ?devices, "creating volume group");
        let mut args = vec!["vgcreate", "--autobackup", "n", "--physicalextentsize", "128m"];
        for tag in tags {
            args.push("--addtag");
            args.push(tag);
        }
        args.push(vg);
        args.extend_from_slice(devices);
        self.cmd(&args)?;
        Ok(())
    }

    /// Adds devices to an existing VG.
    pub fn extend_vg(&self, vg: &str, devices: &[&str]) -> Result<()> {
        info!(vg, ?devices, "extending volume group");
        let mut args = vec!["vgextend", "--autobackup", "n", vg];
        args.extend_from_slice(devices);
        self.cmd(&args)?;
        Ok(())
    }

    /// Removes devices from a VG.
    pub fn reduce_vg(&self, vg: &str, devices: &[&str]) -> Result<()> {
        info!(vg, ?devices, "reducing volume group");
        let mut args = vec!["vgreduce", "--autobackup", "n", vg];
        args.extend_from_slice(devices);
        self.cmd(&args)?;
        Ok(())
    }

    /// Replaces tags on a VG.
    pub fn change_vg_tags(&self, vg: &str, del: &[&str], add: &[&str]) -> Result<()> {
        let mut args = vec!["vgchange", "--autobackup", "n"];
        for tag in del {
            args.push("--deltag");
            args.push(tag);
        }
        for tag in add {
            args.push("--addtag");
            args.push(tag);
        }
        args.push(vg);
        self.cmd(&args)?;
        Ok(())
    }

    /// Creates an LV of `size` bytes, optionally inactive, with tags.
    pub fn create_lv(
        &self,
        vg: &str,
        lv: &str,
        size: u64,
        tags: &[&str],
        activate: bool,
    ) -> Result<()> {
        info!(vg, lv, size, "creating logical volume");
        let size_arg = format!("{size}b");
        let mut args = vec![
            "lvcreate",
            "--autobackup",
            "n",
            "--contiguous",
            "n",
            "--activate",
            if activate { "y" } else { "n" },
            "--size",
            &size_arg,
        ];
        for tag in tags {
            args.push("--addtag");
            args.push(tag);
        }
        args.push("--name");
        args.push(lv);
        args.push(vg);
        self.cmd(&args)?;
        Ok(())
    }

    /// Force-removes an LV.
    pub fn remove_lv(&self, vg: &str, lv: &str) -> Result<()> {
        info!(vg, lv, "removing logical volume");
        let path = format!("{vg}/{lv}");
        self.cmd(&["lvremove", "--autobackup", "n", "-f", &path])?;
        Ok(())
    }

    /// Grows an LV to `size` bytes (LVM rounds up to the extent).
    pub fn extend_lv(&self, vg: &str, lv: &str, size: u64) -> Result<()> {
        info!(vg, lv, size, "extending logical volume");
        let size_arg = format!("{size}b");
        let path = format!("{vg}/{lv}");
        self.cmd(&["lvextend", "--autobackup", "n", "--size", &size_arg, &path])?;
        Ok(())
    }

    /// Shrinks an LV to `size` bytes.
    pub fn reduce_lv(&self, vg: &str, lv: &str, size: u64) -> Result<()> {
        info!(vg, lv, size, "reducing logical volume");
        let size_arg = format!("{size}b");
        let path = format!("{vg}/{lv}");
        self.cmd(&["lvreduce", "--autobackup", "n", "--force", "--size", &size_arg, &path])?;
        Ok(())
    }

    /// Renames an LV within its VG.
    pub fn rename_lv(&self, vg: &str, old: &str, new: &str) -> Result<()> {
        info!(vg, old, new, "renaming logical volume");
        self.cmd(&["lvrename", "--autobackup", "n", vg, old, new])?;
        Ok(())
    }

    /// Reloads device-mapper tables for LVs changed by another host.
    pub fn refresh_lvs(&self, vg: &str, lvs: &[&str]) -> Result<()> {
        let paths: Vec<String> = lvs.iter().map(|lv| format!("{vg}/{lv}")).collect();
        let mut args = vec!["lvchange", "--refresh"];
        args.extend(paths.iter().map(String::as_str));
        self.cmd(&args)?;
        Ok(())
    }

    /// Activates LVs so their device nodes appear.
    pub fn activate_lvs(&self, vg: &str, lvs: &[&str]) -> Result<()> {
        self.change_availability(vg, lvs, true)
    }

    /// Deactivates LVs, releasing their device nodes.
    pub fn deactivate_lvs(&self, vg: &str, lvs: &[&str]) -> Result<()> {
        self.change_availability(vg, lvs, false)
    }

    fn change_availability(&self, vg: &str, lvs: &[&str], available: bool) -> Result<()> {
        if lvs.is_empty() {
            return Ok(());
        }
        let paths: Vec<String> = lvs.iter().map(|lv| format!("{vg}/{lv}")).collect();
        let mut args = vec![
            "lvchange",
            "--autobackup",
            "n",
            "--available",
            if available { "y" } else { "n" },
        ];
        args.extend(paths.iter().map(String::as_str));
        self.cmd(&args)?;
        Ok(())
    }

    /// Toggles an LV between read-write and read-only.
    pub fn set_lv_writable(&self, vg: &str, lv: &str, writable: bool) -> Result<()> {
        let path = format!("{vg}/{lv}");
        self.cmd(&[
            "lvchange",
            "--autobackup",
            "n",
            "--permission",
            if writable { "rw" } else { "r" },
            &path,
        ])?;
        Ok(())
    }

    /// Removes and adds tags on an LV in one command.
    pub fn change_lv_tags(&self, vg: &str, lv: &str, del: &[&str], add: &[&str]) -> Result<()> {
        if del.is_empty() && add.is_empty() {
            return Ok(());
        }
        let path = format!("{vg}/{lv}");
        let mut args = vec!["lvchange", "--autobackup", "n"];
        for tag in del {
            args.push("--deltag");
            args.push(tag);
        }
        for tag in add {
            args.push("--addtag");
            args.push(tag);
        }
        args.push(&path);
        self.cmd(&args)?;
        Ok(())
    }

    /// Lists all LVs of a VG.
    pub fn list_lvs(&self, vg: &str) -> Result<Vec<LogicalVolume>> {
        let out = self.cmd(&[
            "lvs",
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            LV_FIELDS,
            vg,
        ])?;
        report::parse_lvs(&out.stdout)
    }

    /// Looks up one LV.
    pub fn get_lv(&self, vg: &str, lv: &str) -> Result<LogicalVolume> {
        let path = format!("{vg}/{lv}");
        let out = self.cmd(&[
            "lvs",
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            LV_FIELDS,
            &path,
        ])?;
        report::parse_lvs(&out.stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::LvNotFound {
                vg: vg.to_owned(),
                lv: lv.to_owned(),
            })
    }

    /// Looks up one VG.
    pub fn get_vg(&self, vg: &str) -> Result<VolumeGroup> {
        let out = self.cmd(&[
            "vgs",
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            VG_FIELDS,
            vg,
        ])?;
        report::parse_vgs(&out.stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::VgNotFound(vg.to_owned()))
    }

    /// Lists all PVs visible through the current filter.
    pub fn list_pvs(&self) -> Result<Vec<PhysicalVolume>> {
        let out = self.cmd(&[
            "pvs",
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            PV_FIELDS,
        ])?;
        report::parse_pvs(&out.stdout)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    use parking_lot::Mutex;

    use super::*;
    use crate::{LvmCacheConfig, Runner};

    /// Records argv and always succeeds with canned stdout.
    #[derive(Debug)]
    struct RecordingRunner {
        stdout: &'static str,
        calls: &'static Mutex<Vec<Vec<String>>>,
    }

    impl Runner for RecordingRunner {
        fn run(&self, argv: &[String]) -> io::Result<Output> {
            self.calls.lock().push(argv.to_vec());
            Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: self.stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
            })
        }
    }

    fn recording(stdout: &'static str) -> (LvmCache, &'static Mutex<Vec<Vec<String>>>) {
        let calls: &'static Mutex<Vec<Vec<String>>> = Box::leak(Box::new(Mutex::new(Vec::new())));
        let cache = LvmCache::new(
            Box::new(RecordingRunner { stdout, calls }),
            LvmCacheConfig::default(),
        );
        (cache, calls)
    }

    #[test]
    fn create_lv_arguments() {
        let (cache, calls) = recording("");
        cache
            .create_lv("sd1", "vol1", 1 << 30, &["MD_5", "IU_img"], false)
            .unwrap();
        let argv = &calls.lock()[0];
        assert_eq!(argv[1], "lvcreate");
        let joined = argv.join(" ");
        assert!(joined.contains("--activate n"));
        assert!(joined.contains("--size 1073741824b"));
        assert!(joined.contains("--addtag MD_5"));
        assert!(joined.contains("--addtag IU_img"));
        assert!(joined.ends_with("--name vol1 sd1"));
    }

    #[test]
    fn tag_change_combines_del_and_add() {
        let (cache, calls) = recording("");
        cache
            .change_lv_tags("sd1", "vol1", &["PU_old"], &["PU_new"])
            .unwrap();
        let joined = calls.lock()[0].join(" ");
        assert!(joined.contains("--deltag PU_old"));
        assert!(joined.contains("--addtag PU_new"));
        assert!(joined.ends_with("sd1/vol1"));
    }

    #[test]
    fn empty_tag_change_is_a_noop() {
        let (cache, calls) = recording("");
        cache.change_lv_tags("sd1", "vol1", &[], &[]).unwrap();
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn get_lv_not_found() {
        let (cache, _calls) = recording(r#"{"report":[{"lv":[]}]}"#);
        assert!(matches!(
            cache.get_lv("sd1", "missing"),
            Err(Error::LvNotFound { .. })
        ));
    }

    #[test]
    fn get_vg_parses_row() {
        let (cache, _calls) = recording(
            r#"{"report":[{"vg":[{"vg_name":"sd1","vg_size":"107374182400",
            "vg_free":"53687091200","vg_extent_size":"134217728",
            "pv_count":"1","vg_tags":""}]}]}"#,
        );
        let vg = cache.get_vg("sd1").unwrap();
        assert_eq!(vg.free, 50 << 30);
    }

    #[test]
    fn deactivate_empty_list_is_a_noop() {
        let (cache, calls) = recording("");
        cache.deactivate_lvs("sd1", &[]).unwrap();
        assert!(calls.lock().is_empty());
    }
}

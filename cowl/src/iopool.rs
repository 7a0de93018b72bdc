//! Per-domain file I/O worker pools.
//!
//! A slow NFS mount can wedge a thread indefinitely; funnelling each
//! domain's file operations through its own small pool keeps one bad
//! mount from stalling operations on every other domain. Callers submit a
//! closure and block for the result, so the interface stays synchronous.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool executing blocking file operations.
#[derive(Debug)]
pub struct IoPool {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl IoPool {
    /// Spawns `threads` workers named after the owning domain.
    pub fn new(name: &str, threads: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(StdMutex::new(rx));
        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = Arc::clone(&rx);
                std::thread::Builder::new()
                    .name(format!("io/{name}/{i}"))
                    .spawn(move || {
                        loop {
                            let job = {
                                let Ok(guard) = rx.lock() else { return };
                                guard.recv()
                            };
                            match job {
                                Ok(job) => job(),
                                Err(_) => return,
                            }
                        }
                    })
                    .unwrap_or_else(|e| panic!("spawning io worker: {e}"))
            })
            .collect();
        Self { tx: Some(tx), workers }
    }

    /// Runs `f` on a pool worker, blocking the caller for the result.
    pub fn submit<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let _ = result_tx.send(f());
        });
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::other("io pool is shut down"))?;
        tx.send(job)
            .map_err(|_| Error::Io(io::Error::other("io pool is shut down")))?;
        result_rx
            .recv()
            .map_err(|_| Error::Io(io::Error::other("io worker died")))?
            .map_err(Error::Io)
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Registry of per-domain pools.
#[derive(Debug)]
pub struct IoPools {
    threads: usize,
    pools: Mutex<HashMap<Uuid, Arc<IoPool>>>,
}

impl IoPools {
    /// Creates the registry; each domain gets `threads` workers.
    pub fn new(threads: usize) -> Self {
        Self {
            threads,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The pool of a domain, created on first use.
    pub fn get(&self, sd_uuid: Uuid) -> Arc<IoPool> {
        let mut pools = self.pools.lock();
        Arc::clone(pools.entry(sd_uuid).or_insert_with(|| {
            debug!(%sd_uuid, "creating io pool");
            Arc::new(IoPool::new(&sd_uuid.to_string(), self.threads))
        }))
    }

    /// Drops all pools, joining their workers.
    pub fn shutdown(&self) {
        self.pools.lock().clear();
    }
}

/// File backend adapter: every operation runs on the domain's pool.
#[derive(Debug, Clone)]
pub struct FileIo {
    pool: Arc<IoPool>,
}

impl FileIo {
    /// Wraps a domain pool.
    pub const fn new(pool: Arc<IoPool>) -> Self {
        Self { pool }
    }

    /// Whether the path exists.
    pub fn path_exists(&self, path: &Path) -> Result<bool> {
        let path = path.to_owned();
        self.pool.submit(move || Ok(path.exists()))
    }

    /// Logical file size in bytes.
    pub fn size(&self, path: &Path) -> Result<u64> {
        let path = path.to_owned();
        self.pool.submit(move || Ok(fs::metadata(path)?.len()))
    }

    /// On-disk allocation in bytes, as the OS reports it.
    pub fn apparent_size(&self, path: &Path) -> Result<u64> {
        let path = path.to_owned();
        self.pool
            .submit(move || Ok(fs::metadata(path)?.blocks() * 512))
    }

    /// Creates or resizes a file to `size` bytes.
    ///
    /// With `excl` the file must not exist yet; the `AlreadyExists` error
    /// kind is the caller's volume-exists signal. `mode` applies only to
    /// newly created files.
    pub fn truncate(&self, path: &Path, size: u64, mode: u32, excl: bool) -> Result<()> {
        let path = path.to_owned();
        self.pool.submit(move || {
            let mut opts = OpenOptions::new();
            opts.write(true).mode(mode);
            if excl {
                opts.create_new(true);
            } else {
                opts.create(true);
            }
            let file = opts.open(&path)?;
            file.set_len(size)?;
            Ok(())
        })
    }

    /// Renames a file.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = from.to_owned();
        let to = to.to_owned();
        self.pool.submit(move || fs::rename(from, to))
    }

    /// Removes a file; absent files are not an error.
    pub fn unlink(&self, path: &Path) -> Result<()> {
        let path = path.to_owned();
        self.pool.submit(move || match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
    }

    /// Changes file permissions.
    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let path = path.to_owned();
        self.pool
            .submit(move || fs::set_permissions(path, fs::Permissions::from_mode(mode)))
    }

    /// Reads a whole text file.
    pub fn read_to_string(&self, path: &Path) -> Result<String> {
        let path = path.to_owned();
        self.pool.submit(move || fs::read_to_string(path))
    }

    /// Writes `contents` to a sibling temp file, fsyncs, and renames over
    /// `path` so readers never see a torn record.
    pub fn write_then_rename(&self, path: &Path, contents: String, mode: u32) -> Result<()> {
        let path = path.to_owned();
        self.pool.submit(move || {
            use io::Write as _;

            let tmp = tmp_path(&path);
            {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(mode)
                    .open(&tmp)?;
                file.write_all(contents.as_bytes())?;
                file.sync_all()?;
            }
            fs::rename(&tmp, &path)
        })
    }

    /// Creates a directory and any missing parents.
    pub fn create_dir_all(&self, path: &Path) -> Result<()> {
        let path = path.to_owned();
        self.pool.submit(move || fs::create_dir_all(path))
    }

    /// Lists entry names of a directory.
    pub fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let path = path.to_owned();
        self.pool.submit(move || {
            let mut names = Vec::new();
            for entry in fs::read_dir(path)? {
                if let Some(name) = entry?.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
            Ok(names)
        })
    }

    /// Removes a directory tree.
    pub fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let path = path.to_owned();
        self.pool.submit(move || match fs::remove_dir_all(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
    }

    /// Overwrites a file's whole extent with zeroes, preserving its size.
    pub fn zero(&self, path: &Path) -> Result<()> {
        let path = path.to_owned();
        self.pool.submit(move || {
            use io::Write as _;

            let len = fs::metadata(&path)?.len();
            let mut file = OpenOptions::new().write(true).open(&path)?;
            let chunk = vec![0u8; 1 << 20];
            let mut left = len;
            while left > 0 {
                let n = left.min(chunk.len() as u64) as usize;
                file.write_all(&chunk[..n])?;
                left -= n as u64;
            }
            file.sync_all()
        })
    }

    /// Hard-links `src` as `dst` (template sharing).
    pub fn hard_link(&self, src: &Path, dst: &Path) -> Result<()> {
        let src = src.to_owned();
        let dst = dst.to_owned();
        self.pool.submit(move || fs::hard_link(src, dst))
    }

    /// The filesystem block size at `path`.
    pub fn fs_block_size(&self, path: &Path) -> Result<u64> {
        let path = path.to_owned();
        self.pool.submit(move || {
            let stat = nix::sys::statvfs::statvfs(&path)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            #[allow(clippy::useless_conversion)]
            Ok(u64::from(stat.fragment_size()))
        })
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".new");
    PathBuf::from(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn file_io() -> (tempfile::TempDir, FileIo) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(IoPool::new("test", 2));
        (dir, FileIo::new(pool))
    }

    #[test]
    fn submit_returns_value() {
        let pool = IoPool::new("t", 2);
        let out = pool.submit(|| Ok(21 * 2)).unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn submit_propagates_errors() {
        let pool = IoPool::new("t", 1);
        let err = pool
            .submit::<(), _>(|| Err(io::Error::other("boom")))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn exclusive_truncate_refuses_existing() {
        let (dir, io) = file_io();
        let path = dir.path().join("vol");
        io.truncate(&path, 1024, 0o660, true).unwrap();
        assert_eq!(io.size(&path).unwrap(), 1024);

        let err = io.truncate(&path, 1024, 0o660, true).unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::AlreadyExists),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn write_then_rename_is_atomic_replacement() {
        let (dir, io) = file_io();
        let path = dir.path().join("record");
        io.write_then_rename(&path, "one".to_owned(), 0o660).unwrap();
        io.write_then_rename(&path, "two".to_owned(), 0o660).unwrap();
        assert_eq!(io.read_to_string(&path).unwrap(), "two");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn unlink_missing_is_ok() {
        let (dir, io) = file_io();
        io.unlink(&dir.path().join("nope")).unwrap();
    }

    #[test]
    fn sparse_file_apparent_size_is_small() {
        let (dir, io) = file_io();
        let path = dir.path().join("sparse");
        io.truncate(&path, 10 << 20, 0o660, true).unwrap();
        assert!(io.apparent_size(&path).unwrap() < 1 << 20);
    }

    #[test]
    fn pools_are_cached_per_domain() {
        let pools = IoPools::new(1);
        let sd = Uuid::new_v4();
        let a = pools.get(sd);
        let b = pools.get(sd);
        assert!(Arc::ptr_eq(&a, &b));
        pools.shutdown();
    }
}

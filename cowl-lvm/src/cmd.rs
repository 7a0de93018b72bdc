//! The `lvm` command cache: filtered config, slot cap, retries, RO/RW
//! toggle.

use std::io;
use std::process::Command;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::{Error, Result, filter};

/// stderr lines carrying these markers are documented noise, not failures.
const BENIGN_WARNINGS: &[&str] = &[
    "WARNING: This metadata update is NOT backed up",
    "WARNING: Combining activation change with other commands is not advised",
    "WARNING: Inconsistent metadata found for VG",
    "WARNING: Not using device",
];

/// Executes an assembled `lvm` argv. The seam exists so the retry and
/// filter logic can be exercised without a SAN attached.
pub trait Runner: Send + Sync + std::fmt::Debug {
    /// Runs `argv[0]` with `argv[1..]` and captures its output.
    fn run(&self, argv: &[String]) -> io::Result<std::process::Output>;
}

/// [`Runner`] that spawns the real binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, argv: &[String]) -> io::Result<std::process::Output> {
        Command::new(&argv[0]).args(&argv[1..]).output()
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Raw stdout.
    pub stdout: String,
    /// stderr with benign warnings removed.
    pub stderr: String,
}

/// Tunables of the command cache.
#[derive(Debug, Clone, Copy)]
pub struct LvmCacheConfig {
    /// Concurrent `lvm` command cap.
    pub max_commands: usize,
    /// Retries for failures in read-only mode.
    pub read_only_retries: u32,
    /// Delay between read-only retries.
    pub retry_delay: Duration,
}

impl Default for LvmCacheConfig {
    fn default() -> Self {
        Self {
            max_commands: 10,
            read_only_retries: 6,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Mutable cache state guarded by one lock.
#[derive(Debug)]
struct State {
    /// Stable links of the multipath devices currently in use.
    devices: Vec<String>,
    /// Bumped whenever `devices` changes, to tell retries the filter moved.
    generation: u64,
    /// `locking_type=4` probing when set, `locking_type=1` otherwise.
    read_only: bool,
    /// In-flight commands.
    active: usize,
    /// A mode flip is waiting for in-flight commands to finish.
    draining: bool,
}

/// Process-wide mediator for all `lvm` invocations.
///
/// Every command is issued as `lvm <verb> --config <cfg> <args>` where
/// `<cfg>` embeds a filter accepting exactly the known devices. Failures
/// retry per mode: read-only commands are probes and retry up to
/// [`LvmCacheConfig::read_only_retries`] times; read-write commands get a
/// single retry with a rebuilt filter to cover the stale-filter case.
#[derive(Debug)]
pub struct LvmCache {
    runner: Box<dyn Runner>,
    config: LvmCacheConfig,
    state: Mutex<State>,
    cond: Condvar,
}

impl LvmCache {
    /// Creates a cache that drives the real `lvm` binary.
    pub fn system(config: LvmCacheConfig) -> Self {
        Self::new(Box::new(SystemRunner), config)
    }

    /// Creates a cache over an arbitrary [`Runner`].
    pub fn new(runner: Box<dyn Runner>, config: LvmCacheConfig) -> Self {
        Self {
            runner,
            config,
            state: Mutex::new(State {
                devices: Vec::new(),
                generation: 0,
                read_only: false,
                active: 0,
                draining: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Replaces the known device set; subsequent commands (and stale-filter
    /// retries of running ones) embed the new filter.
    pub fn set_devices<S: Into<String>>(&self, devices: impl IntoIterator<Item = S>) {
        let mut devices: Vec<String> = devices.into_iter().map(Into::into).collect();
        devices.sort_unstable();
        devices.dedup();

        let mut state = self.state.lock();
        if state.devices != devices {
            state.devices = devices;
            state.generation += 1;
            debug!(generation = state.generation, "lvm device filter updated");
        }
    }

    /// The current device set.
    pub fn devices(&self) -> Vec<String> {
        self.state.lock().devices.clone()
    }

    /// The canonical filter for the current device set.
    pub fn wanted_filter(&self) -> Vec<String> {
        filter::build_filter(&self.state.lock().devices)
    }

    /// Flips between read-write (`locking_type=1`) and read-only
    /// (`locking_type=4`) operation, draining in-flight commands first.
    pub fn set_read_only(&self, read_only: bool) {
        let mut state = self.state.lock();
        if state.read_only == read_only {
            return;
        }
        state.draining = true;
        while state.active > 0 {
            self.cond.wait(&mut state);
        }
        state.read_only = read_only;
        state.draining = false;
        drop(state);
        self.cond.notify_all();
    }

    /// Whether the cache is in read-only mode.
    pub fn read_only(&self) -> bool {
        self.state.lock().read_only
    }

    /// Issues `lvm <args[0]> --config <cfg> <args[1..]>`.
    pub fn cmd(&self, args: &[&str]) -> Result<CommandOutput> {
        let verb = args.first().copied().unwrap_or_default().to_owned();
        self.acquire_slot();
        let result = self.cmd_with_retries(&verb, args);
        self.release_slot();
        result
    }

    fn cmd_with_retries(&self, verb: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut attempt: u32 = 0;
        loop {
            let (argv, generation, read_only) = self.build_argv(args);
            match self.run_once(verb, &argv) {
                Ok(out) => return Ok(out),
                Err(err) => {
                    if read_only && attempt < self.config.read_only_retries {
                        attempt += 1;
                        debug!(verb, attempt, "read-only lvm command failed, retrying");
                        std::thread::sleep(self.config.retry_delay);
                        continue;
                    }
                    if !read_only && attempt == 0 {
                        attempt += 1;
                        let stale = self.state.lock().generation != generation;
                        warn!(verb, stale, "lvm command failed, reissuing with rebuilt filter");
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    fn acquire_slot(&self) {
        let mut state = self.state.lock();
        while state.active >= self.config.max_commands || state.draining {
            self.cond.wait(&mut state);
        }
        state.active += 1;
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        drop(state);
        self.cond.notify_all();
    }

    fn build_argv(&self, args: &[&str]) -> (Vec<String>, u64, bool) {
        let state = self.state.lock();
        let cfg = config_arg(&state.devices, state.read_only);
        let generation = state.generation;
        let read_only = state.read_only;
        drop(state);

        let mut argv = Vec::with_capacity(args.len() + 3);
        argv.push("lvm".to_owned());
        if let Some(verb) = args.first() {
            argv.push((*verb).to_owned());
        }
        argv.push("--config".to_owned());
        argv.push(cfg);
        argv.extend(args.iter().skip(1).map(|a| (*a).to_owned()));
        (argv, generation, read_only)
    }

    fn run_once(&self, verb: &str, argv: &[String]) -> Result<CommandOutput> {
        let output = self.runner.run(argv)?;
        let stderr = filter_warnings(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            return Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr,
            });
        }
        Err(Error::Command {
            verb: verb.to_owned(),
            rc: output.status.code().unwrap_or(-1),
            stderr,
        })
    }
}

/// Assembles the `--config` argument embedding the device filter and the
/// locking mode.
fn config_arg(devices: &[String], read_only: bool) -> String {
    let items = filter::build_filter(devices);
    let quoted: Vec<String> = items.iter().map(|i| format!("\"{i}\"")).collect();
    let locking_type = if read_only { 4 } else { 1 };
    format!(
        "devices {{ preferred_names=[\"^/dev/mapper/\"] ignore_suspended_devices=1 \
         write_cache_state=0 disable_after_error_count=3 filter=[{}] }} \
         global {{ locking_type={locking_type} prioritise_write_locks=1 \
         wait_for_locks=1 use_lvmetad=0 }} backup {{ retain_min=50 retain_days=0 }}",
        quoted.join(", ")
    )
}

/// Drops documented benign warning lines from stderr.
fn filter_warnings(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !BENIGN_WARNINGS.iter().any(|w| line.contains(w)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Scripted runner: each call pops the next exit code and records argv.
    #[derive(Debug)]
    struct FakeRunner {
        codes: Mutex<Vec<i32>>,
        calls: Mutex<Vec<Vec<String>>>,
        invocations: AtomicUsize,
    }

    impl FakeRunner {
        fn new(codes: Vec<i32>) -> Self {
            Self {
                codes: Mutex::new(codes),
                calls: Mutex::new(Vec::new()),
                invocations: AtomicUsize::new(0),
            }
        }
    }

    impl Runner for FakeRunner {
        fn run(&self, argv: &[String]) -> io::Result<Output> {
            self.calls.lock().push(argv.to_vec());
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let mut codes = self.codes.lock();
            let code = if codes.is_empty() { 0 } else { codes.remove(0) };
            Ok(Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: b"out".to_vec(),
                stderr: Vec::new(),
            })
        }
    }

    fn cache_with(codes: Vec<i32>) -> (LvmCache, &'static FakeRunner) {
        let runner: &'static FakeRunner = Box::leak(Box::new(FakeRunner::new(codes)));
        let config = LvmCacheConfig {
            retry_delay: Duration::from_millis(1),
            ..LvmCacheConfig::default()
        };
        let cache = LvmCache::new(
            Box::new(SharedRunner(runner)),
            config,
        );
        (cache, runner)
    }

    /// Forwards to a leaked [`FakeRunner`] so tests keep a handle on it.
    #[derive(Debug)]
    struct SharedRunner(&'static FakeRunner);

    impl Runner for SharedRunner {
        fn run(&self, argv: &[String]) -> io::Result<Output> {
            self.0.run(argv)
        }
    }

    #[test]
    fn embeds_filter_and_write_locking() {
        let (cache, runner) = cache_with(vec![0]);
        cache.set_devices(["/dev/mapper/wwid1"]);
        cache.cmd(&["vgs", "--noheadings"]).unwrap();

        let calls = runner.calls.lock();
        let argv = &calls[0];
        assert_eq!(argv[0], "lvm");
        assert_eq!(argv[1], "vgs");
        assert_eq!(argv[2], "--config");
        assert!(argv[3].contains("a|^/dev/mapper/wwid1$|"));
        assert!(argv[3].contains("r|.*|"));
        assert!(argv[3].contains("locking_type=1"));
        assert_eq!(argv[4], "--noheadings");
    }

    #[test]
    fn read_only_mode_uses_lock_free_probing() {
        let (cache, runner) = cache_with(vec![0]);
        cache.set_read_only(true);
        cache.cmd(&["lvs"]).unwrap();
        assert!(runner.calls.lock()[0][3].contains("locking_type=4"));
    }

    #[test]
    fn read_only_failures_retry_until_budget() {
        let (cache, runner) = cache_with(vec![5, 5, 5, 5, 5, 5, 5]);
        cache.set_read_only(true);
        let err = cache.cmd(&["lvs"]).unwrap_err();
        assert!(matches!(err, Error::Command { rc: 5, .. }));
        // First attempt plus read_only_retries.
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn read_only_retry_can_succeed() {
        let (cache, runner) = cache_with(vec![5, 0]);
        cache.set_read_only(true);
        cache.cmd(&["lvs"]).unwrap();
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn read_write_failures_retry_once_with_rebuilt_filter() {
        let (cache, runner) = cache_with(vec![5, 5]);
        cache.set_devices(["/dev/mapper/old"]);
        let err = cache.cmd(&["lvcreate"]).unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_filter_retry_picks_up_new_devices() {
        use std::sync::{Arc, OnceLock};

        /// Fails the first call and updates the cache's device list before
        /// returning, as a multipath rescan would.
        #[derive(Debug)]
        struct RescanRunner {
            cache: OnceLock<Arc<LvmCache>>,
            calls: Mutex<Vec<Vec<String>>>,
        }

        impl Runner for RescanRunner {
            fn run(&self, argv: &[String]) -> io::Result<Output> {
                let mut calls = self.calls.lock();
                calls.push(argv.to_vec());
                let first = calls.len() == 1;
                drop(calls);
                if first {
                    if let Some(cache) = self.cache.get() {
                        cache.set_devices(["/dev/mapper/old", "/dev/mapper/new"]);
                    }
                }
                Ok(Output {
                    status: ExitStatus::from_raw(if first { 5 << 8 } else { 0 }),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                })
            }
        }

        let runner: &'static RescanRunner = Box::leak(Box::new(RescanRunner {
            cache: OnceLock::new(),
            calls: Mutex::new(Vec::new()),
        }));
        let cache = Arc::new(LvmCache::new(
            Box::new(SharedRescan(runner)),
            LvmCacheConfig::default(),
        ));
        runner.cache.set(Arc::clone(&cache)).unwrap();

        #[derive(Debug)]
        struct SharedRescan(&'static RescanRunner);
        impl Runner for SharedRescan {
            fn run(&self, argv: &[String]) -> io::Result<Output> {
                self.0.run(argv)
            }
        }

        cache.set_devices(["/dev/mapper/old"]);
        cache.cmd(&["lvcreate"]).unwrap();

        let calls = runner.calls.lock();
        assert!(!calls[0][3].contains("/dev/mapper/new"));
        assert!(calls[1][3].contains("/dev/mapper/new"));
    }

    #[test]
    fn benign_warnings_are_filtered() {
        let filtered = filter_warnings(
            "  WARNING: This metadata update is NOT backed up\nreal error\n",
        );
        assert_eq!(filtered, "real error");
    }

    #[test]
    fn toggle_is_idempotent() {
        let (cache, _runner) = cache_with(vec![]);
        cache.set_read_only(true);
        cache.set_read_only(true);
        assert!(cache.read_only());
        cache.set_read_only(false);
        assert!(!cache.read_only());
    }
}

//! Per-process resource manager: fair reader/writer locks keyed by
//! `(namespace, name)`.
//!
//! Engine operations serialise on these locks before touching shared
//! state: an image mutation takes EXCLUSIVE in the image namespace of its
//! domain, a cross-domain copy additionally takes SHARED on the source
//! template. Waiters are served strictly in arrival order so a stream of
//! readers cannot starve a writer; acquisition by a thread that already
//! holds the resource is reentrant and does not queue behind waiters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

/// Namespace for whole-domain operations.
pub const STORAGE: &str = "00_storage";
/// Namespace prefix for image locks.
pub const IMAGE_NAMESPACE: &str = "01_img";
/// Namespace prefix for volume locks.
pub const VOLUME_NAMESPACE: &str = "02_vol";
/// Namespace prefix for LV activation refcounts.
pub const LVM_ACTIVATION_NAMESPACE: &str = "03_lvm";
/// Namespace prefix for volume lease operations.
pub const VOLUME_LEASE_NAMESPACE: &str = "04_lease";

/// Forms the per-domain namespace, e.g. `01_img_<sdUUID>`.
pub fn namespace(prefix: &str, sd_uuid: Uuid) -> String {
    format!("{prefix}_{sd_uuid}")
}

/// Lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LockMode {
    /// Concurrent readers.
    Shared,
    /// Single writer.
    Exclusive,
}

/// One holder entry: owning thread, granted mode, reentrancy count.
#[derive(Debug)]
struct Holder {
    owner: ThreadId,
    mode: LockMode,
    count: u32,
}

#[derive(Debug, Default)]
struct ResourceState {
    holders: Vec<Holder>,
    queue: VecDeque<(u64, LockMode)>,
    next_ticket: u64,
}

#[derive(Debug, Default)]
struct Resource {
    state: Mutex<ResourceState>,
    cond: Condvar,
}

/// Per-process mapping `(namespace, name) → reader/writer lock`.
#[derive(Debug, Default)]
pub struct ResourceManager {
    resources: Mutex<HashMap<(String, String), Arc<Resource>>>,
}

impl ResourceManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `(namespace, name)` in the given mode, waiting up to
    /// `timeout`.
    ///
    /// Returns a scoped lease; dropping it releases the resource. A thread
    /// already holding the resource reacquires reentrantly without
    /// queueing, except for a shared-to-exclusive upgrade, which would
    /// deadlock and is rejected.
    pub fn acquire(
        &self,
        namespace: &str,
        name: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<ResourceLease> {
        let key = (namespace.to_owned(), name.to_owned());
        let resource = {
            let mut map = self.resources.lock();
            Arc::clone(map.entry(key.clone()).or_default())
        };
        let owner = thread::current().id();

        let mut state = resource.state.lock();

        if let Some(holder) = state.holders.iter_mut().find(|h| h.owner == owner) {
            if mode == LockMode::Exclusive && holder.mode == LockMode::Shared {
                return Err(Error::InvalidParameter {
                    name: "mode",
                    value: "shared-to-exclusive upgrade".to_owned(),
                });
            }
            holder.count += 1;
            drop(state);
            debug!(namespace, name, "reentrant acquire");
            return Ok(ResourceLease {
                resource,
                owner,
                namespace: key.0,
                name: key.1,
                mode,
            });
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back((ticket, mode));

        let deadline = Instant::now() + timeout;
        loop {
            if can_grant(&state, ticket, mode) {
                state.queue.pop_front();
                state.holders.push(Holder {
                    owner,
                    mode,
                    count: 1,
                });
                drop(state);
                // A following shared waiter may be grantable too.
                resource.cond.notify_all();
                debug!(namespace, name, ?mode, "resource acquired");
                return Ok(ResourceLease {
                    resource,
                    owner,
                    namespace: key.0,
                    name: key.1,
                    mode,
                });
            }
            if resource.cond.wait_until(&mut state, deadline).timed_out() {
                state.queue.retain(|(t, _)| *t != ticket);
                drop(state);
                resource.cond.notify_all();
                return Err(Error::ResourceTimeout {
                    namespace: namespace.to_owned(),
                    name: name.to_owned(),
                });
            }
        }
    }

    /// Whether anything currently holds `(namespace, name)`.
    pub fn is_held(&self, namespace: &str, name: &str) -> bool {
        let key = (namespace.to_owned(), name.to_owned());
        self.resources
            .lock()
            .get(&key)
            .is_some_and(|r| !r.state.lock().holders.is_empty())
    }
}

/// FIFO fairness: only the front waiter may be granted, and only when its
/// mode is compatible with the current holders.
fn can_grant(state: &ResourceState, ticket: u64, mode: LockMode) -> bool {
    if state.queue.front().map(|(t, _)| *t) != Some(ticket) {
        return false;
    }
    match mode {
        LockMode::Exclusive => state.holders.is_empty(),
        LockMode::Shared => state.holders.iter().all(|h| h.mode == LockMode::Shared),
    }
}

/// Scoped resource hold; releases on drop.
pub struct ResourceLease {
    resource: Arc<Resource>,
    owner: ThreadId,
    namespace: String,
    name: String,
    mode: LockMode,
}

impl std::fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLease")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

impl ResourceLease {
    /// The granted mode.
    pub const fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        let mut state = self.resource.state.lock();
        if let Some(pos) = state.holders.iter().position(|h| h.owner == self.owner) {
            state.holders[pos].count -= 1;
            if state.holders[pos].count == 0 {
                state.holders.swap_remove(pos);
            }
        }
        drop(state);
        self.resource.cond.notify_all();
        debug!(namespace = %self.namespace, name = %self.name, "resource released");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn shared_holders_coexist() {
        let rm = Arc::new(ResourceManager::new());
        let _lease = rm.acquire("ns", "img", LockMode::Shared, LONG).unwrap();

        let rm_clone = Arc::clone(&rm);
        let handle = thread::spawn(move || {
            rm_clone
                .acquire("ns", "img", LockMode::Shared, LONG)
                .map(|_| ())
        });
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn exclusive_blocks_until_released() {
        let rm = Arc::new(ResourceManager::new());
        let lease = rm.acquire("ns", "img", LockMode::Exclusive, LONG).unwrap();

        let rm_clone = Arc::clone(&rm);
        let handle = thread::spawn(move || {
            rm_clone.acquire("ns", "img", LockMode::Exclusive, SHORT)
                .map(|_| ())
        });
        assert!(matches!(
            handle.join().unwrap(),
            Err(Error::ResourceTimeout { .. })
        ));

        drop(lease);
        let rm_clone = Arc::clone(&rm);
        let handle = thread::spawn(move || {
            rm_clone.acquire("ns", "img", LockMode::Exclusive, LONG).map(|_| ())
        });
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn waiting_writer_blocks_later_readers() {
        // reader R1 holds; writer W queues; reader R2 arrives later and
        // must wait behind W (fairness), so with a short timeout R2 fails.
        let rm = Arc::new(ResourceManager::new());
        let r1 = rm.acquire("ns", "img", LockMode::Shared, LONG).unwrap();

        let rm_w = Arc::clone(&rm);
        let writer = thread::spawn(move || {
            rm_w.acquire("ns", "img", LockMode::Exclusive, LONG).map(|_| ())
        });
        // Give the writer time to queue.
        thread::sleep(Duration::from_millis(20));

        let rm_r2 = Arc::clone(&rm);
        let r2 = thread::spawn(move || {
            rm_r2.acquire("ns", "img", LockMode::Shared, SHORT).map(|_| ())
        });
        assert!(matches!(
            r2.join().unwrap(),
            Err(Error::ResourceTimeout { .. })
        ));

        drop(r1);
        writer.join().unwrap().unwrap();
    }

    #[test]
    fn reentrant_acquire_by_same_thread() {
        let rm = ResourceManager::new();
        let a = rm.acquire("ns", "img", LockMode::Exclusive, LONG).unwrap();
        let b = rm.acquire("ns", "img", LockMode::Exclusive, LONG).unwrap();
        let c = rm.acquire("ns", "img", LockMode::Shared, LONG).unwrap();
        drop(b);
        drop(c);
        assert!(rm.is_held("ns", "img"));
        drop(a);
        assert!(!rm.is_held("ns", "img"));
    }

    #[test]
    fn shared_to_exclusive_upgrade_is_rejected() {
        let rm = ResourceManager::new();
        let _shared = rm.acquire("ns", "img", LockMode::Shared, LONG).unwrap();
        assert!(matches!(
            rm.acquire("ns", "img", LockMode::Exclusive, LONG),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn unrelated_resources_do_not_contend() {
        let rm = ResourceManager::new();
        let _a = rm.acquire("ns", "img-a", LockMode::Exclusive, LONG).unwrap();
        let _b = rm.acquire("ns", "img-b", LockMode::Exclusive, LONG).unwrap();
    }

    #[test]
    fn fifo_order_is_preserved() {
        let rm = Arc::new(ResourceManager::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let first = rm.acquire("ns", "img", LockMode::Exclusive, LONG).unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let rm_clone = Arc::clone(&rm);
            let order = Arc::clone(&order);
            let counter_clone = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                // Stagger arrivals so queue order is deterministic.
                while counter_clone.load(Ordering::SeqCst) != i {
                    thread::sleep(Duration::from_millis(1));
                }
                counter_clone.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                let lease = rm_clone.acquire("ns", "img", LockMode::Exclusive, LONG);
                order.lock().push(i);
                drop(lease);
            }));
            // Wait for this thread to have queued before spawning the next.
            while counter.load(Ordering::SeqCst) <= i {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(30));
        }

        drop(first);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn namespace_format() {
        let sd = Uuid::nil();
        assert_eq!(
            namespace(IMAGE_NAMESPACE, sd),
            "01_img_00000000-0000-0000-0000-000000000000"
        );
    }
}

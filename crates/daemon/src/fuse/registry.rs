//! Close-on-unmount registry of open resources
//!
//! Every stream a node opens on behalf of the kernel is registered here and
//! addressed by its FUSE file handle. The mount flag lives under the same lock
//! as the entries: a registration either lands before the unmount flag flips
//! (and is closed by the drain) or observes the flipped flag and is refused.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// A handle that must be released when the mount goes away.
pub trait Resource: Send + Sync {
    fn close(&self) -> std::io::Result<()>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("File system is not mounted")]
    NotMounted,
    #[error("File system is already mounted")]
    AlreadyMounted,
}

/// Outcome of draining the registry at unmount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub closed: usize,
    pub failed: usize,
}

struct RegistryState<R> {
    mounted: bool,
    next_handle: u64,
    entries: HashMap<u64, Arc<R>>,
}

/// Thread-safe table of open resources plus the mount flag.
pub struct ResourceRegistry<R> {
    state: Mutex<RegistryState<R>>,
}

impl<R: Resource> Default for ResourceRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> ResourceRegistry<R> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                mounted: false,
                next_handle: 1,
                entries: HashMap::new(),
            }),
        }
    }

    /// Flips the mount flag to `true`.
    pub fn mark_mounted(&self) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        if state.mounted {
            return Err(RegistryError::AlreadyMounted);
        }
        state.mounted = true;
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.state.lock().mounted
    }

    /// Flips the mount flag to `false`. Returns `true` only for the caller
    /// that performed the transition, so concurrent unmounts run once.
    pub fn begin_unmount(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.mounted, false)
    }

    /// Tracks `resource` and returns its file handle.
    ///
    /// Refused once unmount has begun; the resource is then closed right
    /// away so nothing opened after the drain outlives the mount.
    pub fn register(&self, resource: Arc<R>) -> Result<u64, RegistryError> {
        let mut state = self.state.lock();
        if !state.mounted {
            drop(state);
            if let Err(e) = resource.close() {
                warn!(error = %e, "failed to close resource refused after unmount");
            }
            return Err(RegistryError::NotMounted);
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.entries.insert(handle, resource);
        Ok(handle)
    }

    pub fn get(&self, handle: u64) -> Option<Arc<R>> {
        self.state.lock().entries.get(&handle).cloned()
    }

    /// Stops tracking `handle`; the caller becomes responsible for closing it.
    pub fn release(&self, handle: u64) -> Option<Arc<R>> {
        self.state.lock().entries.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every tracked resource. Failures are logged per resource and
    /// never stop the drain. Resources are closed after the lock is
    /// released, so a slow close never holds up other callers.
    pub fn drain_and_close_all(&self) -> DrainReport {
        let drained: Vec<(u64, Arc<R>)> = self.state.lock().entries.drain().collect();
        let mut report = DrainReport::default();

        for (handle, resource) in drained {
            match resource.close() {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(handle, error = %e, "failed to close resource on unmount");
                }
            }
        }

        debug!(closed = report.closed, failed = report.failed, "registry drained");
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct Counted {
        closes: AtomicUsize,
        fail: bool,
    }

    impl Resource for Counted {
        fn close(&self) -> std::io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "close failed"))
            } else {
                Ok(())
            }
        }
    }

    fn mounted_registry() -> ResourceRegistry<Counted> {
        let registry = ResourceRegistry::new();
        registry.mark_mounted().unwrap();
        registry
    }

    #[test]
    fn test_mount_flag_transitions() {
        let registry = ResourceRegistry::<Counted>::new();
        assert!(!registry.is_mounted());
        assert!(!registry.begin_unmount());

        registry.mark_mounted().unwrap();
        assert_eq!(registry.mark_mounted(), Err(RegistryError::AlreadyMounted));

        assert!(registry.begin_unmount());
        assert!(!registry.begin_unmount());
        assert!(!registry.is_mounted());
    }

    #[test]
    fn test_concurrent_registrations_each_closed_once() {
        const WORKERS: usize = 64;
        let registry = Arc::new(mounted_registry());

        let resources: Vec<Arc<Counted>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..WORKERS)
                .map(|_| {
                    let registry = registry.clone();
                    scope.spawn(move || {
                        let resource = Arc::new(Counted::default());
                        registry.register(resource.clone()).unwrap();
                        resource
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(registry.len(), WORKERS);
        assert!(registry.begin_unmount());
        let report = registry.drain_and_close_all();

        assert_eq!(report.closed, WORKERS);
        assert!(registry.is_empty());
        for resource in &resources {
            assert_eq!(resource.closes.load(Ordering::SeqCst), 1);
        }

        // a second drain has nothing left to close
        assert_eq!(registry.drain_and_close_all(), DrainReport::default());
        for resource in &resources {
            assert_eq!(resource.closes.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_racing_unmounts_close_each_resource_once() {
        let registry = Arc::new(mounted_registry());
        let resources: Vec<Arc<Counted>> = (0..32).map(|_| Arc::new(Counted::default())).collect();
        for resource in &resources {
            registry.register(resource.clone()).unwrap();
        }

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let winners: usize = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if registry.begin_unmount() {
                        registry.drain_and_close_all();
                        1
                    } else {
                        0
                    }
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .sum();

        assert_eq!(winners, 1);
        assert!(registry.is_empty());
        for resource in &resources {
            assert_eq!(resource.closes.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_drain_closes_outside_the_lock() {
        use std::sync::mpsc;

        struct Slow {
            started: mpsc::Sender<()>,
            release: parking_lot::Mutex<mpsc::Receiver<()>>,
        }

        impl Resource for Slow {
            fn close(&self) -> std::io::Result<()> {
                let _ = self.started.send(());
                let _ = self.release.lock().recv();
                Ok(())
            }
        }

        let (started_tx, started) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        let registry = Arc::new(ResourceRegistry::new());
        registry.mark_mounted().unwrap();
        registry
            .register(Arc::new(Slow {
                started: started_tx,
                release: parking_lot::Mutex::new(release_rx),
            }))
            .unwrap();

        let drain = {
            let registry = registry.clone();
            thread::spawn(move || registry.drain_and_close_all())
        };
        started.recv().unwrap();

        // the registry stays usable while the close is stuck
        let (answer_tx, answer) = mpsc::channel();
        {
            let registry = registry.clone();
            thread::spawn(move || {
                let _ = answer_tx.send(registry.len());
            });
        }
        assert_eq!(
            answer.recv_timeout(std::time::Duration::from_secs(1)).unwrap(),
            0
        );

        release.send(()).unwrap();
        assert_eq!(drain.join().unwrap().closed, 1);
    }

    #[test]
    fn test_handles_are_unique() {
        let registry = mounted_registry();
        let a = registry.register(Arc::new(Counted::default())).unwrap();
        let b = registry.register(Arc::new(Counted::default())).unwrap();
        assert_ne!(a, b);
        assert!(registry.get(a).is_some());
        assert!(registry.get(b).is_some());
    }

    #[test]
    fn test_late_registration_is_refused_and_closed() {
        let registry = mounted_registry();
        assert!(registry.begin_unmount());

        let resource = Arc::new(Counted::default());
        let result = registry.register(resource.clone());

        assert_eq!(result, Err(RegistryError::NotMounted));
        assert_eq!(resource.closes.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_released_handles_are_not_drained() {
        let registry = mounted_registry();
        let resource = Arc::new(Counted::default());
        let handle = registry.register(resource.clone()).unwrap();

        let released = registry.release(handle).unwrap();
        released.close().unwrap();

        registry.begin_unmount();
        assert_eq!(registry.drain_and_close_all().closed, 0);
        assert_eq!(resource.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drain_continues_past_failures() {
        let registry = mounted_registry();
        let failing = Arc::new(Counted {
            fail: true,
            ..Default::default()
        });
        let healthy: Vec<_> = (0..3).map(|_| Arc::new(Counted::default())).collect();

        registry.register(failing.clone()).unwrap();
        for resource in &healthy {
            registry.register(resource.clone()).unwrap();
        }

        registry.begin_unmount();
        let report = registry.drain_and_close_all();

        assert_eq!(report, DrainReport { closed: 3, failed: 1 });
        assert_eq!(failing.closes.load(Ordering::SeqCst), 1);
        for resource in &healthy {
            assert_eq!(resource.closes.load(Ordering::SeqCst), 1);
        }
    }
}

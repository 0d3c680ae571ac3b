//! Process-wide shutdown hook registry.
//!
//! Components register stop callbacks at setup time; a termination signal
//! fires them all, each on its own thread with a bounded grace period so one
//! stuck component cannot hang the exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use argus_types::topics;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::events::{EventDispatcher, EventKind};

type Hook = Box<dyn FnOnce() + Send>;

pub struct ShutdownHooks {
    hooks: Mutex<Vec<(String, Hook)>>,
    fired: AtomicBool,
}

impl Default for ShutdownHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHooks {
    pub fn new() -> Self {
        ShutdownHooks {
            hooks: Mutex::new(Vec::new()),
            fired: AtomicBool::new(false),
        }
    }

    /// Register a stop callback. Hooks run in registration order on
    /// shutdown.
    pub fn register<F>(&self, name: &str, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.fired.load(Ordering::SeqCst) {
            warn!("shutdown already fired; hook {name} ignored");
            return;
        }
        self.hooks.lock().push((name.to_string(), Box::new(hook)));
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Dispatch the shutdown event and run every hook. Returns true when all
    /// hooks finished within their grace window.
    pub fn fire(&self, events: &EventDispatcher, grace: Duration) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return true;
        }
        events.dispatch(topics::SHUTDOWN, EventKind::Shutdown, true);

        let hooks = std::mem::take(&mut *self.hooks.lock());
        let mut clean = true;
        for (name, hook) in hooks {
            info!("running shutdown hook {name}");
            let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
            let handle = std::thread::Builder::new()
                .name(format!("shutdown-{name}"))
                .spawn(move || {
                    hook();
                    let _ = done_tx.send(());
                });
            match handle {
                Ok(handle) => match done_rx.recv_timeout(grace) {
                    Ok(()) => {
                        let _ = handle.join();
                    }
                    Err(_) => {
                        warn!("shutdown hook {name} did not finish within {grace:?}");
                        clean = false;
                    }
                },
                Err(error) => {
                    warn!("could not spawn shutdown hook {name}: {error}");
                    clean = false;
                }
            }
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn hooks_run_in_order_and_only_once() {
        let hooks = ShutdownHooks::new();
        let events = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let log = log.clone();
            hooks.register(name, move || log.lock().push(name));
        }
        assert!(hooks.fire(&events, Duration::from_secs(1)));
        assert_eq!(log.lock().clone(), vec!["a", "b"]);

        // A second fire is a no-op.
        assert!(hooks.fire(&events, Duration::from_secs(1)));
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn stuck_hook_marks_shutdown_unclean() {
        let hooks = ShutdownHooks::new();
        let events = EventDispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));
        hooks.register("stuck", || std::thread::sleep(Duration::from_secs(60)));
        let r = ran.clone();
        hooks.register("fast", move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!hooks.fire(&events, Duration::from_millis(50)));
        // Later hooks still ran.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fire_dispatches_shutdown_event() {
        let hooks = ShutdownHooks::new();
        let events = EventDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        events.listen(topics::SHUTDOWN, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        hooks.fire(&events, Duration::from_secs(1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}

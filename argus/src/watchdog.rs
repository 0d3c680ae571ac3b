//! Poll-based supervision of long-running pipeline threads.
//!
//! Watched entries provide a poll closure (true = stuck) and a restart
//! closure. The camera reader registers its frame timeout here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(u64);

struct WatchEntry {
    name: String,
    poll: Box<dyn Fn() -> bool + Send + Sync>,
    restart: Box<dyn Fn() + Send + Sync>,
}

struct WatchdogInner {
    entries: Mutex<HashMap<u64, WatchEntry>>,
    next_id: AtomicU64,
    stop: crossbeam_channel::Sender<()>,
}

pub struct Watchdog {
    inner: Arc<WatchdogInner>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Cloneable registration handle, for components that need to unregister
/// their entry at teardown without holding the orchestrator.
#[derive(Clone)]
pub struct WatchdogHandle {
    inner: Arc<WatchdogInner>,
}

impl WatchdogHandle {
    pub fn register<P, R>(&self, name: &str, poll: P, restart: R) -> WatchToken
    where
        P: Fn() -> bool + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.lock().insert(
            id,
            WatchEntry {
                name: name.to_string(),
                poll: Box::new(poll),
                restart: Box::new(restart),
            },
        );
        WatchToken(id)
    }

    pub fn unregister(&self, token: WatchToken) {
        self.inner.entries.lock().remove(&token.0);
    }
}

impl Watchdog {
    pub fn spawn(interval: Duration) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let inner = Arc::new(WatchdogInner {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stop: stop_tx,
        });
        let thread_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                }
                let stuck: Vec<(String, u64)> = {
                    let entries = thread_inner.entries.lock();
                    entries
                        .iter()
                        .filter(|(_, e)| (e.poll)())
                        .map(|(id, e)| (e.name.clone(), *id))
                        .collect()
                };
                for (name, id) in stuck {
                    warn!("watchdog: {name} is stuck, restarting");
                    let restart_result = {
                        let entries = thread_inner.entries.lock();
                        entries.get(&id).map(|e| {
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                                (e.restart)()
                            }))
                        })
                    };
                    if let Some(Err(_)) = restart_result {
                        error!("watchdog: restart of {name} panicked");
                    }
                }
            })
            .expect("spawn watchdog");
        Watchdog {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn handle(&self) -> WatchdogHandle {
        WatchdogHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn register<P, R>(&self, name: &str, poll: P, restart: R) -> WatchToken
    where
        P: Fn() -> bool + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        self.handle().register(name, poll, restart)
    }

    pub fn unregister(&self, token: WatchToken) {
        self.handle().unregister(token)
    }

    pub fn shutdown(&self) {
        let _ = self.inner.stop.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

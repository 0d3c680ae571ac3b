//! Core orchestration for the argus NVR: the [`Argus`] value owns the data
//! bus, the typed event dispatcher, the shared frame store, the domain
//! registry and the shutdown hook table. Components receive an `Arc<Argus>`
//! at setup; there is no process-global mutable state.

use std::sync::Arc;
use std::time::Duration;

use databus::DataBus;
use frame_store::{FrameRemover, FrameStore};

pub mod domains;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod registry;
pub mod shutdown;
pub mod watchdog;

pub use argus_types as types;
pub use errors::{DomainError, SetupError};
pub use events::{Event, EventDispatcher, EventKind};
pub use registry::{DomainRef, DomainRegistry, DomainSetup, DomainState};

/// How long after publication a frame stays borrowable before the removal
/// scheduler frees it.
pub const FRAME_REMOVAL_DELAY: Duration = Duration::from_secs(2);

/// Seconds of grace each shutdown hook gets before being abandoned.
pub const SHUTDOWN_HOOK_GRACE: Duration = Duration::from_secs(5);

pub struct Argus {
    pub bus: DataBus,
    pub events: EventDispatcher,
    pub frames: Arc<FrameStore>,
    pub frame_remover: FrameRemover,
    pub registry: DomainRegistry,
    pub shutdown: shutdown::ShutdownHooks,
    pub watchdog: watchdog::Watchdog,
}

impl Argus {
    pub fn new() -> Arc<Self> {
        let events = EventDispatcher::new();
        let frames = Arc::new(FrameStore::new());
        Arc::new(Argus {
            bus: DataBus::new(),
            events: events.clone(),
            frames: frames.clone(),
            frame_remover: FrameRemover::spawn(frames),
            registry: DomainRegistry::new(events),
            shutdown: shutdown::ShutdownHooks::new(),
            watchdog: watchdog::Watchdog::spawn(Duration::from_secs(15)),
        })
    }

    /// Dispatch a typed event, recording it in the history ring and the
    /// last-event map.
    pub fn dispatch_event(&self, topic: &str, kind: EventKind) {
        self.events.dispatch(topic, kind, true);
    }

    /// Dispatch a typed event without recording it.
    pub fn dispatch_event_no_store(&self, topic: &str, kind: EventKind) {
        self.events.dispatch(topic, kind, false);
    }

    /// Tear down shared machinery. Called once, after domain teardown.
    pub fn stop_core(&self) -> bool {
        let clean = self.shutdown.fire(&self.events, SHUTDOWN_HOOK_GRACE);
        self.watchdog.shutdown();
        self.frame_remover.shutdown();
        self.bus.shutdown();
        clean
    }
}

//! Synchronous typed event dispatch.
//!
//! Unlike the data bus, events are delivered inline on the dispatching
//! thread: listeners are expected to be cheap (update a sensor, forward to a
//! queue). A bounded history ring and a last-event-per-topic map support
//! late-attaching consumers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use argus_types::{
    CameraId, DetectedObject, Domain, OperationState, ScannerKind, TriggerKind,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::error;

use crate::registry::DomainState;

/// Number of events kept in the history ring.
const EVENT_HISTORY_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub enum EventKind {
    DomainSetupStatus {
        component: String,
        domain: Domain,
        identifier: String,
        state: DomainState,
        error: Option<String>,
    },
    DomainRegistered {
        domain: Domain,
        identifier: String,
    },
    DomainUnregistered {
        domain: Domain,
        identifier: String,
    },
    OperationState {
        camera: CameraId,
        state: OperationState,
    },
    ScanFrames {
        camera: CameraId,
        scanner: ScannerKind,
        scan: bool,
    },
    MotionDetected {
        camera: CameraId,
        detected: bool,
        max_area: f32,
    },
    ObjectsInFov {
        camera: CameraId,
        objects: Vec<DetectedObject>,
    },
    CameraStarted {
        camera: CameraId,
    },
    CameraStopped {
        camera: CameraId,
    },
    CameraStatus {
        camera: CameraId,
        connected: bool,
    },
    RecorderStart {
        camera: CameraId,
        recording_id: i64,
        trigger: TriggerKind,
        start_time: DateTime<Utc>,
    },
    RecorderStop {
        camera: CameraId,
        recording_id: i64,
        end_time: DateTime<Utc>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

/// Token for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    /// `None` listens to every topic.
    topic: Option<String>,
    callback: Arc<dyn Fn(&Event) + Send + Sync>,
}

struct DispatcherInner {
    listeners: Mutex<HashMap<u64, ListenerEntry>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<Event>>,
    last_by_topic: Mutex<HashMap<String, Event>>,
}

#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        EventDispatcher {
            inner: Arc::new(DispatcherInner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                history: Mutex::new(VecDeque::with_capacity(EVENT_HISTORY_SIZE)),
                last_by_topic: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Invoke every listener registered for `topic` (and all wildcard
    /// listeners) inline. A panicking listener is logged and isolated.
    pub fn dispatch(&self, topic: &str, kind: EventKind, store: bool) {
        let event = Event {
            topic: topic.to_string(),
            kind,
            timestamp: Utc::now(),
        };

        let callbacks: Vec<Arc<dyn Fn(&Event) + Send + Sync>> = {
            let listeners = self.inner.listeners.lock();
            listeners
                .values()
                .filter(|entry| match &entry.topic {
                    Some(t) => t == topic,
                    None => true,
                })
                .map(|entry| entry.callback.clone())
                .collect()
        };

        for callback in callbacks {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&event)));
            if result.is_err() {
                error!("event listener panicked on topic {topic}");
            }
        }

        if store {
            let mut history = self.inner.history.lock();
            if history.len() == EVENT_HISTORY_SIZE {
                history.pop_front();
            }
            history.push_back(event.clone());
            self.inner
                .last_by_topic
                .lock()
                .insert(topic.to_string(), event);
        }
    }

    pub fn listen<F>(&self, topic: &str, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert(Some(topic.to_string()), Arc::new(callback))
    }

    /// Listen to every topic.
    pub fn listen_all<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(callback))
    }

    fn insert(
        &self,
        topic: Option<String>,
        callback: Arc<dyn Fn(&Event) + Send + Sync>,
    ) -> ListenerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .insert(id, ListenerEntry { topic, callback });
        ListenerId(id)
    }

    pub fn unlisten(&self, id: ListenerId) {
        self.inner.listeners.lock().remove(&id.0);
    }

    /// Most recent stored event for a topic.
    pub fn last_event(&self, topic: &str) -> Option<Event> {
        self.inner.last_by_topic.lock().get(topic).cloned()
    }

    /// Stored events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.inner.history.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn shutdown_event() -> EventKind {
        EventKind::Shutdown
    }

    #[test]
    fn listeners_run_inline_and_in_registration_scope() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        dispatcher.listen("shutdown", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch("shutdown", shutdown_event(), true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Different topic: not invoked.
        dispatcher.dispatch("other", shutdown_event(), true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_listener_sees_everything() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        dispatcher.listen_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch("a", shutdown_event(), false);
        dispatcher.dispatch("b", shutdown_event(), false);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unlisten_removes_listener() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = dispatcher.listen("t", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.unlisten(id);
        dispatcher.dispatch("t", shutdown_event(), false);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stored_events_update_history_and_last_map() {
        let dispatcher = EventDispatcher::new();
        dispatcher.dispatch("t", shutdown_event(), true);
        dispatcher.dispatch("t", shutdown_event(), true);
        dispatcher.dispatch("unstored", shutdown_event(), false);
        assert_eq!(dispatcher.history().len(), 2);
        assert!(dispatcher.last_event("t").is_some());
        assert!(dispatcher.last_event("unstored").is_none());
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        dispatcher.listen("t", |_| panic!("boom"));
        dispatcher.listen("t", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch("t", shutdown_event(), false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

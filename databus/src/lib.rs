//! Topic-based pub/sub used to pass frames and scanner results between the
//! camera readers, scanners and pipelines.
//!
//! Publishing pushes onto one bounded queue; a single dispatcher thread
//! delivers to exact-match and wildcard subscribers. All queues are lossy:
//! when full, the oldest pending item is dropped to make room, so a slow
//! consumer can never stall a producer.

use std::collections::HashMap;
use std::sync::Arc;

use argus_types::DataPayload;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Capacity of the main publish queue.
const DATA_QUEUE_SIZE: usize = 1000;

/// Token returned by subscribe, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

enum QueueItem {
    Data { topic: String, payload: DataPayload },
    Stop,
}

/// A bounded channel pair kept together so the sender side can drop the
/// oldest item when full.
#[derive(Clone)]
struct LossyChannel {
    tx: Sender<DataPayload>,
    rx: Receiver<DataPayload>,
}

impl LossyChannel {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        LossyChannel { tx, rx }
    }

    /// Push, discarding the oldest pending item if the queue is full.
    fn push(&self, payload: DataPayload) {
        let mut item = payload;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(crossbeam_channel::TrySendError::Full(rejected)) => {
                    // Drop the oldest entry; the overrun item is gone for good.
                    let _ = self.rx.try_recv();
                    item = rejected;
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Receiving half handed to queue subscribers.
pub struct BusReceiver {
    rx: Receiver<DataPayload>,
}

impl BusReceiver {
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<DataPayload, crossbeam_channel::RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<DataPayload, crossbeam_channel::TryRecvError> {
        self.rx.try_recv()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

type Callback = Box<dyn Fn(DataPayload) + Send + Sync>;

enum Delivery {
    Queue(LossyChannel),
    Callback(Callback),
}

#[derive(Default)]
struct SubscriberMap {
    exact: HashMap<String, HashMap<Uuid, Delivery>>,
    wildcard: HashMap<String, HashMap<Uuid, Delivery>>,
}

struct BusInner {
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
    subscribers: Mutex<SubscriberMap>,
    dispatcher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// The frame/result distribution bus. Cheap to clone; all clones share the
/// same queue and subscriber table.
#[derive(Clone)]
pub struct DataBus {
    inner: Arc<BusInner>,
}

impl Default for DataBus {
    fn default() -> Self {
        Self::new()
    }
}

impl DataBus {
    pub fn new() -> Self {
        let (tx, rx) = bounded(DATA_QUEUE_SIZE);
        let inner = Arc::new(BusInner {
            tx,
            rx,
            subscribers: Mutex::new(SubscriberMap::default()),
            dispatcher: Mutex::new(None),
        });
        let bus = DataBus { inner };
        let thread_bus = bus.clone();
        let handle = std::thread::Builder::new()
            .name("databus".into())
            .spawn(move || thread_bus.consume())
            .expect("spawn databus dispatcher");
        *bus.inner.dispatcher.lock() = Some(handle);
        bus
    }

    /// Publish a payload to a topic. Never blocks: if the main queue is full
    /// the oldest pending item is dropped.
    pub fn publish(&self, topic: &str, payload: DataPayload) {
        let mut item = QueueItem::Data {
            topic: topic.to_string(),
            payload,
        };
        loop {
            match self.inner.tx.try_send(item) {
                Ok(()) => return,
                Err(crossbeam_channel::TrySendError::Full(rejected)) => {
                    match self.inner.rx.try_recv() {
                        // Never drop a pending Stop.
                        Ok(QueueItem::Stop) => {
                            let _ = self.inner.tx.try_send(QueueItem::Stop);
                        }
                        _ => {}
                    }
                    item = rejected;
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Subscribe with a bounded queue of the given capacity. Delivery into a
    /// full queue drops that queue's oldest item.
    pub fn subscribe_queue(&self, topic: &str, capacity: usize) -> (SubscriptionId, BusReceiver) {
        let channel = LossyChannel::new(capacity);
        let receiver = BusReceiver {
            rx: channel.rx.clone(),
        };
        let id = self.insert(topic, Delivery::Queue(channel));
        (id, receiver)
    }

    /// Subscribe with a callback, invoked on the dispatcher thread. A
    /// panicking callback is logged and isolated from other subscribers.
    pub fn subscribe_callback<F>(&self, topic: &str, callback: F) -> SubscriptionId
    where
        F: Fn(DataPayload) + Send + Sync + 'static,
    {
        self.insert(topic, Delivery::Callback(Box::new(callback)))
    }

    fn insert(&self, topic: &str, delivery: Delivery) -> SubscriptionId {
        let id = Uuid::new_v4();
        debug!("subscribing to data topic {topic}");
        let mut subs = self.inner.subscribers.lock();
        let map = if topic.contains('*') {
            &mut subs.wildcard
        } else {
            &mut subs.exact
        };
        map.entry(topic.to_string()).or_default().insert(id, delivery);
        SubscriptionId(id)
    }

    /// Remove the subscription created under `id` for `topic`.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        debug!("unsubscribing from data topic {topic}");
        let mut subs = self.inner.subscribers.lock();
        let map = if topic.contains('*') {
            &mut subs.wildcard
        } else {
            &mut subs.exact
        };
        if map.get_mut(topic).and_then(|m| m.remove(&id.0)).is_none() {
            warn!("no subscription {id:?} on data topic {topic}");
        }
    }

    /// Stop the dispatcher thread and wait for it. Pending items ahead of the
    /// stop marker are still delivered.
    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(QueueItem::Stop);
        if let Some(handle) = self.inner.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }

    fn consume(&self) {
        loop {
            let item = match self.inner.rx.recv() {
                Ok(item) => item,
                Err(_) => return,
            };
            let (topic, payload) = match item {
                QueueItem::Data { topic, payload } => (topic, payload),
                QueueItem::Stop => return,
            };
            let subs = self.inner.subscribers.lock();
            if let Some(exact) = subs.exact.get(&topic) {
                deliver_all(exact, &topic, &payload);
            }
            for (pattern, subscribers) in subs.wildcard.iter() {
                if topic_matches(pattern, &topic) {
                    deliver_all(subscribers, &topic, &payload);
                }
            }
        }
    }
}

fn deliver_all(subscribers: &HashMap<Uuid, Delivery>, topic: &str, payload: &DataPayload) {
    for delivery in subscribers.values() {
        match delivery {
            Delivery::Queue(channel) => channel.push(payload.clone()),
            Delivery::Callback(callback) => {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(payload.clone())
                }));
                if result.is_err() {
                    error!("subscriber callback panicked on data topic {topic}");
                }
            }
        }
    }
}

/// Shell-style `*` matching on `/`-separated topic segments. A `*` segment
/// matches exactly one segment; segment counts must agree.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut topic_segments = topic.split('/');
    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(t)) => {
                if p != "*" && p != t {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::{CameraId, PixelFormat, SharedFrame};
    use std::time::Duration;

    fn frame(id: u64) -> DataPayload {
        DataPayload::Frame(SharedFrame {
            frame_id: id,
            camera: CameraId::new("cam_1"),
            pixel_format: PixelFormat::Nv12,
            color_plane_width: 4,
            color_plane_height: 6,
            resolution: (4, 4),
            capture_time: chrono::Utc::now(),
        })
    }

    fn frame_id(payload: &DataPayload) -> u64 {
        match payload {
            DataPayload::Frame(sf) => sf.frame_id,
            _ => panic!("expected frame payload"),
        }
    }

    #[test]
    fn topic_matching() {
        assert!(topic_matches("frame_bytes/cam_1", "frame_bytes/cam_1"));
        assert!(topic_matches("frame_bytes/*", "frame_bytes/cam_1"));
        assert!(topic_matches("scanner/*/motion/result", "scanner/cam_1/motion/result"));
        assert!(!topic_matches("frame_bytes/*", "processed_frame/cam_1"));
        assert!(!topic_matches("frame_bytes/*", "frame_bytes/cam_1/extra"));
    }

    #[test]
    fn exact_subscriber_receives_in_publish_order() {
        let bus = DataBus::new();
        let (_id, rx) = bus.subscribe_queue("frame_bytes/cam_1", 10);
        for i in 0..5 {
            bus.publish("frame_bytes/cam_1", frame(i));
        }
        for i in 0..5 {
            let payload = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(frame_id(&payload), i);
        }
        bus.shutdown();
    }

    #[test]
    fn wildcard_subscriber_sees_all_cameras() {
        let bus = DataBus::new();
        let (_id, rx) = bus.subscribe_queue("frame_bytes/*", 10);
        bus.publish("frame_bytes/cam_1", frame(1));
        bus.publish("frame_bytes/cam_2", frame(2));
        bus.publish("processed_frame/cam_1", frame(3));
        assert_eq!(frame_id(&rx.recv_timeout(Duration::from_secs(1)).unwrap()), 1);
        assert_eq!(frame_id(&rx.recv_timeout(Duration::from_secs(1)).unwrap()), 2);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        bus.shutdown();
    }

    #[test]
    fn full_subscriber_queue_drops_oldest() {
        let bus = DataBus::new();
        let (_id, rx) = bus.subscribe_queue("frame_bytes/cam_1", 2);
        for i in 0..5 {
            bus.publish("frame_bytes/cam_1", frame(i));
        }
        bus.shutdown(); // drains the main queue first
        // Only the two newest remain.
        assert_eq!(frame_id(&rx.try_recv().unwrap()), 3);
        assert_eq!(frame_id(&rx.try_recv().unwrap()), 4);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = DataBus::new();
        let (id, rx) = bus.subscribe_queue("frame_bytes/cam_1", 10);
        bus.publish("frame_bytes/cam_1", frame(1));
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        bus.unsubscribe("frame_bytes/cam_1", id);
        bus.publish("frame_bytes/cam_1", frame(2));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        bus.shutdown();
    }

    #[test]
    fn panicking_callback_does_not_break_other_subscribers() {
        let bus = DataBus::new();
        let _cb = bus.subscribe_callback("frame_bytes/cam_1", |_| panic!("boom"));
        let (_id, rx) = bus.subscribe_queue("frame_bytes/cam_1", 10);
        bus.publish("frame_bytes/cam_1", frame(7));
        assert_eq!(frame_id(&rx.recv_timeout(Duration::from_secs(1)).unwrap()), 7);
        bus.shutdown();
    }
}

//! Pool of decoded frames shared between the camera reader and its consumers.
//!
//! The camera reader inserts raw YUV bytes and gets back a [`SharedFrame`]
//! descriptor which travels over the bus. Consumers borrow the pixel data
//! through the pool; borrows are `Arc` guards, so dropping the guard is the
//! "close" operation and the buffer lives until both the pool entry and the
//! last guard are gone. A removal scheduler frees each frame a fixed delay
//! after the pipeline is done with it, giving slow consumers a grace window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use argus_types::{CameraId, PixelFormat, SharedFrame};
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

mod convert;

pub use convert::yuv420_to_rgb;

struct Slot {
    descriptor: SharedFrame,
    raw: Arc<Vec<u8>>,
    rgb: Option<Arc<Vec<u8>>>,
}

/// Keyed table of decoded frames. Frame ids increase monotonically for the
/// lifetime of the store.
pub struct FrameStore {
    slots: Mutex<HashMap<u64, Slot>>,
    next_id: AtomicU64,
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameStore {
    pub fn new() -> Self {
        FrameStore {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a decoded raw frame and return its descriptor. `bytes` must
    /// be exactly `pixel_format.frame_bytes_size(resolution)` long.
    pub fn insert(
        &self,
        camera: &CameraId,
        pixel_format: PixelFormat,
        resolution: (u32, u32),
        bytes: Vec<u8>,
    ) -> SharedFrame {
        debug_assert_eq!(
            bytes.len(),
            pixel_format.frame_bytes_size(resolution.0, resolution.1)
        );
        let frame_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (plane_w, plane_h) = pixel_format.color_plane_dims(resolution.0, resolution.1);
        let descriptor = SharedFrame {
            frame_id,
            camera: camera.clone(),
            pixel_format,
            color_plane_width: plane_w,
            color_plane_height: plane_h,
            resolution,
            capture_time: Utc::now(),
        };
        let slot = Slot {
            descriptor: descriptor.clone(),
            raw: Arc::new(bytes),
            rgb: None,
        };
        self.slots.lock().insert(frame_id, slot);
        descriptor
    }

    /// Borrow the raw color planes. Returns `None` once the frame has been
    /// removed.
    pub fn raw(&self, frame: &SharedFrame) -> Option<Arc<Vec<u8>>> {
        self.slots.lock().get(&frame.frame_id).map(|s| s.raw.clone())
    }

    /// Borrow the frame as packed RGB, converting and caching on first use.
    pub fn rgb(&self, frame: &SharedFrame) -> Option<Arc<Vec<u8>>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&frame.frame_id)?;
        if slot.rgb.is_none() {
            let rgb = convert::yuv420_to_rgb(
                &slot.raw,
                slot.descriptor.pixel_format,
                slot.descriptor.resolution,
            );
            slot.rgb = Some(Arc::new(rgb));
        }
        slot.rgb.clone()
    }

    /// Free the frame's buffers. Removing an already-removed frame is a
    /// no-op; outstanding borrows keep their data alive until dropped.
    pub fn remove(&self, frame: &SharedFrame) -> bool {
        self.slots.lock().remove(&frame.frame_id).is_some()
    }

    /// Drop every frame belonging to `camera`.
    pub fn remove_all_for(&self, camera: &CameraId) {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| &slot.descriptor.camera != camera);
        let dropped = before - slots.len();
        if dropped > 0 {
            debug!("removed {dropped} frames for camera {camera}");
        }
    }

    /// Number of live frames across all cameras.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

enum RemoverMsg {
    Remove { due: Instant, frame: SharedFrame },
    Stop,
}

/// Frees frames a fixed delay after they are scheduled. Removal order equals
/// scheduling order because the delay is constant, so a simple channel is
/// enough.
pub struct FrameRemover {
    tx: Sender<RemoverMsg>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Cloneable scheduling handle for producers that outlive borrows of the
/// remover itself.
#[derive(Clone)]
pub struct RemoverHandle {
    tx: Sender<RemoverMsg>,
}

impl RemoverHandle {
    /// Schedule `frame` for removal `delay` from now. Call exactly once per
    /// published frame.
    pub fn schedule(&self, frame: SharedFrame, delay: Duration) {
        let msg = RemoverMsg::Remove {
            due: Instant::now() + delay,
            frame,
        };
        if self.tx.send(msg).is_err() {
            warn!("frame remover is gone; frame leaked until store teardown");
        }
    }
}

impl FrameRemover {
    pub fn spawn(store: Arc<FrameStore>) -> Self {
        let (tx, rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("frame-remover".into())
            .spawn(move || Self::run(store, rx))
            .expect("spawn frame remover");
        FrameRemover {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn handle(&self) -> RemoverHandle {
        RemoverHandle {
            tx: self.tx.clone(),
        }
    }

    /// Schedule `frame` for removal `delay` from now. Call exactly once per
    /// published frame.
    pub fn schedule(&self, frame: SharedFrame, delay: Duration) {
        self.handle().schedule(frame, delay);
    }

    /// Stop the remover. Frames still queued are removed immediately.
    pub fn shutdown(&self) {
        let _ = self.tx.send(RemoverMsg::Stop);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(store: Arc<FrameStore>, rx: Receiver<RemoverMsg>) {
        let mut pending: std::collections::VecDeque<(Instant, SharedFrame)> =
            std::collections::VecDeque::new();
        loop {
            let wait = pending
                .front()
                .map(|(due, _)| due.saturating_duration_since(Instant::now()));
            let msg = match wait {
                Some(t) if t.is_zero() => None,
                Some(t) => match rx.recv_timeout(t) {
                    Ok(msg) => Some(msg),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        Some(RemoverMsg::Stop)
                    }
                },
                None => match rx.recv() {
                    Ok(msg) => Some(msg),
                    Err(_) => return,
                },
            };
            match msg {
                Some(RemoverMsg::Remove { due, frame }) => pending.push_back((due, frame)),
                Some(RemoverMsg::Stop) => {
                    // Flush the backlog without waiting out the delays.
                    for (_, frame) in pending.drain(..) {
                        store.remove(&frame);
                    }
                    while let Ok(RemoverMsg::Remove { frame, .. }) = rx.try_recv() {
                        store.remove(&frame);
                    }
                    return;
                }
                None => {
                    if let Some((_, frame)) = pending.pop_front() {
                        store.remove(&frame);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_frame() -> (Arc<FrameStore>, SharedFrame) {
        let store = Arc::new(FrameStore::new());
        let camera = CameraId::new("cam_1");
        let bytes = vec![0u8; PixelFormat::Yuv420p.frame_bytes_size(4, 4)];
        let frame = store.insert(&camera, PixelFormat::Yuv420p, (4, 4), bytes);
        (store, frame)
    }

    #[test]
    fn insert_borrow_remove() {
        let (store, frame) = store_with_frame();
        assert_eq!(store.len(), 1);
        let raw = store.raw(&frame).unwrap();
        assert_eq!(raw.len(), 24);
        assert!(store.remove(&frame));
        assert!(store.raw(&frame).is_none());
        // The outstanding borrow is still readable.
        assert_eq!(raw.len(), 24);
        // Second removal is a no-op.
        assert!(!store.remove(&frame));
    }

    #[test]
    fn rgb_is_cached() {
        let (store, frame) = store_with_frame();
        let first = store.rgb(&frame).unwrap();
        let second = store.rgb(&frame).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 4 * 4 * 3);
    }

    #[test]
    fn frame_ids_are_monotonic() {
        let store = FrameStore::new();
        let camera = CameraId::new("cam_1");
        let mut last = 0;
        for _ in 0..5 {
            let bytes = vec![0u8; PixelFormat::Nv12.frame_bytes_size(2, 2)];
            let frame = store.insert(&camera, PixelFormat::Nv12, (2, 2), bytes);
            assert!(frame.frame_id > last);
            last = frame.frame_id;
        }
    }

    #[test]
    fn remove_all_for_only_touches_that_camera() {
        let store = FrameStore::new();
        let bytes = || vec![0u8; PixelFormat::Nv12.frame_bytes_size(2, 2)];
        let a = store.insert(&CameraId::new("a"), PixelFormat::Nv12, (2, 2), bytes());
        let b = store.insert(&CameraId::new("b"), PixelFormat::Nv12, (2, 2), bytes());
        store.remove_all_for(&CameraId::new("a"));
        assert!(store.raw(&a).is_none());
        assert!(store.raw(&b).is_some());
    }

    #[test]
    fn remover_frees_after_delay() {
        let (store, frame) = store_with_frame();
        let remover = FrameRemover::spawn(store.clone());
        remover.schedule(frame.clone(), Duration::from_millis(50));
        assert!(store.raw(&frame).is_some());
        std::thread::sleep(Duration::from_millis(200));
        assert!(store.raw(&frame).is_none());
        remover.shutdown();
    }

    #[test]
    fn shutdown_flushes_backlog() {
        let (store, frame) = store_with_frame();
        let remover = FrameRemover::spawn(store.clone());
        remover.schedule(frame.clone(), Duration::from_secs(60));
        remover.shutdown();
        assert!(store.raw(&frame).is_none());
    }
}

//! Scan-rate calculation: marking every Nth camera frame for a scanner so
//! that N × scanner_fps approximates the camera's output rate.

use std::sync::atomic::{AtomicBool, Ordering};

use argus::events::{EventDispatcher, EventKind};
use argus_types::{topics, CameraId, DataPayload, ScannerKind, SharedFrame};
use databus::{BusReceiver, DataBus, SubscriptionId};
use parking_lot::Mutex;
use tracing::warn;

struct IntervalState {
    frame_number: u64,
    scan_interval: u64,
}

pub struct FrameIntervalCalculator {
    camera: CameraId,
    kind: ScannerKind,
    scan_fps: f32,
    scan: AtomicBool,
    scan_error: AtomicBool,
    state: Mutex<IntervalState>,
    topic_scan: String,
    topic_result: String,
    bus: DataBus,
    events: EventDispatcher,
    result_rx: BusReceiver,
    result_sub: SubscriptionId,
}

impl FrameIntervalCalculator {
    /// A scanner asking for more frames than the camera outputs is clamped
    /// to the camera rate, with a warning.
    pub fn new(
        bus: DataBus,
        events: EventDispatcher,
        camera: CameraId,
        kind: ScannerKind,
        output_fps: f32,
        mut scan_fps: f32,
    ) -> Self {
        if scan_fps > output_fps {
            warn!("FPS for {kind} is too high, highest possible FPS is {output_fps}");
            scan_fps = output_fps;
        }
        let topic_scan = topics::scanner_scan(&camera, kind);
        let topic_result = topics::scanner_result(&camera, kind);
        let (result_sub, result_rx) = bus.subscribe_queue(&topic_result, 1);
        let calculator = FrameIntervalCalculator {
            camera,
            kind,
            scan_fps,
            scan: AtomicBool::new(false),
            scan_error: AtomicBool::new(false),
            state: Mutex::new(IntervalState {
                frame_number: 0,
                scan_interval: 1,
            }),
            topic_scan,
            topic_result,
            bus,
            events,
            result_rx,
            result_sub,
        };
        calculator.calculate_scan_interval(output_fps);
        calculator
    }

    pub fn kind(&self) -> ScannerKind {
        self.kind
    }

    pub fn scan_fps(&self) -> f32 {
        self.scan_fps
    }

    pub fn calculate_scan_interval(&self, output_fps: f32) {
        let interval = (output_fps / self.scan_fps).round().max(1.0) as u64;
        self.state.lock().scan_interval = interval;
    }

    pub fn scan_interval(&self) -> u64 {
        self.state.lock().scan_interval
    }

    /// Mark the frame for scanning when due; publishes it on the scan topic
    /// and returns true. A disabled scanner keeps its counter at zero.
    pub fn check_scan_interval(&self, frame: &SharedFrame) -> bool {
        let mut state = self.state.lock();
        if !self.scan.load(Ordering::SeqCst) {
            state.frame_number = 0;
            return false;
        }
        if state.frame_number % state.scan_interval == 0 {
            state.frame_number = 1;
            drop(state);
            self.bus
                .publish(&self.topic_scan, DataPayload::Frame(frame.clone()));
            true
        } else {
            state.frame_number += 1;
            false
        }
    }

    pub fn scan(&self) -> bool {
        self.scan.load(Ordering::SeqCst)
    }

    /// Toggle scanning, notifying the scanner so it can clear state when
    /// turned off.
    pub fn set_scan(&self, value: bool) {
        self.scan.store(value, Ordering::SeqCst);
        self.events.dispatch(
            &topics::scan_frames(&self.camera, self.kind),
            EventKind::ScanFrames {
                camera: self.camera.clone(),
                scanner: self.kind,
                scan: value,
            },
            true,
        );
    }

    pub fn scan_error(&self) -> bool {
        self.scan_error.load(Ordering::SeqCst)
    }

    pub fn set_scan_error(&self, value: bool) {
        self.scan_error.store(value, Ordering::SeqCst);
    }

    /// Block for this scanner's next result.
    pub fn wait_result(
        &self,
        timeout: std::time::Duration,
    ) -> Result<DataPayload, crossbeam_channel::RecvTimeoutError> {
        self.result_rx.recv_timeout(timeout)
    }
}

impl Drop for FrameIntervalCalculator {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.topic_result, self.result_sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::PixelFormat;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn frame(camera: &CameraId) -> SharedFrame {
        SharedFrame {
            frame_id: 1,
            camera: camera.clone(),
            pixel_format: PixelFormat::Nv12,
            color_plane_width: 4,
            color_plane_height: 6,
            resolution: (4, 4),
            capture_time: chrono::Utc::now(),
        }
    }

    fn calculator(output_fps: f32, scan_fps: f32) -> (DataBus, FrameIntervalCalculator) {
        let bus = DataBus::new();
        let calculator = FrameIntervalCalculator::new(
            bus.clone(),
            EventDispatcher::new(),
            CameraId::new("cam_1"),
            ScannerKind::Motion,
            output_fps,
            scan_fps,
        );
        (bus, calculator)
    }

    #[test]
    fn interval_approximates_rate_ratio() {
        let (bus, calculator) = calculator(15.0, 5.0);
        assert_eq!(calculator.scan_interval(), 3);
        calculator.calculate_scan_interval(10.0);
        assert_eq!(calculator.scan_interval(), 2);
        bus.shutdown();
    }

    #[test]
    fn every_nth_frame_is_marked() {
        let (bus, calculator) = calculator(6.0, 2.0);
        calculator.set_scan(true);
        let camera = CameraId::new("cam_1");
        let marks: Vec<bool> = (0..9)
            .map(|_| calculator.check_scan_interval(&frame(&camera)))
            .collect();
        // Interval 3: marked on frames 0, 3, 6.
        assert_eq!(
            marks,
            vec![true, false, false, true, false, false, true, false, false]
        );
        bus.shutdown();
    }

    #[test]
    fn disabled_scanner_marks_nothing_and_resets() {
        let (bus, calculator) = calculator(6.0, 2.0);
        let camera = CameraId::new("cam_1");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_callback(&topics::scanner_scan(&camera, ScannerKind::Motion), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            assert!(!calculator.check_scan_interval(&frame(&camera)));
        }
        // Re-enabling starts fresh at frame zero.
        calculator.set_scan(true);
        assert!(calculator.check_scan_interval(&frame(&camera)));
        bus.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn excessive_scanner_fps_is_clamped() {
        let (bus, calculator) = calculator(5.0, 30.0);
        assert_eq!(calculator.scan_fps(), 5.0);
        assert_eq!(calculator.scan_interval(), 1);
        bus.shutdown();
    }

    #[test]
    fn scan_toggle_dispatches_event() {
        let bus = DataBus::new();
        let events = EventDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        events.listen_all(move |event| {
            if matches!(event.kind, EventKind::ScanFrames { scan: true, .. }) {
                s.fetch_add(1, Ordering::SeqCst);
            }
        });
        let calculator = FrameIntervalCalculator::new(
            bus.clone(),
            events,
            CameraId::new("cam_1"),
            ScannerKind::Object,
            5.0,
            1.0,
        );
        calculator.set_scan(true);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }
}

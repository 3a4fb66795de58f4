//! Live detection: capture frames, match every face against the gallery and
//! mark attendance for recognised identities.
//!
//! The loop runs on its own OS thread and reports through a bounded channel.
//! It stops when the shared [`StopFlag`] is raised, when the receiving side
//! of the channel goes away, or on the first failed capture.

use crate::attendance::{AttendanceError, AttendanceLog, MarkOutcome};
use crate::encoder::{EncoderError, FaceEncoder};
use crate::gallery::{GalleryError, GalleryStore};
use crate::types::{BoundingBox, DistanceMatcher, GalleryEntry, Identity, Matcher};
use chrono::NaiveDateTime;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

const MATCHED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Error type produced by frame sources.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// A running stream of frames.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<RgbImage, SourceError>;
}

/// A capture device that can start a frame stream borrowing it.
pub trait FrameDevice {
    type Stream<'a>: FrameSource
    where
        Self: 'a;

    fn start(&self) -> Result<Self::Stream<'_>, SourceError>;
}

#[derive(Error, Debug)]
pub enum LiveError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("frame capture failed after {frames} frames: {reason}")]
    CaptureFailed { frames: u64, reason: String },
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("attendance error: {0}")]
    Attendance(#[from] AttendanceError),
    #[error("failed to spawn detection thread: {0}")]
    Spawn(std::io::Error),
    #[error("detection thread panicked")]
    ThreadPanicked,
}

/// Cooperative cancellation flag, checked once per frame.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened to one face in one frame.
#[derive(Debug, Clone)]
pub struct FaceOutcome {
    pub face: BoundingBox,
    pub identity: Option<Identity>,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub enum DetectionEvent {
    /// A processed frame with recognised faces boxed in green, others in red.
    Frame {
        sequence: u64,
        annotated: RgbImage,
        faces: Vec<FaceOutcome>,
    },
    /// A new attendance row was written.
    Marked { identity: Identity, at: NaiveDateTime },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    /// The event receiver was dropped.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct DetectionReport {
    pub frames: u64,
    pub gallery_size: usize,
    pub marked: Vec<Identity>,
    pub stop: StopReason,
}

type Clock = Box<dyn FnMut() -> NaiveDateTime + Send>;

/// Everything the loop owns while it runs.
pub struct DetectionLoop<E> {
    encoder: E,
    gallery: GalleryStore,
    log: AttendanceLog,
    matcher: DistanceMatcher,
    clock: Clock,
}

impl<E: FaceEncoder> DetectionLoop<E> {
    pub fn new(encoder: E, gallery: GalleryStore, log: AttendanceLog) -> Self {
        Self {
            encoder,
            gallery,
            log,
            matcher: DistanceMatcher::default(),
            clock: Box::new(|| chrono::Local::now().naive_local()),
        }
    }

    /// Replace the wall clock used to timestamp attendance.
    pub fn with_clock(mut self, clock: impl FnMut() -> NaiveDateTime + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Load the gallery, open the device and process frames until stopped.
    ///
    /// The gallery is read once; faces registered while the loop runs are not
    /// seen until the next invocation. The device and its stream are dropped
    /// before this returns, whatever the outcome.
    pub fn run<D, F>(
        mut self,
        open_device: F,
        stop: &StopFlag,
        events: &mpsc::Sender<DetectionEvent>,
    ) -> Result<DetectionReport, LiveError>
    where
        D: FrameDevice,
        F: FnOnce() -> Result<D, SourceError>,
    {
        let gallery = self.gallery.load_all(&mut self.encoder)?;

        let device = open_device().map_err(|e| LiveError::CameraUnavailable(e.to_string()))?;
        let mut stream = device
            .start()
            .map_err(|e| LiveError::CameraUnavailable(e.to_string()))?;

        tracing::info!(gallery = gallery.len(), "live detection started");

        let mut report = DetectionReport {
            frames: 0,
            gallery_size: gallery.len(),
            marked: Vec::new(),
            stop: StopReason::Requested,
        };

        while !stop.is_requested() {
            let frame = stream.next_frame().map_err(|e| LiveError::CaptureFailed {
                frames: report.frames,
                reason: e.to_string(),
            })?;
            report.frames += 1;

            if !self.process_frame(frame, &gallery, events, &mut report)? {
                report.stop = StopReason::Disconnected;
                break;
            }
        }

        tracing::info!(
            frames = report.frames,
            marked = report.marked.len(),
            stop = ?report.stop,
            "live detection stopped"
        );
        Ok(report)
    }

    /// Returns `false` once the event receiver is gone.
    fn process_frame(
        &mut self,
        frame: RgbImage,
        gallery: &[GalleryEntry],
        events: &mpsc::Sender<DetectionEvent>,
        report: &mut DetectionReport,
    ) -> Result<bool, LiveError> {
        let faces = self.encoder.locate_faces(&frame)?;
        let embeddings = if faces.is_empty() {
            Vec::new()
        } else {
            self.encoder.encode_faces(&frame, &faces)?
        };

        let mut outcomes = Vec::with_capacity(faces.len());
        for (face, embedding) in faces.into_iter().zip(embeddings) {
            let result = self.matcher.best_match(&embedding, gallery);

            if let Some(identity) = &result.identity {
                let at = (self.clock)();
                if self.log.mark(identity, at)? == MarkOutcome::Marked {
                    report.marked.push(identity.clone());
                    let event = DetectionEvent::Marked { identity: identity.clone(), at };
                    if events.blocking_send(event).is_err() {
                        return Ok(false);
                    }
                }
            }

            outcomes.push(FaceOutcome {
                face,
                identity: result.identity,
                distance: result.distance,
            });
        }

        let event = DetectionEvent::Frame {
            sequence: report.frames,
            annotated: annotate(frame, &outcomes),
            faces: outcomes,
        };
        Ok(events.blocking_send(event).is_ok())
    }
}

/// Draw a 2px box around every face.
fn annotate(mut frame: RgbImage, outcomes: &[FaceOutcome]) -> RgbImage {
    let (width, height) = frame.dimensions();
    for outcome in outcomes {
        let Some((x, y, w, h)) = outcome.face.clamped_rect(width, height) else {
            continue;
        };
        let color = if outcome.identity.is_some() { MATCHED_COLOR } else { UNKNOWN_COLOR };
        draw_hollow_rect_mut(&mut frame, Rect::at(x as i32, y as i32).of_size(w, h), color);
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(
                &mut frame,
                Rect::at(x as i32 + 1, y as i32 + 1).of_size(w - 2, h - 2),
                color,
            );
        }
    }
    frame
}

/// Handle to a detection loop running on its own thread.
pub struct DetectionHandle {
    stop: StopFlag,
    thread: std::thread::JoinHandle<Result<DetectionReport, LiveError>>,
}

impl DetectionHandle {
    /// Ask the loop to stop after the frame in progress.
    pub fn stop(&self) {
        self.stop.request();
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the loop thread and return its outcome.
    pub fn join(self) -> Result<DetectionReport, LiveError> {
        self.thread.join().map_err(|_| LiveError::ThreadPanicked)?
    }
}

/// Spawn `detection` on a dedicated thread.
///
/// `open_device` runs on that thread, so the device never has to be `Send`.
/// At most `capacity` events are buffered; the loop blocks when the
/// receiver falls behind.
pub fn spawn_detection<E, D, F>(
    detection: DetectionLoop<E>,
    open_device: F,
    capacity: usize,
) -> Result<(DetectionHandle, mpsc::Receiver<DetectionEvent>), LiveError>
where
    E: FaceEncoder + Send + 'static,
    D: FrameDevice + 'static,
    F: FnOnce() -> Result<D, SourceError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stop = StopFlag::default();
    let thread_stop = stop.clone();

    let thread = std::thread::Builder::new()
        .name("rollcall-detect".into())
        .spawn(move || detection.run(open_device, &thread_stop, &tx))
        .map_err(LiveError::Spawn)?;

    Ok((DetectionHandle { stop, thread }, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{faces_image, TileEncoder, BLUE, GREEN, RED};
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    type FrameHook = Box<dyn FnMut(usize) + Send>;

    /// Replays a fixed list of frames, then fails like an unplugged camera.
    struct ScriptedDevice {
        frames: Mutex<VecDeque<RgbImage>>,
        released: Arc<AtomicBool>,
        hook: Mutex<Option<FrameHook>>,
    }

    impl ScriptedDevice {
        fn new(frames: Vec<RgbImage>, released: Arc<AtomicBool>) -> Self {
            Self {
                frames: Mutex::new(frames.into()),
                released,
                hook: Mutex::new(None),
            }
        }

        fn with_hook(self, hook: impl FnMut(usize) + Send + 'static) -> Self {
            *self.hook.lock().unwrap() = Some(Box::new(hook));
            self
        }
    }

    impl Drop for ScriptedDevice {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedStream<'a> {
        device: &'a ScriptedDevice,
        served: usize,
    }

    impl FrameSource for ScriptedStream<'_> {
        fn next_frame(&mut self) -> Result<RgbImage, SourceError> {
            let frame = self.device.frames.lock().unwrap().pop_front();
            match frame {
                Some(f) => {
                    self.served += 1;
                    if let Some(hook) = self.device.hook.lock().unwrap().as_mut() {
                        hook(self.served);
                    }
                    Ok(f)
                }
                None => Err("device disconnected".into()),
            }
        }
    }

    impl FrameDevice for ScriptedDevice {
        type Stream<'a> = ScriptedStream<'a>;

        fn start(&self) -> Result<ScriptedStream<'_>, SourceError> {
            Ok(ScriptedStream { device: self, served: 0 })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        gallery_dir: PathBuf,
        log_path: PathBuf,
    }

    impl Fixture {
        fn with_faces(faces: &[(&str, Rgb<u8>)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let gallery_dir = dir.path().join("faces");
            let store = GalleryStore::open(&gallery_dir).unwrap();
            let mut enc = TileEncoder::default();
            for (name, color) in faces {
                store
                    .register(&Identity::new(name).unwrap(), &faces_image(&[*color]), &mut enc)
                    .unwrap();
            }
            let log_path = dir.path().join("attendance.csv");
            Self { _dir: dir, gallery_dir, log_path }
        }

        fn detection(&self) -> DetectionLoop<TileEncoder> {
            DetectionLoop::new(
                TileEncoder::default(),
                GalleryStore::open(&self.gallery_dir).unwrap(),
                AttendanceLog::open(&self.log_path).unwrap(),
            )
            .with_clock(|| day(1, 9))
        }

        fn log(&self) -> AttendanceLog {
            AttendanceLog::open(&self.log_path).unwrap()
        }
    }

    fn day(d: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<DetectionEvent>) -> Vec<DetectionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    /// Device that raises `stop` after serving `after` frames.
    fn stopping_device(frames: Vec<RgbImage>, stop: &StopFlag, after: usize) -> ScriptedDevice {
        let stop = stop.clone();
        ScriptedDevice::new(frames, Arc::default()).with_hook(move |served| {
            if served >= after {
                stop.request();
            }
        })
    }

    #[test]
    fn test_marks_recognised_face_once_per_day() {
        let fx = Fixture::with_faces(&[("alice", RED)]);
        let stop = StopFlag::default();
        let (tx, mut rx) = mpsc::channel(16);

        let frames = vec![faces_image(&[RED]), faces_image(&[RED])];
        let device = stopping_device(frames, &stop, 2);
        let report = fx.detection().run(move || Ok(device), &stop, &tx).unwrap();

        assert_eq!(report.frames, 2);
        assert_eq!(report.gallery_size, 1);
        assert_eq!(report.stop, StopReason::Requested);
        assert_eq!(report.marked, vec![Identity::new("alice").unwrap()]);
        assert_eq!(fx.log().len(), 1);

        let events = drain(&mut rx);
        let marks = events.iter().filter(|e| matches!(e, DetectionEvent::Marked { .. })).count();
        let frames = events.iter().filter(|e| matches!(e, DetectionEvent::Frame { .. })).count();
        assert_eq!((marks, frames), (1, 2));
    }

    #[test]
    fn test_new_day_marks_again() {
        let fx = Fixture::with_faces(&[("alice", RED)]);
        let stop = StopFlag::default();
        let (tx, _rx) = mpsc::channel(16);

        let mut times = vec![day(1, 9), day(1, 17), day(2, 9)].into_iter();
        let detection = fx.detection().with_clock(move || times.next().unwrap_or(day(3, 9)));

        let frames = vec![faces_image(&[RED]); 3];
        let device = stopping_device(frames, &stop, 3);
        let report = detection.run(move || Ok(device), &stop, &tx).unwrap();

        assert_eq!(report.marked.len(), 2);
        let log = fx.log();
        assert_eq!(log.len(), 2);
        assert_eq!(log.records()[1].timestamp, day(2, 9));
    }

    #[test]
    fn test_every_face_in_frame_is_matched() {
        let fx = Fixture::with_faces(&[("alice", RED), ("bob", GREEN)]);
        let stop = StopFlag::default();
        let (tx, mut rx) = mpsc::channel(16);

        let device = stopping_device(vec![faces_image(&[RED, BLUE, GREEN])], &stop, 1);
        let report = fx.detection().run(move || Ok(device), &stop, &tx).unwrap();

        assert_eq!(report.marked.len(), 2);
        let faces = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                DetectionEvent::Frame { faces, .. } => Some(faces),
                _ => None,
            })
            .unwrap();
        let names: Vec<Option<String>> = faces
            .iter()
            .map(|f| f.identity.as_ref().map(|i| i.to_string()))
            .collect();
        assert_eq!(names, vec![Some("alice".into()), None, Some("bob".into())]);
    }

    #[test]
    fn test_annotated_frame_boxes_faces() {
        let fx = Fixture::with_faces(&[("alice", RED)]);
        let stop = StopFlag::default();
        let (tx, mut rx) = mpsc::channel(16);

        let device = stopping_device(vec![faces_image(&[RED, BLUE])], &stop, 1);
        fx.detection().run(move || Ok(device), &stop, &tx).unwrap();

        let annotated = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                DetectionEvent::Frame { annotated, .. } => Some(annotated),
                _ => None,
            })
            .unwrap();
        assert_eq!(*annotated.get_pixel(0, 0), MATCHED_COLOR);
        assert_eq!(*annotated.get_pixel(16, 0), UNKNOWN_COLOR);
    }

    #[test]
    fn test_unknown_face_is_not_marked() {
        let fx = Fixture::with_faces(&[("alice", RED)]);
        let stop = StopFlag::default();
        let (tx, _rx) = mpsc::channel(16);

        let device = stopping_device(vec![faces_image(&[BLUE])], &stop, 1);
        let report = fx.detection().run(move || Ok(device), &stop, &tx).unwrap();

        assert!(report.marked.is_empty());
        assert!(fx.log().is_empty());
    }

    #[test]
    fn test_empty_gallery_marks_nothing() {
        let fx = Fixture::with_faces(&[]);
        let stop = StopFlag::default();
        let (tx, _rx) = mpsc::channel(16);

        let device = stopping_device(vec![faces_image(&[RED])], &stop, 1);
        let report = fx.detection().run(move || Ok(device), &stop, &tx).unwrap();

        assert_eq!(report.gallery_size, 0);
        assert!(report.marked.is_empty());
    }

    #[test]
    fn test_capture_failure_aborts_and_releases_camera() {
        let fx = Fixture::with_faces(&[("alice", RED)]);
        let stop = StopFlag::default();
        let (tx, _rx) = mpsc::channel(16);
        let released = Arc::new(AtomicBool::new(false));

        let device = ScriptedDevice::new(vec![faces_image(&[RED])], released.clone());
        let err = fx.detection().run(move || Ok(device), &stop, &tx).unwrap_err();

        assert!(matches!(err, LiveError::CaptureFailed { frames: 1, .. }));
        assert!(released.load(Ordering::SeqCst));
        // the mark made before the failure is kept
        assert_eq!(fx.log().len(), 1);
    }

    #[test]
    fn test_camera_unavailable() {
        let fx = Fixture::with_faces(&[("alice", RED)]);
        let stop = StopFlag::default();
        let (tx, _rx) = mpsc::channel(16);

        let err = fx
            .detection()
            .run(|| Err::<ScriptedDevice, _>("no such device".into()), &stop, &tx)
            .unwrap_err();
        assert!(matches!(err, LiveError::CameraUnavailable(ref m) if m.contains("no such device")));
    }

    #[test]
    fn test_stop_before_first_frame() {
        let fx = Fixture::with_faces(&[("alice", RED)]);
        let stop = StopFlag::default();
        stop.request();
        let (tx, _rx) = mpsc::channel(16);
        let released = Arc::new(AtomicBool::new(false));

        let device = ScriptedDevice::new(vec![faces_image(&[RED])], released.clone());
        let report = fx.detection().run(move || Ok(device), &stop, &tx).unwrap();

        assert_eq!(report.frames, 0);
        assert!(released.load(Ordering::SeqCst));
        assert!(fx.log().is_empty());
    }

    #[test]
    fn test_dropped_receiver_stops_loop() {
        let fx = Fixture::with_faces(&[]);
        let stop = StopFlag::default();
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let device = ScriptedDevice::new(vec![faces_image(&[RED]); 5], Arc::default());
        let report = fx.detection().run(move || Ok(device), &stop, &tx).unwrap();

        assert_eq!(report.stop, StopReason::Disconnected);
        assert_eq!(report.frames, 1);
    }

    #[test]
    fn test_gallery_not_refreshed_mid_loop() {
        let fx = Fixture::with_faces(&[("alice", RED)]);
        let stop = StopFlag::default();
        let (tx, _rx) = mpsc::channel(16);

        // bob is enrolled after the first frame; his face in frame 2 stays unknown
        let gallery_dir = fx.gallery_dir.clone();
        let hook_stop = stop.clone();
        let device = ScriptedDevice::new(vec![faces_image(&[RED]), faces_image(&[GREEN])], Arc::default())
            .with_hook(move |served| {
                if served == 1 {
                    let store = GalleryStore::open(&gallery_dir).unwrap();
                    store
                        .register(&Identity::new("bob").unwrap(), &faces_image(&[GREEN]), &mut TileEncoder::default())
                        .unwrap();
                } else {
                    hook_stop.request();
                }
            });
        let report = fx.detection().run(move || Ok(device), &stop, &tx).unwrap();

        assert_eq!(report.frames, 2);
        assert_eq!(report.marked, vec![Identity::new("alice").unwrap()]);
    }

    #[test]
    fn test_spawned_loop_streams_events_and_joins() {
        let fx = Fixture::with_faces(&[("alice", RED)]);
        let released = Arc::new(AtomicBool::new(false));
        let device_released = released.clone();

        let (handle, mut rx) = spawn_detection(
            fx.detection(),
            move || Ok(ScriptedDevice::new(vec![faces_image(&[RED]); 50], device_released)),
            1,
        )
        .unwrap();

        let first = rx.blocking_recv().unwrap();
        assert!(matches!(first, DetectionEvent::Marked { ref identity, .. } if identity.as_str() == "alice"));

        handle.stop();
        // keep draining so the bounded channel never blocks the loop
        while rx.blocking_recv().is_some() {}

        let report = handle.join().unwrap();
        assert_eq!(report.stop, StopReason::Requested);
        assert_eq!(report.marked.len(), 1);
        assert!(released.load(Ordering::SeqCst));
    }
}

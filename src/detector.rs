//! The pose detection adapter.
//!
//! [`PoseDetector`] owns an [`Engine`] and bridges its callback-driven
//! result delivery into a blocking request/response call. The bridge is a
//! single-slot mailbox: one outstanding sender at a time, cleared exactly
//! once by whichever of {result callback, timeout, dispose} happens first.
//! A callback that fires while the slot is empty (a late response to a
//! request that already timed out) is dropped on the floor instead of being
//! wired into a later request.
//!
//! Because [`PoseDetector::detect`] takes `&mut self` and blocks, two
//! overlapping detections on one adapter are unrepresentable in safe Rust;
//! this is the compile-time form of the "at most one outstanding request"
//! policy.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{Engine, EngineConfig, EngineResult};
use crate::image::Resolution;
use crate::pose::{Point, Pose};
use crate::timer::Timer;
use crate::video::VideoSource;

/// How long to wait for the engine's callback before giving up on a frame.
pub const DETECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay before the single retry of a failed engine load.
const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Fatal errors of the detection adapter.
///
/// Transient per-frame problems (engine hiccup, unready media, timeout) are
/// *not* errors; they degrade to an empty pose list so that batch walks and
/// live loops survive them.
#[derive(Debug, Error)]
pub enum DetectError {
    /// Engine initialization failed even after the retry. No detection is
    /// possible until a fresh adapter is constructed.
    #[error("engine initialization failed")]
    Init(#[source] anyhow::Error),

    /// The adapter was used after [`PoseDetector::dispose`].
    #[error("detector has been disposed")]
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Ready,
    Disposed,
}

/// The single-slot callback-to-result mailbox.
///
/// Shared between the adapter and the engine's persistent result callback.
/// Invariant: set on request, cleared exactly once, never overwritten while
/// occupied.
#[derive(Default)]
struct Mailbox {
    slot: Mutex<Option<SyncSender<EngineResult>>>,
}

impl Mailbox {
    /// Occupies the slot. Returns `false` if a request is already pending.
    fn arm(&self, sender: SyncSender<EngineResult>) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(sender);
        true
    }

    /// Clears the slot without delivering anything.
    fn disarm(&self) {
        self.slot.lock().unwrap().take();
    }

    /// Delivers a result to the pending request, if there is one.
    fn deliver(&self, result: EngineResult) {
        match self.slot.lock().unwrap().take() {
            // The receiver may already have given up; that's fine.
            Some(sender) => {
                sender.try_send(result).ok();
            }
            None => log::debug!("engine result arrived with no pending request, dropping"),
        }
    }
}

/// Owns an inference [`Engine`] and turns it into a per-frame
/// request/response detector.
///
/// Lifecycle: `Uninitialized → Ready → Disposed`. [`detect`][Self::detect]
/// auto-initializes; [`dispose`][Self::dispose] is terminal.
pub struct PoseDetector {
    engine: Box<dyn Engine>,
    config: EngineConfig,
    state: State,
    mailbox: Arc<Mailbox>,
    timeout: Duration,
    t_submit: Timer,
    t_convert: Timer,
}

impl PoseDetector {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        Self::with_config(engine, EngineConfig::default())
    }

    pub fn with_config<E: Engine + 'static>(engine: E, config: EngineConfig) -> Self {
        Self {
            engine: Box::new(engine),
            config,
            state: State::Uninitialized,
            mailbox: Arc::new(Mailbox::default()),
            timeout: DETECT_TIMEOUT,
            t_submit: Timer::new("submit"),
            t_convert: Timer::new("convert"),
        }
    }

    /// Overrides the per-frame detection timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Returns profiling timers for frame submission and result conversion.
    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.t_submit, &self.t_convert].into_iter()
    }

    /// Configures and loads the engine.
    ///
    /// Idempotent: if the adapter is already ready this returns immediately.
    /// A transient load failure is retried exactly once after a short delay;
    /// a second failure is fatal. On success, the engine's persistent result
    /// callback is installed, once, for the adapter's entire lifetime.
    pub fn initialize(&mut self) -> Result<(), DetectError> {
        match self.state {
            State::Ready => return Ok(()),
            State::Disposed => return Err(DetectError::Disposed),
            State::Uninitialized => {}
        }

        self.engine.configure(&self.config);
        if let Err(first) = self.engine.load() {
            log::warn!("engine load failed ({first}), retrying once");
            thread::sleep(INIT_RETRY_DELAY);
            if let Err(second) = self.engine.load() {
                return Err(DetectError::Init(second));
            }
        }

        let mailbox = self.mailbox.clone();
        self.engine
            .set_result_callback(Box::new(move |result| mailbox.deliver(result)));
        self.state = State::Ready;
        log::debug!("engine initialized");
        Ok(())
    }

    /// Detects poses in the video's current frame.
    ///
    /// Blocks until the engine reports a result or the timeout elapses.
    /// Returns the detected poses with coordinates converted to the video's
    /// intrinsic pixel space; an empty list means "no detection" and covers
    /// every transient failure (engine timeout, unready media, rejected
    /// frame). Read-only with respect to the video's play position.
    ///
    /// # Errors
    ///
    /// Fails with [`DetectError::Init`] if the adapter was uninitialized and
    /// auto-initialization failed, and with [`DetectError::Disposed`] after
    /// [`dispose`][Self::dispose].
    pub fn detect(&mut self, video: &mut dyn VideoSource) -> Result<Vec<Pose>, DetectError> {
        match self.state {
            State::Disposed => return Err(DetectError::Disposed),
            State::Uninitialized => self.initialize()?,
            State::Ready => {}
        }

        if !video.has_decoded_data() {
            if let Err(e) = video.wait_for_data() {
                log::warn!("frame source has no decoded data: {e}");
                return Ok(Vec::new());
            }
        }

        let frame = match video.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("failed to capture frame: {e}");
                return Ok(Vec::new());
            }
        };

        let (sender, receiver) = mpsc::sync_channel(1);
        if !self.mailbox.arm(sender) {
            // Cannot happen through this (&mut) API, but the mailbox policy
            // is refuse-not-overwrite either way.
            log::warn!("a detection is already outstanding, refusing");
            return Ok(Vec::new());
        }

        if let Err(e) = self.t_submit.time(|| self.engine.submit(&frame)) {
            self.mailbox.disarm();
            log::warn!("engine rejected frame: {e}");
            return Ok(Vec::new());
        }

        let result = match receiver.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // Clear the slot so a late callback can't leak into a future
                // request.
                self.mailbox.disarm();
                log::debug!("no engine result within {:?}", self.timeout);
                return Ok(Vec::new());
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.mailbox.disarm();
                return Ok(Vec::new());
            }
        };

        let resolution = video.resolution();
        Ok(self.t_convert.time(|| convert_poses(result, resolution)))
    }

    /// Releases the engine and clears any pending request state.
    ///
    /// Idempotent. The adapter cannot be resurrected: all further calls fail
    /// with [`DetectError::Disposed`].
    pub fn dispose(&mut self) {
        if self.state == State::Disposed {
            return;
        }
        self.mailbox.disarm();
        if self.state == State::Ready {
            self.engine.close();
        }
        self.state = State::Disposed;
    }
}

impl Drop for PoseDetector {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Converts engine results from normalized model space to the frame source's
/// intrinsic pixel space.
///
/// Engines occasionally report coordinates slightly outside `[0, 1]`;
/// converted points are clamped to the intrinsic bounds.
fn convert_poses(result: EngineResult, resolution: Resolution) -> Vec<Pose> {
    let width = resolution.width() as f32;
    let height = resolution.height() as f32;

    result
        .poses
        .into_iter()
        .enumerate()
        .map(|(id, raw)| {
            let mut pose = Pose::new(id as u32);
            let mut visibility_sum = 0.0;
            let mut joints = 0;
            for (joint, lm) in raw.iter() {
                let point = Point::new((lm.x * width).clamp(0.0, width), (lm.y * height).clamp(0.0, height))
                    .with_z(lm.z);
                pose.set(joint, point);
                visibility_sum += lm.visibility;
                joints += 1;
            }
            if joints != 0 {
                pose.set_confidence(visibility_sum / joints as f32);
            }
            pose
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RawLandmark, RawPose};
    use crate::pose::Joint;
    use crate::test::{FakeEngine, FakeVideo, Response};

    use approx::assert_relative_eq;

    fn short_timeout(detector: &mut PoseDetector) {
        detector.set_timeout(Duration::from_millis(50));
    }

    #[test]
    fn initialize_is_idempotent() {
        let engine = FakeEngine::new();
        let script = engine.script();
        let mut detector = PoseDetector::new(engine);

        detector.initialize().unwrap();
        detector.initialize().unwrap();

        assert_eq!(script.load_calls(), 1);
        assert_eq!(script.callbacks_installed(), 1);
        // Configuration is applied before the load.
        assert!(script.config().is_some());
    }

    #[test]
    fn detect_waits_for_decoded_data() {
        let engine = FakeEngine::new();
        let script = engine.script();
        let mut detector = PoseDetector::new(engine);
        let mut video = FakeVideo::new(Resolution::new(640, 480), 10.0);
        video.set_ready(false);

        detector.detect(&mut video).unwrap();
        assert_eq!(script.submit_calls(), 1);
    }

    #[test]
    fn load_is_retried_once() {
        let engine = FakeEngine::new();
        let script = engine.script();
        script.fail_loads(1);
        let mut detector = PoseDetector::new(engine);

        detector.initialize().unwrap();
        assert_eq!(script.load_calls(), 2);
    }

    #[test]
    fn second_load_failure_is_fatal() {
        let engine = FakeEngine::new();
        let script = engine.script();
        script.fail_loads(2);
        let mut detector = PoseDetector::new(engine);

        assert!(matches!(detector.initialize(), Err(DetectError::Init(_))));
        assert_eq!(script.load_calls(), 2);
    }

    #[test]
    fn converts_to_intrinsic_pixels() {
        let engine = FakeEngine::new();
        let script = engine.script();
        let mut raw = RawPose::default();
        raw.set(
            Joint::Nose,
            RawLandmark {
                x: 0.5,
                y: 0.25,
                z: -0.1,
                visibility: 0.8,
            },
        );
        raw.set(
            Joint::LeftShoulder,
            RawLandmark {
                x: 0.1,
                y: 0.9,
                z: 0.0,
                visibility: 0.4,
            },
        );
        script.push_response(Response::poses(vec![raw]));

        let mut detector = PoseDetector::new(engine);
        let mut video = FakeVideo::new(Resolution::new(1280, 720), 10.0);

        let poses = detector.detect(&mut video).unwrap();
        assert_eq!(poses.len(), 1);
        let pose = &poses[0];
        let nose = pose.get(Joint::Nose).unwrap();
        assert_relative_eq!(nose.x, 640.0);
        assert_relative_eq!(nose.y, 180.0);
        assert_eq!(nose.z, Some(-0.1));
        assert!(pose.get(Joint::RightShoulder).is_none());
        assert_relative_eq!(pose.confidence(), 0.6);
    }

    #[test]
    fn out_of_range_landmarks_are_clamped() {
        let engine = FakeEngine::new();
        let script = engine.script();

        let mut raw = RawPose::default();
        for joint in Joint::ALL {
            raw.set(
                joint,
                RawLandmark {
                    x: fastrand::f32() * 3.0 - 1.0,
                    y: fastrand::f32() * 3.0 - 1.0,
                    z: 0.0,
                    visibility: 1.0,
                },
            );
        }
        script.push_response(Response::poses(vec![raw]));

        let mut detector = PoseDetector::new(engine);
        let mut video = FakeVideo::new(Resolution::new(640, 480), 10.0);

        let poses = detector.detect(&mut video).unwrap();
        for (_, point) in poses[0].joints() {
            assert!((0.0..=640.0).contains(&point.x));
            assert!((0.0..=480.0).contains(&point.y));
        }
    }

    #[test]
    fn detect_times_out_to_no_detection() {
        let engine = FakeEngine::new();
        let script = engine.script();
        script.push_response(Response::Silence);

        let mut detector = PoseDetector::new(engine);
        short_timeout(&mut detector);
        let mut video = FakeVideo::new(Resolution::new(640, 480), 10.0);

        let poses = detector.detect(&mut video).unwrap();
        assert!(poses.is_empty());
        assert_eq!(script.submit_calls(), 1);
    }

    #[test]
    fn late_callback_does_not_cross_wire() {
        let engine = FakeEngine::new();
        let script = engine.script();
        script.push_response(Response::Silence);

        let mut detector = PoseDetector::new(engine);
        short_timeout(&mut detector);
        let mut video = FakeVideo::new(Resolution::new(100, 100), 10.0);

        // First request times out; its slot must be cleared.
        assert!(detector.detect(&mut video).unwrap().is_empty());

        // The engine wakes up late. There is no pending request, so the
        // result must be dropped, not stored.
        let mut stale = RawPose::default();
        stale.set(
            Joint::Nose,
            RawLandmark {
                x: 0.1,
                y: 0.1,
                z: 0.0,
                visibility: 1.0,
            },
        );
        script.deliver(EngineResult { poses: vec![stale] });

        // The second request gets its own (empty) result, not the stale one.
        let mut fresh = RawPose::default();
        fresh.set(
            Joint::Nose,
            RawLandmark {
                x: 0.9,
                y: 0.9,
                z: 0.0,
                visibility: 1.0,
            },
        );
        script.push_response(Response::poses(vec![fresh]));
        let poses = detector.detect(&mut video).unwrap();
        assert_eq!(poses.len(), 1);
        let nose = poses[0].get(Joint::Nose).unwrap();
        assert_relative_eq!(nose.x, 90.0);
        assert_relative_eq!(nose.y, 90.0);
    }

    #[test]
    fn submit_failure_degrades_to_no_detection() {
        let engine = FakeEngine::new();
        let script = engine.script();
        script.push_response(Response::SubmitError);
        let mut detector = PoseDetector::new(engine);
        let mut video = FakeVideo::new(Resolution::new(640, 480), 10.0);

        assert!(detector.detect(&mut video).unwrap().is_empty());
        // The slot must be free again.
        script.push_response(Response::poses(Vec::new()));
        assert!(detector.detect(&mut video).unwrap().is_empty());
        assert_eq!(script.submit_calls(), 2);
    }

    #[test]
    fn detect_after_dispose_fails() {
        let engine = FakeEngine::new();
        let script = engine.script();
        let mut detector = PoseDetector::new(engine);
        let mut video = FakeVideo::new(Resolution::new(640, 480), 10.0);

        detector.initialize().unwrap();
        detector.dispose();
        detector.dispose(); // idempotent

        assert!(matches!(
            detector.detect(&mut video),
            Err(DetectError::Disposed)
        ));
        assert!(matches!(detector.initialize(), Err(DetectError::Disposed)));
        assert_eq!(script.submit_calls(), 0);
        assert_eq!(script.close_calls(), 1);
    }

    #[test]
    fn dispose_before_initialize_skips_engine() {
        let engine = FakeEngine::new();
        let script = engine.script();
        let mut detector = PoseDetector::new(engine);

        detector.dispose();
        assert_eq!(script.close_calls(), 0);
        assert_eq!(script.load_calls(), 0);
    }
}

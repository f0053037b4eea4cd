//! Batch frame walking: an offline, exhaustive pose pass over a whole video.
//!
//! A walk is inherently sequential. The video can only represent one decoded
//! frame at a time, so every seek is awaited before the next one is issued;
//! the produced samples are therefore strictly increasing in time, with no
//! duplicates and no gaps other than the configured stride.
//!
//! The walker is the only code in this crate that moves the play head, and
//! it takes the `&mut dyn VideoSource` driver borrow for the whole pass. The
//! caller's original play position is restored on *every* exit path
//! (success, error or cancellation), because other UI may be observing the
//! same video.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::detector::{DetectError, PoseDetector};
use crate::pose::FrameSample;
use crate::timer::Timer;
use crate::video::VideoSource;

/// The assumed source frame rate used to map frame indices to timestamps.
pub const DEFAULT_FPS: u32 = 30;

/// Fatal errors of a batch walk.
///
/// Per-frame detection misses never abort a walk; only a failing seek, an
/// unavailable video, or a fatal adapter error does. Position restoration is
/// attempted even then.
#[derive(Debug, Error)]
pub enum WalkError {
    #[error("video seek failed")]
    Seek(#[source] anyhow::Error),

    #[error(transparent)]
    Detect(#[from] DetectError),
}

/// Cooperative cancellation for an in-progress walk.
///
/// Cloneable and thread-safe, so a host can stop a pass from wherever its
/// teardown runs. Cancellation is not an error: the walk returns the samples
/// gathered so far, after restoring the play position.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A configured batch pass over a video.
pub struct FrameWalk {
    stride: u64,
    fps: u32,
    cancel: CancelToken,
    t_step: Timer,
}

impl FrameWalk {
    /// Creates a walk that processes every `stride`-th frame (1 = every
    /// frame) at the assumed default frame rate.
    ///
    /// # Panics
    ///
    /// Panics if `stride` is 0.
    pub fn new(stride: u64) -> Self {
        assert!(stride != 0, "stride must be at least 1");
        Self {
            stride,
            fps: DEFAULT_FPS,
            cancel: CancelToken::default(),
            t_step: Timer::new("step"),
        }
    }

    /// Overrides the assumed source frame rate.
    ///
    /// # Panics
    ///
    /// Panics if `fps` is 0.
    pub fn with_fps(mut self, fps: u32) -> Self {
        assert!(fps != 0, "fps must be at least 1");
        self.fps = fps;
        self
    }

    /// Returns a token that can stop this walk from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Returns the profiling timer covering one seek-and-detect step.
    pub fn timer(&self) -> &Timer {
        &self.t_step
    }

    /// Steps through the video, detecting poses in every `stride`-th frame.
    ///
    /// Each produced [`FrameSample`] is passed to `on_sample` as it appears
    /// (for progress reporting) and collected into the returned sequence. An
    /// empty detection still produces a sample: "nobody in frame" is data,
    /// not an error.
    ///
    /// Preconditions: the video's metadata (duration) is loaded, and no
    /// other code seeks the video while the walk runs. The latter is largely
    /// enforced by the exclusive borrow.
    ///
    /// On return (success, error or cancellation) the play head is back at
    /// the position it had when the walk started.
    pub fn run(
        &self,
        detector: &mut PoseDetector,
        video: &mut dyn VideoSource,
        on_sample: impl FnMut(&FrameSample),
    ) -> Result<Vec<FrameSample>, WalkError> {
        let original = video.current_time();
        let result = self.run_inner(detector, video, on_sample);

        // Restore the caller's play position on every exit path.
        let restored = video.seek(original).map_err(WalkError::Seek);
        match (result, restored) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(samples), Ok(())) => Ok(samples),
        }
    }

    fn run_inner(
        &self,
        detector: &mut PoseDetector,
        video: &mut dyn VideoSource,
        mut on_sample: impl FnMut(&FrameSample),
    ) -> Result<Vec<FrameSample>, WalkError> {
        let frame_duration = 1.0 / f64::from(self.fps);
        let duration = video.duration();

        video.seek(0.0).map_err(WalkError::Seek)?;

        let mut samples = Vec::new();
        let mut frame = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                log::debug!("walk cancelled after {} samples", samples.len());
                break;
            }

            if frame % self.stride == 0 {
                let guard = self.t_step.start();
                let poses = detector.detect(video)?;
                drop(guard);

                let sample = FrameSample {
                    frame,
                    timestamp: video.current_time(),
                    poses,
                };
                on_sample(&sample);
                samples.push(sample);
            }

            frame += 1;
            let next = frame as f64 * frame_duration;
            if next >= duration {
                break;
            }
            video.seek(next).map_err(WalkError::Seek)?;
        }

        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Resolution;
    use crate::test::{FakeEngine, FakeVideo};

    use itertools::Itertools;

    fn detector_with_default_pose() -> PoseDetector {
        use crate::engine::{EngineResult, RawLandmark, RawPose};
        use crate::pose::Joint;

        let engine = FakeEngine::new();
        let mut raw = RawPose::default();
        raw.set(
            Joint::Nose,
            RawLandmark {
                x: 0.5,
                y: 0.5,
                z: 0.0,
                visibility: 1.0,
            },
        );
        engine
            .script()
            .set_default_result(EngineResult { poses: vec![raw] });
        PoseDetector::new(engine)
    }

    #[test]
    fn walks_every_frame() {
        let mut detector = detector_with_default_pose();
        let mut video = FakeVideo::new(Resolution::new(640, 480), 10.0);

        let mut streamed = 0;
        let samples = FrameWalk::new(1)
            .run(&mut detector, &mut video, |_| streamed += 1)
            .unwrap();

        assert_eq!(samples.len(), 300);
        assert_eq!(streamed, 300);
        assert_eq!(samples.first().unwrap().frame, 0);
        assert_eq!(samples.last().unwrap().frame, 299);
        assert!(samples.iter().all(|s| s.poses.len() == 1));
        // The walk starts by rewinding to the beginning.
        assert_eq!(video.seeks().first(), Some(&0.0));
        for (a, b) in samples.iter().tuple_windows() {
            assert!(b.frame == a.frame + 1);
            assert!(b.timestamp > a.timestamp);
        }
    }

    #[test]
    fn stride_skips_frames() {
        let mut detector = detector_with_default_pose();
        let mut video = FakeVideo::new(Resolution::new(640, 480), 10.0);

        let samples = FrameWalk::new(5)
            .run(&mut detector, &mut video, |_| ())
            .unwrap();

        assert_eq!(samples.len(), 60);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.frame, i as u64 * 5);
        }
    }

    #[test]
    fn empty_detections_still_produce_samples() {
        // No scripted results: the engine reports "nobody in frame".
        let mut detector = PoseDetector::new(FakeEngine::new());
        let mut video = FakeVideo::new(Resolution::new(640, 480), 1.0);

        let samples = FrameWalk::new(1)
            .run(&mut detector, &mut video, |_| ())
            .unwrap();

        assert_eq!(samples.len(), 30);
        assert!(samples.iter().all(|s| s.poses.is_empty()));
    }

    #[test]
    fn restores_position_on_success() {
        let mut detector = detector_with_default_pose();
        let mut video = FakeVideo::new(Resolution::new(640, 480), 2.0);
        video.seek(1.25).unwrap();

        FrameWalk::new(1).run(&mut detector, &mut video, |_| ()).unwrap();

        assert_eq!(video.current_time(), 1.25);
    }

    #[test]
    fn restores_position_on_seek_failure() {
        let mut detector = detector_with_default_pose();
        let mut video = FakeVideo::new(Resolution::new(640, 480), 10.0);
        video.seek(3.5).unwrap();
        video.fail_seeks_to_after(5.0);

        let result = FrameWalk::new(1).run(&mut detector, &mut video, |_| ());

        assert!(matches!(result, Err(WalkError::Seek(_))));
        assert_eq!(video.current_time(), 3.5);
    }

    #[test]
    fn cancellation_returns_partial_results() {
        let mut detector = detector_with_default_pose();
        let mut video = FakeVideo::new(Resolution::new(640, 480), 10.0);
        video.seek(0.5).unwrap();

        let walk = FrameWalk::new(1);
        let token = walk.cancel_token();
        let samples = walk
            .run(&mut detector, &mut video, |sample| {
                if sample.frame == 9 {
                    token.cancel();
                }
            })
            .unwrap();

        assert_eq!(samples.len(), 10);
        assert_eq!(video.current_time(), 0.5);
    }

    #[test]
    #[should_panic]
    fn zero_stride_panics() {
        FrameWalk::new(0);
    }
}

//! Pose and skeleton data model.
//!
//! All coordinates in this module are in *intrinsic* pixels, the video's
//! native decoded resolution. Mapping to the on-screen box is the overlay
//! renderer's job.

use crate::num::TotalF32;

/// A 2D location in intrinsic pixel space, with optional depth.
///
/// `z` is model-relative and unitless. It can be compared between joints of
/// the same detection, but not across frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub z: Option<f32>,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, z: None }
    }

    pub fn with_z(self, z: f32) -> Self {
        Self { z: Some(z), ..self }
    }
}

/// A named anatomical landmark.
///
/// Not every joint is present in every detection: occluded or low-confidence
/// joints are reported as absent, never as a placeholder zero point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Joint {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl Joint {
    pub const COUNT: usize = 17;

    pub const ALL: [Joint; Self::COUNT] = {
        use Joint::*;
        [
            Nose,
            LeftEye,
            RightEye,
            LeftEar,
            RightEar,
            LeftShoulder,
            RightShoulder,
            LeftElbow,
            RightElbow,
            LeftWrist,
            RightWrist,
            LeftHip,
            RightHip,
            LeftKnee,
            RightKnee,
            LeftAnkle,
            RightAnkle,
        ]
    };
}

/// Anatomical connections drawn between joints to form a skeleton.
pub const CONNECTIONS: &[(Joint, Joint)] = {
    use Joint::*;
    &[
        // Face
        (Nose, LeftEye),
        (Nose, RightEye),
        (LeftEye, LeftEar),
        (RightEye, RightEar),
        // Upper body
        (LeftShoulder, RightShoulder),
        (LeftShoulder, LeftElbow),
        (LeftElbow, LeftWrist),
        (RightShoulder, RightElbow),
        (RightElbow, RightWrist),
        // Torso
        (LeftShoulder, LeftHip),
        (RightShoulder, RightHip),
        (LeftHip, RightHip),
        // Lower body
        (LeftHip, LeftKnee),
        (LeftKnee, LeftAnkle),
        (RightHip, RightKnee),
        (RightKnee, RightAnkle),
    ]
};

/// One detected person in one frame.
///
/// The `id` is stable only within a single detection call. It is *not* a
/// cross-frame track id.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    id: u32,
    points: [Option<Point>; Joint::COUNT],
    confidence: f32,
}

impl Pose {
    /// Creates an empty [`Pose`] with no joints and a confidence of 0.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            points: [None; Joint::COUNT],
            confidence: 0.0,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Aggregate confidence in `[0, 1]`, the mean of the per-joint visibility
    /// scores reported by the engine. 0 exactly when no joints are present.
    #[inline]
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn set_confidence(&mut self, confidence: f32) {
        self.confidence = confidence;
    }

    pub fn get(&self, joint: Joint) -> Option<Point> {
        self.points[joint as usize]
    }

    pub fn set(&mut self, joint: Joint, point: Point) {
        self.points[joint as usize] = Some(point);
    }

    /// Iterates over all joints present in this pose.
    pub fn joints(&self) -> impl Iterator<Item = (Joint, Point)> + '_ {
        Joint::ALL
            .iter()
            .filter_map(|&joint| self.get(joint).map(|point| (joint, point)))
    }

    /// Number of joints present.
    pub fn len(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.points.iter().all(|p| p.is_none())
    }
}

/// One processed instant of a video: a frame index, its timestamp in
/// video-relative seconds, and the poses detected in it.
///
/// An empty pose list means "no person detected"; it is not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSample {
    pub frame: u64,
    pub timestamp: f64,
    pub poses: Vec<Pose>,
}

impl FrameSample {
    /// Returns the most confident pose of this sample, if any.
    pub fn best_pose(&self) -> Option<&Pose> {
        self.poses
            .iter()
            .max_by_key(|pose| TotalF32(pose.confidence()))
    }
}

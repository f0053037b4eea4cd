//! Live skeleton overlay rendering.
//!
//! The overlay paints the most recent pose onto a transparent canvas locked
//! to the video's on-screen box. It owns neither the pose nor the video: it
//! is a pure consumer of "latest pose + current viewport geometry", and the
//! host presents the canvas however it likes.
//!
//! Three sizes meet here: the video's intrinsic resolution (the space pose
//! coordinates live in), the viewport's logical on-screen size, and the
//! physical backing store, which is the logical size times the device pixel
//! ratio so lines stay crisp on high-density displays.

use crate::image::{draw, Color, Image, Resolution};
use crate::pose::{Pose, CONNECTIONS};
use crate::timer::FpsCounter;

/// The video's on-screen bounding box, in logical (CSS) pixels.
///
/// This changes on window resizes and layout changes, not just when the
/// video itself changes size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplaySize {
    pub width: f32,
    pub height: f32,
}

/// Read access to the host layout: where the video is displayed and how
/// dense the output device is.
pub trait Viewport {
    /// The current on-screen box of the video element.
    fn display_size(&self) -> DisplaySize;

    /// Physical pixels per logical pixel.
    fn device_pixel_ratio(&self) -> f32;
}

/// Paces the render loop.
///
/// The host side of "paint before the next repaint": blocking here instead
/// of running a fixed timer keeps the overlay from drifting against the
/// actual screen refresh and from painting while nothing is visible.
pub trait RepaintScheduler {
    /// Blocks until the next repaint opportunity. Returns `false` once the
    /// surface is gone and the loop must stop.
    fn next_frame(&mut self) -> bool;
}

/// Renders a skeleton for the latest pose, scaled to the on-screen box.
pub struct Overlay {
    viewport: Box<dyn Viewport>,
    intrinsic: Resolution,
    canvas: Image,
    pose: Option<Pose>,
    fps: FpsCounter,
}

impl Overlay {
    /// Creates an overlay for a video with the given intrinsic resolution,
    /// displayed inside `viewport`.
    pub fn new(viewport: Box<dyn Viewport>, intrinsic: Resolution) -> Self {
        Self {
            viewport,
            intrinsic,
            canvas: Image::new(0, 0),
            pose: None,
            fps: FpsCounter::new("overlay"),
        }
    }

    /// Replaces the pose to draw. `None` clears the skeleton on the next
    /// repaint ("no detection" means "temporarily not drawn", not an error).
    pub fn set_pose(&mut self, pose: Option<Pose>) {
        self.pose = pose;
    }

    /// Per-frame tick. Repaints and returns the canvas for presentation.
    pub fn render(&mut self) -> &Image {
        self.redraw();
        self.fps.tick();
        &self.canvas
    }

    /// Immediate redraw hook for layout observers.
    ///
    /// Call this when the video's on-screen box changes, so the overlay
    /// never shows even one frame at a stale scale. Returns the repainted
    /// canvas.
    pub fn layout_changed(&mut self) -> &Image {
        self.redraw();
        &self.canvas
    }

    /// Drives the overlay from the host's repaint scheduler until the
    /// scheduler reports the surface is gone.
    pub fn run<S: RepaintScheduler>(&mut self, scheduler: &mut S, mut present: impl FnMut(&Image)) {
        while scheduler.next_frame() {
            present(self.render());
        }
        log::debug!("overlay surface gone, render loop stopped");
    }

    fn redraw(&mut self) {
        let size = self.viewport.display_size();
        let dpr = self.viewport.device_pixel_ratio();

        // Backing store is the logical size times the device pixel ratio.
        let backing = Resolution::new(
            (size.width * dpr).round() as u32,
            (size.height * dpr).round() as u32,
        );
        if self.canvas.resolution() != backing {
            self.canvas = Image::new(backing.width(), backing.height());
        } else {
            self.canvas.clear(Color::NONE);
        }

        let Some(pose) = &self.pose else { return };
        if self.intrinsic.num_pixels() == 0 {
            return;
        }

        // Pose coordinates are intrinsic pixels; map them to physical canvas
        // pixels in one step.
        let scale_x = size.width / self.intrinsic.width() as f32 * dpr;
        let scale_y = size.height / self.intrinsic.height() as f32 * dpr;

        let color = confidence_color(pose.confidence());
        let stroke = (2.0 * dpr).round().max(1.0) as u32;
        // Marker size must be uneven.
        let marker_size = ((5.0 * dpr).round() as u32).max(1) | 1;

        // Connections first, so markers end up on top.
        for (a, b) in CONNECTIONS {
            if let (Some(pa), Some(pb)) = (pose.get(*a), pose.get(*b)) {
                draw::line(
                    &mut self.canvas,
                    (pa.x * scale_x).round() as i32,
                    (pa.y * scale_y).round() as i32,
                    (pb.x * scale_x).round() as i32,
                    (pb.y * scale_y).round() as i32,
                )
                .color(color)
                .stroke_width(stroke);
            }
        }

        for (_, point) in pose.joints() {
            draw::marker(
                &mut self.canvas,
                (point.x * scale_x).round() as i32,
                (point.y * scale_y).round() as i32,
            )
            .color(color)
            .size(marker_size);
        }
    }
}

fn confidence_color(confidence: f32) -> Color {
    if confidence >= 0.8 {
        Color::GREEN
    } else if confidence >= 0.4 {
        Color::YELLOW
    } else {
        Color::RED
    }
}

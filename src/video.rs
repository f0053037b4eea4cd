//! Boundary to the host-owned video element.
//!
//! The video is a shared, stateful resource: the host UI owns it, and other
//! components may be observing its playback position at any time. Kata only
//! ever *reads* intrinsic state (resolution, duration, readiness); only the
//! batch walker *mutates* the play head, and it always restores it
//! afterwards.
//!
//! Holding a `&mut dyn VideoSource` is the "driver role": at most one driver
//! can exist at a time, which the borrow checker enforces for us. Code that
//! only needs to read should not take the mutable borrow.

use crate::image::{Image, Resolution};

/// A readable video frame source with a seekable play head.
///
/// All blocking methods suspend the calling thread until the underlying
/// playback machinery reports completion, mirroring how a host environment
/// delivers "seeked" and "data decoded" signals asynchronously.
pub trait VideoSource {
    /// The intrinsic (decoded) resolution of the video's frames.
    ///
    /// This is *not* the on-screen displayed size.
    fn resolution(&self) -> Resolution;

    /// Total duration in seconds. Only meaningful once the video's metadata
    /// has loaded; callers of the batch walker must ensure that.
    fn duration(&self) -> f64;

    /// The current play position in seconds.
    fn current_time(&self) -> f64;

    /// Moves the play head to `time` (seconds) and blocks until the seek has
    /// settled and the frame at the new position is represented.
    ///
    /// Issuing a second seek before the first settles has last-write-wins
    /// behavior on real video elements, which is why every caller in this
    /// crate awaits completion before seeking again.
    fn seek(&mut self, time: f64) -> anyhow::Result<()>;

    /// Whether decoded data for the current position is available.
    fn has_decoded_data(&self) -> bool;

    /// Blocks until decoded data for the current position is available.
    fn wait_for_data(&mut self) -> anyhow::Result<()>;

    /// Grabs the currently represented frame.
    ///
    /// Read-only with respect to the play head. Fails if the media is
    /// detached or has no decoded data; such failures are transient.
    fn capture_frame(&mut self) -> anyhow::Result<Image>;
}

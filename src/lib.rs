//! Kata: frame-synchronized pose estimation for video.
//!
//! Kata drives a video source frame-by-frame (or in real time), asks an
//! external inference engine for a skeletal pose per frame, and renders the
//! result as an overlay aligned to the video's on-screen box.
//!
//! # Coordinate Spaces
//!
//! Three pixel spaces are involved and must not be confused:
//!
//! * *Normalized model space*: what the inference engine reports, `[0, 1]`
//!   per axis. Only the engine boundary ([`engine`]) speaks this.
//! * *Intrinsic space*: the video's native decoded resolution. All [`pose`]
//!   data is in intrinsic pixels; the [`detector`] converts into this space
//!   before returning anything.
//! * *Display space*: the video's on-screen box, which differs from the
//!   intrinsic size and additionally scales with the device pixel ratio.
//!   Only the [`overlay`] renderer deals with this.

use log::LevelFilter;

pub mod detector;
pub mod engine;
pub mod filter;
pub mod image;
pub mod num;
pub mod overlay;
pub mod pose;
pub mod timer;
pub mod video;
pub mod walker;


/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and Kata will log at *debug* level; `RUST_LOG` can
/// override this.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}

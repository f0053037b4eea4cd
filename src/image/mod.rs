//! Canvas primitives.
//!
//! This module provides:
//!
//! - The [`Image`] type, an owned RGBA image. It serves as the overlay's
//!   backing store and as the frame payload handed to the inference engine.
//! - [`Resolution`], the intrinsic size of images, videos and backing
//!   stores.
//! - [`Color`] and the [`draw`] functions used to paint skeletons.

pub mod draw;

use std::fmt;
use std::path::Path;

use embedded_graphics::pixelcolor::raw::RawU32;
use embedded_graphics::prelude::PixelColor;
use image::{ImageBuffer, Rgba, RgbaImage};

/// Resolution (`width x height`) of an image, video or backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    /// Creates a new [`Resolution`] of `width x height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn num_pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An 8-bit sRGB color with alpha channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub(crate) [u8; 4]);

impl Color {
    /// Fully transparent black (all components are 0).
    pub const NONE: Self = Self([0, 0, 0, 0]);
    pub const BLACK: Self = Self([0, 0, 0, 255]);
    pub const WHITE: Self = Self([255, 255, 255, 255]);
    pub const RED: Self = Self([255, 0, 0, 255]);
    pub const GREEN: Self = Self([0, 255, 0, 255]);
    pub const BLUE: Self = Self([0, 0, 255, 255]);
    pub const YELLOW: Self = Self([255, 255, 0, 255]);

    #[inline]
    pub const fn from_rgb8(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b, 255])
    }

    #[inline]
    pub const fn from_rgba8(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self([r, g, b, a])
    }

    #[inline]
    pub fn r(&self) -> u8 {
        self.0[0]
    }

    #[inline]
    pub fn g(&self) -> u8 {
        self.0[1]
    }

    #[inline]
    pub fn b(&self) -> u8 {
        self.0[2]
    }

    #[inline]
    pub fn a(&self) -> u8 {
        self.0[3]
    }
}

impl PixelColor for Color {
    type Raw = RawU32;
}

/// An 8-bit sRGB image with alpha channel.
#[derive(Clone)]
pub struct Image {
    buf: RgbaImage,
}

impl Image {
    /// Creates an empty image of the specified size.
    ///
    /// The image will start out black and fully transparent.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            buf: ImageBuffer::new(width, height),
        }
    }

    /// Returns the width of this image, in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.buf.width()
    }

    /// Returns the height of this image, in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.buf.height()
    }

    /// Returns the size of this image.
    #[inline]
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width(), self.height())
    }

    /// Gets the image color at the given pixel coordinates.
    ///
    /// # Panics
    ///
    /// This will panic if `(x, y)` is outside the bounds of this image.
    pub(crate) fn get(&self, x: u32, y: u32) -> Color {
        Color(self.buf[(x, y)].0)
    }

    /// Sets the image color at the given pixel coordinates. Writes outside
    /// the image bounds are ignored.
    pub(crate) fn set(&mut self, x: u32, y: u32, color: Color) {
        if x < self.width() && y < self.height() {
            self.buf[(x, y)] = Rgba(color.0);
        }
    }

    /// Clears the image, setting every pixel value to `color`.
    pub fn clear(&mut self, color: Color) {
        self.buf.pixels_mut().for_each(|pix| pix.0 = color.0);
    }

    /// Raw image data, row-major RGBA.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.buf.as_raw()
    }

    /// Saves the image as a PNG file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        self.buf
            .save_with_format(path.as_ref(), image::ImageFormat::Png)?;
        Ok(())
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} Image", self.width(), self.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_image_is_transparent() {
        let image = Image::new(4, 2);
        assert_eq!(image.resolution(), Resolution::new(4, 2));
        assert_eq!(image.get(0, 0), Color::NONE);
        assert_eq!(image.get(3, 1), Color::NONE);
    }

    #[test]
    fn clear_overwrites_every_pixel() {
        let mut image = Image::new(3, 3);
        image.clear(Color::YELLOW);
        assert_eq!(image.get(0, 0), Color::YELLOW);
        assert_eq!(image.get(2, 2), Color::YELLOW);
    }

    #[test]
    fn out_of_bounds_writes_are_ignored() {
        let mut image = Image::new(2, 2);
        image.set(5, 5, Color::RED);
        assert_eq!(image.get(1, 1), Color::NONE);
    }
}

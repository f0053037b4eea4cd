//! Utilities for numerics.

use std::cmp::Ordering;

/// Wrapper around `f32` that provides a total order, for use as a sort or
/// max key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TotalF32(pub f32);

impl Eq for TotalF32 {}

impl PartialOrd for TotalF32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF32 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

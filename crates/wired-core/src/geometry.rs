//! 2D geometry types used for surface sizes and render areas.

use bytemuck::{Pod, Zeroable};

/// An unsigned 2D size in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Size2D {
    pub w: u32,
    pub h: u32,
}

impl Size2D {
    #[inline]
    #[must_use]
    pub const fn new(w: u32, h: u32) -> Self {
        Self { w, h }
    }

    /// Returns true if either dimension is zero.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Total pixel count.
    #[inline]
    #[must_use]
    pub const fn area(self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

/// An unsigned 3D size in pixels, used for image extents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Size3D {
    pub w: u32,
    pub h: u32,
    pub d: u32,
}

impl Size3D {
    #[inline]
    #[must_use]
    pub const fn new(w: u32, h: u32, d: u32) -> Self {
        Self { w, h, d }
    }

    /// Returns true if any dimension is zero.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.w == 0 || self.h == 0 || self.d == 0
    }
}

/// An unsigned 2D point, origin at the top-left.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Point2D {
    pub x: u32,
    pub y: u32,
}

impl Point2D {
    #[inline]
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// An unsigned 3D point, used for image region offsets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Point3D {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Point3D {
    #[inline]
    #[must_use]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_area() {
        assert_eq!(Size2D::new(1920, 1080).area(), 2_073_600);
        assert_eq!(Size2D::new(0, 1080).area(), 0);
    }

    #[test]
    fn size_is_empty() {
        assert!(Size2D::new(0, 10).is_empty());
        assert!(Size2D::new(10, 0).is_empty());
        assert!(!Size2D::new(1, 1).is_empty());
    }
}

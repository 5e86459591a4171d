//! Core types shared across the Wired GPU workspace.
//!
//! This crate provides the small foundational pieces the GPU layer builds on:
//! - geometry types for render areas, surface sizes, and image extents
//! - tracing initialization for binaries and tests

pub mod geometry;
pub mod logging;

pub use geometry::{Point2D, Point3D, Size2D, Size3D};
pub use logging::init_tracing;

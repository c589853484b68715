//! Board-agnostic motion planning core for stepper-driven machines
//!
//! This crate contains the look-ahead motion planner: the subsystem that
//! accepts linear tool-path segments in user units (millimeters + feed
//! rate) and fills a bounded queue of fully parameterized motion blocks
//! for an interrupt-driven step-pulse generator to consume:
//!
//! - Fixed-capacity single-producer/single-consumer block ring
//! - Millimeter-to-step translation with per-extruder scaling
//! - Per-axis feed-rate and acceleration limiting
//! - Junction jerk policy and two-pass look-ahead replanning
//! - Trapezoid (accelerate/cruise/decelerate) profile generation
//! - Optional filament pressure-advance compensation
//!
//! Hardware collaborators (stepper driver, heaters, display) live behind
//! the traits in [`traits`]; the crate itself never touches hardware.

#![no_std]
#![deny(unsafe_code)]

#[cfg(test)]
extern crate std;

pub mod config;
pub mod motion;
pub mod traits;

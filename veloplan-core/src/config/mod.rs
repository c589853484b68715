//! Configuration types
//!
//! Board-agnostic planner configuration. All fields are mutable at run
//! time from the gcode layer (the producer context); the planner reads
//! them on every submission.

pub mod types;

pub use types::*;

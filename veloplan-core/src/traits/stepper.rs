//! Step-pulse generator interface
//!
//! The stepper consumes blocks from the queue tail inside its timer
//! interrupt; these are the producer-side notifications it needs from
//! the planner.

/// Producer-side link to the step-pulse generator
///
/// The consumer half of the contract lives on the block queue itself
/// (`with_tail`, `mark_busy`, `advance_tail`); this trait carries the
/// calls the planner makes toward the stepper.
pub trait StepperLink {
    /// Re-arm the step timer after a block has been queued
    fn wake(&mut self);

    /// Overwrite the stepper's absolute step counters (all axes)
    fn set_position(&mut self, steps: &[i32; crate::config::NUM_AXES]);

    /// Overwrite the stepper's absolute E step counter only
    fn set_e_position(&mut self, steps: i32);

    /// Power up the drivers of the axes a queued block moves
    fn enable_axes(&mut self, x: bool, y: bool, z: bool, e: bool);
}

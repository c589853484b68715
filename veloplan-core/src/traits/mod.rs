//! External collaborator traits
//!
//! These traits define the interface between the planner and the
//! services it cooperates with but does not own: the step-pulse
//! generator, the hotend temperature readout, and the cooperative
//! services that must keep running while the planner waits for
//! buffer space.

pub mod services;
pub mod stepper;

pub use services::{HotendMonitor, IdleServices};
pub use stepper::StepperLink;

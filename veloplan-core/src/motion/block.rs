//! Planned motion block
//!
//! A block is one linear segment, fully parameterized for the stepper:
//! step counts and directions per axis, the trapezoid speed profile in
//! step space, and the look-ahead state the replanner works on.

use fixed::types::U24F8;

use crate::config::{E_AXIS, NUM_AXES};

/// Lowest step rate ever programmed (steps/s); keeps the step timer
/// period representable
pub const MIN_STEP_RATE: u32 = 120;

/// One planned linear segment, the unit consumed by the stepper
///
/// Field groups and who owns them:
/// - geometry (`steps`, `direction_bits`, `millimeters`, …) is written
///   once by the producer before the block is published
/// - look-ahead state (`entry_speed`, `max_entry_speed`,
///   `recalculate_flag`, …) is producer-only
/// - trajectory fields (`initial_rate`, `final_rate`,
///   `accelerate_until`, `decelerate_after`, the advance values) are
///   shared with the interrupt context and only rewritten under a
///   critical section while `busy` is clear
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Block {
    /// Step counts per axis (always non-negative)
    pub steps: [u32; NUM_AXES],
    /// Largest axis step count; the Bresenham denominator
    pub step_event_count: u32,
    /// Bit per axis, set when that axis moves in the negative direction
    pub direction_bits: u8,
    /// Extruder this block was planned for
    pub active_extruder: u8,
    /// Fan PWM captured at submission
    pub fan_speed: u8,

    /// No extruder motion (move or reposition only)
    pub travel: bool,
    /// Extruder-only move pulling filament back
    pub retract: bool,
    /// Extruder-only move pushing filament forward
    pub restore: bool,

    /// Euclidean XYZ length, or |ΔE| for an extruder-only block (mm)
    pub millimeters: f32,
    /// Cruise speed after all clamps (mm/s), always > 0
    pub nominal_speed: f32,
    /// Planned speed entering the block (mm/s)
    pub entry_speed: f32,
    /// Junction ceiling on the entry speed (mm/s)
    pub max_entry_speed: f32,
    /// Effective constant acceleration (mm/s²)
    pub acceleration: f32,

    /// Cruise step rate (steps/s)
    pub nominal_rate: u32,
    /// Acceleration in step space (steps/s²)
    pub acceleration_st: u32,
    /// 24.8 fixed-point rate increment per stepper timer tick (raw bits)
    pub acceleration_rate: u32,
    /// Step rate entering the block (steps/s)
    pub initial_rate: u32,
    /// Step rate leaving the block (steps/s)
    pub final_rate: u32,
    /// Step index where acceleration ends
    pub accelerate_until: u32,
    /// Step index where deceleration begins
    pub decelerate_after: u32,

    /// Block can decelerate from nominal speed to rest within its own
    /// length; the look-ahead passes may skip it
    pub nominal_length_flag: bool,
    /// Trapezoid must be regenerated before the stepper may use it
    pub recalculate_flag: bool,
    /// Set by the stepper when it starts executing this block
    pub busy: bool,

    /// Compensation carried over from the predecessor (E steps)
    pub prev_advance: i32,
    /// Compensation at the entry rate (E steps)
    pub initial_advance: i32,
    /// Compensation at the cruise rate (E steps)
    pub target_advance: i32,
    /// Compensation at the exit rate (E steps)
    pub final_advance: i32,
    /// Entry compensation of the successor, for hand-off (E steps)
    pub next_advance: i32,
    /// Step rate for applying compensation changes (steps/s)
    pub advance_step_rate: u32,
}

impl Block {
    /// All-zero block used to seed the ring storage
    pub const EMPTY: Self = Self {
        steps: [0; NUM_AXES],
        step_event_count: 0,
        direction_bits: 0,
        active_extruder: 0,
        fan_speed: 0,
        travel: false,
        retract: false,
        restore: false,
        millimeters: 0.0,
        nominal_speed: 0.0,
        entry_speed: 0.0,
        max_entry_speed: 0.0,
        acceleration: 0.0,
        nominal_rate: 0,
        acceleration_st: 0,
        acceleration_rate: 0,
        initial_rate: 0,
        final_rate: 0,
        accelerate_until: 0,
        decelerate_after: 0,
        nominal_length_flag: false,
        recalculate_flag: false,
        busy: false,
        prev_advance: 0,
        initial_advance: 0,
        target_advance: 0,
        final_advance: 0,
        next_advance: 0,
        advance_step_rate: 0,
    };

    /// Whether the given axis moves in the negative direction
    pub fn direction_is_negative(&self, axis: usize) -> bool {
        self.direction_bits & (1 << axis) != 0
    }

    /// Whether the block steps the given axis at all
    pub fn moves_axis(&self, axis: usize) -> bool {
        self.steps[axis] != 0
    }

    /// Whether the block pushes filament forward
    pub fn extrudes_forward(&self) -> bool {
        self.steps[E_AXIS] != 0 && !self.direction_is_negative(E_AXIS)
    }

    /// The 24.8 rate increment as a fixed-point value
    pub fn rate_increment(&self) -> U24F8 {
        U24F8::from_bits(self.acceleration_rate)
    }

    /// Step counts of the accelerate, cruise and decelerate phases
    pub fn phase_lengths(&self) -> (u32, u32, u32) {
        (
            self.accelerate_until,
            self.decelerate_after - self.accelerate_until,
            self.step_event_count - self.decelerate_after,
        )
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::EMPTY
    }
}

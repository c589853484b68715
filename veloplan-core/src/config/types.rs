//! Configuration type definitions
//!
//! These types describe the machine limits the planner enforces: per-axis
//! feed-rate and acceleration ceilings, junction jerk budgets, minimum
//! feed rates, and the optional extrusion interlocks and pressure-advance
//! compensation tables.

use heapless::Vec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of motion axes (X, Y, Z, E)
pub const NUM_AXES: usize = 4;

/// Maximum number of extruders supported
pub const MAX_EXTRUDERS: usize = 3;

/// X axis index
pub const X_AXIS: usize = 0;
/// Y axis index
pub const Y_AXIS: usize = 1;
/// Z axis index
pub const Z_AXIS: usize = 2;
/// E (extruder) axis index
pub const E_AXIS: usize = 3;

/// Number of per-axis configuration slots (XYZ plus one E slot per extruder)
pub const AXIS_SLOTS: usize = 3 + MAX_EXTRUDERS;

/// Maximum entries in a pressure-advance compensation table
pub const MAX_ADVANCE_POINTS: usize = 8;

/// One entry of a pressure-advance compensation table
///
/// Tables are piecewise linear: between two entries the compensation is
/// interpolated, above the highest entry it is clamped to that entry.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdvancePoint {
    /// Extrusion speed this entry applies to (mm/s)
    pub rate_mm_s: f32,
    /// Filament compensation at that speed (mm)
    pub advance_mm: f32,
}

/// Pressure-advance compensation table for one extruder
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdvanceTable {
    /// Calibration points, sorted by ascending rate
    pub points: Vec<AdvancePoint, MAX_ADVANCE_POINTS>,
    /// Minimum E speed reserved for compensation headroom (mm/s)
    pub min_speed: f32,
}

/// Pressure-advance configuration (one table per extruder)
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdvanceConfig {
    pub per_extruder: [AdvanceTable; MAX_EXTRUDERS],
}

/// Planner configuration
///
/// Per-axis arrays are indexed `[X, Y, Z, E0, E1, E2]`; the E slot for a
/// given extruder is `E_AXIS + extruder`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlannerConfig {
    /// Steps per millimeter for each axis slot
    pub axis_steps_per_unit: [f32; AXIS_SLOTS],
    /// Feed-rate ceiling per axis slot (mm/s)
    pub max_feedrate: [f32; AXIS_SLOTS],
    /// Acceleration ceiling per axis slot (mm/s²)
    pub max_acceleration: [u32; AXIS_SLOTS],
    /// Default acceleration for moves (mm/s²)
    pub acceleration: f32,
    /// Acceleration for extruder-only moves, per extruder (mm/s²)
    pub retract_acceleration: [f32; MAX_EXTRUDERS],
    /// Instantaneous velocity change allowed in the XY plane (mm/s)
    pub max_xy_jerk: f32,
    /// Instantaneous velocity change allowed on Z (mm/s)
    pub max_z_jerk: f32,
    /// Instantaneous velocity change allowed on E, per extruder (mm/s)
    pub max_e_jerk: [f32; MAX_EXTRUDERS],
    /// Lower feed bound for extruding moves (mm/s)
    pub minimum_feedrate: f32,
    /// Lower feed bound for travel moves (mm/s)
    pub min_travel_feedrate: f32,
    /// Segments shorter than this are stretched when the queue drains (µs)
    pub min_segment_time_us: u32,
    /// Speed the last queued block always decelerates to (mm/s)
    pub minimum_planner_speed: f32,
    /// Moves of this many steps or fewer are discarded
    pub drop_segments: u32,
    /// Extrusion flow multiplier (percent)
    pub extrude_multiply: u16,
    /// Stretch near-starved segments to keep the stepper fed
    pub slowdown: bool,
    /// XY direction-change frequency ceiling (Hz), if limited
    pub xy_frequency_limit_hz: Option<f32>,
    /// Hotend temperature below which extrusion is suppressed (°C)
    pub extrude_min_temp: Option<f32>,
    /// Longest single extrusion accepted (mm)
    pub extrude_max_length: Option<f32>,
    /// Stepper timer tick rate the 24.8 rate increment is scaled for (Hz)
    pub stepper_timer_hz: u32,
    /// Pressure-advance compensation, if fitted
    pub advance: Option<AdvanceConfig>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            axis_steps_per_unit: [80.0, 80.0, 400.0, 100.0, 100.0, 100.0],
            max_feedrate: [300.0, 300.0, 5.0, 25.0, 25.0, 25.0],
            max_acceleration: [9000; AXIS_SLOTS],
            acceleration: 3000.0,
            retract_acceleration: [3000.0; MAX_EXTRUDERS],
            max_xy_jerk: 20.0,
            max_z_jerk: 0.4,
            max_e_jerk: [5.0; MAX_EXTRUDERS],
            minimum_feedrate: 0.0,
            min_travel_feedrate: 0.0,
            min_segment_time_us: 20_000,
            minimum_planner_speed: 0.05,
            drop_segments: 5,
            extrude_multiply: 100,
            slowdown: true,
            xy_frequency_limit_hz: None,
            extrude_min_temp: None,
            extrude_max_length: None,
            stepper_timer_hz: 1_000_000,
            advance: None,
        }
    }
}

impl PlannerConfig {
    /// Configuration slot for the E axis of a given extruder
    pub fn e_slot(extruder: u8) -> usize {
        E_AXIS + extruder as usize
    }

    /// Minimum E speed reserved for pressure advance (zero when disabled)
    pub fn comp_speed(&self, extruder: usize) -> f32 {
        self.advance
            .as_ref()
            .map(|adv| adv.per_extruder[extruder].min_speed)
            .unwrap_or(0.0)
    }

    /// Per-axis acceleration ceiling in step space (steps/s²)
    pub(crate) fn step_accel_ceiling(&self, axis: usize, extruder: usize) -> f32 {
        let slot = if axis == E_AXIS { axis + extruder } else { axis };
        self.max_acceleration[slot] as f32 * self.axis_steps_per_unit[slot]
    }

    /// Scale from steps/s² to the stepper's 24.8 fixed-point rate
    /// increment per timer tick (`2²³ / timer_hz`; 8.388608 at 1 MHz)
    pub(crate) fn rate_scale(&self) -> f32 {
        8_388_608.0 / self.stepper_timer_hz as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e_slot_indexing() {
        assert_eq!(PlannerConfig::e_slot(0), 3);
        assert_eq!(PlannerConfig::e_slot(2), 5);
    }

    #[test]
    fn test_comp_speed_disabled() {
        let config = PlannerConfig::default();
        assert_eq!(config.comp_speed(0), 0.0);
    }

    #[test]
    fn test_comp_speed_enabled() {
        let mut config = PlannerConfig::default();
        let mut advance = AdvanceConfig::default();
        advance.per_extruder[1].min_speed = 0.5;
        config.advance = Some(advance);
        assert_eq!(config.comp_speed(0), 0.0);
        assert_eq!(config.comp_speed(1), 0.5);
    }

    #[test]
    fn test_step_accel_ceiling_uses_extruder_slot() {
        let mut config = PlannerConfig::default();
        config.max_acceleration[E_AXIS + 1] = 1000;
        config.axis_steps_per_unit[E_AXIS + 1] = 140.0;
        assert_eq!(config.step_accel_ceiling(X_AXIS, 1), 9000.0 * 80.0);
        assert_eq!(config.step_accel_ceiling(E_AXIS, 1), 1000.0 * 140.0);
    }

    #[test]
    fn test_rate_scale_default_timer() {
        let config = PlannerConfig::default();
        // 2^23 / 10^6 at the default 1 MHz tick
        assert!((config.rate_scale() - 8.388_608).abs() < 1e-6);
    }
}

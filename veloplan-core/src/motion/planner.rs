//! Planner facade
//!
//! Producer-side API of the motion core. A submission converts one
//! linear segment in user units into a block: millimeter targets become
//! absolute step counts, per-axis feed and acceleration ceilings clamp
//! the requested speed, the junction policy bounds the entry speed
//! against the previous segment, and the block is published at the
//! queue head before the look-ahead replan reshapes the whole plan.
//!
//! Submissions never fail: a segment that rounds away is silently
//! dropped, and an extrusion the interlocks reject is consumed without
//! motion while any remaining XYZ component still proceeds.

use libm::{ceilf, fabsf, hypotf, roundf, sqrtf};

use crate::config::{
    PlannerConfig, E_AXIS, MAX_EXTRUDERS, NUM_AXES, X_AXIS, Y_AXIS, Z_AXIS,
};
use crate::traits::{HotendMonitor, IdleServices, StepperLink};

use super::block::Block;
use super::lookahead;
use super::queue::BlockQueue;

/// One linear tool-path segment in user units
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MoveRequest {
    /// Absolute target position (mm)
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub e: f32,
    /// Requested feed rate (mm/s)
    pub feed_rate: f32,
    /// Extruder carrying out the E component
    pub extruder: u8,
}

impl MoveRequest {
    pub const fn new(x: f32, y: f32, z: f32, e: f32, feed_rate: f32, extruder: u8) -> Self {
        Self { x, y, z, e, feed_rate, extruder }
    }
}

/// Why an E component was consumed without motion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SuppressReason {
    /// Hotend below the minimum extrusion temperature
    ColdHotend,
    /// Single extrusion longer than the configured maximum
    OverlongSegment,
}

/// What became of a submission
///
/// The planner has no failure path; every request resolves to one of
/// these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubmitOutcome {
    /// Block enqueued and the plan reshaped
    Accepted,
    /// Segment rounded to too few steps; nothing queued, position kept
    Dropped,
    /// E component discarded by a safety interlock; `queued` tells
    /// whether a remaining XYZ component was still enqueued
    ExtrusionSuppressed { reason: SuppressReason, queued: bool },
}

/// Snapshot of which axes the queued plan still moves
///
/// Inputs for the idle axis-disable and fan services: counts of queued
/// blocks stepping each axis, and the fan state captured in the block
/// the stepper consumes next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AxesActivity {
    pub x_moves: u8,
    pub y_moves: u8,
    pub z_moves: u8,
    pub e_moves: u8,
    pub tail_extruder: Option<u8>,
    pub tail_fan_speed: Option<u8>,
}

/// The motion planner (producer side)
///
/// Owns the commanded position in absolute steps, the junction state of
/// the previous segment, and the configuration. Shares the block queue
/// with the stepper interrupt.
pub struct Planner<'q, const N: usize> {
    queue: &'q BlockQueue<N>,
    config: PlannerConfig,
    /// Commanded tool position in absolute steps
    position: [i32; NUM_AXES],
    /// Per-axis velocity vector of the last queued segment (mm/s)
    previous_speed: [f32; NUM_AXES],
    /// Nominal speed of the last queued segment (mm/s)
    previous_nominal_speed: f32,
    last_extruder: u8,
    allow_cold_extrude: bool,
    fan_speed: [u8; MAX_EXTRUDERS],
    /// Direction bits of the previous block, for the XY frequency limit
    old_direction_bits: u8,
    /// Segment-time windows keyed on X/Y direction changes (µs)
    x_window_us: [u32; 3],
    y_window_us: [u32; 3],
}

impl<'q, const N: usize> Planner<'q, N> {
    /// Create a planner over an (empty) block queue
    pub fn new(queue: &'q BlockQueue<N>, config: PlannerConfig) -> Self {
        // Seed the frequency windows above the threshold so the limit
        // cannot trip before three direction changes were seen
        let window_seed = config
            .xy_frequency_limit_hz
            .map(|hz| roundf(1_000_000.0 / hz) as u32 + 1)
            .unwrap_or(0);
        Self {
            queue,
            config,
            position: [0; NUM_AXES],
            previous_speed: [0.0; NUM_AXES],
            previous_nominal_speed: 0.0,
            last_extruder: 0,
            allow_cold_extrude: false,
            fan_speed: [0; MAX_EXTRUDERS],
            old_direction_bits: 0,
            x_window_us: [window_seed, 0, 0],
            y_window_us: [window_seed, 0, 0],
        }
    }

    /// Submit one linear segment
    ///
    /// Blocks while the queue is full, running the host's idle services
    /// between retests; this is the planner's only suspension point and
    /// the sole backpressure mechanism.
    pub fn submit<H>(&mut self, request: MoveRequest, host: &mut H) -> SubmitOutcome
    where
        H: StepperLink + IdleServices + HotendMonitor,
    {
        while self.queue.is_full() {
            host.poll();
        }

        let extruder = request.extruder as usize;
        let e_slot = E_AXIS + extruder;
        let steps_per_unit = self.config.axis_steps_per_unit;

        // Target position in absolute steps
        let mut target = [0i32; NUM_AXES];
        target[X_AXIS] = roundf(request.x * steps_per_unit[X_AXIS]) as i32;
        target[Y_AXIS] = roundf(request.y * steps_per_unit[Y_AXIS]) as i32;
        target[Z_AXIS] = roundf(request.z * steps_per_unit[Z_AXIS]) as i32;
        target[E_AXIS] = roundf(request.e * steps_per_unit[e_slot]) as i32;

        // Changing to an extruder with a different E scale rescales the
        // stored position, preserving the physical filament position
        // without emitting a move
        if request.extruder != self.last_extruder
            && steps_per_unit[e_slot] != steps_per_unit[E_AXIS + self.last_extruder as usize]
        {
            let factor =
                steps_per_unit[e_slot] / steps_per_unit[E_AXIS + self.last_extruder as usize];
            self.position[E_AXIS] = roundf(self.position[E_AXIS] as f32 * factor) as i32;
        }
        self.last_extruder = request.extruder;

        // Extrusion interlocks: consume the E component silently, keep
        // any XYZ motion
        let mut suppressed = None;
        if target[E_AXIS] != self.position[E_AXIS] {
            if let Some(min_temp) = self.config.extrude_min_temp {
                if host.hotend_celsius(request.extruder) < min_temp && !self.allow_cold_extrude {
                    self.position[E_AXIS] = target[E_AXIS];
                    suppressed = Some(SuppressReason::ColdHotend);
                    #[cfg(feature = "defmt")]
                    defmt::warn!("cold extrusion prevented");
                }
            }
            if let Some(max_length) = self.config.extrude_max_length {
                if (target[E_AXIS] - self.position[E_AXIS]).unsigned_abs() as f32
                    > steps_per_unit[E_AXIS] * max_length
                {
                    self.position[E_AXIS] = target[E_AXIS];
                    suppressed = Some(SuppressReason::OverlongSegment);
                    #[cfg(feature = "defmt")]
                    defmt::warn!("overlong extrusion prevented");
                }
            }
        }

        let mut block = Block::EMPTY;

        let mut steps = [0u32; NUM_AXES];
        for axis in 0..NUM_AXES {
            steps[axis] = (target[axis] - self.position[axis]).unsigned_abs();
        }
        steps[E_AXIS] = steps[E_AXIS] * self.config.extrude_multiply as u32 / 100;
        block.steps = steps;
        block.step_event_count = steps.iter().fold(0, |max, &count| max.max(count));

        if block.step_event_count <= self.config.drop_segments {
            return match suppressed {
                Some(reason) => SubmitOutcome::ExtrusionSuppressed { reason, queued: false },
                None => SubmitOutcome::Dropped,
            };
        }

        block.fan_speed = self.fan_speed[extruder];
        block.active_extruder = request.extruder;

        let mut direction_bits = 0u8;
        for axis in 0..NUM_AXES {
            if target[axis] < self.position[axis] {
                direction_bits |= 1 << axis;
            }
        }
        block.direction_bits = direction_bits;

        host.enable_axes(
            steps[X_AXIS] != 0,
            steps[Y_AXIS] != 0,
            steps[Z_AXIS] != 0,
            steps[E_AXIS] != 0,
        );

        let mut feed_rate = request.feed_rate;
        if steps[E_AXIS] == 0 {
            feed_rate = feed_rate.max(self.config.min_travel_feedrate);
            block.travel = true;
        } else {
            feed_rate = feed_rate.max(self.config.minimum_feedrate);
        }

        let mut delta_mm = [0f32; NUM_AXES];
        delta_mm[X_AXIS] = (target[X_AXIS] - self.position[X_AXIS]) as f32 / steps_per_unit[X_AXIS];
        delta_mm[Y_AXIS] = (target[Y_AXIS] - self.position[Y_AXIS]) as f32 / steps_per_unit[Y_AXIS];
        delta_mm[Z_AXIS] = (target[Z_AXIS] - self.position[Z_AXIS]) as f32 / steps_per_unit[Z_AXIS];
        delta_mm[E_AXIS] = (target[E_AXIS] - self.position[E_AXIS]) as f32 / steps_per_unit[e_slot]
            * self.config.extrude_multiply as f32
            / 100.0;

        // A block whose XYZ steps all round away only moves filament
        let drop_segments = self.config.drop_segments;
        let no_move = steps[X_AXIS] <= drop_segments
            && steps[Y_AXIS] <= drop_segments
            && steps[Z_AXIS] <= drop_segments;
        if no_move {
            block.millimeters = fabsf(delta_mm[E_AXIS]);
            if steps[E_AXIS] != 0 {
                if block.direction_is_negative(E_AXIS) {
                    block.retract = true;
                } else {
                    block.restore = true;
                }
            }
        } else {
            block.millimeters = sqrtf(
                delta_mm[X_AXIS] * delta_mm[X_AXIS]
                    + delta_mm[Y_AXIS] * delta_mm[Y_AXIS]
                    + delta_mm[Z_AXIS] * delta_mm[Z_AXIS],
            );
        }
        let inverse_millimeters = 1.0 / block.millimeters;
        let mut inverse_second = feed_rate * inverse_millimeters;
        let moves_queued = self.queue.depth();

        // Soft backpressure: when the queue is draining, stretch short
        // extruding segments so the stepper does not starve
        if self.config.slowdown
            && delta_mm[E_AXIS] != 0.0
            && delta_mm[Z_AXIS] == 0.0
            && (delta_mm[X_AXIS] != 0.0 || delta_mm[Y_AXIS] != 0.0)
            && moves_queued > 1
            && moves_queued < N / 2
        {
            let segment_time_us = roundf(1_000_000.0 / inverse_second) as u32;
            if segment_time_us < self.config.min_segment_time_us {
                let padding_us = roundf(
                    2.0 * (self.config.min_segment_time_us - segment_time_us) as f32
                        / moves_queued as f32,
                ) as u32;
                inverse_second = 1_000_000.0 / (segment_time_us + padding_us) as f32;
            }
        }

        block.nominal_speed = block.millimeters * inverse_second;
        block.nominal_rate = ceilf(block.step_event_count as f32 * inverse_second) as u32;

        // Clamp against per-axis feed ceilings; the E ceiling keeps
        // headroom for pressure advance
        let mut current_speed = [0f32; NUM_AXES];
        let mut speed_factor = 1.0f32;
        for axis in 0..3 {
            current_speed[axis] = delta_mm[axis] * inverse_second;
            if fabsf(current_speed[axis]) > self.config.max_feedrate[axis] {
                speed_factor = speed_factor
                    .min(self.config.max_feedrate[axis] / fabsf(current_speed[axis]));
            }
        }
        let comp_speed = self.config.comp_speed(extruder);
        if self.config.advance.is_some() {
            block.advance_step_rate = (steps_per_unit[e_slot] * comp_speed) as u32;
        }
        current_speed[E_AXIS] = delta_mm[E_AXIS] * inverse_second;
        if fabsf(current_speed[E_AXIS]) > self.config.max_feedrate[e_slot] - comp_speed {
            speed_factor = speed_factor.min(
                (self.config.max_feedrate[e_slot] - comp_speed) / fabsf(current_speed[E_AXIS]),
            );
        }

        // XY direction-change frequency limit
        if let Some(limit_hz) = self.config.xy_frequency_limit_hz {
            let max_freq_time_us = 1_000_000.0 / limit_hz;
            let direction_change = block.direction_bits ^ self.old_direction_bits;
            self.old_direction_bits = block.direction_bits;
            let segment_time_us = roundf(1_000_000.0 / inverse_second / speed_factor) as u32;

            if direction_change & (1 << X_AXIS) == 0 {
                self.x_window_us[0] = self.x_window_us[0].saturating_add(segment_time_us);
            } else {
                self.x_window_us[2] = self.x_window_us[1];
                self.x_window_us[1] = self.x_window_us[0];
                self.x_window_us[0] = segment_time_us;
            }
            if direction_change & (1 << Y_AXIS) == 0 {
                self.y_window_us[0] = self.y_window_us[0].saturating_add(segment_time_us);
            } else {
                self.y_window_us[2] = self.y_window_us[1];
                self.y_window_us[1] = self.y_window_us[0];
                self.y_window_us[0] = segment_time_us;
            }
            let max_x = self.x_window_us[0].max(self.x_window_us[1]).max(self.x_window_us[2]);
            let max_y = self.y_window_us[0].max(self.y_window_us[1]).max(self.y_window_us[2]);
            let min_xy = max_x.min(max_y);
            if (min_xy as f32) < max_freq_time_us {
                speed_factor = speed_factor.min(speed_factor * min_xy as f32 / max_freq_time_us);
            }
        }

        if speed_factor < 1.0 {
            for speed in &mut current_speed {
                *speed *= speed_factor;
            }
            block.nominal_speed *= speed_factor;
            block.nominal_rate = (block.nominal_rate as f32 * speed_factor) as u32;
        }

        // Acceleration for the trapezoid generator, clamped so no axis
        // exceeds its own step-space ceiling
        let steps_per_mm = block.step_event_count as f32 / block.millimeters;
        if no_move {
            block.acceleration_st =
                ceilf(self.config.retract_acceleration[extruder] * steps_per_mm) as u32;
        } else {
            block.acceleration_st = ceilf(self.config.acceleration * steps_per_mm) as u32;
            for axis in 0..NUM_AXES {
                let ceiling = self.config.step_accel_ceiling(axis, extruder);
                if block.acceleration_st as f32 * block.steps[axis] as f32
                    / block.step_event_count as f32
                    > ceiling
                {
                    block.acceleration_st = ceiling as u32;
                }
            }
        }
        block.acceleration = block.acceleration_st as f32 / steps_per_mm;
        block.acceleration_rate =
            roundf(block.acceleration_st as f32 * self.config.rate_scale()) as u32;

        // Junction policy: how fast may this block join the previous one
        if no_move {
            let safe_speed = self.config.max_e_jerk[extruder].min(block.nominal_speed);
            block.entry_speed = safe_speed;
            block.max_entry_speed = safe_speed;
            block.recalculate_flag = true;
        } else {
            let max_e_jerk = self.config.max_e_jerk[extruder];
            let mut vmax_junction = self.config.max_xy_jerk / 2.0;
            let mut vmax_junction_factor = 1.0f32;
            if fabsf(current_speed[Z_AXIS]) > self.config.max_z_jerk / 2.0 {
                vmax_junction = vmax_junction.min(self.config.max_z_jerk / 2.0);
            }
            if fabsf(current_speed[E_AXIS]) > max_e_jerk / 2.0 {
                vmax_junction = vmax_junction.min(max_e_jerk / 2.0);
            }
            vmax_junction = vmax_junction.min(block.nominal_speed);

            if moves_queued >= 1 && self.previous_nominal_speed > 0.0001 {
                let jerk = hypotf(
                    current_speed[X_AXIS] - self.previous_speed[X_AXIS],
                    current_speed[Y_AXIS] - self.previous_speed[Y_AXIS],
                );
                vmax_junction = block.nominal_speed;
                if jerk > self.config.max_xy_jerk {
                    vmax_junction_factor = self.config.max_xy_jerk / jerk;
                }
                let delta_z = fabsf(current_speed[Z_AXIS] - self.previous_speed[Z_AXIS]);
                if delta_z > self.config.max_z_jerk {
                    vmax_junction_factor = vmax_junction_factor.min(self.config.max_z_jerk / delta_z);
                }
                let delta_e = fabsf(current_speed[E_AXIS] - self.previous_speed[E_AXIS]);
                if delta_e + comp_speed > max_e_jerk {
                    // TODO: calibrate whether the compensation floor
                    // belongs inside the divisor here
                    vmax_junction_factor =
                        vmax_junction_factor.min(max_e_jerk / delta_e + comp_speed);
                }
                vmax_junction =
                    self.previous_nominal_speed.min(vmax_junction * vmax_junction_factor);
            }
            block.max_entry_speed = vmax_junction;

            // Highest entry from which the block can still brake down to
            // the minimum planner speed within its own length
            let minimum_planner_speed = self.config.minimum_planner_speed as f64;
            let v_allowable = libm::sqrt(
                minimum_planner_speed * minimum_planner_speed
                    + 2.0 * block.acceleration as f64 * block.millimeters as f64,
            );
            block.entry_speed = (vmax_junction as f64).min(v_allowable) as f32;

            if self.config.advance.is_some() {
                // Widen the compensation rate up to the jerk headroom
                let delta_e = fabsf(current_speed[E_AXIS] - self.previous_speed[E_AXIS]);
                if delta_e + comp_speed < max_e_jerk {
                    block.advance_step_rate =
                        (steps_per_unit[e_slot] * (max_e_jerk - delta_e)) as u32;
                }
            }

            block.nominal_length_flag = (block.nominal_speed as f64) <= v_allowable;
            block.recalculate_flag = true;
        }

        self.previous_speed = current_speed;
        self.previous_nominal_speed = block.nominal_speed;

        // Publish: every field is in place before the head advance
        // releases the block to the interrupt
        let published = self.queue.publish(&block);
        debug_assert!(published);
        self.position = target;

        lookahead::recalculate(self.queue, &self.config);
        host.wake();

        match suppressed {
            Some(reason) => SubmitOutcome::ExtrusionSuppressed { reason, queued: true },
            None => SubmitOutcome::Accepted,
        }
    }

    /// Rewrite the planner's notion of where the tool is
    ///
    /// Does not drain the queue. Junction state resets so the next
    /// block is planned as starting from rest; the stepper's own step
    /// counters are rewritten through the link.
    pub fn set_position<S: StepperLink>(
        &mut self,
        x: f32,
        y: f32,
        z: f32,
        e: f32,
        extruder: u8,
        stepper: &mut S,
    ) {
        let steps_per_unit = self.config.axis_steps_per_unit;
        self.position[X_AXIS] = roundf(x * steps_per_unit[X_AXIS]) as i32;
        self.position[Y_AXIS] = roundf(y * steps_per_unit[Y_AXIS]) as i32;
        self.position[Z_AXIS] = roundf(z * steps_per_unit[Z_AXIS]) as i32;
        self.position[E_AXIS] = roundf(e * steps_per_unit[E_AXIS + extruder as usize]) as i32;
        self.last_extruder = extruder;
        stepper.set_position(&self.position);
        self.previous_nominal_speed = 0.0;
        self.previous_speed = [0.0; NUM_AXES];
    }

    /// Rewrite the E position only
    pub fn set_e_position<S: StepperLink>(&mut self, e: f32, extruder: u8, stepper: &mut S) {
        self.position[E_AXIS] =
            roundf(e * self.config.axis_steps_per_unit[E_AXIS + extruder as usize]) as i32;
        self.last_extruder = extruder;
        stepper.set_e_position(self.position[E_AXIS]);
    }

    /// Number of blocks currently queued
    pub fn moves_planned(&self) -> usize {
        self.queue.depth()
    }

    /// Toggle the cold-extrusion interlock
    pub fn allow_cold_extrudes(&mut self, allow: bool) {
        self.allow_cold_extrude = allow;
    }

    /// Fan PWM captured into blocks submitted for this extruder
    pub fn set_fan_speed(&mut self, extruder: u8, pwm: u8) {
        self.fan_speed[extruder as usize] = pwm;
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Configuration is producer-owned; the gcode layer mutates it here
    pub fn config_mut(&mut self) -> &mut PlannerConfig {
        &mut self.config
    }

    /// Commanded position in absolute steps
    pub fn position_steps(&self) -> [i32; NUM_AXES] {
        self.position
    }

    /// Which axes the queued plan still moves, plus the tail fan state
    pub fn axes_activity(&self) -> AxesActivity {
        let mut activity = AxesActivity::default();
        self.queue.scan(|block| {
            if block.moves_axis(X_AXIS) {
                activity.x_moves = activity.x_moves.saturating_add(1);
            }
            if block.moves_axis(Y_AXIS) {
                activity.y_moves = activity.y_moves.saturating_add(1);
            }
            if block.moves_axis(Z_AXIS) {
                activity.z_moves = activity.z_moves.saturating_add(1);
            }
            if block.moves_axis(E_AXIS) {
                activity.e_moves = activity.e_moves.saturating_add(1);
            }
        });
        if let Some((extruder, fan)) = self
            .queue
            .with_tail(|block| (block.active_extruder, block.fan_speed))
        {
            activity.tail_extruder = Some(extruder);
            activity.tail_fan_speed = Some(fan);
        }
        activity
    }

    /// Highest planned extrusion speed among queued printing moves
    /// (mm/s); input to hotend temperature heuristics
    pub fn peak_extrusion_speed(&self) -> f32 {
        let mut highest = 0.0f32;
        self.queue.scan(|block| {
            if block.moves_axis(X_AXIS) || block.moves_axis(Y_AXIS) || block.moves_axis(Z_AXIS) {
                let speed =
                    block.steps[E_AXIS] as f32 / block.step_event_count as f32 * block.nominal_speed;
                highest = highest.max(speed);
            }
        });
        highest
    }

    /// Visit a copy of every queued block, oldest first
    pub fn for_each_planned(&self, f: impl FnMut(&Block)) {
        self.queue.scan(f);
    }
}

//! Trapezoid profile generation
//!
//! For each block the stepper needs the step indices where acceleration
//! ends and deceleration begins, plus the boundary step rates. Profiles
//! are constant-acceleration: the distance to change between two rates
//! is `(v₁² − v₀²) / 2a`, and when no cruise plateau fits the
//! acceleration is aborted at the intersection point
//! `(2ad − v₀² + v₁²) / 4a` so the exit rate is still met exactly.

use libm::{ceilf, floorf, sqrtf};

use super::block::{Block, MIN_STEP_RATE};

/// Computed profile for one block, in step space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct Trapezoid {
    pub initial_rate: u32,
    pub final_rate: u32,
    pub accelerate_until: u32,
    pub decelerate_after: u32,
    /// Rate actually reached while cruising: the nominal rate, or the
    /// cross-over rate of a triangle profile
    pub cruise_rate: u32,
}

/// Distance (steps) needed to go from `initial_rate` to `target_rate`
/// at the given acceleration (steps/s²)
pub(crate) fn acceleration_distance(initial_rate: f32, target_rate: f32, acceleration: f32) -> f32 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (target_rate * target_rate - initial_rate * initial_rate) / (2.0 * acceleration)
}

/// Point at which acceleration must stop so that decelerating at the
/// same rate reaches `final_rate` exactly after `distance` steps
pub(crate) fn intersection_distance(
    initial_rate: f32,
    final_rate: f32,
    acceleration: f32,
    distance: f32,
) -> f32 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (2.0 * acceleration * distance - initial_rate * initial_rate + final_rate * final_rate)
        / (4.0 * acceleration)
}

/// Highest speed at a point from which `target_velocity` is still
/// reachable over `distance` (pass a negative acceleration to describe
/// braking)
pub(crate) fn max_allowable_speed(acceleration: f32, target_velocity: f32, distance: f32) -> f32 {
    sqrtf(target_velocity * target_velocity - 2.0 * acceleration * distance)
}

/// Compute the trapezoid for a block, with entry and exit speeds given
/// as fractions of the nominal speed
///
/// Boundary rates are floored at [`MIN_STEP_RATE`] and the exit rate is
/// capped at the nominal rate. Phase lengths are clamped against
/// numerical round-off so they always partition `step_event_count`.
pub(crate) fn plan(block: &Block, entry_factor: f32, exit_factor: f32) -> Trapezoid {
    let nominal_rate = block.nominal_rate;
    let mut initial_rate = ceilf(nominal_rate as f32 * entry_factor) as u32;
    let mut final_rate = ceilf(nominal_rate as f32 * exit_factor) as u32;

    if initial_rate < MIN_STEP_RATE {
        initial_rate = MIN_STEP_RATE;
    }
    if final_rate < MIN_STEP_RATE {
        final_rate = MIN_STEP_RATE;
    }
    if final_rate > nominal_rate {
        final_rate = nominal_rate;
    }

    let acceleration = block.acceleration_st as f32;
    let steps = block.step_event_count as i64;
    let mut accelerate_steps = ceilf(acceleration_distance(
        initial_rate as f32,
        nominal_rate as f32,
        acceleration,
    )) as i64;
    let mut decelerate_steps = floorf(acceleration_distance(
        nominal_rate as f32,
        final_rate as f32,
        -acceleration,
    )) as i64;
    accelerate_steps = accelerate_steps.clamp(0, steps);
    decelerate_steps = decelerate_steps.clamp(0, steps);

    let mut cruise_rate = nominal_rate;
    let mut plateau_steps = steps - accelerate_steps - decelerate_steps;
    if plateau_steps < 0 {
        // No room to cruise: abort acceleration at the intersection so
        // the final rate is reached exactly at the end of the block
        accelerate_steps = ceilf(intersection_distance(
            initial_rate as f32,
            final_rate as f32,
            acceleration,
            steps as f32,
        )) as i64;
        accelerate_steps = accelerate_steps.clamp(0, steps);
        cruise_rate = sqrtf(
            initial_rate as f32 * initial_rate as f32
                + 2.0 * acceleration * accelerate_steps as f32,
        ) as u32;
        plateau_steps = 0;
    }

    Trapezoid {
        initial_rate,
        final_rate,
        accelerate_until: accelerate_steps as u32,
        decelerate_after: (accelerate_steps + plateau_steps) as u32,
        cruise_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_for(step_event_count: u32, nominal_rate: u32, acceleration_st: u32) -> Block {
        let mut block = Block::EMPTY;
        block.step_event_count = step_event_count;
        block.nominal_rate = nominal_rate;
        block.acceleration_st = acceleration_st;
        block
    }

    #[test]
    fn test_acceleration_distance() {
        // 800 -> 4800 steps/s at 240000 steps/s² takes 46.67 steps
        let d = acceleration_distance(800.0, 4800.0, 240_000.0);
        assert!((d - 46.666_668).abs() < 1e-2);
        assert_eq!(acceleration_distance(100.0, 200.0, 0.0), 0.0);
    }

    #[test]
    fn test_max_allowable_speed_braking() {
        // Decelerating to 0.05 mm/s over 10 mm at 3000 mm/s²
        let v = max_allowable_speed(-3000.0, 0.05, 10.0);
        assert!((v - 244.949).abs() < 1e-2);
    }

    #[test]
    fn test_full_trapezoid_partition() {
        let block = block_for(800, 4800, 240_000);
        let trapezoid = plan(&block, 0.25, 0.02);
        assert_eq!(trapezoid.initial_rate, 1200);
        assert_eq!(trapezoid.final_rate, 120);
        // ceil((4800² − 1200²) / 2·240000) and floor((4800² − 120²) / 2·240000)
        assert_eq!(trapezoid.accelerate_until, 45);
        assert_eq!(trapezoid.decelerate_after, 753);
        assert_eq!(trapezoid.cruise_rate, 4800);
    }

    #[test]
    fn test_triangle_fallback() {
        // Too short to reach nominal: 50 steps needs 48 + 47 to ramp
        let block = block_for(50, 4800, 240_000);
        let trapezoid = plan(&block, 120.0 / 4800.0, 120.0 / 4800.0);
        assert_eq!(trapezoid.accelerate_until, 25);
        assert_eq!(trapezoid.decelerate_after, 25);
        assert!(trapezoid.cruise_rate > trapezoid.initial_rate);
        assert!(trapezoid.cruise_rate < block.nominal_rate);
        // Cross-over rate: sqrt(120² + 2·240000·25)
        assert_eq!(trapezoid.cruise_rate, 3466);
    }

    #[test]
    fn test_rate_floor() {
        let block = block_for(800, 4800, 240_000);
        let trapezoid = plan(&block, 0.0001, 0.0001);
        assert_eq!(trapezoid.initial_rate, MIN_STEP_RATE);
        assert_eq!(trapezoid.final_rate, MIN_STEP_RATE);
    }

    #[test]
    fn test_exit_rate_capped_at_nominal() {
        let block = block_for(800, 4800, 240_000);
        let trapezoid = plan(&block, 1.0, 2.0);
        assert_eq!(trapezoid.final_rate, 4800);
    }

    #[test]
    fn test_phases_always_partition() {
        for &(steps, rate, accel) in &[
            (10u32, 4800u32, 240_000u32),
            (800, 4800, 240_000),
            (3, 150, 1000),
            (10_000, 120_000, 500_000),
        ] {
            let block = block_for(steps, rate, accel);
            for &(entry, exit) in &[(0.1f32, 0.9f32), (1.0, 1.0), (0.001, 0.001), (0.5, 0.2)] {
                let t = plan(&block, entry, exit);
                assert!(t.accelerate_until <= t.decelerate_after);
                assert!(t.decelerate_after <= steps);
            }
        }
    }
}

//! Filament pressure-advance compensation
//!
//! Extruder-side feed-forward that raises or lowers the E rate to
//! counter filament elasticity. The calibration table is piecewise
//! linear over extrusion speed in millimeter units; evaluation happens
//! in E-step space at the block's entry, cruise and exit rates.

use libm::floorf;

use crate::config::{AdvanceTable, X_AXIS, Y_AXIS};

use super::block::Block;

/// Whether a block carries fresh compensation values
///
/// Only blocks that move X or Y while pushing filament forward do; all
/// other blocks carry their predecessor's compensation unchanged.
pub(crate) fn applies_to(block: &Block, drop_segments: u32) -> bool {
    (block.steps[X_AXIS] > drop_segments || block.steps[Y_AXIS] > drop_segments)
        && block.extrudes_forward()
}

/// Evaluate the compensation table at three E step rates (steps/s)
///
/// Table bounds are scaled into step space by `steps_per_mm_e`.
/// Between two entries the compensation interpolates linearly; above
/// the highest entry it clamps to that entry's value. Rates below the
/// lowest entry interpolate down to zero.
pub(crate) fn eval_table(table: &AdvanceTable, steps_per_mm_e: f32, rates: [f32; 3]) -> [i32; 3] {
    let mut compensation = [0i32; 3];
    let mut low_bound = 0.0f32;
    let mut low_comp = 0.0f32;

    for point in &table.points {
        if rates.iter().all(|&rate| rate < low_bound) {
            break;
        }
        let high_bound = point.rate_mm_s * steps_per_mm_e;
        let high_comp = point.advance_mm * steps_per_mm_e;
        if high_bound <= low_bound {
            continue;
        }
        let slope = (low_comp - high_comp) / (low_bound - high_bound);
        let offset =
            (high_bound * low_comp - low_bound * high_comp) / (high_bound - low_bound);
        for (comp, &rate) in compensation.iter_mut().zip(rates.iter()) {
            if rate >= low_bound && rate < high_bound {
                *comp = floorf(slope * rate + offset) as i32;
            } else if rate > high_bound {
                *comp = floorf(high_comp) as i32;
            }
        }
        low_bound = high_bound;
        low_comp = high_comp;
    }

    compensation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdvancePoint, E_AXIS};

    fn table() -> AdvanceTable {
        let mut table = AdvanceTable::default();
        table.points.push(AdvancePoint { rate_mm_s: 5.0, advance_mm: 0.1 }).unwrap();
        table.points.push(AdvancePoint { rate_mm_s: 10.0, advance_mm: 0.3 }).unwrap();
        table.min_speed = 0.5;
        table
    }

    #[test]
    fn test_empty_table_gives_zero() {
        let table = AdvanceTable::default();
        assert_eq!(eval_table(&table, 100.0, [100.0, 600.0, 2000.0]), [0, 0, 0]);
    }

    #[test]
    fn test_interpolation_segments() {
        // Bounds in step space: 500 -> 10 steps, 1000 -> 30 steps
        let table = table();
        // First segment interpolates from (0, 0) to (500, 10)
        assert_eq!(eval_table(&table, 100.0, [100.0, 100.0, 100.0])[0], 2);
        // Second segment from (500, 10) to (1000, 30)
        assert_eq!(eval_table(&table, 100.0, [600.0, 600.0, 600.0])[1], 14);
        // Near-zero rates compensate to zero
        assert_eq!(eval_table(&table, 100.0, [15.0, 15.0, 15.0])[2], 0);
    }

    #[test]
    fn test_clamp_above_highest_entry() {
        let table = table();
        assert_eq!(eval_table(&table, 100.0, [2000.0, 1500.0, 1200.0]), [30, 30, 30]);
    }

    #[test]
    fn test_mixed_rates() {
        let table = table();
        assert_eq!(eval_table(&table, 100.0, [100.0, 600.0, 15.0]), [2, 14, 0]);
    }

    #[test]
    fn test_applies_only_to_forward_xy_extrusion() {
        let mut block = Block::EMPTY;
        block.steps[X_AXIS] = 800;
        assert!(!applies_to(&block, 5), "travel move");

        block.steps[E_AXIS] = 100;
        assert!(applies_to(&block, 5), "forward extrusion with XY motion");

        block.direction_bits |= 1 << E_AXIS;
        assert!(!applies_to(&block, 5), "retracting");

        block.direction_bits = 0;
        block.steps[X_AXIS] = 0;
        assert!(!applies_to(&block, 5), "extruder-only move");
    }
}

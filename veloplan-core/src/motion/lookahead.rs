//! Look-ahead replanning
//!
//! After every accepted submission the whole plan is reconsidered:
//!
//! 1. A reverse pass walks the queue backward from the head and raises
//!    each block's entry speed as far as deceleration to its successor
//!    allows, never above the junction ceiling.
//! 2. A forward pass walks tail to head and lowers entry speeds the
//!    predecessor cannot accelerate up to.
//! 3. A trapezoid sweep regenerates the profile of every block whose
//!    entry or exit junction changed. The newest block always
//!    decelerates to the minimum planner speed.
//!
//! Both passes run on the producer; the interrupt only ever observes
//! finished trapezoids because the sweep writes under a critical
//! section and leaves claimed blocks alone.

use crate::config::{PlannerConfig, E_AXIS};

use super::advance;
use super::queue::BlockQueue;
use super::trapezoid;

/// Replan the whole queue after a submission
pub(crate) fn recalculate<const N: usize>(queue: &BlockQueue<N>, config: &PlannerConfig) {
    reverse_pass(queue);
    forward_pass(queue);
    recalculate_trapezoids(queue, config);
}

/// Reverse pass: propagate deceleration feasibility from newer blocks
/// to older ones
///
/// Runs only when more than three blocks are queued; with fewer there
/// is nothing useful to look ahead over. The sliding window skips the
/// newest block (its exit is pinned by the sweep) and never touches the
/// tail block, which the stepper may be executing.
fn reverse_pass<const N: usize>(queue: &BlockQueue<N>) {
    let head = queue.head_index();
    let tail = queue.tail_snapshot();
    if head.wrapping_sub(tail) & (N - 1) <= 3 {
        return;
    }

    let mut index = head;
    let mut loaded: Option<usize> = None;
    let mut current: Option<usize> = None;
    while index != tail {
        index = BlockQueue::<N>::prev_index(index);
        let next = current;
        current = loaded;
        loaded = Some(index);
        if let (Some(cur), Some(nxt)) = (current, next) {
            reverse_kernel(queue, cur, nxt);
        }
    }
}

fn reverse_kernel<const N: usize>(queue: &BlockQueue<N>, cur: usize, nxt: usize) {
    queue.with_blocks_mut(|blocks| {
        let next_entry = blocks[nxt].entry_speed;
        let block = &mut blocks[cur];
        // Saturated blocks are already as fast as the junction allows
        if block.entry_speed == block.max_entry_speed {
            return;
        }
        if !block.nominal_length_flag && block.max_entry_speed > next_entry {
            block.entry_speed = block.max_entry_speed.min(trapezoid::max_allowable_speed(
                -block.acceleration,
                next_entry,
                block.millimeters,
            ));
        } else {
            block.entry_speed = block.max_entry_speed;
        }
        block.recalculate_flag = true;
    });
}

/// Forward pass: lower entry speeds the predecessor cannot reach
///
/// The window trails one block behind the walk, so the tail block is
/// never recomputed and the newest block is handled by the trailing
/// kernel call after the loop.
fn forward_pass<const N: usize>(queue: &BlockQueue<N>) {
    let head = queue.head_index();
    let tail = queue.tail_snapshot();

    let mut previous: Option<usize> = None;
    let mut current: Option<usize> = None;
    let mut loaded: Option<usize> = None;
    let mut index = tail;
    while index != head {
        previous = current;
        current = loaded;
        loaded = Some(index);
        if let (Some(prev), Some(cur)) = (previous, current) {
            forward_kernel(queue, prev, cur);
        }
        index = BlockQueue::<N>::next_index(index);
    }
    if let (Some(prev), Some(cur)) = (current, loaded) {
        forward_kernel(queue, prev, cur);
    }
}

fn forward_kernel<const N: usize>(queue: &BlockQueue<N>, prev: usize, cur: usize) {
    queue.with_blocks_mut(|blocks| {
        let previous = blocks[prev];
        // A full-length predecessor always reaches its junction speed
        if previous.nominal_length_flag {
            return;
        }
        let block = &mut blocks[cur];
        if previous.entry_speed < block.entry_speed {
            let reachable = libm::sqrt(
                previous.entry_speed as f64 * previous.entry_speed as f64
                    + 2.0 * previous.acceleration as f64 * previous.millimeters as f64,
            );
            let entry = (block.entry_speed as f64).min(reachable) as f32;
            if block.entry_speed != entry {
                block.entry_speed = entry;
                block.recalculate_flag = true;
            }
        }
    });
}

/// Regenerate trapezoids for blocks whose junctions changed
fn recalculate_trapezoids<const N: usize>(queue: &BlockQueue<N>, config: &PlannerConfig) {
    let head = queue.head_index();
    let tail = queue.tail_snapshot();
    let advance_enabled = config.advance.is_some();

    let mut previous: Option<usize> = None;
    let mut current: Option<usize> = None;
    let mut loaded: Option<usize> = None;
    let mut index = tail;
    while index != head {
        previous = current;
        current = loaded;
        loaded = Some(index);
        if let (Some(cur), Some(nxt)) = (current, loaded) {
            let current_flag = queue.read_block(cur).recalculate_flag;
            let next_flag = queue.read_block(nxt).recalculate_flag;
            if current_flag || next_flag {
                if advance_enabled {
                    if let Some(prev) = previous {
                        let carried = queue.read_block(prev).final_advance;
                        queue.with_block_mut(cur, |b| b.prev_advance = carried);
                    }
                }
                let (entry_factor, exit_factor) = {
                    let current_block = queue.read_block(cur);
                    let next_block = queue.read_block(nxt);
                    (
                        current_block.entry_speed / current_block.nominal_speed,
                        next_block.entry_speed / current_block.nominal_speed,
                    )
                };
                retrapezoid(queue, config, cur, entry_factor, exit_factor);
                // Reset current only, so the successor still recomputes
                queue.with_block_mut(cur, |b| b.recalculate_flag = false);
                if advance_enabled {
                    if let Some(prev) = previous {
                        let entry_advance = queue.read_block(cur).initial_advance;
                        queue.with_block_mut(prev, |b| {
                            if b.next_advance != entry_advance {
                                b.next_advance = entry_advance;
                            }
                        });
                    }
                }
            }
        }
        index = BlockQueue::<N>::next_index(index);
    }

    // Newest block: exit pinned to the minimum planner speed, always
    // recomputed
    if let Some(last) = loaded {
        if advance_enabled {
            if let Some(cur) = current {
                let carried = queue.read_block(cur).final_advance;
                queue.with_block_mut(last, |b| b.prev_advance = carried);
            }
        }
        let last_block = queue.read_block(last);
        retrapezoid(
            queue,
            config,
            last,
            last_block.entry_speed / last_block.nominal_speed,
            config.minimum_planner_speed / last_block.nominal_speed,
        );
        queue.with_block_mut(last, |b| b.recalculate_flag = false);
        if advance_enabled {
            if let Some(cur) = current {
                let entry_advance = queue.read_block(last).initial_advance;
                queue.with_block_mut(cur, |b| b.next_advance = entry_advance);
            }
        }
    }
}

/// Recompute one block's trapezoid and, when fitted, its compensation
fn retrapezoid<const N: usize>(
    queue: &BlockQueue<N>,
    config: &PlannerConfig,
    index: usize,
    entry_factor: f32,
    exit_factor: f32,
) {
    let block = queue.read_block(index);
    let trapezoid = trapezoid::plan(&block, entry_factor, exit_factor);
    let advances = config.advance.as_ref().map(|adv| {
        if advance::applies_to(&block, config.drop_segments) {
            let extruder = block.active_extruder as usize;
            let e_factor = block.steps[E_AXIS] as f32 / block.step_event_count as f32;
            advance::eval_table(
                &adv.per_extruder[extruder],
                config.axis_steps_per_unit[E_AXIS + extruder],
                [
                    trapezoid.initial_rate as f32 * e_factor,
                    trapezoid.cruise_rate as f32 * e_factor,
                    trapezoid.final_rate as f32 * e_factor,
                ],
            )
        } else {
            [block.prev_advance; 3]
        }
    });
    queue.apply_trapezoid(index, &trapezoid, advances);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::X_AXIS;
    use crate::motion::block::Block;

    // 0.1 mm X move at 60 mm/s nominal with 3000 mm/s² acceleration
    fn short_block(entry_speed: f32, max_entry_speed: f32) -> Block {
        let mut block = Block::EMPTY;
        block.steps[X_AXIS] = 8;
        block.step_event_count = 8;
        block.millimeters = 0.1;
        block.nominal_speed = 60.0;
        block.nominal_rate = 4800;
        block.acceleration = 3000.0;
        block.acceleration_st = 240_000;
        block.entry_speed = entry_speed;
        block.max_entry_speed = max_entry_speed;
        block.recalculate_flag = true;
        block
    }

    fn planned(queue: &BlockQueue<16>) -> std::vec::Vec<Block> {
        let mut blocks = std::vec::Vec::new();
        queue.scan(|b| blocks.push(*b));
        blocks
    }

    #[test]
    fn test_passes_propagate_feasible_entries() {
        let queue: BlockQueue<16> = BlockQueue::new();
        let config = PlannerConfig::default();
        // Four blocks too short to stop within themselves, then a slow
        // newest block
        for _ in 0..4 {
            queue.publish(&short_block(24.49, 60.0));
        }
        queue.publish(&short_block(2.0, 2.0));

        recalculate(&queue, &config);

        let blocks = planned(&queue);
        // Newest block is skipped by both passes
        assert!((blocks[4].entry_speed - 2.0).abs() < 1e-3);
        // Tail block is never touched
        assert!((blocks[0].entry_speed - 24.49).abs() < 1e-3);
        // Every junction is reachable under constant acceleration
        for pair in blocks.windows(2) {
            let reachable_sq = pair[0].entry_speed * pair[0].entry_speed
                + 2.0 * pair[0].acceleration * pair[0].millimeters;
            assert!(
                pair[1].entry_speed * pair[1].entry_speed <= reachable_sq + 1e-2,
                "entry {} unreachable from {}",
                pair[1].entry_speed,
                pair[0].entry_speed
            );
        }
        // And deceleration into the slow block is feasible
        let decel_sq = blocks[4].entry_speed * blocks[4].entry_speed
            + 2.0 * blocks[3].acceleration * blocks[3].millimeters;
        assert!(blocks[3].entry_speed * blocks[3].entry_speed <= decel_sq + 1e-2);
    }

    #[test]
    fn test_sweep_clears_flags_and_fills_trapezoids() {
        let queue: BlockQueue<16> = BlockQueue::new();
        let config = PlannerConfig::default();
        for _ in 0..5 {
            queue.publish(&short_block(24.49, 60.0));
        }

        recalculate(&queue, &config);

        for block in planned(&queue) {
            assert!(!block.recalculate_flag);
            assert!(block.initial_rate >= crate::motion::MIN_STEP_RATE);
            assert!(block.final_rate >= crate::motion::MIN_STEP_RATE);
            let (accel, plateau, decel) = block.phase_lengths();
            assert_eq!(accel + plateau + decel, block.step_event_count);
        }
    }

    #[test]
    fn test_saturated_queue_stays_at_nominal() {
        let queue: BlockQueue<16> = BlockQueue::new();
        let config = PlannerConfig::default();
        // Long blocks that can stop within their own length keep their
        // junction speeds
        for _ in 0..5 {
            let mut block = short_block(60.0, 60.0);
            block.steps[X_AXIS] = 800;
            block.step_event_count = 800;
            block.millimeters = 10.0;
            block.nominal_length_flag = true;
            queue.publish(&block);
        }

        recalculate(&queue, &config);

        for block in planned(&queue) {
            assert!((block.entry_speed - 60.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_shallow_queue_skips_reverse_pass() {
        let queue: BlockQueue<16> = BlockQueue::new();
        let config = PlannerConfig::default();
        queue.publish(&short_block(5.0, 60.0));
        queue.publish(&short_block(2.0, 2.0));

        recalculate(&queue, &config);

        let blocks = planned(&queue);
        // Depth 2: reverse pass does not run, entries are untouched
        assert!((blocks[0].entry_speed - 5.0).abs() < 1e-3);
        assert!((blocks[1].entry_speed - 2.0).abs() < 1e-3);
    }
}

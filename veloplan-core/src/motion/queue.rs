//! Block ring buffer
//!
//! Fixed-capacity single-producer/single-consumer ring shared between
//! the planner (producer, advances `head`) and the stepper interrupt
//! (consumer, advances `tail`). Capacity must be a power of two so
//! indices wrap with a mask.
//!
//! The index words carry release/acquire ordering: the producer
//! publishes a block by storing `head` with release after all fields are
//! written, the consumer frees a slot by storing `tail` with release.
//! The block storage itself sits behind a critical-section mutex, and
//! every multi-field access happens inside one short section. Trajectory
//! fields of the block the stepper has claimed (`busy`) are never
//! rewritten.

use core::cell::RefCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use critical_section::Mutex;

use super::block::Block;
use super::trapezoid::Trapezoid;

/// Single-producer/single-consumer ring of motion blocks
///
/// `N` is the compile-time capacity and must be a power of two. One slot
/// is kept free to distinguish full from empty, so at most `N - 1`
/// blocks are queued at a time.
pub struct BlockQueue<const N: usize> {
    blocks: Mutex<RefCell<[Block; N]>>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl<const N: usize> BlockQueue<N> {
    /// Create an empty queue
    ///
    /// `const` so a queue can live in a `static` shared with the
    /// interrupt handler.
    pub const fn new() -> Self {
        assert!(N.is_power_of_two());
        Self {
            blocks: Mutex::new(RefCell::new([Block::EMPTY; N])),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub(crate) fn next_index(index: usize) -> usize {
        (index + 1) & (N - 1)
    }

    pub(crate) fn prev_index(index: usize) -> usize {
        index.wrapping_sub(1) & (N - 1)
    }

    /// Number of queued blocks, including one the stepper may be executing
    pub fn depth(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & (N - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn is_full(&self) -> bool {
        Self::next_index(self.head.load(Ordering::Relaxed)) == self.tail.load(Ordering::Acquire)
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Producer-owned head index (no one else writes it)
    pub(crate) fn head_index(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }

    /// Local copy of the consumer's tail index
    ///
    /// The interrupt can advance `tail` at any moment, so callers walk
    /// the plan against this snapshot. A block freed mid-walk is only
    /// ever written harmlessly: its slot cannot be reused until the
    /// producer itself advances `head`.
    pub(crate) fn tail_snapshot(&self) -> usize {
        critical_section::with(|_| self.tail.load(Ordering::Acquire))
    }

    /// Write a block at the head slot and publish it
    ///
    /// Producer context only. Returns `false` without writing when the
    /// queue is full.
    pub(crate) fn publish(&self, block: &Block) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = Self::next_index(head);
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        critical_section::with(|cs| {
            self.blocks.borrow_ref_mut(cs)[head] = *block;
        });
        self.head.store(next, Ordering::Release);
        true
    }

    /// Run `f` on the block at the tail, if any
    ///
    /// Consumer-side accessor; also used for late-bound reads such as
    /// the advance hand-off value just before `advance_tail`.
    pub fn with_tail<R>(&self, f: impl FnOnce(&Block) -> R) -> Option<R> {
        critical_section::with(|cs| {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Relaxed);
            if head == tail {
                return None;
            }
            Some(f(&self.blocks.borrow_ref(cs)[tail]))
        })
    }

    /// Claim the tail block for execution
    ///
    /// Sets `busy` under a critical section and returns a copy for the
    /// interrupt to execute. Once claimed, the planner will not touch
    /// the block's trajectory fields, so the copy stays valid; only
    /// `next_advance` may still change and must be re-read through
    /// [`Self::with_tail`] at block completion.
    pub fn mark_busy(&self) -> Option<Block> {
        critical_section::with(|cs| {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Relaxed);
            if head == tail {
                return None;
            }
            let mut blocks = self.blocks.borrow_ref_mut(cs);
            blocks[tail].busy = true;
            Some(blocks[tail])
        })
    }

    /// Free the tail block after execution
    pub fn advance_tail(&self) {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if head == tail {
            return;
        }
        self.tail.store(Self::next_index(tail), Ordering::Release);
    }

    /// Copy out one block
    pub(crate) fn read_block(&self, index: usize) -> Block {
        critical_section::with(|cs| self.blocks.borrow_ref(cs)[index])
    }

    /// Mutate one block under a critical section
    pub(crate) fn with_block_mut<R>(&self, index: usize, f: impl FnOnce(&mut Block) -> R) -> R {
        critical_section::with(|cs| f(&mut self.blocks.borrow_ref_mut(cs)[index]))
    }

    /// Mutate the whole storage under one critical section
    ///
    /// Kept for the look-ahead kernels, which need a neighbour read and
    /// a block write to be atomic with respect to the interrupt.
    pub(crate) fn with_blocks_mut<R>(&self, f: impl FnOnce(&mut [Block; N]) -> R) -> R {
        critical_section::with(|cs| f(&mut *self.blocks.borrow_ref_mut(cs)))
    }

    /// Install a freshly computed trapezoid into a block
    ///
    /// The write is skipped entirely when the stepper has already
    /// claimed the block; its trajectory is then owned by the interrupt.
    pub(crate) fn apply_trapezoid(
        &self,
        index: usize,
        trapezoid: &Trapezoid,
        advances: Option<[i32; 3]>,
    ) {
        critical_section::with(|cs| {
            let mut blocks = self.blocks.borrow_ref_mut(cs);
            let block = &mut blocks[index];
            if block.busy {
                return;
            }
            block.accelerate_until = trapezoid.accelerate_until;
            block.decelerate_after = trapezoid.decelerate_after;
            block.initial_rate = trapezoid.initial_rate;
            block.final_rate = trapezoid.final_rate;
            if let Some([initial, target, fin]) = advances {
                block.initial_advance = initial;
                block.target_advance = target;
                block.final_advance = fin;
            }
        });
    }

    /// Visit a copy of every queued block, tail to head
    pub fn scan(&self, mut f: impl FnMut(&Block)) {
        let head = self.head.load(Ordering::Acquire);
        let mut index = self.tail_snapshot();
        while index != head {
            let block = self.read_block(index);
            f(&block);
            index = Self::next_index(index);
        }
    }
}

impl<const N: usize> Default for BlockQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::vec::Vec;

    fn block_with_count(step_event_count: u32) -> Block {
        let mut block = Block::EMPTY;
        block.step_event_count = step_event_count;
        block
    }

    #[test]
    fn test_new_queue_is_empty() {
        let queue: BlockQueue<16> = BlockQueue::new();
        assert!(queue.is_empty());
        assert!(!queue.is_full());
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.capacity(), 16);
    }

    #[test]
    fn test_index_wrapping() {
        assert_eq!(BlockQueue::<8>::next_index(7), 0);
        assert_eq!(BlockQueue::<8>::prev_index(0), 7);
        assert_eq!(BlockQueue::<8>::next_index(3), 4);
    }

    #[test]
    fn test_fills_to_capacity_minus_one() {
        let queue: BlockQueue<8> = BlockQueue::new();
        for i in 0..7 {
            assert!(queue.publish(&block_with_count(i + 1)), "slot {i}");
        }
        assert!(queue.is_full());
        assert!(!queue.publish(&block_with_count(99)));
        assert_eq!(queue.depth(), 7);
    }

    #[test]
    fn test_consume_in_order() {
        let queue: BlockQueue<8> = BlockQueue::new();
        for i in 1..=3 {
            queue.publish(&block_with_count(i));
        }
        for expected in 1..=3 {
            let claimed = queue.mark_busy().unwrap();
            assert_eq!(claimed.step_event_count, expected);
            assert!(claimed.busy);
            queue.advance_tail();
        }
        assert!(queue.is_empty());
        assert!(queue.mark_busy().is_none());
    }

    #[test]
    fn test_with_tail_sees_oldest() {
        let queue: BlockQueue<8> = BlockQueue::new();
        assert!(queue.with_tail(|_| ()).is_none());
        queue.publish(&block_with_count(11));
        queue.publish(&block_with_count(22));
        assert_eq!(queue.with_tail(|b| b.step_event_count), Some(11));
    }

    #[test]
    fn test_busy_block_keeps_trapezoid() {
        let queue: BlockQueue<8> = BlockQueue::new();
        let mut block = block_with_count(100);
        block.initial_rate = 500;
        queue.publish(&block);
        queue.mark_busy();

        let trapezoid = Trapezoid {
            initial_rate: 900,
            final_rate: 900,
            accelerate_until: 1,
            decelerate_after: 2,
            cruise_rate: 900,
        };
        queue.apply_trapezoid(0, &trapezoid, None);
        assert_eq!(queue.read_block(0).initial_rate, 500);

        // A non-busy block does take the update
        queue.publish(&block);
        queue.apply_trapezoid(1, &trapezoid, None);
        assert_eq!(queue.read_block(1).initial_rate, 900);
    }

    #[test]
    fn test_scan_visits_tail_to_head() {
        let queue: BlockQueue<8> = BlockQueue::new();
        for i in 1..=4 {
            queue.publish(&block_with_count(i * 10));
        }
        let mut seen = Vec::new();
        queue.scan(|b| seen.push(b.step_event_count));
        assert_eq!(seen, [10, 20, 30, 40]);
    }

    #[test]
    fn test_wraparound_reuses_slots() {
        let queue: BlockQueue<4> = BlockQueue::new();
        for round in 0..10 {
            assert!(queue.publish(&block_with_count(round + 1)));
            assert_eq!(queue.mark_busy().unwrap().step_event_count, round + 1);
            queue.advance_tail();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let queue: BlockQueue<16> = BlockQueue::new();
        let total = 500u32;

        thread::scope(|scope| {
            let consumer = scope.spawn(|| {
                let mut received = Vec::new();
                while received.len() < total as usize {
                    if let Some(block) = queue.mark_busy() {
                        received.push(block.step_event_count);
                        queue.advance_tail();
                    } else {
                        thread::yield_now();
                    }
                }
                received
            });

            for i in 1..=total {
                let block = block_with_count(i);
                while !queue.publish(&block) {
                    thread::yield_now();
                }
            }

            let received = consumer.join().unwrap();
            let expected: Vec<u32> = (1..=total).collect();
            assert_eq!(received, expected);
        });
    }
}

//! Sequence-number arithmetic for the frame ring.
//!
//! A frame is addressed by its absolute sequence number, the value of the
//! frame counter when it was written. The physical slot is the sequence
//! masked by the ring size. With the counter at `k`, sequence `k` is the
//! slot being written, and sequences older than `k - (NUM_FRAMES - 1)`
//! share a slot with it or with something newer.

/// Number of frames the buffer can hold, as a power of two
pub const NUM_FRAMES_LOG2: u32 = 5;
pub const NUM_FRAMES: usize = 1 << NUM_FRAMES_LOG2;
pub const RING_MASK: u64 = NUM_FRAMES as u64 - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Published and not yet overwritten.
    Readable(usize),
    /// Not published yet, possibly being written right now.
    Pending,
    /// Overwritten, or about to be. `behind` is `counter - sequence`.
    Stale { behind: u64 },
}

#[inline(always)]
pub const fn slot_index(sequence: u64) -> usize {
    (sequence & RING_MASK) as usize
}

/// Decide what a reader that observed `counter` may do with `sequence`.
pub fn slot_state(sequence: u64, counter: u64) -> SlotState {
    if sequence >= counter {
        return SlotState::Pending;
    }
    let behind = counter - sequence;
    if behind >= NUM_FRAMES as u64 {
        SlotState::Stale { behind }
    } else {
        SlotState::Readable(slot_index(sequence))
    }
}

/// Oldest sequence still readable when the counter is at `counter`.
pub fn oldest_readable(counter: u64) -> u64 {
    counter.saturating_sub(NUM_FRAMES as u64 - 1)
}

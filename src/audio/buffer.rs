//! # Sequenced Turn Buffer
//!
//! Holds the chunks of one turn in arrival order even when their decodes
//! finish out of order.
//!
//! ## How ordering is kept:
//! - When an audio event is dispatched, a slot is **reserved** with the next
//!   sequence number, before any decoding happens.
//! - When the decode finishes, the slot is **filled** (or marked dropped if the
//!   decode failed).
//! - Readers only ever see the **contiguous resolved prefix**: a chunk is not
//!   released while an earlier slot is still pending.
//!
//! The buffer keeps a read cursor so the playback path can take newly released
//! chunks incrementally while the turn is still streaming.

use crate::audio::chunk::AudioChunk;
use std::collections::BTreeMap;

/// State of one reserved position in the turn.
#[derive(Debug, Clone)]
enum Slot {
    /// Decode still in flight
    Pending,
    /// Decoded audio ready for playback
    Ready(AudioChunk),
    /// Decode failed; the position resolves with no audio
    Dropped,
}

/// Ordered chunk storage for a single turn.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    slots: BTreeMap<u64, Slot>,
    next_seq: u64,
    /// Next sequence number to hand to the reader
    cursor: u64,
}

impl TurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next position and return its sequence number.
    pub fn reserve(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(seq, Slot::Pending);
        seq
    }

    /// Fill a reserved position. Returns false for unknown or already resolved positions.
    pub fn fill(&mut self, seq: u64, chunk: AudioChunk) -> bool {
        match self.slots.get_mut(&seq) {
            Some(slot) if matches!(slot, Slot::Pending) => {
                *slot = Slot::Ready(chunk);
                true
            }
            _ => false,
        }
    }

    /// Resolve a reserved position without audio.
    pub fn drop_slot(&mut self, seq: u64) -> bool {
        match self.slots.get_mut(&seq) {
            Some(slot) if matches!(slot, Slot::Pending) => {
                *slot = Slot::Dropped;
                true
            }
            _ => false,
        }
    }

    /// Take every chunk that has become playable since the last call, in order.
    pub fn take_ready(&mut self) -> Vec<AudioChunk> {
        let mut ready = Vec::new();
        while let Some(slot) = self.slots.get(&self.cursor) {
            match slot {
                Slot::Pending => break,
                Slot::Ready(chunk) => ready.push(chunk.clone()),
                Slot::Dropped => {}
            }
            self.cursor += 1;
        }
        ready
    }

    /// Rewind the reader so the next `take_ready` starts from the first chunk again.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// True when every reserved position is resolved and has been read.
    pub fn is_drained(&self) -> bool {
        self.cursor == self.next_seq
    }

    /// Number of reservations whose decode has not finished.
    pub fn pending_count(&self) -> usize {
        self.slots.values().filter(|s| matches!(s, Slot::Pending)).count()
    }

    /// Number of positions reserved so far.
    pub fn reserved(&self) -> u64 {
        self.next_seq
    }
}

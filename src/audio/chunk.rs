//! # Decoded Audio Chunks
//!
//! The unit of audio that flows from the codec layer into a turn and from a
//! turn into the playback scheduler.
//!
//! ## Sharing:
//! Samples live behind an `Arc<[i16]>`. Cloning an `AudioChunk` only bumps a
//! reference count, so the scheduler can hold a chunk while it is rendered
//! without the turn manager giving up ownership of the turn.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Telephony sample rate used by the μ-law path.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// One side of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// The human on the phone line
    Caller,
    /// The automated agent
    Agent,
}

impl Party {
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Caller => "caller",
            Party::Agent => "agent",
        }
    }

    /// Tag byte used in binary audio frames sent to the monitoring client.
    pub fn wire_tag(&self) -> u8 {
        match self {
            Party::Caller => 0,
            Party::Agent => 1,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded, single-channel buffer of 16-bit linear PCM.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub party: Party,
    pub sample_rate: u32,
    samples: Arc<[i16]>,
}

impl AudioChunk {
    pub fn new(party: Party, sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            party,
            sample_rate,
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Playback duration of this chunk.
    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_duration() {
        let chunk = AudioChunk::new(Party::Caller, 8000, vec![0; 4000]);
        assert_eq!(chunk.duration().as_millis(), 500);
        assert_eq!(chunk.len(), 4000);
    }

    #[test]
    fn test_clone_shares_samples() {
        let chunk = AudioChunk::new(Party::Agent, 8000, vec![1, 2, 3]);
        let copy = chunk.clone();
        assert!(std::ptr::eq(chunk.samples().as_ptr(), copy.samples().as_ptr()));
    }
}

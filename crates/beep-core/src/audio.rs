use std::sync::Arc;
use std::time::Duration;

/// One block of PCM audio, one sample vector per channel.
///
/// Chunks are immutable once built; sinks receive them by reference and clone
/// the [`Arc`] if they need to keep the data past `deliver`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    channels: Arc<[Vec<f32>]>,
    sample_rate: u32,
}

impl AudioChunk {
    /// Builds a chunk. All channels are expected to have the same length.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        debug_assert!(
            channels.windows(2).all(|pair| pair[0].len() == pair[1].len()),
            "channel lengths differ"
        );
        Self {
            channels: channels.into(),
            sample_rate,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Playback length of the chunk at its own sample rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.frames() as u64 * 1_000_000_000 / u64::from(self.sample_rate))
    }
}

/// Consumer of broadcast audio.
///
/// `deliver` runs on the producer's task while the registry lock is held, so
/// implementations must not block for long and must not call back into the
/// registry they are registered with.
pub trait Sink: Send + Sync {
    fn deliver(&self, chunk: &AudioChunk);
}

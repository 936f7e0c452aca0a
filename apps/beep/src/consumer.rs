use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use beep_core::{AudioChunk, Sink};
use tracing::{debug, info};

/// Bob's end of the remote track: logs when audio starts and keeps counts.
#[derive(Debug, Default)]
pub struct ConsumerSink {
    started: AtomicBool,
    chunks: AtomicU64,
    frames: AtomicU64,
}

impl ConsumerSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }
}

impl Sink for ConsumerSink {
    fn deliver(&self, chunk: &AudioChunk) {
        if !self.started.swap(true, Ordering::Relaxed) {
            info!(
                sample_rate = chunk.sample_rate(),
                channels = chunk.channel_count(),
                "start receiving audio data"
            );
        }
        let chunks = self.chunks.fetch_add(1, Ordering::Relaxed) + 1;
        self.frames.fetch_add(chunk.frames() as u64, Ordering::Relaxed);
        if chunks % 500 == 0 {
            debug!(chunks, frames = self.frames(), "remote audio flowing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_every_delivery() {
        let consumer = ConsumerSink::new();
        assert!(!consumer.has_started());
        for _ in 0..3 {
            consumer.deliver(&AudioChunk::mono(vec![0.0; 80], 8_000));
        }
        assert!(consumer.has_started());
        assert_eq!(consumer.chunks(), 3);
        assert_eq!(consumer.frames(), 240);
    }
}

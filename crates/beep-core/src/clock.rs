use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::AudioChunk;
use crate::sink::SinkRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("chunk rate {chunk_rate} does not divide sample rate {sample_rate}")]
    UnevenChunks { sample_rate: u32, chunk_rate: u32 },
    #[error("tone {tone_frequency} Hz is too high for sample rate {sample_rate}")]
    ToneTooHigh {
        sample_rate: u32,
        tone_frequency: u32,
    },
}

/// Cadence and waveform parameters of a [`SampleClock`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockConfig {
    pub sample_rate: u32,
    pub chunk_rate: u32,
    pub tone_frequency: u32,
    pub amplitude: f32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            chunk_rate: 100,
            tone_frequency: 256,
            amplitude: 0.04,
        }
    }
}

impl ClockConfig {
    pub fn validate(&self) -> Result<(), ClockError> {
        if self.sample_rate == 0 {
            return Err(ClockError::Zero("sample rate"));
        }
        if self.chunk_rate == 0 {
            return Err(ClockError::Zero("chunk rate"));
        }
        if self.tone_frequency == 0 {
            return Err(ClockError::Zero("tone frequency"));
        }
        if self.sample_rate % self.chunk_rate != 0 {
            return Err(ClockError::UnevenChunks {
                sample_rate: self.sample_rate,
                chunk_rate: self.chunk_rate,
            });
        }
        if self.half_period() == 0 {
            return Err(ClockError::ToneTooHigh {
                sample_rate: self.sample_rate,
                tone_frequency: self.tone_frequency,
            });
        }
        Ok(())
    }

    /// Samples per chunk.
    pub fn frames_per_chunk(&self) -> usize {
        (self.sample_rate / self.chunk_rate) as usize
    }

    /// Samples between two sign flips of the square wave.
    pub fn half_period(&self) -> u64 {
        u64::from(self.sample_rate / self.tone_frequency / 2)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.chunk_rate
    }
}

/// Square-wave generator whose phase carries over between calls to `fill`.
#[derive(Debug, Clone)]
pub struct SquareWave {
    half_period: u64,
    position: u64,
    level: f32,
}

impl SquareWave {
    pub fn new(half_period: u64, amplitude: f32) -> Self {
        Self {
            half_period: half_period.max(1),
            position: 0,
            level: amplitude,
        }
    }

    pub fn fill(&mut self, out: &mut [f32]) {
        for sample in out.iter_mut() {
            if self.position % self.half_period == 0 {
                self.level = -self.level;
            }
            *sample = self.level;
            self.position += 1;
        }
    }

    /// Total samples generated so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

/// Periodic tone producer feeding a [`SinkRegistry`].
///
/// Ticks are scheduled against a fixed time base: tick `n` is due at
/// `start + n * interval`, so time spent generating or delivering a chunk does
/// not push later ticks back. If the task falls behind it fires the missed
/// ticks back to back.
pub struct SampleClock {
    config: ClockConfig,
    registry: Arc<SinkRegistry>,
    wave: SquareWave,
    ticks: u64,
}

impl SampleClock {
    pub fn new(config: ClockConfig, registry: Arc<SinkRegistry>) -> Result<Self, ClockError> {
        config.validate()?;
        Ok(Self {
            wave: SquareWave::new(config.half_period(), config.amplitude),
            config,
            registry,
            ticks: 0,
        })
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Number of chunks produced so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Generates the next chunk and hands it to every registered sink.
    pub fn tick(&mut self) -> AudioChunk {
        let mut samples = vec![0.0; self.config.frames_per_chunk()];
        self.wave.fill(&mut samples);
        let chunk = AudioChunk::mono(samples, self.config.sample_rate);
        self.registry.broadcast(&chunk);
        self.ticks += 1;
        chunk
    }

    /// Runs the clock until `shutdown` is cancelled. A delivery that is
    /// already in progress finishes before the loop exits.
    pub async fn run(mut self, shutdown: CancellationToken) -> u64 {
        let interval = self.config.tick_interval();
        let mut timer = tokio::time::interval_at(Instant::now(), interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Burst);
        info!(
            target = "beep::clock",
            sample_rate = self.config.sample_rate,
            chunk_rate = self.config.chunk_rate,
            tone_hz = self.config.tone_frequency,
            "sample clock started"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    self.tick();
                }
            }
        }
        debug!(target = "beep::clock", ticks = self.ticks, "sample clock stopped");
        self.ticks
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Sink;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        chunks: Mutex<Vec<(Instant, AudioChunk)>>,
    }

    impl Sink for Recorder {
        fn deliver(&self, chunk: &AudioChunk) {
            self.chunks.lock().push((Instant::now(), chunk.clone()));
        }
    }

    fn beep_config() -> ClockConfig {
        ClockConfig::default()
    }

    #[test]
    fn rejects_bad_configs() {
        let mut config = beep_config();
        config.chunk_rate = 0;
        assert_eq!(config.validate(), Err(ClockError::Zero("chunk rate")));

        let mut config = beep_config();
        config.chunk_rate = 7;
        assert!(matches!(
            config.validate(),
            Err(ClockError::UnevenChunks { .. })
        ));

        let mut config = beep_config();
        config.tone_frequency = 30_000;
        assert!(matches!(
            config.validate(),
            Err(ClockError::ToneTooHigh { .. })
        ));
    }

    #[test]
    fn chunks_hold_one_interval_of_samples() {
        let registry = Arc::new(SinkRegistry::new());
        let mut clock = SampleClock::new(beep_config(), registry).expect("valid config");
        let chunk = clock.tick();
        assert_eq!(chunk.frames(), 480);
        assert_eq!(chunk.channel_count(), 1);
        assert_eq!(chunk.sample_rate(), 48_000);
    }

    #[test]
    fn square_wave_flips_every_half_period_across_chunks() {
        let config = beep_config();
        assert_eq!(config.half_period(), 93);
        let registry = Arc::new(SinkRegistry::new());
        let mut clock = SampleClock::new(config, registry).expect("valid config");

        let mut stream = Vec::new();
        for _ in 0..5 {
            stream.extend_from_slice(clock.tick().channel(0).expect("mono chunk"));
        }
        assert_eq!(stream.len(), 2_400);
        assert!(stream.iter().all(|s| s.abs() == 0.04));

        let flips: Vec<usize> = stream
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[0] != pair[1])
            .map(|(index, _)| index + 1)
            .collect();
        assert!(!flips.is_empty());
        for pair in flips.windows(2) {
            assert_eq!(pair[1] - pair[0], 93);
        }
        // The first chunk boundary (480) falls mid-period: no flip there.
        assert!(!flips.contains(&480));
        assert_eq!(stream[479], stream[480]);
    }

    #[test]
    fn tick_broadcasts_to_registered_sinks() {
        let registry = Arc::new(SinkRegistry::new());
        let recorder = Arc::new(Recorder::default());
        let sink: Arc<dyn Sink> = recorder.clone();
        registry.add(&sink);
        let mut clock = SampleClock::new(beep_config(), registry).expect("valid config");
        let produced = clock.tick();
        let seen = recorder.chunks.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, produced);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn produces_chunk_rate_chunks_per_second() {
        let registry = Arc::new(SinkRegistry::new());
        let recorder = Arc::new(Recorder::default());
        let sink: Arc<dyn Sink> = recorder.clone();
        registry.add(&sink);

        let clock = SampleClock::new(beep_config(), registry).expect("valid config");
        let shutdown = CancellationToken::new();
        let start = Instant::now();
        let handle = clock.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(2_995)).await;
        shutdown.cancel();
        let ticks = handle.await.expect("clock task");

        assert_eq!(ticks, 300);
        let seen = recorder.chunks.lock();
        assert_eq!(seen.len(), 300);
        for (index, (at, _)) in seen.iter().enumerate() {
            let due = start + Duration::from_millis(10) * index as u32;
            let drift = at.saturating_duration_since(due);
            assert!(drift < Duration::from_millis(10), "tick {index} drifted {drift:?}");
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn late_ticks_catch_up_to_the_time_base() {
        struct NullSink;
        impl Sink for NullSink {
            fn deliver(&self, _chunk: &AudioChunk) {}
        }

        let registry = Arc::new(SinkRegistry::new());
        let sink: Arc<dyn Sink> = Arc::new(NullSink);
        registry.add(&sink);
        let clock = SampleClock::new(beep_config(), registry).expect("valid config");
        let shutdown = CancellationToken::new();
        let handle = clock.spawn(shutdown.clone());

        // Jump the clock past 25 deadlines at once; the missed ticks still fire.
        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::time::advance(Duration::from_millis(244)).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        shutdown.cancel();
        assert_eq!(handle.await.expect("clock task"), 25);
    }
}

//! Moves audio between [`SinkRegistry`] fan-outs and WebRTC tracks.
//!
//! Outgoing: a [`TrackSink`] registered on the local source turns each chunk
//! into one PCMU sample and queues it; a pump task writes the queue to the
//! track. Incoming: a reader task decodes RTP payloads from a remote track
//! and broadcasts them as 8 kHz chunks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use beep_core::{AudioChunk, Sink, SinkRegistry};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::g711;

pub const PCMU_RATE: u32 = 8_000;

/// Chunks buffered between the clock and the pump. At 100 chunks a second this
/// is a quarter second of audio.
const QUEUE_DEPTH: usize = 25;

/// One encoded chunk, ready to be written as a sample.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    pub payload: Vec<u8>,
    pub duration: Duration,
}

/// Averages channels into one and reduces it to `target_rate` by taking the
/// mean of each window. Upsampling is not supported: a chunk already at or
/// below `target_rate` is only mixed down.
pub fn downmix_and_decimate(chunk: &AudioChunk, target_rate: u32) -> Vec<f32> {
    let frames = chunk.frames();
    let channels = chunk.channel_count().max(1);
    let mono: Vec<f32> = (0..frames)
        .map(|frame| {
            let sum: f32 = (0..channels)
                .filter_map(|channel| chunk.channel(channel).and_then(|data| data.get(frame)))
                .sum();
            sum / channels as f32
        })
        .collect();

    let source_rate = chunk.sample_rate();
    if source_rate <= target_rate || mono.is_empty() {
        return mono;
    }
    let out_len = (frames as u64 * u64::from(target_rate) / u64::from(source_rate)) as usize;
    (0..out_len)
        .map(|index| {
            let start = index as u64 * u64::from(source_rate) / u64::from(target_rate);
            let end = ((index as u64 + 1) * u64::from(source_rate) / u64::from(target_rate))
                .min(frames as u64);
            let window = &mono[start as usize..end.max(start + 1) as usize];
            window.iter().sum::<f32>() / window.len() as f32
        })
        .collect()
}

/// Encodes a chunk as an 8 kHz PCMU payload.
pub fn encode_chunk(chunk: &AudioChunk) -> Option<EncodedChunk> {
    if chunk.frames() == 0 {
        return None;
    }
    let samples = downmix_and_decimate(chunk, PCMU_RATE);
    Some(EncodedChunk {
        payload: g711::encode(&samples),
        duration: chunk.duration(),
    })
}

/// Sink feeding an outgoing track. Delivery never blocks: when the pump falls
/// behind, chunks are dropped.
pub struct TrackSink {
    queue: mpsc::Sender<EncodedChunk>,
    dropped: AtomicU64,
}

impl TrackSink {
    pub fn new(queue: mpsc::Sender<EncodedChunk>) -> Self {
        Self {
            queue,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn channel() -> (Self, mpsc::Receiver<EncodedChunk>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        (Self::new(tx), rx)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Sink for TrackSink {
    fn deliver(&self, chunk: &AudioChunk) {
        let Some(encoded) = encode_chunk(chunk) else {
            return;
        };
        if let Err(err) = self.queue.try_send(encoded) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    trace!(target = "beep::webrtc", dropped, "outgoing audio queue full; chunk dropped")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    trace!(target = "beep::webrtc", "outgoing track pump gone; chunk dropped")
                }
            }
        }
    }
}

/// Writes queued chunks to `track` until every sender is gone.
pub fn spawn_pump(
    track: Arc<TrackLocalStaticSample>,
    mut queue: mpsc::Receiver<EncodedChunk>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut written = 0u64;
        while let Some(chunk) = queue.recv().await {
            let sample = Sample {
                data: Bytes::from(chunk.payload),
                duration: chunk.duration,
                ..Default::default()
            };
            if let Err(err) = track.write_sample(&sample).await {
                warn!(target = "beep::webrtc", error = %err, "failed to write audio sample");
                continue;
            }
            written += 1;
        }
        debug!(target = "beep::webrtc", written, "outgoing track pump stopped");
    })
}

/// Reads PCMU RTP from a remote track and broadcasts it on `registry` until
/// the track ends.
pub fn spawn_remote_reader(track: Arc<TrackRemote>, registry: Arc<SinkRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut packets = 0u64;
        loop {
            let (packet, _) = match track.read_rtp().await {
                Ok(read) => read,
                Err(err) => {
                    debug!(target = "beep::webrtc", error = %err, packets, "remote track ended");
                    break;
                }
            };
            if packet.payload.is_empty() {
                continue;
            }
            if packets == 0 {
                info!(target = "beep::webrtc", ssrc = track.ssrc(), "receiving remote audio");
            }
            packets += 1;
            let samples = g711::decode(&packet.payload);
            registry.broadcast(&AudioChunk::mono(samples, PCMU_RATE));
        }
    })
}

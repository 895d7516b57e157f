//! Audio frame types and the frame bus.
//!
//! The bus only moves frames; it makes no decisions. Inbound frames come
//! from the transport, outbound frames carry synthesized speech back to it.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

/// One fixed-size chunk of PCM audio with its capture timestamp.
///
/// Frames are immutable once produced; ownership moves from the producer to
/// the single consuming stage.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM 16-bit signed little-endian samples
    pub pcm: Bytes,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count (1 = mono)
    pub channels: u16,
    /// Capture timestamp, milliseconds from session start
    pub timestamp_ms: u64,
}

impl AudioFrame {
    pub fn new(pcm: Bytes, sample_rate: u32, channels: u16, timestamp_ms: u64) -> Self {
        Self {
            pcm,
            sample_rate,
            channels,
            timestamp_ms,
        }
    }

    /// Frame duration derived from the payload length.
    pub fn duration_ms(&self) -> u64 {
        let samples = self.pcm.len() as u64 / 2 / self.channels.max(1) as u64;
        samples * 1_000 / self.sample_rate.max(1) as u64
    }

    /// A silent frame, useful for padding and tests.
    pub fn silence(samples: usize, sample_rate: u32, timestamp_ms: u64) -> Self {
        Self {
            pcm: Bytes::from(vec![0u8; samples * 2]),
            sample_rate,
            channels: 1,
            timestamp_ms,
        }
    }
}

/// Bidirectional frame bus with bounded queues in both directions.
///
/// `split` hands the transport-facing endpoints to the host application and
/// keeps the session-facing endpoints inside the pipeline.
pub struct FrameBus {
    input_tx: mpsc::Sender<AudioFrame>,
    input_rx: Option<mpsc::Receiver<AudioFrame>>,
    output_tx: mpsc::Sender<AudioFrame>,
    output_rx: Option<mpsc::Receiver<AudioFrame>>,
}

impl FrameBus {
    pub fn new(depth: usize) -> Self {
        let (input_tx, input_rx) = mpsc::channel(depth);
        let (output_tx, output_rx) = mpsc::channel(depth);
        Self {
            input_tx,
            input_rx: Some(input_rx),
            output_tx,
            output_rx: Some(output_rx),
        }
    }

    /// Sender the transport uses to push captured frames into the session.
    pub fn input_sender(&self) -> mpsc::Sender<AudioFrame> {
        self.input_tx.clone()
    }

    /// Receiver the transport drains for playback. Can be taken once.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.output_rx.take()
    }

    /// Receiver the session consumes captured frames from. Can be taken once.
    pub(crate) fn take_input(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.input_rx.take()
    }

    /// Sender synthesis uses for playback frames.
    pub(crate) fn output_sender(&self) -> mpsc::Sender<AudioFrame> {
        self.output_tx.clone()
    }
}

/// Drains every frame currently queued on a playback receiver.
///
/// Used on barge-in: frames already handed to the bus but not yet consumed
/// by the transport are dropped so the agent falls silent immediately.
pub fn flush_playback(rx: &mut mpsc::Receiver<AudioFrame>) -> usize {
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        trace!(dropped, "flushed queued playback frames");
    }
    dropped
}

//! Synthesis pipeline.
//!
//! Consumes reply segments in order, synthesizes each and streams the
//! resulting frames to the playback channel. Synthesis runs ahead of
//! playback by a bounded lookahead so segment boundaries don't leave
//! audible gaps, but frames always leave in segment order.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tokio::time::Duration;

use crate::config::SynthConfig;
use crate::core::audio::AudioFrame;
use crate::core::collaborators::{
    call_with_retry, CollabResult, RetryPolicy, SpeechSynthesizer, SynthStream,
};
use crate::core::reply::ReplySegment;
use crate::errors::{AgentError, AgentResult};

/// What one pipeline run delivered before finishing or being cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct SynthReport {
    pub segments: usize,
    pub frames: usize,
}

pub struct SynthesisPipeline {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    config: SynthConfig,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl SynthesisPipeline {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        config: SynthConfig,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            synthesizer,
            config,
            retry,
            call_timeout,
        }
    }

    /// Run until the segment queue closes or the token fires.
    ///
    /// Cancellation is checked between frames; at most one in-flight frame
    /// is emitted after the token fires.
    pub async fn run(
        &self,
        segments_rx: mpsc::Receiver<ReplySegment>,
        frames_tx: mpsc::Sender<AudioFrame>,
        token: &CancellationToken,
    ) -> AgentResult<SynthReport> {
        let synthesizer = Arc::clone(&self.synthesizer);
        let retry = self.retry.clone();
        let call_timeout = self.call_timeout;
        let synth_token = token.clone();

        // Ordered stream of per-segment synthesis streams; `buffered` keeps
        // the lookahead window of segments synthesizing concurrently.
        let segment_stream = stream::unfold(segments_rx, |mut rx| async move {
            rx.recv().await.map(|segment| (segment, rx))
        });
        let mut synth_streams = segment_stream
            .map(move |segment| {
                let synthesizer = Arc::clone(&synthesizer);
                let retry = retry.clone();
                let token = synth_token.clone();
                async move {
                    let frames = call_with_retry("tts", &retry, call_timeout, &token, || {
                        synthesizer.synthesize(&segment.text)
                    })
                    .await;
                    (segment, frames)
                }
            })
            .buffered(self.config.lookahead + 1)
            .boxed();

        let mut report = SynthReport::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = synth_streams.next() => next,
            };
            let Some((segment, frames)) = next else {
                info!(
                    segments = report.segments,
                    frames = report.frames,
                    "synthesis drained"
                );
                return Ok(report);
            };

            let Some(frames) = frames? else {
                // Cancelled while the segment was being synthesized
                break;
            };
            debug!(index = segment.index, "playing segment");
            if !self
                .play_segment(frames, &frames_tx, token, &mut report)
                .await?
            {
                break;
            }
            report.segments += 1;
        }

        debug!(
            segments = report.segments,
            frames = report.frames,
            "synthesis cancelled"
        );
        Ok(report)
    }

    /// Streams one segment's frames out. Returns false on cancellation.
    async fn play_segment(
        &self,
        mut frames: SynthStream,
        frames_tx: &mpsc::Sender<AudioFrame>,
        token: &CancellationToken,
        report: &mut SynthReport,
    ) -> AgentResult<bool> {
        loop {
            let frame: Option<CollabResult<AudioFrame>> = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(false),
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => {
                    frames_tx
                        .send(frame)
                        .await
                        .map_err(|_| AgentError::ChannelClosed("playback queue"))?;
                    report.frames += 1;
                }
                Some(Err(e)) => {
                    return Err(AgentError::CollaboratorUnavailable {
                        collaborator: "tts",
                        reason: e.to_string(),
                    });
                }
                None => return Ok(true),
            }
        }
    }
}

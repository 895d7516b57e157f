//! Deterministic in-process collaborators.
//!
//! Used by the `check` command and the integration tests. None of them
//! touch the network; the transcriber and language model replay scripts,
//! the scorer and end-of-turn model run cheap heuristics.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::audio::AudioFrame;
use crate::core::collaborators::{
    CollabError, CollabResult, EndOfTurnModel, GenerationRequest, LanguageModel, LlmUnit,
    RevisionStream, SpeechSynthesizer, SynthStream, Transcriber, UnitStream, VoiceActivityScorer,
};
use crate::core::transcript::TranscriptRevision;

/// Scores frames by RMS energy. Silence scores 0.0, full-scale noise ~1.0.
#[derive(Debug, Default)]
pub struct EnergyScorer;

#[async_trait]
impl VoiceActivityScorer for EnergyScorer {
    async fn score(&self, frame: &AudioFrame) -> CollabResult<f32> {
        let samples: Vec<i16> = frame
            .pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if samples.is_empty() {
            return Ok(0.0);
        }
        let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let rms = (sum_sq / samples.len() as f64).sqrt();
        // Scaled so ordinary speech amplitudes land well above 0.5
        Ok((rms / 8_192.0).min(1.0) as f32)
    }
}

/// Replays a fixed revision script per utterance.
///
/// Each call to `stream_utterance` pops the next script; incoming frames
/// are drained and discarded. A revision marked final ends the stream the
/// way a real engine's end-of-utterance signal would.
pub struct ScriptedTranscriber {
    scripts: Mutex<VecDeque<Vec<TranscriptRevision>>>,
}

impl ScriptedTranscriber {
    pub fn new(scripts: Vec<Vec<TranscriptRevision>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
        }
    }

    /// Single-utterance script that grows word by word and seals with the
    /// full text.
    pub fn for_utterance(text: &str) -> Self {
        let words: Vec<&str> = text.split_whitespace().collect();
        let mut script = Vec::new();
        for (i, _) in words.iter().enumerate().skip(1) {
            script.push(TranscriptRevision::partial(words[..i].join(" "), i as u64));
        }
        script.push(TranscriptRevision::final_revision(
            words.join(" "),
            words.len() as u64,
        ));
        Self::new(vec![script])
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn stream_utterance(
        &self,
        mut frames: mpsc::Receiver<AudioFrame>,
    ) -> CollabResult<RevisionStream> {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| CollabError::new("no scripted utterance left"))?;

        tokio::spawn(async move { while frames.recv().await.is_some() {} });
        Ok(stream::iter(script.into_iter().map(Ok)).boxed())
    }
}

/// Punctuation heuristic: terminal punctuation reads as complete, a
/// trailing conjunction or filler as mid-thought, anything else ambiguous.
#[derive(Debug, Default)]
pub struct HeuristicEndOfTurn;

const TRAILING_CONTINUATIONS: &[&str] = &["and", "but", "or", "so", "um", "uh", "because"];

#[async_trait]
impl EndOfTurnModel for HeuristicEndOfTurn {
    async fn completeness(&self, text: &str) -> CollabResult<f32> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(0.0);
        }
        if trimmed.ends_with(['.', '?', '!']) {
            return Ok(0.95);
        }
        let last_word = trimmed
            .rsplit(|c: char| !c.is_alphanumeric() && c != '\'')
            .find(|w| !w.is_empty())
            .unwrap_or("")
            .to_lowercase();
        if TRAILING_CONTINUATIONS.contains(&last_word.as_str()) {
            return Ok(0.05);
        }
        Ok(0.3)
    }
}

/// Replays scripted unit sequences, one per `generate` call.
pub struct ScriptedLanguageModel {
    replies: Mutex<VecDeque<Vec<LlmUnit>>>,
}

impl ScriptedLanguageModel {
    pub fn new(replies: Vec<Vec<LlmUnit>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
        }
    }

    /// Model that answers every request with the same text.
    pub fn always(text: &str) -> Self {
        let mut replies = VecDeque::new();
        for _ in 0..64 {
            replies.push_back(vec![LlmUnit::Text(text.to_string())]);
        }
        Self {
            replies: Mutex::new(replies),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedLanguageModel {
    async fn generate(&self, _request: GenerationRequest) -> CollabResult<UnitStream> {
        let units = self
            .replies
            .lock()
            .pop_front()
            .ok_or_else(|| CollabError::new("no scripted reply left"))?;
        Ok(stream::iter(units.into_iter().map(Ok)).boxed())
    }
}

/// Emits silent frames sized to the text, roughly 60 ms of audio per word.
#[derive(Debug)]
pub struct SilenceSynthesizer {
    pub sample_rate: u32,
}

impl Default for SilenceSynthesizer {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for SilenceSynthesizer {
    async fn synthesize(&self, text: &str) -> CollabResult<SynthStream> {
        let words = text.split_whitespace().count().max(1);
        let frames = words * 3; // 3 x 20 ms frames per word
        let samples = (self.sample_rate / 50) as usize;
        let rate = self.sample_rate;

        let iter = (0..frames).map(move |i| {
            Ok(AudioFrame::new(
                Bytes::from(vec![0u8; samples * 2]),
                rate,
                1,
                (i as u64) * 20,
            ))
        });
        Ok(stream::iter(iter).boxed())
    }
}

//! Collaborator contracts.
//!
//! The runtime never talks to an acoustic model or a language model
//! directly; it consumes these traits. Implementations live in the host
//! application (or in [`stub`] for tests and the `check` command).
//!
//! Every method is a suspension point and must return promptly when the
//! session's cancellation token fires; streams are dropped to cancel them.

pub mod stub;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::audio::AudioFrame;
use crate::core::transcript::TranscriptRevision;
use crate::errors::{AgentError, AgentResult};
use crate::tools::ToolSchema;

/// A collaborator call failed or the collaborator is unreachable.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CollabError(pub String);

impl CollabError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type CollabResult<T> = Result<T, CollabError>;

/// Stream of transcript revisions for one utterance.
pub type RevisionStream = BoxStream<'static, CollabResult<TranscriptRevision>>;

/// Stream of generation units from the language model.
pub type UnitStream = BoxStream<'static, CollabResult<LlmUnit>>;

/// Stream of synthesized audio frames for one segment.
pub type SynthStream = BoxStream<'static, CollabResult<AudioFrame>>;

/// Scores a single frame for speech activity.
#[async_trait]
pub trait VoiceActivityScorer: Send + Sync {
    /// Speech probability in [0, 1] for the given frame.
    async fn score(&self, frame: &AudioFrame) -> CollabResult<f32>;
}

/// Streaming speech-to-text for one utterance.
///
/// A stream is not restartable; a new utterance gets a new stream. The
/// stream ends when the engine signals end-of-utterance or the frame sender
/// is dropped (which the session does on barge-in).
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn stream_utterance(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> CollabResult<RevisionStream>;
}

/// Scores transcript text for syntactic completeness.
#[async_trait]
pub trait EndOfTurnModel: Send + Sync {
    /// Probability in [0, 1] that the utterance is a complete turn.
    async fn completeness(&self, text: &str) -> CollabResult<f32>;
}

/// Conversation roles for the language-model history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of dialogue history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One request to the language model.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Dialogue history including the newly closed user turn and any tool
    /// results folded in so far
    pub history: Vec<ChatMessage>,
    /// Out-of-band instruction (greeting, proactive summaries)
    pub instruction: Option<String>,
    /// Schemas of the tools the model may call
    pub tools: Vec<ToolSchema>,
}

/// One unit of language-model output.
#[derive(Debug, Clone)]
pub enum LlmUnit {
    /// Plain reply text (may be a partial token run)
    Text(String),
    /// Request to invoke a tool; generation pauses until the result is
    /// folded back into the history
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
}

/// Streaming language model with tool calling.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> CollabResult<UnitStream>;
}

/// Streaming speech synthesis for one text segment.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> CollabResult<SynthStream>;
}

/// Bounded retry with exponential backoff for collaborator calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Adds up to ±25% jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }

    /// Delay before the given retry attempt (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let delay = base * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay.as_millis() as f64);

        let delay = if self.jitter {
            (delay + rand_jitter(delay * 0.25)).max(0.0)
        } else {
            delay
        };
        Duration::from_millis(delay as u64)
    }
}

/// Pseudo-random jitter from a time-seeded LCG, enough for backoff spreading
/// without pulling in the rand crate.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}

/// Runs a collaborator call with per-attempt timeout, bounded retry and
/// cooperative cancellation.
///
/// Cancellation surfaces as `Ok(None)` so callers can tell an interrupted
/// call apart from an unavailable collaborator.
pub async fn call_with_retry<T, F, Fut>(
    collaborator: &'static str,
    policy: &RetryPolicy,
    timeout: Duration,
    token: &CancellationToken,
    mut call: F,
) -> AgentResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CollabResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            result = tokio::time::timeout(timeout, call()) => result,
        };

        let reason = match outcome {
            Ok(Ok(value)) => return Ok(Some(value)),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {timeout:?}"),
        };

        if !policy.should_retry(attempt + 1) {
            return Err(AgentError::CollaboratorUnavailable {
                collaborator,
                reason,
            });
        }
        attempt += 1;
        let delay = policy.calculate_delay(attempt);
        warn!(collaborator, attempt, ?delay, %reason, "collaborator call failed, retrying");
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        // Capped at max_delay
        assert_eq!(policy.calculate_delay(10), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        };
        let token = CancellationToken::new();

        let result = call_with_retry("stt", &policy, Duration::from_secs(1), &token, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CollabError::new("transient"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_unavailable() {
        let policy = RetryPolicy {
            attempts: 1,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        };
        let token = CancellationToken::new();

        let result: AgentResult<Option<u32>> =
            call_with_retry("llm", &policy, Duration::from_secs(1), &token, || async {
                Err(CollabError::new("boom"))
            })
            .await;

        match result {
            Err(AgentError::CollaboratorUnavailable { collaborator, .. }) => {
                assert_eq!(collaborator, "llm");
            }
            other => panic!("expected CollaboratorUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_is_not_an_error() {
        let policy = RetryPolicy::default();
        let token = CancellationToken::new();
        token.cancel();

        let result = call_with_retry("tts", &policy, Duration::from_secs(1), &token, || async {
            Ok(1u32)
        })
        .await
        .unwrap();
        assert_eq!(result, None);
    }
}

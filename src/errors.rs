//! Error types for the voice-agent runtime.
//!
//! Tool-level failures (`ToolError`) live in [`crate::tools`] and are always
//! recovered locally by the dispatcher; the variants here are the ones that
//! can end a turn or a session.

use thiserror::Error;

/// Errors surfaced by the orchestrator and its stages.
#[derive(Debug, Error)]
pub enum AgentError {
    /// An external collaborator (VAD, STT, LLM, TTS) failed after exhausting
    /// the retry budget. The turn that triggered the call is marked failed.
    #[error("collaborator '{collaborator}' unavailable: {reason}")]
    CollaboratorUnavailable {
        collaborator: &'static str,
        reason: String,
    },

    /// The reply generator requested more tool calls than allowed in a
    /// single turn. Fatal to the turn, not the session.
    #[error("tool call limit exceeded ({limit} calls in one turn)")]
    ToolLoopExceeded { limit: u32 },

    /// A pipeline channel closed while the session was still running.
    #[error("pipeline channel '{0}' closed unexpectedly")]
    ChannelClosed(&'static str),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A revision was appended to a sealed transcript, or revision numbers
    /// went backwards.
    #[error("transcript error: {0}")]
    Transcript(#[from] crate::core::transcript::TranscriptError),

    /// The single-active-turn invariant (or another internal invariant) was
    /// broken. This is a programming fault; the session aborts cleanly.
    #[error("session invariant violated: {0}")]
    InvariantViolation(String),
}

/// Result type for runtime operations.
pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    /// Whether the error ends only the current turn (the session keeps
    /// listening) as opposed to tearing the session down.
    pub fn is_turn_local(&self) -> bool {
        matches!(
            self,
            AgentError::CollaboratorUnavailable { .. } | AgentError::ToolLoopExceeded { .. }
        )
    }
}

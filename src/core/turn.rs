//! Turn records and the session state enum.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::transcript::Transcript;
use crate::tools::ToolInvocation;

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnOutcome {
    /// Reply fully generated, synthesized and played
    Completed,
    /// Cut short by barge-in; no fallback is spoken
    Interrupted,
    /// Collaborator outage or tool loop; a fallback utterance is spoken
    Failed,
}

impl std::fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnOutcome::Completed => write!(f, "completed"),
            TurnOutcome::Interrupted => write!(f, "interrupted"),
            TurnOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// One user-utterance/agent-reply pair.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: Uuid,
    /// Final transcript of the user utterance. Empty for agent-initiated
    /// turns such as the opening greeting.
    pub transcript: Transcript,
    /// Accumulated reply text actually dispatched to synthesis
    pub reply_text: String,
    /// Tool invocations made while generating the reply, in request order
    pub invocations: Vec<ToolInvocation>,
    /// Milliseconds from session start
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub outcome: Option<TurnOutcome>,
}

impl Turn {
    pub fn new(transcript: Transcript, started_at_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            transcript,
            reply_text: String::new(),
            invocations: Vec::new(),
            started_at_ms,
            ended_at_ms: None,
            outcome: None,
        }
    }

    /// An agent-initiated turn with no user utterance behind it.
    pub fn agent_initiated(started_at_ms: u64) -> Self {
        Self::new(Transcript::new(), started_at_ms)
    }

    pub fn close(&mut self, outcome: TurnOutcome, ended_at_ms: u64) {
        self.outcome = Some(outcome);
        self.ended_at_ms = Some(ended_at_ms);
    }

    pub fn is_open(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No conversation activity
    Idle,
    /// Accumulating the user's utterance
    Listening,
    /// End-of-turn declared, retraction window still open
    Deciding,
    /// Reply generation running, nothing audible yet
    Generating,
    /// Synthesized audio streaming out
    Speaking,
}

impl SessionState {
    /// States in which a turn holds the generation/synthesis pipeline.
    pub fn turn_active(&self) -> bool {
        matches!(self, SessionState::Generating | SessionState::Speaking)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Deciding => "deciding",
            SessionState::Generating => "generating",
            SessionState::Speaking => "speaking",
        };
        write!(f, "{name}")
    }
}

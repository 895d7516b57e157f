//! Session-external signals.
//!
//! Emitted on a broadcast channel for the host application's observability;
//! nothing inside the pipeline consumes them.

use uuid::Uuid;

use crate::core::turn::TurnOutcome;

/// Signals a session emits while running.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A turn entered generation
    TurnStarted { turn_id: Uuid },
    /// A turn closed with the given outcome
    TurnEnded {
        turn_id: Uuid,
        outcome: TurnOutcome,
    },
    /// A turn-end decision was withdrawn before anything was spoken; the
    /// turn record is discarded and listening resumes
    TurnRetracted { turn_id: Uuid },
    /// The user interrupted the agent mid-reply
    BargeIn {
        turn_id: Uuid,
        /// Playback position at interruption, ms into the reply
        at_ms: u64,
    },
    /// A tool was dispatched
    ToolInvoked { turn_id: Uuid, tool: String },
    /// A tool returned (or failed locally)
    ToolResult {
        turn_id: Uuid,
        tool: String,
        ok: bool,
        latency_ms: u64,
    },
}

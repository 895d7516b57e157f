//! Real-time conversational voice-agent runtime.
//!
//! A session consumes a stream of audio frames, decides when the user has
//! finished a turn, generates a reply through a language model (with tool
//! calling), and streams synthesized speech back out. The user may
//! interrupt at any point; barge-in cancels the agent's reply mid-word.
//!
//! Model endpoints (VAD, speech-to-text, end-of-turn, LLM, TTS) are
//! pluggable through the traits in [`core::collaborators`]; deterministic
//! in-process versions live in [`core::collaborators::stub`].

pub mod config;
pub mod core;
pub mod errors;
pub mod tools;

pub use config::RuntimeConfig;
pub use core::audio::{AudioFrame, FrameBus};
pub use core::events::SessionEvent;
pub use core::session::{Collaborators, Session};
pub use core::turn::{SessionState, Turn, TurnOutcome};
pub use errors::{AgentError, AgentResult};

//! Core runtime: audio plumbing, turn-taking, generation and synthesis.

pub mod audio;
pub mod collaborators;
pub mod eot;
pub mod events;
pub mod gate;
pub mod reply;
pub mod session;
pub mod synth;
pub mod transcript;
pub mod turn;

//! Voice activity gate.
//!
//! Turns per-frame speech-probability scores into discrete speech-run
//! events. Hysteresis on both edges: a frame above the start threshold only
//! opens the gate after `min_speech_ms` of sustained speech, and a frame
//! below the (lower) end threshold only closes it after `min_silence_ms` of
//! sustained silence. Scores between the two thresholds extend whichever
//! run is in progress.

use tracing::{debug, trace};

use crate::config::GateConfig;

/// Discrete speech-run boundaries, stamped with the triggering frame time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    SpeechStarted { at_ms: u64 },
    SpeechEnded { at_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Silence,
    /// Above start threshold, waiting out min_speech_ms
    PotentialSpeech { since_ms: u64 },
    Speech,
    /// Below end threshold, waiting out min_silence_ms
    PotentialSilence { since_ms: u64 },
}

/// Hysteresis state machine over VAD scores.
pub struct SpeechGate {
    config: GateConfig,
    state: GateState,
    /// Timestamp of the most recent score, for the stall watchdog
    last_score_ms: Option<u64>,
    /// When the current silence run began, if the gate is closed
    silence_since_ms: Option<u64>,
}

impl SpeechGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: GateState::Silence,
            last_score_ms: None,
            silence_since_ms: Some(0),
        }
    }

    /// Feed one score; returns an event when a run boundary is crossed.
    pub fn process(&mut self, score: f32, timestamp_ms: u64) -> Option<GateEvent> {
        self.last_score_ms = Some(timestamp_ms);
        let above_start = score >= self.config.start_threshold;
        let below_end = score < self.config.end_threshold;

        let (next, event) = match self.state {
            GateState::Silence => {
                if above_start {
                    trace!(score, timestamp_ms, "potential speech");
                    (GateState::PotentialSpeech { since_ms: timestamp_ms }, None)
                } else {
                    (GateState::Silence, None)
                }
            }
            GateState::PotentialSpeech { since_ms } => {
                if below_end {
                    (GateState::Silence, None)
                } else if timestamp_ms.saturating_sub(since_ms) >= self.config.min_speech_ms {
                    debug!(at_ms = since_ms, "speech started");
                    self.silence_since_ms = None;
                    (
                        GateState::Speech,
                        Some(GateEvent::SpeechStarted { at_ms: since_ms }),
                    )
                } else {
                    (GateState::PotentialSpeech { since_ms }, None)
                }
            }
            GateState::Speech => {
                if below_end {
                    trace!(score, timestamp_ms, "potential silence");
                    (GateState::PotentialSilence { since_ms: timestamp_ms }, None)
                } else {
                    (GateState::Speech, None)
                }
            }
            GateState::PotentialSilence { since_ms } => {
                if above_start {
                    (GateState::Speech, None)
                } else if timestamp_ms.saturating_sub(since_ms) >= self.config.min_silence_ms {
                    debug!(at_ms = timestamp_ms, "speech ended");
                    self.silence_since_ms = Some(since_ms);
                    (
                        GateState::Silence,
                        Some(GateEvent::SpeechEnded { at_ms: timestamp_ms }),
                    )
                } else {
                    (GateState::PotentialSilence { since_ms }, None)
                }
            }
        };
        self.state = next;
        event
    }

    /// Stall watchdog. If the score stream has gone quiet for longer than
    /// the configured interval while the gate is open, closes it with a
    /// synthetic `SpeechEnded` so the pipeline cannot hang on a dead VAD.
    pub fn check_watchdog(&mut self, now_ms: u64) -> Option<GateEvent> {
        if !self.is_open() {
            return None;
        }
        let last = self.last_score_ms?;
        if now_ms.saturating_sub(last) < self.config.watchdog_ms {
            return None;
        }
        debug!(now_ms, last_score_ms = last, "VAD stalled, forcing speech end");
        self.state = GateState::Silence;
        self.silence_since_ms = Some(last);
        Some(GateEvent::SpeechEnded { at_ms: now_ms })
    }

    /// Whether a speech run is in progress (including its trailing
    /// potential-silence tail).
    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            GateState::Speech | GateState::PotentialSilence { .. }
        )
    }

    /// Length of the current silence run. Zero while the gate is open.
    /// The end-of-turn estimator reads this against its silence ceiling.
    pub fn silence_run_ms(&self, now_ms: u64) -> u64 {
        match self.state {
            GateState::Speech => 0,
            GateState::PotentialSilence { since_ms } => now_ms.saturating_sub(since_ms),
            _ => self
                .silence_since_ms
                .map(|s| now_ms.saturating_sub(s))
                .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SpeechGate {
        SpeechGate::new(GateConfig {
            start_threshold: 0.5,
            end_threshold: 0.35,
            min_speech_ms: 100,
            min_silence_ms: 300,
            frame_ms: 20,
            watchdog_ms: 2_000,
        })
    }

    fn feed(gate: &mut SpeechGate, score: f32, from_ms: u64, count: u64) -> Vec<GateEvent> {
        (0..count)
            .filter_map(|i| gate.process(score, from_ms + i * 20))
            .collect()
    }

    #[test]
    fn sustained_speech_opens_gate() {
        let mut g = gate();
        let events = feed(&mut g, 0.9, 0, 6);
        assert_eq!(events, vec![GateEvent::SpeechStarted { at_ms: 0 }]);
        assert!(g.is_open());
    }

    #[test]
    fn brief_blip_does_not_open() {
        let mut g = gate();
        // Two loud frames (40 ms) then silence, under min_speech_ms
        assert!(feed(&mut g, 0.9, 0, 2).is_empty());
        assert!(feed(&mut g, 0.1, 40, 3).is_empty());
        assert!(!g.is_open());
    }

    #[test]
    fn sustained_silence_closes_gate() {
        let mut g = gate();
        feed(&mut g, 0.9, 0, 6);
        // 300 ms of silence starting at 120 ms
        let events = feed(&mut g, 0.1, 120, 16);
        assert_eq!(events, vec![GateEvent::SpeechEnded { at_ms: 420 }]);
        assert!(!g.is_open());
    }

    #[test]
    fn mid_band_score_does_not_close() {
        let mut g = gate();
        feed(&mut g, 0.9, 0, 6);
        // 0.4 is below start but above end; run continues
        assert!(feed(&mut g, 0.4, 120, 30).is_empty());
        assert!(g.is_open());
    }

    #[test]
    fn silence_run_tracks_potential_silence() {
        let mut g = gate();
        feed(&mut g, 0.9, 0, 6);
        feed(&mut g, 0.1, 120, 5); // 100 ms into the silence run
        assert_eq!(g.silence_run_ms(220), 100);
    }

    #[test]
    fn watchdog_forces_end() {
        let mut g = gate();
        feed(&mut g, 0.9, 0, 6);
        assert!(g.check_watchdog(500).is_none());
        let event = g.check_watchdog(2_200);
        assert_eq!(event, Some(GateEvent::SpeechEnded { at_ms: 2_200 }));
        assert!(!g.is_open());
    }
}

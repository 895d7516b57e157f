//! End-of-turn estimation.
//!
//! Decides whether the user has finished speaking by combining the
//! end-of-turn model's completeness score for the latest transcript with
//! the gate's running silence duration. The eagerness threshold trades
//! early cutoffs against response latency; the silence ceiling is a safety
//! net for utterances the model never scores as complete.

use tracing::debug;

use crate::config::EndOfTurnConfig;

/// Outcome of one assessment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TurnDecision {
    Continues,
    Ended { confidence: f32 },
}

impl TurnDecision {
    pub fn is_ended(&self) -> bool {
        matches!(self, TurnDecision::Ended { .. })
    }
}

/// Stateless combiner of model completeness and observed silence.
pub struct EndOfTurnEstimator {
    config: EndOfTurnConfig,
}

impl EndOfTurnEstimator {
    pub fn new(config: EndOfTurnConfig) -> Self {
        Self { config }
    }

    /// Assess the utterance given the model's completeness score for the
    /// latest transcript text and the current silence run length.
    ///
    /// Silence short of the ceiling nudges the probability upward, so a
    /// borderline utterance still closes once the speaker stays quiet.
    pub fn assess(&self, completeness: f32, silence_ms: u64) -> TurnDecision {
        if silence_ms >= self.config.silence_ceiling_ms {
            debug!(silence_ms, "silence ceiling reached, closing turn");
            return TurnDecision::Ended { confidence: 1.0 };
        }

        let silence_weight =
            (silence_ms as f32 / self.config.silence_ceiling_ms as f32).clamp(0.0, 1.0);
        let probability = (completeness + silence_weight * (1.0 - completeness)).clamp(0.0, 1.0);

        if probability >= self.config.eagerness {
            debug!(completeness, silence_ms, probability, "turn ended");
            TurnDecision::Ended {
                confidence: probability,
            }
        } else {
            TurnDecision::Continues
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> EndOfTurnEstimator {
        EndOfTurnEstimator::new(EndOfTurnConfig {
            eagerness: 0.4,
            silence_ceiling_ms: 3_000,
        })
    }

    #[test]
    fn complete_utterance_ends_immediately() {
        let decision = estimator().assess(0.95, 0);
        assert!(decision.is_ended());
    }

    #[test]
    fn incomplete_utterance_continues() {
        assert_eq!(estimator().assess(0.05, 200), TurnDecision::Continues);
    }

    #[test]
    fn silence_ceiling_overrides_model() {
        let decision = estimator().assess(0.0, 3_000);
        assert_eq!(decision, TurnDecision::Ended { confidence: 1.0 });
    }

    #[test]
    fn growing_silence_closes_borderline_utterance() {
        let e = estimator();
        // 0.3 alone is under the 0.4 eagerness threshold
        assert_eq!(e.assess(0.3, 0), TurnDecision::Continues);
        // 600 ms of silence lifts it over: 0.3 + 0.2 * 0.7 = 0.44
        assert!(e.assess(0.3, 600).is_ended());
    }
}

//! Runtime configuration.
//!
//! Loaded from a YAML file or from environment variables, with sane defaults
//! for every stage. All durations are milliseconds.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{AgentError, AgentResult};

/// Top-level configuration for a voice-agent session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Voice activity gate settings
    #[serde(default)]
    pub gate: GateConfig,

    /// End-of-turn estimator settings
    #[serde(default)]
    pub eot: EndOfTurnConfig,

    /// Reply generation settings
    #[serde(default)]
    pub reply: ReplyConfig,

    /// Synthesis pipeline settings
    #[serde(default)]
    pub synth: SynthConfig,

    /// Session-level settings
    #[serde(default)]
    pub session: SessionConfig,
}

/// Voice activity gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Speech probability above which a frame counts toward speech onset
    pub start_threshold: f32,

    /// Speech probability below which a frame counts toward silence.
    /// Kept lower than `start_threshold` for hysteresis.
    pub end_threshold: f32,

    /// Speech must persist this long before `SpeechStarted` fires (ms).
    /// Filters out brief noise spikes.
    pub min_speech_ms: u64,

    /// Silence must persist this long before `SpeechEnded` fires (ms).
    /// Prevents premature end detection during pauses.
    pub min_silence_ms: u64,

    /// Duration of one scored frame (ms)
    pub frame_ms: u64,

    /// If no probability arrives for this long, a synthetic `SpeechEnded`
    /// is emitted so the pipeline cannot hang on a stalled VAD stream.
    pub watchdog_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            start_threshold: 0.5,
            end_threshold: 0.35,
            min_speech_ms: 100,
            min_silence_ms: 300,
            frame_ms: 20,
            watchdog_ms: 2_000,
        }
    }
}

impl GateConfig {
    /// Preset tuned for responsiveness over stability.
    pub fn low_latency() -> Self {
        Self {
            min_speech_ms: 60,
            min_silence_ms: 200,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> AgentResult<()> {
        for (name, value) in [
            ("gate.start_threshold", self.start_threshold),
            ("gate.end_threshold", self.end_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AgentError::Configuration(format!(
                    "{name} must be between 0.0 and 1.0, got {value}"
                )));
            }
        }
        if self.end_threshold > self.start_threshold {
            return Err(AgentError::Configuration(
                "gate.end_threshold must not exceed gate.start_threshold".into(),
            ));
        }
        if self.frame_ms == 0 {
            return Err(AgentError::Configuration("gate.frame_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// End-of-turn estimator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndOfTurnConfig {
    /// Completeness probability at which the turn is declared over.
    /// Lower values cut in sooner at the cost of more false cutoffs.
    pub eagerness: f32,

    /// Silence after which the turn ends no matter what the completeness
    /// model says (ms). Safety net against the model never firing.
    pub silence_ceiling_ms: u64,
}

impl Default for EndOfTurnConfig {
    fn default() -> Self {
        Self {
            eagerness: 0.4,
            silence_ceiling_ms: 3_000,
        }
    }
}

impl EndOfTurnConfig {
    pub fn validate(&self) -> AgentResult<()> {
        if !(0.0..=1.0).contains(&self.eagerness) {
            return Err(AgentError::Configuration(format!(
                "eot.eagerness must be between 0.0 and 1.0, got {}",
                self.eagerness
            )));
        }
        if self.silence_ceiling_ms == 0 {
            return Err(AgentError::Configuration(
                "eot.silence_ceiling_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Reply generation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    /// Maximum tool calls within one turn before the turn fails
    pub max_tool_calls: u32,

    /// Segment length at which text is cut even without a clause boundary
    pub max_segment_chars: usize,

    /// Minimum characters before the first segment is emitted. Small so
    /// synthesis can start early.
    pub first_segment_min_chars: usize,

    /// Spoken when a turn fails (collaborator outage, tool loop)
    pub fallback_utterance: String,

    /// Optional instruction for an agent-initiated opening turn, spoken
    /// before the session starts listening.
    #[serde(default)]
    pub greeting_instruction: Option<String>,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 4,
            max_segment_chars: 240,
            first_segment_min_chars: 24,
            fallback_utterance: "Sorry, I ran into a problem with that. Could you try again?"
                .to_string(),
            greeting_instruction: None,
        }
    }
}

impl ReplyConfig {
    pub fn validate(&self) -> AgentResult<()> {
        if self.max_tool_calls == 0 {
            return Err(AgentError::Configuration(
                "reply.max_tool_calls must be > 0".into(),
            ));
        }
        if self.max_segment_chars < self.first_segment_min_chars {
            return Err(AgentError::Configuration(
                "reply.max_segment_chars must be >= reply.first_segment_min_chars".into(),
            ));
        }
        Ok(())
    }
}

/// Synthesis pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Segments synthesized ahead of the one currently streaming.
    /// Playback order stays strictly sequential regardless.
    pub lookahead: usize,

    /// Queue depth between the reply generator and synthesis
    pub segment_queue_depth: usize,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            lookahead: 1,
            segment_queue_depth: 16,
        }
    }
}

impl SynthConfig {
    pub fn validate(&self) -> AgentResult<()> {
        if self.segment_queue_depth == 0 {
            return Err(AgentError::Configuration(
                "synth.segment_queue_depth must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Session-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Depth of the inbound/outbound audio frame queues
    pub frame_queue_depth: usize,

    /// Retry attempts per collaborator call before the turn fails
    pub retry_attempts: u32,

    /// Initial retry backoff (ms)
    pub retry_initial_delay_ms: u64,

    /// Backoff cap (ms)
    pub retry_max_delay_ms: u64,

    /// Absolute timeout for a single collaborator call (ms)
    pub collaborator_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_queue_depth: 64,
            retry_attempts: 2,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 1_000,
            collaborator_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> AgentResult<()> {
        if self.frame_queue_depth == 0 {
            return Err(AgentError::Configuration(
                "session.frame_queue_depth must be > 0".into(),
            ));
        }
        if self.collaborator_timeout_ms == 0 {
            return Err(AgentError::Configuration(
                "session.collaborator_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl RuntimeConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> AgentResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: RuntimeConfig = serde_yaml::from_str(&contents).map_err(|e| {
            AgentError::Configuration(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset. Recognized variables use the
    /// `VOICETURN_` prefix, e.g. `VOICETURN_EOT_EAGERNESS`.
    pub fn from_env() -> AgentResult<Self> {
        let mut config = RuntimeConfig::default();

        if let Some(v) = env_parse::<f32>("VOICETURN_GATE_START_THRESHOLD")? {
            config.gate.start_threshold = v;
        }
        if let Some(v) = env_parse::<f32>("VOICETURN_GATE_END_THRESHOLD")? {
            config.gate.end_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("VOICETURN_GATE_MIN_SILENCE_MS")? {
            config.gate.min_silence_ms = v;
        }
        if let Some(v) = env_parse::<f32>("VOICETURN_EOT_EAGERNESS")? {
            config.eot.eagerness = v;
        }
        if let Some(v) = env_parse::<u64>("VOICETURN_EOT_SILENCE_CEILING_MS")? {
            config.eot.silence_ceiling_ms = v;
        }
        if let Some(v) = env_parse::<u32>("VOICETURN_REPLY_MAX_TOOL_CALLS")? {
            config.reply.max_tool_calls = v;
        }
        if let Ok(v) = std::env::var("VOICETURN_GREETING_INSTRUCTION") {
            if !v.is_empty() {
                config.reply.greeting_instruction = Some(v);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> AgentResult<()> {
        self.gate.validate()?;
        self.eot.validate()?;
        self.reply.validate()?;
        self.synth.validate()?;
        self.session.validate()?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> AgentResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            AgentError::Configuration(format!("{name} has invalid value '{raw}'"))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.eot.eagerness, 0.4);
    }

    #[test]
    fn rejects_out_of_range_eagerness() {
        let mut config = RuntimeConfig::default();
        config.eot.eagerness = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_gate_thresholds() {
        let mut config = RuntimeConfig::default();
        config.gate.start_threshold = 0.3;
        config.gate.end_threshold = 0.6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn low_latency_preset_is_valid() {
        assert!(GateConfig::low_latency().validate().is_ok());
    }

    #[test]
    fn loads_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "eot:\n  eagerness: 0.6\nreply:\n  max_tool_calls: 2").unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.eot.eagerness, 0.6);
        assert_eq!(config.reply.max_tool_calls, 2);
        // Untouched sections fall back to defaults
        assert_eq!(config.gate.min_silence_ms, 300);
    }

    #[test]
    fn from_file_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "eot:\n  eagerness: 7.0").unwrap();
        assert!(RuntimeConfig::from_file(file.path()).is_err());
    }
}

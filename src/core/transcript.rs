//! Append-only transcript log.
//!
//! Streaming speech-to-text engines revise earlier words as more audio
//! arrives. Rather than rewriting text in place, every revision is stored
//! immutably; the latest one is authoritative for display and decisions,
//! and the final one is permanent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscriptError {
    /// A final revision was already recorded for this utterance.
    #[error("transcript is sealed; no revisions may follow a final one")]
    Sealed,

    /// Revision numbers must increase monotonically.
    #[error("revision {got} is not after {latest}")]
    StaleRevision { latest: u64, got: u64 },
}

/// One revision of an utterance's text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRevision {
    /// Transcribed text, full replacement of any earlier revision
    pub text: String,
    /// Monotonically increasing revision number within the utterance
    pub revision: u64,
    /// Final revisions are immutable and close the utterance
    pub is_final: bool,
}

impl TranscriptRevision {
    pub fn partial(text: impl Into<String>, revision: u64) -> Self {
        Self {
            text: text.into(),
            revision,
            is_final: false,
        }
    }

    pub fn final_revision(text: impl Into<String>, revision: u64) -> Self {
        Self {
            text: text.into(),
            revision,
            is_final: true,
        }
    }
}

/// The revision log for a single utterance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    revisions: Vec<TranscriptRevision>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a revision. Rejected once a final revision exists, or if the
    /// revision number does not advance.
    pub fn push(&mut self, revision: TranscriptRevision) -> Result<(), TranscriptError> {
        if self.is_sealed() {
            return Err(TranscriptError::Sealed);
        }
        if let Some(latest) = self.latest() {
            if revision.revision <= latest.revision {
                return Err(TranscriptError::StaleRevision {
                    latest: latest.revision,
                    got: revision.revision,
                });
            }
        }
        self.revisions.push(revision);
        Ok(())
    }

    /// The authoritative current revision, if any.
    pub fn latest(&self) -> Option<&TranscriptRevision> {
        self.revisions.last()
    }

    /// Current text (empty until the first revision arrives).
    pub fn text(&self) -> &str {
        self.latest().map(|r| r.text.as_str()).unwrap_or("")
    }

    /// Whether a final revision closed the utterance.
    pub fn is_sealed(&self) -> bool {
        self.latest().map(|r| r.is_final).unwrap_or(false)
    }

    /// The permanent final text, if the utterance is closed.
    pub fn final_text(&self) -> Option<&str> {
        self.latest()
            .filter(|r| r.is_final)
            .map(|r| r.text.as_str())
    }

    pub fn revision_count(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text().trim().is_empty()
    }
}

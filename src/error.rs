//! Error taxonomy for a polling run.
use thiserror::Error;

/// Errors surfaced by the batch lifecycle.
///
/// `Parse` and `Validation` are expected outcomes: they are logged and
/// recorded as data, and never abort a run on their own. `Transport` and
/// `Fatal` abort the remainder of the run and are captured in the polling
/// attempt.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unrecognised filename {filename}: {reason}")]
    Parse { filename: String, reason: String },
    #[error("validation failed for batch {batch}: {reason}")]
    Validation { batch: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn parse(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::Parse {
            filename: filename.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(batch: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::Validation {
            batch: batch.into(),
            reason: reason.into(),
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        IngestError::Fatal(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, IngestError::Validation { .. })
    }

    /// Full message including any wrapped context, suitable for persisting.
    pub fn describe(&self) -> String {
        match self {
            IngestError::Other(err) => format!("{:#}", err),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn describe_keeps_context_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("disk full"));
        let err = err.context("copying 1_Admin_Patient.csv").unwrap_err();
        let described = IngestError::from(err).describe();
        assert!(described.contains("copying 1_Admin_Patient.csv"));
        assert!(described.contains("disk full"));
    }

    #[test]
    fn validation_is_recognised() {
        assert!(IngestError::validation("2024-01-01", "missing files").is_validation());
        assert!(!IngestError::fatal("boom").is_validation());
    }
}

use std::time::Duration;

/// Failures of the fetch-normalize-diff pipeline for a single target.
///
/// None of these escape the scheduler; they are logged against the target and
/// the cycle moves on.
#[derive(Debug, thiserror::Error)]
pub enum ScoreboardError {
    /// No candidate endpoint matched, or nothing was captured
    #[error("scoreboard discovery failed: {0}")]
    Discovery(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Payload found but its envelope does not hold an entry list
    #[error("unexpected scoreboard shape: {0}")]
    Shape(String),

    #[error("headless browser error: {0}")]
    Browser(String),

    #[error("unsupported source kind: {0}")]
    UnsupportedSource(String),

    #[error("snapshot store error: {0:#}")]
    Persistence(anyhow::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<chromiumoxide::error::CdpError> for ScoreboardError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        ScoreboardError::Browser(err.to_string())
    }
}

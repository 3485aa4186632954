use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::error::ScoreboardError;
use crate::db::models::{PollTarget, ScoreboardEntry, SourceKind};

/// Trait that every scoreboard fetch strategy must implement.
#[async_trait]
pub trait ScoreboardSource: Send + Sync {
    /// Fetch and normalize the target's current scoreboard.
    async fn fetch_entries(
        &self,
        target: &PollTarget,
    ) -> Result<Vec<ScoreboardEntry>, ScoreboardError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Routes each target to the strategy matching its declared kind.
#[derive(Clone)]
pub struct SourceFetcher {
    api: Arc<dyn ScoreboardSource>,
    rendered: Arc<dyn ScoreboardSource>,
}

impl SourceFetcher {
    pub fn new(api: Arc<dyn ScoreboardSource>, rendered: Arc<dyn ScoreboardSource>) -> Self {
        SourceFetcher { api, rendered }
    }

    pub fn source_for(
        &self,
        target: &PollTarget,
    ) -> Result<&Arc<dyn ScoreboardSource>, ScoreboardError> {
        match target.source_kind() {
            Ok(SourceKind::Api) => Ok(&self.api),
            Ok(SourceKind::Rendered) => Ok(&self.rendered),
            Err(_) => Err(ScoreboardError::UnsupportedSource(target.kind.clone())),
        }
    }

    pub async fn fetch(&self, target: &PollTarget) -> Result<Vec<ScoreboardEntry>, ScoreboardError> {
        let source = self.source_for(target)?;
        debug!("[{}] Fetching via {}", target.key(), source.name());
        source.fetch_entries(target).await
    }
}

pub mod webhook;

pub use webhook::WebhookSink;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::models::DeltaEvent;
use crate::db::Database;

/// Receives scoreboard deltas for delivery. Only called on a real change.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn on_delta(&self, event: &DeltaEvent) -> Result<()>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Writes a one-line summary of every delta to the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_delta(&self, event: &DeltaEvent) -> Result<()> {
        let leader = event
            .entries
            .first()
            .map(|e| format!("{} ({})", e.name, e.score))
            .unwrap_or_else(|| "N/A".to_string());
        info!(
            "[{}] Scoreboard update from {}: leader {}, {} change(s)",
            event.target,
            event.source_url,
            leader,
            event.changes.len()
        );
        for change in &event.changes {
            info!("[{}]   {}", event.target, change);
        }
        Ok(())
    }
}

/// Keeps a delta history for the admin API.
pub struct DatabaseSink {
    db: Database,
}

impl DatabaseSink {
    pub fn new(db: Database) -> Self {
        DatabaseSink { db }
    }
}

#[async_trait]
impl NotificationSink for DatabaseSink {
    fn name(&self) -> &str {
        "database"
    }

    async fn on_delta(&self, event: &DeltaEvent) -> Result<()> {
        self.db.insert_delta_event(event)?;
        Ok(())
    }
}

/// Delivers to every inner sink; one sink failing does not stop the others.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        FanoutSink { sinks }
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn on_delta(&self, event: &DeltaEvent) -> Result<()> {
        let mut failed = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.on_delta(event).await {
                warn!("[{}] Sink '{}' failed: {:#}", event.target, sink.name(), e);
                failed.push(sink.name().to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("delivery failed for sink(s): {}", failed.join(", "))
        }
    }
}

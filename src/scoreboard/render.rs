//! Scoreboard capture for platforms that only render standings client-side.
//!
//! ```text
//!  Chromium (headless) ──responseReceived──▶ filter: XHR/fetch + URL pattern + JSON
//!        │                                        │ request ids, arrival order
//!        ▼                                        ▼
//!  network quiet + settle delay ──▶ Network.getResponseBody ──▶ last payload wins
//! ```
//!
//! Each capture launches and tears down a whole browser process, so sessions
//! are bounded by a semaphore shared by every target.
//!
//! Known limitation: the LAST leaderboard-looking JSON response is taken as
//! authoritative. A platform that fires several such requests where the final
//! one is not the standings table will be misreported.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EventResponseReceived, GetResponseBodyParams, Headers, RequestId, ResourceType,
    SetExtraHttpHeadersParams,
};
use chromiumoxide::Page;
use futures_util::StreamExt;
use regex::Regex;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::ScoreboardError;
use super::normalize::normalize_entries;
use super::provider::ScoreboardSource;
use crate::db::models::{PollTarget, ScoreboardEntry};

/// Envelope keys that may hold the entry list, in lookup order.
pub const ENVELOPE_KEYS: [&str; 5] = ["data", "leaderboard", "scores", "result", "items"];

fn leaderboard_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(score|scores|leader|leaderboard|standing|rank)")
            .expect("leaderboard pattern is a valid regex")
    })
}

/// Settings for headless capture sessions.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub user_agent: String,
    /// Bound on navigation plus waiting for the network to go quiet
    pub navigation_timeout: Duration,
    /// Extra collection time once the network went quiet
    pub settle_delay: Duration,
    /// Gap without new responses that counts as "network quiet"
    pub idle_window: Duration,
    pub max_sessions: usize,
    pub chrome_executable: Option<PathBuf>,
    pub no_sandbox: bool,
    /// Parent of the per-session profile directories; system temp dir when unset
    pub profile_parent: Option<PathBuf>,
}

/// A JSON body intercepted during page load.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedResponse {
    pub url: String,
    pub payload: Value,
}

pub struct RenderCapture {
    config: RenderConfig,
    sessions: Arc<Semaphore>,
}

impl RenderCapture {
    pub fn new(config: RenderConfig) -> Self {
        let sessions = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        RenderCapture { config, sessions }
    }

    /// Load `url` in a fresh browser session and return every matching JSON
    /// response in arrival order.
    pub async fn capture(
        &self,
        url: &str,
        auth_token: Option<&str>,
    ) -> Result<Vec<CapturedResponse>, ScoreboardError> {
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|_| ScoreboardError::Browser("browser session pool closed".into()))?;

        // Removed on drop, including when this future is cancelled mid-session
        let profile = self.new_profile_dir()?;

        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile.path())
            .request_timeout(self.config.navigation_timeout)
            .arg(format!("--user-agent={}", self.config.user_agent));
        if let Some(exe) = &self.config.chrome_executable {
            builder = builder.chrome_executable(exe);
        }
        if self.config.no_sandbox {
            builder = builder.no_sandbox();
        }
        let browser_config = builder.build().map_err(ScoreboardError::Browser)?;

        let (mut browser, mut handler) = Browser::launch(browser_config).await?;
        let _handler_task = AbortOnDrop(tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        }));

        let result = self.run_session(&browser, url, auth_token).await;

        if let Err(e) = browser.close().await {
            debug!("Browser close failed: {}", e);
        }
        if let Err(e) = browser.wait().await {
            debug!("Browser wait failed: {}", e);
        }
        let profile_path = profile.path().to_path_buf();
        if let Err(e) = profile.close() {
            debug!("Could not remove profile {}: {}", profile_path.display(), e);
        }

        result
    }

    fn new_profile_dir(&self) -> Result<TempDir, ScoreboardError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("scoreboard-watch-");
        let dir = match &self.config.profile_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        };
        dir.map_err(|e| ScoreboardError::Browser(format!("cannot create browser profile: {}", e)))
    }

    async fn run_session(
        &self,
        browser: &Browser,
        url: &str,
        auth_token: Option<&str>,
    ) -> Result<Vec<CapturedResponse>, ScoreboardError> {
        let page = browser.new_page("about:blank").await?;

        if let Some(token) = auth_token {
            let headers = Headers::new(serde_json::json!({
                "Authorization": format!("Bearer {}", token),
            }));
            page.execute(SetExtraHttpHeadersParams::new(headers)).await?;
        }

        let mut responses = page.event_listener::<EventResponseReceived>().await?;
        let mut matched: Vec<(RequestId, String)> = Vec::new();

        let nav_timeout = self.config.navigation_timeout;
        let deadline = Instant::now() + nav_timeout;
        tokio::time::timeout(nav_timeout, page.goto(url))
            .await
            .map_err(|_| ScoreboardError::Timeout(nav_timeout))??;

        // wait for the network to go quiet, bounded by the navigation budget
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Network never went quiet on {}", url);
                break;
            }
            match tokio::time::timeout(self.config.idle_window.min(remaining), responses.next())
                .await
            {
                Ok(Some(event)) => record_response(&event, &mut matched),
                Ok(None) | Err(_) => break,
            }
        }

        let settle = tokio::time::sleep(self.config.settle_delay);
        tokio::pin!(settle);
        loop {
            tokio::select! {
                _ = &mut settle => break,
                Some(event) = responses.next() => record_response(&event, &mut matched),
            }
        }

        Ok(read_bodies(&page, matched).await)
    }
}

/// Aborts the CDP handler loop when the session ends, however it ends.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn record_response(event: &EventResponseReceived, matched: &mut Vec<(RequestId, String)>) {
    let response = &event.response;
    if is_background_request(&event.r#type)
        && matches_leaderboard_url(&response.url)
        && response.mime_type.to_lowercase().contains("json")
    {
        debug!("Leaderboard candidate response: {}", response.url);
        matched.push((event.request_id.clone(), response.url.clone()));
    }
}

async fn read_bodies(page: &Page, matched: Vec<(RequestId, String)>) -> Vec<CapturedResponse> {
    let mut captured = Vec::with_capacity(matched.len());
    for (request_id, url) in matched {
        let body = match page.execute(GetResponseBodyParams::new(request_id)).await {
            Ok(resp) => resp.result,
            Err(e) => {
                debug!("No body for {}: {}", url, e);
                continue;
            }
        };
        if body.base64_encoded {
            debug!("Skipping binary body from {}", url);
            continue;
        }
        match serde_json::from_str::<Value>(&body.body) {
            Ok(payload) => captured.push(CapturedResponse { url, payload }),
            Err(e) => debug!("Unparsable JSON from {}: {}", url, e),
        }
    }
    captured
}

/// Only script-initiated traffic counts; document navigations never do.
pub fn is_background_request(kind: &ResourceType) -> bool {
    matches!(kind, ResourceType::Xhr | ResourceType::Fetch)
}

pub fn matches_leaderboard_url(url: &str) -> bool {
    leaderboard_pattern().is_match(url)
}

/// The entry rows of a captured payload: the payload itself when it is a
/// list, otherwise the first list under one of [`ENVELOPE_KEYS`].
pub fn find_entry_rows(payload: &Value) -> Option<&[Value]> {
    if let Some(rows) = payload.as_array() {
        return Some(rows);
    }
    let obj = payload.as_object()?;
    ENVELOPE_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array))
        .map(Vec::as_slice)
}

/// Pick the last captured payload and normalize its entries.
pub fn select_entries(
    mut captured: Vec<CapturedResponse>,
) -> Result<Vec<ScoreboardEntry>, ScoreboardError> {
    let last = captured
        .pop()
        .ok_or_else(|| ScoreboardError::Discovery("no leaderboard JSON captured".into()))?;
    let rows = find_entry_rows(&last.payload).ok_or_else(|| {
        ScoreboardError::Shape(format!("payload from {} holds no entry list", last.url))
    })?;
    Ok(normalize_entries(rows))
}

#[async_trait]
impl ScoreboardSource for RenderCapture {
    fn name(&self) -> &str {
        "render-capture"
    }

    async fn fetch_entries(
        &self,
        target: &PollTarget,
    ) -> Result<Vec<ScoreboardEntry>, ScoreboardError> {
        let captured = self
            .capture(&target.base_url, target.auth_token.as_deref())
            .await?;
        info!(
            "Captured {} leaderboard response(s) from {}",
            captured.len(),
            target.base_url
        );
        select_entries(captured)
    }
}

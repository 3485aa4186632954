use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::error::ScoreboardError;
use super::normalize::{has_entry_keys, normalize_entries};
use super::provider::ScoreboardSource;
use crate::db::models::{PollTarget, ScoreboardEntry};

/// A candidate endpoint plus the check its response body must pass.
#[derive(Clone, Copy)]
pub struct ProbeCandidate {
    pub path: &'static str,
    /// Returns the raw entry rows when the payload has the expected shape
    pub validate: fn(&Value) -> Option<&[Value]>,
}

/// Tried in order; the first structural match wins.
pub const DEFAULT_CANDIDATES: [ProbeCandidate; 4] = [
    ProbeCandidate {
        path: "/api/v1/scoreboard",
        validate: data_envelope,
    },
    ProbeCandidate {
        path: "/api/v1/scoreboard?count=1000",
        validate: data_envelope,
    },
    ProbeCandidate {
        path: "/scoreboard?format=json",
        validate: data_envelope,
    },
    ProbeCandidate {
        path: "/scores?format=json",
        validate: data_envelope,
    },
];

/// CTFd-style envelope: `{"success": true, "data": [{"name": .., "score": ..}, ..]}`
pub fn data_envelope(payload: &Value) -> Option<&[Value]> {
    let rows = payload.as_object()?.get("data")?.as_array()?;
    let first = rows.first()?;
    has_entry_keys(first).then_some(rows.as_slice())
}

/// Discovers a JSON scoreboard endpoint on REST-ish platforms by probing a
/// fixed list of well-known paths.
pub struct ApiProber {
    http: Client,
    candidates: Vec<ProbeCandidate>,
}

impl ApiProber {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, ScoreboardError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(ApiProber {
            http,
            candidates: DEFAULT_CANDIDATES.to_vec(),
        })
    }

    #[cfg(test)]
    fn with_candidates(mut self, candidates: Vec<ProbeCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Probe every candidate against `base_url`; returns the matching URL and
    /// its normalized entries.
    pub async fn probe(
        &self,
        base_url: &str,
        auth_token: Option<&str>,
    ) -> Result<(Url, Vec<ScoreboardEntry>), ScoreboardError> {
        let base = parse_base_url(base_url)?;

        for candidate in &self.candidates {
            let url = match base.join(candidate.path) {
                Ok(u) => u,
                Err(e) => {
                    debug!("Skipping candidate {}: {}", candidate.path, e);
                    continue;
                }
            };

            let payload = match self.get_json(&url, auth_token).await {
                Ok(Some(p)) => p,
                Ok(None) => {
                    debug!("{} did not return JSON", url);
                    continue;
                }
                Err(e) => {
                    debug!("{} failed: {}", url, e);
                    continue;
                }
            };

            match (candidate.validate)(&payload) {
                Some(rows) => {
                    let entries = normalize_entries(rows);
                    info!("Found scoreboard endpoint {} ({} entries)", url, entries.len());
                    return Ok((url, entries));
                }
                None => debug!("{} returned JSON of an unexpected shape", url),
            }
        }

        Err(ScoreboardError::Discovery(format!(
            "no scoreboard endpoint found under {}",
            base
        )))
    }

    /// GET a URL; `Ok(None)` when the response is not JSON-typed.
    async fn get_json(
        &self,
        url: &Url,
        auth_token: Option<&str>,
    ) -> Result<Option<Value>, ScoreboardError> {
        let mut req = self.http.get(url.clone());
        if let Some(token) = auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let resp = req.send().await?.error_for_status()?;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if !content_type.contains("json") {
            return Ok(None);
        }

        Ok(Some(resp.json::<Value>().await?))
    }
}

#[async_trait]
impl ScoreboardSource for ApiProber {
    fn name(&self) -> &str {
        "api-probe"
    }

    async fn fetch_entries(
        &self,
        target: &PollTarget,
    ) -> Result<Vec<ScoreboardEntry>, ScoreboardError> {
        let (_, entries) = self
            .probe(&target.base_url, target.auth_token.as_deref())
            .await?;
        Ok(entries)
    }
}

fn parse_base_url(base_url: &str) -> Result<Url, ScoreboardError> {
    let trimmed = format!("{}/", base_url.trim().trim_end_matches('/'));
    Url::parse(&trimmed)
        .map_err(|e| ScoreboardError::Discovery(format!("invalid base URL '{}': {}", base_url, e)))
}

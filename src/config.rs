use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// CTF scoreboard watcher: polls scoreboards and reports rank/score changes
#[derive(Parser, Debug, Clone)]
#[command(name = "scoreboard-watch", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "scoreboard.db")]
    pub database_path: String,

    /// Admin API listen address
    #[arg(long, env = "ADMIN_ADDR", default_value = "127.0.0.1:8080")]
    pub admin_addr: String,

    /// Seconds between poll cycles
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "30")]
    pub poll_interval_secs: u64,

    /// Number of leading entries compared for rank/score changes
    #[arg(long, env = "SCOREBOARD_TOP_N", default_value = "10")]
    pub top_n: usize,

    /// Maximum change lines carried by one delta event
    #[arg(long, env = "MAX_CHANGE_LINES", default_value = "5")]
    pub max_change_lines: usize,

    /// Targets polled concurrently
    #[arg(long, env = "POLL_WORKERS", default_value = "3")]
    pub poll_workers: usize,

    /// Upper bound on one target's fetch, diff and delivery
    #[arg(long, env = "TARGET_TIMEOUT_SECS", default_value = "120")]
    pub target_timeout_secs: u64,

    /// Timeout for each scoreboard API request
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "20")]
    pub http_timeout_secs: u64,

    /// User-Agent sent to scoreboards (defaults to scoreboard-watch/<version>)
    #[arg(long, env = "USER_AGENT")]
    pub user_agent: Option<String>,

    /// Concurrent headless browser sessions
    #[arg(long, env = "MAX_BROWSER_SESSIONS", default_value = "2")]
    pub max_browser_sessions: usize,

    /// Page navigation timeout for rendered scoreboards
    #[arg(long, env = "NAVIGATION_TIMEOUT_SECS", default_value = "60")]
    pub navigation_timeout_secs: u64,

    /// Extra capture time after the page's network went quiet
    #[arg(long, env = "SETTLE_DELAY_MS", default_value = "2000")]
    pub settle_delay_ms: u64,

    /// Chrome/Chromium binary; auto-detected when unset
    #[arg(long, env = "CHROME_EXECUTABLE")]
    pub chrome_executable: Option<PathBuf>,

    /// Launch the browser with --no-sandbox (needed in most containers)
    #[arg(long, env = "BROWSER_NO_SANDBOX", default_value = "false")]
    pub browser_no_sandbox: bool,

    /// Where per-session browser profiles are created; system temp dir when unset
    #[arg(long, env = "BROWSER_PROFILE_DIR")]
    pub browser_profile_dir: Option<PathBuf>,

    /// Participant tracked on targets that do not name one
    #[arg(long, env = "SCOREBOARD_TEAM_NAME")]
    pub team_name: Option<String>,

    /// Delta events are POSTed here as JSON when set
    #[arg(long, env = "WEBHOOK_URL")]
    pub webhook_url: Option<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be at least 1");
        }
        if self.top_n == 0 {
            anyhow::bail!("top_n must be at least 1");
        }
        if self.poll_workers == 0 {
            anyhow::bail!("poll_workers must be at least 1");
        }
        if self.max_browser_sessions == 0 {
            anyhow::bail!("max_browser_sessions must be at least 1");
        }
        if self.http_timeout_secs == 0 || self.navigation_timeout_secs == 0 {
            anyhow::bail!("request timeouts must be at least 1 second");
        }
        // A rendered fetch must fit inside the per-target budget
        let render_budget = self.navigation_timeout_secs + self.settle_delay_ms.div_ceil(1000);
        if self.target_timeout_secs <= render_budget {
            anyhow::bail!(
                "target_timeout_secs ({}) must exceed navigation timeout plus settle delay ({}s)",
                self.target_timeout_secs,
                render_budget
            );
        }
        if let Some(url) = &self.webhook_url {
            url::Url::parse(url).map_err(|e| anyhow::anyhow!("invalid WEBHOOK_URL: {}", e))?;
        }
        Ok(())
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("scoreboard-watch/{}", env!("CARGO_PKG_VERSION")))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn target_timeout(&self) -> Duration {
        Duration::from_secs(self.target_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Blank team names count as unset.
    pub fn default_tracked_name(&self) -> Option<String> {
        self.team_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}

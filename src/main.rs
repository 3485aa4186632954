use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod dashboard;
mod db;
mod notify;
mod scoreboard;

use config::Config;
use dashboard::AppState;
use db::Database;
use notify::{DatabaseSink, FanoutSink, LogSink, NotificationSink, WebhookSink};
use scoreboard::{
    start_poll_loop, ApiProber, DiffEngine, PollScheduler, RenderCapture, RenderConfig,
    SchedulerConfig, SourceFetcher,
};

/// How long rendered pages may stay silent before the network counts as idle
const RENDER_IDLE_WINDOW: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;
    let user_agent = config.user_agent();

    // Open database
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    // Fetch strategies
    let api = ApiProber::new(&user_agent, config.http_timeout())?;
    let rendered = RenderCapture::new(RenderConfig {
        user_agent: user_agent.clone(),
        navigation_timeout: Duration::from_secs(config.navigation_timeout_secs),
        settle_delay: Duration::from_millis(config.settle_delay_ms),
        idle_window: RENDER_IDLE_WINDOW,
        max_sessions: config.max_browser_sessions,
        chrome_executable: config.chrome_executable.clone(),
        no_sandbox: config.browser_no_sandbox,
        profile_parent: config.browser_profile_dir.clone(),
    });
    let fetcher = SourceFetcher::new(Arc::new(api), Arc::new(rendered));

    // Delivery: always log and record; webhook when configured
    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![
        Arc::new(LogSink),
        Arc::new(DatabaseSink::new(db.clone())),
    ];
    if let Some(url) = &config.webhook_url {
        sinks.push(Arc::new(WebhookSink::new(url, &user_agent)?));
        info!("Webhook delivery enabled: {}", url);
    }
    info!("Configured {} notification sink(s)", sinks.len());

    let default_tracked_name = config.default_tracked_name();
    if let Some(name) = &default_tracked_name {
        info!("Tracking '{}' on targets without their own tracked name", name);
    }

    let scheduler = Arc::new(PollScheduler::new(
        Arc::new(db.clone()),
        fetcher,
        DiffEngine::new(config.top_n, config.max_change_lines),
        Arc::new(FanoutSink::new(sinks)),
        SchedulerConfig {
            interval: config.poll_interval(),
            workers: config.poll_workers,
            target_timeout: config.target_timeout(),
            default_tracked_name,
        },
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
            shutdown.cancel();
        });
    }

    let poller = start_poll_loop(scheduler.clone(), shutdown.clone());

    // Start the admin API server
    let app = dashboard::router(AppState {
        db: db.clone(),
        scheduler,
    });
    let addr: SocketAddr = config
        .admin_addr
        .parse()
        .with_context(|| format!("invalid ADMIN_ADDR '{}'", config.admin_addr))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Admin API listening on http://{}", addr);

    // Run admin server until shutdown, then let the in-flight cycle finish
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;
    shutdown.cancel();

    if let Err(e) = poller.await {
        error!("Poll loop task failed: {}", e);
    }
    info!("Stopped");

    Ok(())
}

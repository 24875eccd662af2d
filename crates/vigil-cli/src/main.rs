//! # vigil
//!
//! Demo client for the Vigil realtime feed: connects to a dashboard, tails
//! inventory transitions, and optionally one server's performance window.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use vigil_core::{AuthToken, InventoryView, MetricPoint, ServerId};
use vigil_sync::{
    RestHistory, SyncConfig, SyncService, WsTransport, default_config_path, load_config_from_path,
};

/// Vigil realtime feed client.
#[derive(Parser, Debug)]
#[command(name = "vigil", about = "Tail a Vigil dashboard's realtime feed")]
struct Cli {
    /// Dashboard base URL (http or https).
    #[arg(long)]
    base_url: Option<String>,

    /// Bearer token for the authenticated feed. Falls back to VIGIL_TOKEN;
    /// connects anonymously when both are absent.
    #[arg(long)]
    token: Option<String>,

    /// Server whose performance window to tail alongside the inventory.
    #[arg(long)]
    server: Option<String>,

    /// Sliding metric window in seconds.
    #[arg(long)]
    window_secs: Option<u64>,

    /// Config file path (default: ~/.vigil/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    /// Token from the flag, or the VIGIL_TOKEN environment variable.
    fn resolve_token(&self) -> Option<AuthToken> {
        self.token
            .clone()
            .or_else(|| std::env::var("VIGIL_TOKEN").ok())
            .filter(|t| !t.is_empty())
            .map(AuthToken::from)
    }
}

/// Layer CLI flags over a loaded configuration. Flags win over everything.
fn build_config(args: &Cli, mut config: SyncConfig) -> SyncConfig {
    if let Some(base_url) = &args.base_url {
        config.base_url.clone_from(base_url);
    }
    if let Some(secs) = args.window_secs {
        let window_ms = secs.saturating_mul(1000);
        config.metric_window_ms = window_ms;
        config.check_window_ms = window_ms;
    }
    config
}

/// Initialize the global tracing subscriber (stderr, compact).
///
/// RUST_LOG wins over the CLI level when set. Subsequent calls are no-ops.
fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();
    let _ = subscriber.try_init();
}

/// One line summarizing an inventory view.
fn format_inventory(view: &InventoryView) -> String {
    if let Some(error) = &view.error {
        return format!("[{}] error: {error}", view.connection);
    }
    if view.is_loading {
        return format!("[{}] waiting for inventory", view.connection);
    }
    if view.servers.is_empty() {
        return format!("[{}] no servers", view.connection);
    }
    let servers = view
        .servers
        .iter()
        .map(|s| format!("{} {}", s.name, s.status))
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{}] {} servers: {servers}", view.connection, view.servers.len())
}

/// One line summarizing a delivered performance window.
fn format_window(server: &ServerId, window: &[MetricPoint]) -> String {
    match window.last() {
        Some(latest) => format!(
            "{server}: {} samples, latest {}={:.1} at {}",
            window.len(),
            latest.channel,
            latest.value,
            latest.recorded_at.to_rfc3339()
        ),
        None => format!("{server}: window empty"),
    }
}

/// Print every inventory transition until the service goes away.
async fn tail_inventory(service: Arc<SyncService>) {
    let mut updates = service.inventory().subscribe();
    loop {
        let view = updates.borrow_and_update().clone();
        println!("{}", format_inventory(&view));
        if updates.changed().await.is_err() {
            break;
        }
    }
}

/// Print one server's performance window on every delivery.
///
/// The subscription closes when the cache is cleared (credential change);
/// re-subscribing picks the feed back up on the new session.
async fn tail_performance(service: Arc<SyncService>, server: ServerId) {
    loop {
        let mut sub = service.performance().subscribe(server.clone());
        let initial = service.performance().initial_window(&server).await;
        println!("{}", format_window(&server, &initial));
        while let Some(window) = sub.next_window().await {
            println!("{}", format_window(&server, &window));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging(&args.log_level);

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = load_config_from_path(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let config = build_config(&args, config);
    tracing::info!(base_url = %config.base_url, "starting vigil");

    // The CLI owns the credential slot; the token is fixed for the life of
    // the process. An embedding dashboard would feed login/logout through
    // this same channel.
    let (_credentials, credential_watch) = watch::channel(args.resolve_token());

    let history = Arc::new(RestHistory::new(
        config.base_url.clone(),
        credential_watch.clone(),
    ));
    let service = Arc::new(SyncService::new(
        config,
        Arc::new(WsTransport),
        credential_watch,
        Arc::clone(&history) as _,
        history as _,
    ));
    service.init();

    let inventory_task = tokio::spawn(tail_inventory(Arc::clone(&service)));
    let performance_task = args
        .server
        .clone()
        .map(|id| tokio::spawn(tail_performance(Arc::clone(&service), ServerId::from(id))));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    if let Some(task) = performance_task {
        task.abort();
    }
    inventory_task.abort();
    service.shutdown().await;

    Ok(())
}

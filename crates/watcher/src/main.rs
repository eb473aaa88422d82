//! Watcher entry point.
//!
//! Follows the chat, presence and odds feeds of one match and logs every
//! snapshot change until interrupted.

use anyhow::{Context, Result};
use common::{ConnectionManager, WsTransport};
use feeds::{ChatFeed, ChatTarget, FeedClient, FeedConfig, OddsFeed, PresenceFeed};
use metrics_exporter_prometheus::PrometheusBuilder;
use rest_client::{PlatformApi, PlatformClient};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting watcher");

    // Read configuration from environment
    let ws_base_url = env::var("WS_BASE_URL").unwrap_or_else(|_| "ws://localhost:3001".to_string());
    let api_base_url =
        env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000/api".to_string());
    let api_token = env::var("API_TOKEN").ok().filter(|t| !t.is_empty());
    let match_id = env::var("MATCH_ID").context("MATCH_ID must be set")?;
    let competition_id = env::var("COMPETITION_ID").ok().filter(|id| !id.is_empty());
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9095".to_string())
        .parse()
        .context("METRICS_PORT must be a number")?;
    let config = FeedConfig::from_env();

    info!("Configuration:");
    info!("  WS_BASE_URL: {}", ws_base_url);
    info!("  API_BASE_URL: {}", api_base_url);
    info!("  MATCH_ID: {}", match_id);
    info!("  COMPETITION_ID: {:?}", competition_id);
    info!("  METRICS_PORT: {}", metrics_port);
    info!(
        "  Reconnect: {} attempts, {:?} base delay ({:?})",
        config.connection.max_reconnect_attempts,
        config.connection.reconnect_delay,
        config.connection.backoff
    );

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", metrics_port);

    let mut transport = WsTransport::new(&ws_base_url)?;
    let mut client = PlatformClient::new(&api_base_url);
    if let Some(token) = &api_token {
        transport = transport.with_bearer_token(token.clone());
        client = client.with_bearer_token(token.clone());
    }
    let api: Arc<dyn PlatformApi> = Arc::new(client);
    let manager = ConnectionManager::new(Arc::new(transport), config.connection.clone());

    let chat = FeedClient::spawn(
        ChatFeed::new(api.clone(), config.user_id.clone(), config.history_page_size),
        manager.clone(),
    );
    let presence = FeedClient::spawn(
        PresenceFeed::new(api.clone(), config.presence_poll_interval),
        manager.clone(),
    );
    let odds = FeedClient::spawn(OddsFeed::new(), manager);

    let chat_target = match &competition_id {
        Some(id) => ChatTarget::for_competition(id.clone()),
        None => ChatTarget::for_match(match_id.clone()),
    };
    chat.set_target(Some(chat_target))?;
    presence.set_target(Some(match_id.clone()))?;
    odds.set_target(Some(match_id.clone()))?;

    let mut chat_views = chat.subscribe();
    let mut presence_views = presence.subscribe();
    let mut odds_views = odds.subscribe();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            changed = chat_views.changed() => {
                if changed.is_err() {
                    warn!("Chat feed stopped");
                    break;
                }
                let view = chat_views.borrow_and_update().clone();
                info!(
                    "[chat] {} / {} | channel {:?} | {} messages (more: {}) | last: {:?}",
                    view.status,
                    view.connection.as_str(),
                    view.data.channel_id,
                    view.data.messages.len(),
                    view.data.has_more,
                    view.data.messages.last().map(|m| (&m.author_id, &m.body)),
                );
                if let Some(notice) = &view.notice {
                    warn!("[chat] {}", notice);
                }
            }

            changed = presence_views.changed() => {
                if changed.is_err() {
                    warn!("Presence feed stopped");
                    break;
                }
                let view = presence_views.borrow_and_update().clone();
                info!(
                    "[presence] {} / {} | viewers {:?} | status {:?} | {} matches tracked",
                    view.status,
                    view.connection.as_str(),
                    view.data.viewer_count(),
                    view.data.live_status(),
                    view.data.matches.len(),
                );
            }

            changed = odds_views.changed() => {
                if changed.is_err() {
                    warn!("Odds feed stopped");
                    break;
                }
                let view = odds_views.borrow_and_update().clone();
                match &view.data.snapshot {
                    Some(snapshot) => info!(
                        "[odds] {} / {} | pools {} / {} | probabilities {:?} | {:.0}% left",
                        view.status,
                        view.connection.as_str(),
                        snapshot.pool_a,
                        snapshot.pool_b,
                        snapshot.implied_probabilities(),
                        snapshot.time_remaining_pct * 100.0,
                    ),
                    None => info!(
                        "[odds] {} / {} | no snapshot yet",
                        view.status,
                        view.connection.as_str()
                    ),
                }
            }
        }
    }

    info!("Shutting down feeds...");
    tokio::join!(chat.shutdown(), presence.shutdown(), odds.shutdown());

    info!("Watcher stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use whalewatch_core::{
    EngineSettings, EventBroadcaster, WatchConfig, WhaleWatch, price::DEFAULT_COINGECKO_URL,
    upstream::blockchain_info::DEFAULT_BLOCKCHAIN_INFO_URL,
};

/// Runtime configuration and health endpoints.
mod http;

/// First message sent to every client.
#[derive(Debug, Serialize)]
struct Hello {
    r#type: &'static str,
    message: &'static str,
    timestamp: DateTime<Utc>,
    threshold: Decimal,
    interval_secs: u64,
}

/// Sent to a single client whose queue overflowed since its last delivery.
#[derive(Debug, Serialize)]
struct Lagged {
    r#type: &'static str,
    dropped: u64,
    total_dropped: u64,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    if let Err(error) = run().await {
        error!(%error, "whalewatch-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting WhaleWatch WebSocket server");

    // Threshold & interval are validated by the engine, a bad value is fatal
    let threshold = required_env::<Decimal>("WHALE_THRESHOLD")?.unwrap_or(Decimal::ONE_HUNDRED);
    let interval_secs = required_env::<u64>("SUMMARY_INTERVAL")?.unwrap_or(60);
    let config = WatchConfig::new(threshold, interval_secs)?;

    let settings = EngineSettings::default()
        .with_config(config)
        .with_session_capacity(env_or("SESSION_CAPACITY", 256))
        .with_replay_size(env_or("REPLAY_SIZE", 16))
        .with_price_refresh(Duration::from_secs(env_or("PRICE_REFRESH_SECS", 60)));

    let upstream_url = std::env::var("UPSTREAM_URL")
        .unwrap_or_else(|_| DEFAULT_BLOCKCHAIN_INFO_URL.to_string());
    let price_url =
        std::env::var("PRICE_URL").unwrap_or_else(|_| DEFAULT_COINGECKO_URL.to_string());

    info!(%upstream_url, threshold = %config.threshold, interval_secs, "configuration loaded");

    let engine = Arc::new(WhaleWatch::start_with_urls(settings, &upstream_url, &price_url)?);

    // Configurable via WS_ADDR env var (default: 0.0.0.0:9001)
    let server_addr = std::env::var("WS_ADDR")
        .ok()
        .and_then(|addr| addr.parse::<SocketAddr>().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9001)));
    let listener = TcpListener::bind(server_addr).await?;

    info!("WebSocket server listening on ws://{}", server_addr);

    // Configurable via HTTP_ADDR env var (default: 0.0.0.0:9002)
    let http_addr = std::env::var("HTTP_ADDR")
        .ok()
        .and_then(|addr| addr.parse::<SocketAddr>().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9002)));
    let http_listener = TcpListener::bind(http_addr).await?;

    info!("HTTP control API listening on http://{} (/config, /health)", http_addr);

    let mut server = tokio::spawn(start_websocket_server(
        listener,
        Arc::clone(engine.broadcaster()),
        engine.config_changes(),
    ));
    let http_shutdown = CancellationToken::new();
    let mut http_server = tokio::spawn(http::serve(
        http_listener,
        Arc::clone(&engine),
        http_shutdown.clone(),
    ));

    let mut http_finished = false;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                warn!(%error, "failed to listen for Ctrl-C, shutting down");
            }
            info!("Ctrl-C received, shutting down");
        }
        _ = &mut server => {
            warn!("WebSocket server stopped accepting connections");
        }
        result = &mut http_server => {
            http_finished = true;
            warn!(?result, "HTTP control API stopped");
        }
    }

    server.abort();
    engine.shutdown().await;

    http_shutdown.cancel();
    if !http_finished {
        match http_server.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "HTTP control API failed"),
            Err(error) => warn!(%error, "HTTP control API task did not shut down cleanly"),
        }
    }

    info!("WhaleWatch WebSocket server stopped");
    Ok(())
}

/// Accept WebSocket clients until the listener fails
async fn start_websocket_server(
    listener: TcpListener,
    broadcaster: Arc<EventBroadcaster>,
    config: watch::Receiver<WatchConfig>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New WebSocket connection from {}", peer_addr);
                tokio::spawn(handle_client(
                    stream,
                    peer_addr,
                    Arc::clone(&broadcaster),
                    config.clone(),
                ));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                break;
            }
        }
    }
}

/// Handle individual WebSocket client connection
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    broadcaster: Arc<EventBroadcaster>,
    config: watch::Receiver<WatchConfig>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut session = broadcaster.subscribe();
    let session_id = session.id();

    info!(session = %session_id, "WebSocket handshake completed for {}", peer_addr);

    // Send hello message
    let current = *config.borrow();
    let hello = Hello {
        r#type: "hello",
        message: "Connected to WhaleWatch Bitcoin whale feed",
        timestamp: Utc::now(),
        threshold: current.threshold,
        interval_secs: current.interval_secs,
    };
    if let Ok(msg) = serde_json::to_string(&hello) {
        let _ = ws_sender.send(Message::Text(msg.into())).await;
    }

    // Spawn task to send broadcast events to this client, owning its session
    let mut send_task = tokio::spawn(async move {
        let mut reported_lost = 0;

        while let Some(event) = session.next_event().await {
            let lost = session.lost_events();
            if lost > reported_lost {
                warn!(
                    session = %session_id,
                    dropped = lost - reported_lost,
                    "Client {} lagged, oldest events dropped",
                    peer_addr
                );
                let notice = Lagged {
                    r#type: "lagged",
                    dropped: lost - reported_lost,
                    total_dropped: lost,
                };
                reported_lost = lost;

                if let Ok(json) = serde_json::to_string(&notice) {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        return;
                    }
                }
            }

            match serde_json::to_string(&event) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        return;
                    }
                }
                Err(e) => error!("Failed to serialise {} event: {}", event.kind.name(), e),
            }
        }

        // Session closed by the engine
        info!("Broadcast session closed for {}", peer_addr);
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // Handle incoming messages from client (e.g., ping/pong)
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    // Tungstenite handles pong automatically
                    debug!("Received ping from {}", peer_addr);
                }
                Ok(Message::Text(text)) => {
                    debug!("Ignoring text from {}: {}", peer_addr, text);
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Whichever side finishes first ends the connection; the session is dropped with its task
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    info!(session = %session_id, "WebSocket connection closed for {}", peer_addr);
}

/// Read an optional environment variable that must parse when present.
fn required_env<T>(key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("invalid {key}={value}: {e}")),
        Err(_) => Ok(None),
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

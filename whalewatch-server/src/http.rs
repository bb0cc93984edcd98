//! HTTP control surface next to the WebSocket push stream.
//!
//! * `GET /config`: current whale threshold and summary interval.
//! * `POST /config`: partial update `{"threshold": 50, "interval": 30}`. The effective
//!   configuration is announced to every WebSocket client as a `config` event. An invalid update
//!   is rejected with `400` and the previous configuration stays in effect.
//! * `GET /health`: `healthy` while the engine runs subscribed upstream, `degraded` otherwise.

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use whalewatch_core::{ConfigUpdate, WatchConfig, WhaleWatch};

#[derive(Debug, Default, Deserialize)]
struct ConfigRequest {
    threshold: Option<Decimal>,
    interval: Option<u64>,
}

impl From<ConfigRequest> for ConfigUpdate {
    fn from(request: ConfigRequest) -> Self {
        Self {
            threshold: request.threshold,
            interval_secs: request.interval,
        }
    }
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    threshold: Decimal,
    interval: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<WatchConfig> for ConfigResponse {
    fn from(config: WatchConfig) -> Self {
        Self {
            status: None,
            threshold: config.threshold,
            interval: config.interval_secs,
            error: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    feed: String,
    sessions: usize,
    published: u64,
    latest_block_height: Option<u64>,
    rate: Decimal,
    rate_stale: bool,
}

pub fn router(engine: Arc<WhaleWatch>) -> Router {
    Router::new()
        .route("/config", get(get_config).post(update_config))
        .route("/health", get(health))
        .with_state(engine)
}

/// Serve the control API until `shutdown` is cancelled, letting in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<WhaleWatch>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn get_config(State(engine): State<Arc<WhaleWatch>>) -> Json<ConfigResponse> {
    Json(ConfigResponse::from(engine.config()))
}

async fn update_config(
    State(engine): State<Arc<WhaleWatch>>,
    Json(request): Json<ConfigRequest>,
) -> (StatusCode, Json<ConfigResponse>) {
    match engine.update_config(ConfigUpdate::from(request)) {
        Ok(effective) => (
            StatusCode::OK,
            Json(ConfigResponse {
                status: Some("ok"),
                ..ConfigResponse::from(effective)
            }),
        ),
        Err(error) => (
            StatusCode::BAD_REQUEST,
            Json(ConfigResponse {
                status: Some("rejected"),
                error: Some(error.to_string()),
                ..ConfigResponse::from(engine.config())
            }),
        ),
    }
}

async fn health(State(engine): State<Arc<WhaleWatch>>) -> Json<HealthResponse> {
    let status = engine.status();

    Json(HealthResponse {
        status: if status.is_healthy() { "healthy" } else { "degraded" },
        timestamp: Utc::now(),
        feed: status.feed.to_string(),
        sessions: status.sessions,
        published: status.published,
        latest_block_height: status.latest_block_height,
        rate: status.rate.rate,
        rate_stale: status.rate.stale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::{StreamExt, stream};
    use rust_decimal_macros::dec;
    use serde_json::{Value, json};
    use std::{net::SocketAddr, time::Duration};
    use whalewatch_core::{
        EngineSettings, EventKind,
        error::{FeedError, PriceError},
        price::RateSource,
        upstream::{FeedState, UpstreamConnector, UpstreamStream},
    };

    /// Subscribes and then stays silent.
    struct IdleConnector;

    #[async_trait]
    impl UpstreamConnector for IdleConnector {
        async fn connect(&self) -> Result<UpstreamStream, FeedError> {
            Ok(stream::pending().boxed())
        }
    }

    struct FixedRate;

    #[async_trait]
    impl RateSource for FixedRate {
        async fn fetch_rate(&self) -> Result<Decimal, PriceError> {
            Ok(dec!(60000))
        }
    }

    async fn start() -> (Arc<WhaleWatch>, SocketAddr, CancellationToken) {
        let settings = EngineSettings::default()
            .with_config(WatchConfig::new(dec!(100), 60).unwrap())
            .with_replay_size(0)
            .with_drain_grace(Duration::ZERO);
        let engine =
            Arc::new(WhaleWatch::start(settings, IdleConnector, Arc::new(FixedRate)).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::clone(&engine), shutdown.clone()));

        (engine, addr, shutdown)
    }

    async fn get(addr: SocketAddr, path: &str) -> Value {
        reqwest::get(format!("http://{addr}{path}"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn post_config(addr: SocketAddr, body: Value) -> (u16, Value) {
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/config"))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn test_config_update_applies_and_is_announced() {
        let (engine, addr, shutdown) = start().await;
        let mut session = engine.subscribe();

        let current = get(addr, "/config").await;
        assert_eq!(current["threshold"].as_f64(), Some(100.0));
        assert_eq!(current["interval"].as_u64(), Some(60));

        let (status, body) = post_config(addr, json!({ "threshold": 50, "interval": 30 })).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["threshold"].as_f64(), Some(50.0));
        assert_eq!(body["interval"].as_u64(), Some(30));
        assert_eq!(engine.config(), WatchConfig::new(dec!(50), 30).unwrap());

        match session.next_event().await.unwrap().kind {
            EventKind::Config(config) => {
                assert_eq!(config.threshold, dec!(50));
                assert_eq!(config.interval_secs, 30);
            }
            other => panic!("expected config, got {other:?}"),
        }

        engine.shutdown().await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_invalid_config_update_is_rejected() {
        let (engine, addr, shutdown) = start().await;
        let mut session = engine.subscribe();

        let (status, body) = post_config(addr, json!({ "threshold": -5, "interval": 30 })).await;
        assert_eq!(status, 400);
        assert_eq!(body["status"], "rejected");
        assert!(body["error"].as_str().unwrap().contains("threshold"));
        assert_eq!(body["threshold"].as_f64(), Some(100.0));
        assert_eq!(body["interval"].as_u64(), Some(60));

        assert_eq!(engine.config(), WatchConfig::new(dec!(100), 60).unwrap());
        assert!(session.try_next_event().is_none());

        engine.shutdown().await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_health_reports_running_then_degraded() {
        let (engine, addr, shutdown) = start().await;
        while engine.status().feed != FeedState::Subscribed || engine.status().rate.stale {
            tokio::task::yield_now().await;
        }

        let health = get(addr, "/health").await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["feed"], "Subscribed");
        assert_eq!(health["rate"].as_f64(), Some(60000.0));
        assert_eq!(health["rate_stale"], false);

        engine.shutdown().await;

        let health = get(addr, "/health").await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["feed"], "Stopped");

        shutdown.cancel();
    }
}

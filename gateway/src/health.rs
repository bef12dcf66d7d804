//! `GET /health` endpoint and the self-monitor task that watches it
//! from inside the process (§4.5).
//!
//! Readiness is the conjunction of "the gateway has finished loading
//! its model" and "the event-log publisher is reachable". The
//! self-monitor polls the same two conditions every 30s; five
//! consecutive unhealthy checks triggers a graceful shutdown and a
//! non-zero exit, on the assumption that whatever external process
//! supervises the gateway will restart it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::publisher::Publisher;

const SELF_MONITOR_INTERVAL: Duration = Duration::from_secs(30);
const UNHEALTHY_STREAK_LIMIT: u32 = 5;

pub struct HealthState {
    gateway_ready: AtomicBool,
    publisher: Arc<Publisher>,
}

impl HealthState {
    pub fn new(publisher: Arc<Publisher>) -> Arc<Self> {
        Arc::new(Self { gateway_ready: AtomicBool::new(false), publisher })
    }

    pub fn mark_ready(&self) {
        self.gateway_ready.store(true, Ordering::SeqCst);
    }

    async fn is_healthy(&self) -> (bool, Vec<&'static str>) {
        let ready = self.gateway_ready.load(Ordering::SeqCst);
        let ping_ok = self.publisher.ping_ok().await;
        let mut reasons = Vec::new();
        if !ready {
            reasons.push("model not yet loaded");
        }
        if !ping_ok {
            reasons.push("event-log publisher unreachable");
        }
        (ready && ping_ok, reasons)
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> Response {
    let (healthy, reasons) = state.is_healthy().await;
    if healthy {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, format!("Service Unavailable: {}", reasons.join(", "))).into_response()
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

pub async fn run_health_server(addr: &str, port: u16, state: Arc<HealthState>) -> anyhow::Result<()> {
    let app = Router::new().route("/health", get(health_handler)).fallback(not_found).with_state(state);
    let listener = TcpListener::bind((addr, port)).await?;
    info!("health endpoint listening on {}:{}", addr, port);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Watches the same readiness signal the health endpoint exposes and
/// terminates the process if it stays unhealthy for too long.
pub async fn run_self_monitor(state: Arc<HealthState>) {
    let mut streak: u32 = 0;
    let mut interval = tokio::time::interval(SELF_MONITOR_INTERVAL);
    loop {
        interval.tick().await;
        let (healthy, reasons) = state.is_healthy().await;
        if healthy {
            streak = 0;
            continue;
        }
        streak += 1;
        warn!(streak, reasons = ?reasons, "self-monitor: unhealthy check");
        if streak >= UNHEALTHY_STREAK_LIMIT {
            error!("self-monitor: unhealthy for {} consecutive checks, shutting down", streak);
            state.gateway_ready.store(false, Ordering::SeqCst);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> Arc<Publisher> {
        Arc::new(Publisher::new("redis://127.0.0.1:1/0", "transcription_segments".into()).unwrap())
    }

    #[tokio::test]
    async fn unhealthy_until_marked_ready() {
        let state = HealthState::new(publisher());
        let (healthy, reasons) = state.is_healthy().await;
        assert!(!healthy);
        assert!(reasons.contains(&"model not yet loaded"));
    }

    #[tokio::test]
    async fn still_unhealthy_without_publisher_even_once_ready() {
        let state = HealthState::new(publisher());
        state.mark_ready();
        let (healthy, reasons) = state.is_healthy().await;
        assert!(!healthy);
        assert!(reasons.contains(&"event-log publisher unreachable"));
    }
}

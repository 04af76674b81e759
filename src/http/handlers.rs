//! Route handlers for the rate-limited endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Local;
use tracing::{debug, instrument, warn};

use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    client_key, AdmissionGate, AdmissionRequest, Admitted, IntervalLimiter, KeyedLimiter,
    WindowCounter,
};

/// Header carrying the remaining quota on window-limited responses.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Limiters shared by every handler, built once at startup.
#[derive(Clone, Debug)]
pub struct AppState {
    /// One grant per interval for the default route
    pub paced: Arc<IntervalLimiter>,
    /// Global fixed-window throttle
    pub throttle: Arc<WindowCounter>,
    /// Fixed-window limits per client address
    pub per_client: Arc<KeyedLimiter>,
    /// How long a paced request may wait
    pub request_timeout: Duration,
}

impl AppState {
    /// Build every limiter from configuration.
    ///
    /// Fails with a configuration error outside a tokio runtime.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        Ok(Self {
            paced: Arc::new(IntervalLimiter::new(config.pacing.interval())?),
            throttle: Arc::new(WindowCounter::new(
                config.throttle.limit,
                config.throttle.window(),
            )),
            per_client: Arc::new(KeyedLimiter::new(
                config.per_client.limit,
                config.per_client.window(),
            )),
            request_timeout: config.server.request_timeout(),
        })
    }
}

/// Build the router with all rate-limited routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(paced))
        .route("/not-a-honeypot", get(throttled))
        .route("/api", get(throttled))
        .route("/exclusive-content", get(per_client))
        .with_state(state)
}

/// One request per pacing interval, waiting up to the request timeout.
#[instrument(skip(state))]
async fn paced(State(state): State<AppState>) -> Response {
    let request = AdmissionRequest::global().with_timeout(state.request_timeout);

    match state.paced.admit(&request).await {
        Ok(_) => (
            StatusCode::OK,
            format!("Request allowed at {}\n", Local::now().to_rfc3339()),
        )
            .into_response(),
        Err(e) => reject(e, "Rate limit exceeded or context canceled"),
    }
}

/// Fixed-window throttle shared by every caller.
#[instrument(skip(state))]
async fn throttled(State(state): State<AppState>) -> Response {
    match state.throttle.admit(&AdmissionRequest::global()).await {
        Ok(admitted) => with_remaining(admitted, "OK - You passed the vibe check\n".to_string()),
        Err(e) => reject(e, "Rate limit Exceeded"),
    }
}

/// Fixed-window limit per client host.
#[instrument(skip(state))]
async fn per_client(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    let key = client_key(&remote.to_string());
    let request = AdmissionRequest::for_key(key.clone());

    match state.per_client.admit(&request).await {
        Ok(admitted) => with_remaining(
            admitted,
            format!("Msg from {}. You're within the rate limit.\n", key),
        ),
        Err(e) => reject(e, "Rate Limit exceeded"),
    }
}

fn with_remaining(admitted: Admitted, body: String) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    if let Some(remaining) = admitted.remaining {
        response
            .headers_mut()
            .insert(REMAINING_HEADER, HeaderValue::from(remaining));
    }
    response
}

fn reject(error: TurnstileError, message: &str) -> Response {
    if error.is_rejection() {
        debug!(error = %error, "Request rejected");
        (StatusCode::TOO_MANY_REQUESTS, format!("{}\n", message)).into_response()
    } else {
        warn!(error = %error, "Admission check failed");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", error)).into_response()
    }
}

//! HTTP surface: the push delivery endpoint and operator endpoints.
//!
//! `POST /push/{subscription}` accepts the push envelope of an external bus.
//! The bearer token names the invoker, which must be the subscription's
//! expected principal. 2xx acknowledges, 5xx asks for redelivery.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{debug, warn};

use datafeed_core::Principal;
use datafeed_queue::{
    DeadLetter, DeadLetterQueue, Delivery, HandlerError, PushEnvelope, PushHandler, PushTokenVerifier,
    SubscriptionStats,
};

use crate::join::{JoinCoordinator, JoinTaskStatus};
use crate::metrics::{MetricsResponse, PipelineMetrics};

/// A handler reachable through the push endpoint.
pub struct PushRoute {
    pub handler: Arc<dyn PushHandler>,
    /// The only principal allowed to invoke this route.
    pub invoker: Principal,
    /// Topic recorded on decoded messages.
    pub topic: String,
}

pub struct AppState {
    /// `None` rejects every push.
    pub verifier: Option<PushTokenVerifier>,
    pub routes: HashMap<String, PushRoute>,
    pub subscriptions: Vec<(String, Arc<SubscriptionStats>)>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub joins: Arc<JoinCoordinator>,
    pub metrics: PipelineMetrics,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

fn reject(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: error.into() }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/joins", get(joins))
        .route("/dead-letters", get(dead_letters))
        .route("/push/{subscription}", post(push))
        .with_state(state)
}

// ── Operator endpoints ───────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub subscriptions: usize,
    pub dead_letter_depth: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        subscriptions: state.subscriptions.len(),
        dead_letter_depth: state.dead_letters.depth(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    let subscriptions: BTreeMap<_, _> = state
        .subscriptions
        .iter()
        .map(|(name, stats)| (name.clone(), stats.snapshot()))
        .collect();
    Json(MetricsResponse {
        datasets: state.metrics.datasets().await,
        subscriptions,
        dead_letter_depth: state.dead_letters.depth(),
        dead_letters_evicted: state.dead_letters.evicted(),
        joins: state.joins.statuses().await,
        recent_events: state.metrics.recent_events().await,
        uptime_secs: state.metrics.uptime_secs(),
    })
}

async fn joins(State(state): State<Arc<AppState>>) -> Json<Vec<JoinTaskStatus>> {
    Json(state.joins.statuses().await)
}

async fn dead_letters(State(state): State<Arc<AppState>>) -> Json<Vec<DeadLetter>> {
    Json(state.dead_letters.snapshot())
}

// ── Push endpoint ────────────────────────────────────────────────────

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn push(
    State(state): State<Arc<AppState>>,
    Path(subscription): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let route = state
        .routes
        .get(&subscription)
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, format!("unknown subscription '{subscription}'")))?;

    let verifier = state
        .verifier
        .as_ref()
        .ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "push authentication is not configured"))?;
    let token = bearer(&headers).ok_or_else(|| reject(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
    let invoker = verifier.verify(token).map_err(|e| {
        warn!(subscription = %subscription, error = %e, "push rejected");
        reject(StatusCode::UNAUTHORIZED, e.to_string())
    })?;
    if invoker != route.invoker {
        warn!(subscription = %subscription, invoker = %invoker, expected = %route.invoker, "push from wrong principal");
        return Err(reject(
            StatusCode::FORBIDDEN,
            format!("principal '{invoker}' may not invoke '{subscription}'"),
        ));
    }

    let envelope: PushEnvelope = serde_json::from_slice(&body)
        .map_err(|e| reject(StatusCode::BAD_REQUEST, format!("invalid push envelope: {e}")))?;
    let message = envelope
        .into_message(&route.topic)
        .map_err(|e| reject(StatusCode::BAD_REQUEST, e.to_string()))?;
    debug!(subscription = %subscription, message_id = %message.id, attempt = message.delivery_attempt, "push received");

    match route.handler.handle(Delivery { message, invoker }).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            let status = match &e {
                HandlerError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
                HandlerError::Permanent(_) => StatusCode::INTERNAL_SERVER_ERROR,
                HandlerError::Unauthorized(_) => StatusCode::FORBIDDEN,
            };
            Err(reject(status, e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer(&headers), Some("abc.def.ghi"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer(&headers), None);
    }
}

//! HTTP signaling: each side POSTs its description to the other's endpoint.

use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use beep_core::{DispatchOutcome, SignalRouter, Signaler};
use bytes::Bytes;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Delivers signals by POSTing them to the peer. Transport errors and 5xx
/// answers are retried until the peer responds or `shutdown` fires; a 4xx means
/// the peer saw the payload and refused it, which is logged and not retried.
pub struct HttpSignaler {
    client: reqwest::Client,
    peer: Url,
    retry: Duration,
    shutdown: CancellationToken,
}

impl HttpSignaler {
    pub fn new(
        peer: Url,
        retry: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            peer,
            retry,
            shutdown,
        })
    }

    pub fn peer(&self) -> &Url {
        &self.peer
    }

    async fn attempt(&self, payload: &str) -> Delivery {
        let sent = self
            .client
            .post(self.peer.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_owned())
            .send()
            .await;
        match sent {
            Ok(response) => classify(response.status()),
            Err(err) => Delivery::Retry(err.to_string()),
        }
    }
}

/// What one POST to the peer achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Delivery {
    Accepted,
    /// The peer received the payload and refused it; resending cannot help.
    Rejected(StatusCode),
    Retry(String),
}

fn classify(status: StatusCode) -> Delivery {
    if status.is_success() {
        Delivery::Accepted
    } else if status.is_server_error() {
        Delivery::Retry(format!("peer answered {status}"))
    } else {
        Delivery::Rejected(status)
    }
}

#[async_trait]
impl Signaler for HttpSignaler {
    async fn signal(&self, payload: String) {
        let mut attempt = 1u32;
        loop {
            match self.attempt(&payload).await {
                Delivery::Accepted => {
                    info!(target = "beep::http", peer = %self.peer, attempt, "signal delivered");
                    return;
                }
                Delivery::Rejected(status) => {
                    warn!(
                        target = "beep::http",
                        peer = %self.peer,
                        attempt,
                        status = status.as_u16(),
                        "signal delivered but rejected by peer"
                    );
                    return;
                }
                Delivery::Retry(err) => warn!(
                    target = "beep::http",
                    peer = %self.peer,
                    attempt,
                    error = %err,
                    retry_ms = self.retry.as_millis() as u64,
                    "signal delivery failed; retrying"
                ),
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(target = "beep::http", attempt, "shutting down; signal abandoned");
                    return;
                }
                _ = tokio::time::sleep(self.retry) => {}
            }
            attempt += 1;
        }
    }
}

pub fn status_for(outcome: &DispatchOutcome) -> StatusCode {
    match outcome {
        DispatchOutcome::DescriptionApplied(_) | DispatchOutcome::CandidateApplied => {
            StatusCode::ACCEPTED
        }
        DispatchOutcome::DescriptionRejected(_) | DispatchOutcome::CandidateRejected(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        DispatchOutcome::InvalidDescription
        | DispatchOutcome::InvalidCandidate
        | DispatchOutcome::Unrecognized => StatusCode::BAD_REQUEST,
    }
}

/// `POST <path>` feeds the raw body to `router`; `GET /healthz` reports liveness.
pub fn signaling_router(path: &str, router: SignalRouter) -> Router {
    Router::new()
        .route(path, post(receive_signal))
        .route("/healthz", get(health_handler))
        .with_state(router)
}

async fn receive_signal(State(router): State<SignalRouter>, body: Bytes) -> StatusCode {
    let outcome = router.dispatch(&body).await;
    let status = status_for(&outcome);
    debug!(target = "beep::http", ?outcome, status = status.as_u16(), "inbound signal handled");
    status
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

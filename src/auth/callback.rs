//! Short-lived local HTTP listener for the provider's redirect.
//!
//! [`CallbackReceiver::bind`] takes the port and starts serving;
//! [`CallbackReceiver::wait`] blocks until the first usable redirect (or the
//! timeout) and then stops the server, so the port is free again by the time
//! it returns. Dropping a receiver that was never waited on aborts the
//! server task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AuthError, Result};

/// How long in-flight browser connections get to finish after capture.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// What the redirect carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Code(String),
    /// Provider error detail (`error_description`, falling back to `error`).
    Denied(String),
}

#[derive(Debug, Default, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Clone)]
struct ReceiverState {
    expected_state: Arc<str>,
    /// Taken by the first redirect that produces an outcome.
    outcome_tx: Arc<Mutex<Option<oneshot::Sender<CallbackOutcome>>>>,
}

/// A bound callback listener for exactly one authorization attempt.
pub struct CallbackReceiver {
    local_addr: SocketAddr,
    outcome_rx: Option<oneshot::Receiver<CallbackOutcome>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl CallbackReceiver {
    /// Bind `addr` and serve `path`. Redirects must echo `expected_state`.
    pub async fn bind(addr: SocketAddr, path: &str, expected_state: &str) -> Result<Self> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = ReceiverState {
            expected_state: Arc::from(expected_state),
            outcome_tx: Arc::new(Mutex::new(Some(outcome_tx))),
        };

        let app = Router::new()
            .route(path, get(handle_callback))
            .with_state(state);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AuthError::Listener(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AuthError::Listener(format!("failed to read bound address: {e}")))?;

        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(%local_addr, path, "callback listener started");
        Ok(Self {
            local_addr,
            outcome_rx: Some(outcome_rx),
            shutdown_tx: Some(shutdown_tx),
            server: Some(server),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the redirect, then stop listening.
    pub async fn wait(mut self, timeout: Duration) -> Result<CallbackOutcome> {
        let outcome_rx = self
            .outcome_rx
            .take()
            .ok_or_else(|| AuthError::Listener("receiver already consumed".into()))?;

        let result = tokio::time::timeout(timeout, outcome_rx).await;
        self.shutdown().await;

        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(AuthError::Listener(
                "listener stopped before a redirect arrived".into(),
            )),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "no redirect before timeout");
                Err(AuthError::Timeout(timeout))
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(mut server) = self.server.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "callback server exited with error"),
            Ok(Err(e)) => warn!(error = %e, "callback server task failed"),
            Err(_) => {
                warn!("callback server did not drain in time, aborting");
                server.abort();
                let _ = server.await;
            }
        }
        debug!(local_addr = %self.local_addr, "callback listener stopped");
    }
}

impl Drop for CallbackReceiver {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

async fn handle_callback(
    State(state): State<ReceiverState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let mut slot = state.outcome_tx.lock().await;
    if slot.is_none() {
        debug!("redirect after completion, ignoring");
        return (
            StatusCode::OK,
            Html(page(
                "Already completed",
                "This authorization was already handled. You can close this window.",
            )),
        )
            .into_response();
    }

    match classify(query, &state.expected_state) {
        Ok(outcome) => {
            let response = match &outcome {
                CallbackOutcome::Code(_) => {
                    info!("authorization code received");
                    (
                        StatusCode::OK,
                        Html(page(
                            "Authentication complete",
                            "You can close this window and return to the terminal.",
                        )),
                    )
                }
                CallbackOutcome::Denied(detail) => {
                    warn!(detail = %detail, "provider returned an error redirect");
                    (
                        StatusCode::BAD_REQUEST,
                        Html(page("Authentication failed", detail)),
                    )
                }
            };
            if let Some(tx) = slot.take() {
                let _ = tx.send(outcome);
            }
            response.into_response()
        }
        Err(reason) => {
            warn!(reason, "rejected callback request");
            (
                StatusCode::BAD_REQUEST,
                Html(page("Invalid response", reason)),
            )
                .into_response()
        }
    }
}

/// Decide what a redirect means. `Err` leaves the attempt pending.
fn classify(query: CallbackQuery, expected_state: &str) -> std::result::Result<CallbackOutcome, &'static str> {
    let state_matches = query.state.as_deref() == Some(expected_state);

    if let Some(error) = query.error.filter(|e| !e.is_empty()) {
        if query.state.is_some() && !state_matches {
            return Err("state mismatch on error redirect");
        }
        let detail = query
            .error_description
            .filter(|d| !d.is_empty())
            .unwrap_or(error);
        return Ok(CallbackOutcome::Denied(detail));
    }

    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or("missing authorization code")?;
    if query.state.is_none() {
        return Err("missing state parameter");
    }
    if !state_matches {
        return Err("state mismatch");
    }
    Ok(CallbackOutcome::Code(code))
}

fn page(title: &str, message: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{}</p></body></html>",
        escape_html(message)
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

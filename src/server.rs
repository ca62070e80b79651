//! # HTTP and WebSocket Surface
//!
//! | Route | Method | Response |
//! |-------|--------|----------|
//! | `/ws` | GET (upgrade) | counter protocol, see [`codec`](crate::codec) |
//! | `/api/ping` | POST | `{"message":"pong"}` |
//! | `/api/viewers` | GET | `{"count":12}` |
//! | `/api/counter` | GET | `{"count":"1000","pos":42}` |
//! | `/api/counter/history?range=hour\|day\|week\|all` | GET | `[{"count":"1000","timestamp":1700000000000}]` |
//! | `/api/payments` | POST | records a succeeded payment in the shared store (payment provider webhook) |
//!
//! ## One Connection
//!
//! ```text
//!   socket ──split──► stream ──► reader loop (this task)
//!                                  │  decode → ping / viewer count
//!                                  │  idle check, disconnect signal
//!                                  │ try_send
//!                                  ▼
//!                          [operation queue 8] ──► operation task ──► processor
//!                                                        │ errors
//!                                                        ▼
//!                 SessionHandle::send ─► [bounded queue] ─► sender task ─► sink
//!                                              ▲
//!                 SessionRegistry::broadcast_local ┘
//! ```
//!
//! The first frame on every connection is the current value, read from the
//! store after the upgrade. Replies (pong, viewer count, errors) go only to
//! the session that asked; successful operations are confirmed by the
//! broadcast every session receives.
//!
//! Operations run on their own task, in arrival order. A payment check that
//! takes seconds never stops the reader loop from answering pings, noticing
//! an idle peer or honoring a disconnect. A client that queues more than
//! [`OPERATION_QUEUE_SIZE`] operations gets `TooManyPending` for the excess.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api::CounterStore;
use crate::attribution::TracingAttributionSink;
use crate::broadcaster::Broadcaster;
use crate::codec::{decode_client_message, ClientMessage, ServerMessage};
use crate::config::Config;
use crate::error::{Error, Result, STORE_UNAVAILABLE_MESSAGE};
use crate::payment::{PaymentVerifier, StorePaymentVerifier};
use crate::processor::OperationProcessor;
use crate::session::{SessionHandle, SessionRegistry};
use crate::types::{HistoryRange, Operation};

/// How long a closing connection may take to flush its queue.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Operations one connection may have waiting for the processor.
pub const OPERATION_QUEUE_SIZE: usize = 8;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: CounterStore,
    pub processor: OperationProcessor,
    pub broadcaster: Arc<Broadcaster>,
    pub idle_timeout: Duration,
    /// `None` disables `POST /api/payments`.
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    /// Opens the store and starts the broadcaster.
    ///
    /// Payments are checked against the confirmations `POST /api/payments`
    /// writes to the shared store, so any process can serve the multiply.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = CounterStore::open_with_config(&config.store_path, config.store_config()).await?;
        let verifier = Arc::new(StorePaymentVerifier::new(store.clone()));
        Self::from_parts(config, store, verifier).await
    }

    /// Builds the state around an open store and a chosen payment verifier.
    pub async fn from_parts(
        config: &Config,
        store: CounterStore,
        verifier: Arc<dyn PaymentVerifier>,
    ) -> Result<Self> {
        let processor = OperationProcessor::new(
            store.clone(),
            verifier,
            Arc::new(TracingAttributionSink),
            config.processor_config(),
        );

        let registry = SessionRegistry::new(config.session_queue_size);
        let broadcaster = Broadcaster::spawn(store.clone(), registry, config.presence_interval).await?;

        Ok(Self {
            store,
            processor,
            broadcaster,
            idle_timeout: config.idle_timeout,
            admin_token: config.admin_token.as_deref().map(Arc::from),
        })
    }

    /// Closes every session, stops the broadcaster and shuts the store down.
    pub async fn shutdown(self) {
        self.broadcaster.registry().disconnect_all();
        self.broadcaster.shutdown().await;
        self.store.shutdown().await;
    }
}

/// Builds the router with CORS and request tracing.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/ping", post(ping_handler))
        .route("/api/viewers", get(viewers_handler))
        .route("/api/counter", get(counter_handler))
        .route("/api/counter/history", get(history_handler))
        .route("/api/payments", post(payment_webhook_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let address = listener
        .local_addr()
        .map_err(|e| Error::Config(format!("listener has no address: {e}")))?;
    info!("Server running on {address}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::StoreUnavailable(format!("server failed: {e}")))
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
        } else {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// =============================================================================
// HTTP Errors
// =============================================================================

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::MalformedMessage(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::RateLimited { .. } | Error::TooManyPending => StatusCode::TOO_MANY_REQUESTS,
            Error::DuplicatePayment { .. } => StatusCode::CONFLICT,
            Error::PaymentRejected(_) => StatusCode::PAYMENT_REQUIRED,
            Error::PaymentTimeout => StatusCode::GATEWAY_TIMEOUT,
            e if e.is_systemic() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if self.is_systemic() {
            STORE_UNAVAILABLE_MESSAGE.to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn ping_handler() -> impl IntoResponse {
    Json(json!({ "message": "pong" }))
}

async fn viewers_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "count": state.broadcaster.viewer_count().await }))
}

async fn counter_handler(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let snapshot = state.store.get().await?;
    Ok(Json(json!({
        "count": snapshot.value,
        "pos": snapshot.pos.as_raw(),
    })))
}

#[derive(Deserialize)]
struct HistoryQuery {
    range: Option<String>,
}

async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse> {
    let range = match query.range.as_deref() {
        None => HistoryRange::All,
        Some(range) => range.parse()?,
    };
    Ok(Json(state.store.read_history(range).await?))
}

#[derive(Deserialize)]
struct PaymentWebhook {
    payment_intent_id: String,
    amount: u64,
    currency: String,
}

async fn payment_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payment): Json<PaymentWebhook>,
) -> Result<StatusCode> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(StatusCode::NOT_FOUND);
    };

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if presented != Some(expected) {
        warn!("payment webhook called with a bad token");
        return Ok(StatusCode::FORBIDDEN);
    }

    state
        .store
        .confirm_payment(payment.payment_intent_id.as_str(), payment.amount, &payment.currency)
        .await?;
    info!(
        payment_intent_id = %payment.payment_intent_id,
        amount = payment.amount,
        currency = %payment.currency,
        "payment confirmed"
    );

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// WebSocket
// =============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let registry = Arc::clone(state.broadcaster.registry());

    let resync = match state.store.get().await {
        Ok(snapshot) => ServerMessage::resync(&snapshot.value)
            .encode()
            .map(|frame| (snapshot.pos, frame)),
        Err(e) => Err(e),
    };
    let resync = match resync {
        Ok(resync) => resync,
        Err(e) => {
            warn!(error = %e, "cannot resync new connection, closing");
            if let Some(Ok(frame)) = e.to_frame().map(|m| m.encode()) {
                let _ = sink.send(Message::Text(frame.to_string().into())).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    let (session, mut outbound) = registry.create_session();
    let guard = registry.register(Arc::clone(&session), resync);
    let session_id = guard.id();
    info!(session_id = %session_id, "session connected");

    let sender = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    let sender_abort = sender.abort_handle();

    let (operations, operation_rx) = mpsc::channel(OPERATION_QUEUE_SIZE);
    let worker = tokio::spawn(run_operations(
        state.processor.clone(),
        Arc::clone(&session),
        operation_rx,
    ));
    let worker_abort = worker.abort_handle();

    let mut idle_check = tokio::time::interval((state.idle_timeout / 4).max(Duration::from_millis(10)));

    loop {
        tokio::select! {
            _ = session.closed() => {
                info!(session_id = %session_id, "session disconnected by server");
                break;
            }
            _ = idle_check.tick() => {
                if session.idle_for() > state.idle_timeout {
                    info!(session_id = %session_id, "session idle, closing");
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    session.touch();
                    if handle_text(&state, &session, &operations, text.as_str()).await.is_break() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    session.touch();
                    let err = Error::MalformedMessage("binary frames are not supported".to_string());
                    if reply_error(&session, &err).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => session.touch(),
                Some(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "socket error");
                    break;
                }
            }
        }
    }

    // Unregister first so the registry drops its sender. Operations already
    // queued get FLUSH_TIMEOUT to finish, then the sender task flushes.
    drop(guard);
    drop(operations);
    if tokio::time::timeout(FLUSH_TIMEOUT, worker).await.is_err() {
        worker_abort.abort();
    }

    let connected_ms = session.connected_for().as_millis() as u64;
    let user_id = session.user_id().map(|id| id.to_string()).unwrap_or_default();
    let country = session.country_code().map(|code| code.to_string()).unwrap_or_default();
    drop(session);
    if tokio::time::timeout(FLUSH_TIMEOUT, sender).await.is_err() {
        sender_abort.abort();
    }

    info!(session_id = %session_id, user_id = %user_id, country = %country, connected_ms, "session closed");
}

/// Runs one connection's operations in arrival order.
async fn run_operations(
    processor: OperationProcessor,
    session: Arc<SessionHandle>,
    mut operations: mpsc::Receiver<Operation>,
) {
    while let Some(operation) = operations.recv().await {
        session.note_identity(operation.attribution());
        match processor.process(operation).await {
            // The broadcast confirms the new value to the sender too.
            Ok(_) => {}
            Err(e) => {
                if !e.is_systemic() {
                    warn!(
                        session_id = %session.id(),
                        user_id = %session.user_id().map(|id| id.as_str()).unwrap_or(""),
                        error = %e,
                        "operation rejected"
                    );
                }
                if reply_error(&session, &e).is_err() {
                    break;
                }
            }
        }
    }
}

async fn handle_text(
    state: &AppState,
    session: &SessionHandle,
    operations: &mpsc::Sender<Operation>,
    text: &str,
) -> ControlFlow<()> {
    let reply = match decode_client_message(text) {
        Ok(ClientMessage::Ping) => state.broadcaster.answer_ping(session),
        Ok(ClientMessage::GetViewerCount) => state.broadcaster.answer_viewer_count(session).await,
        Ok(ClientMessage::Operation(operation)) => match operations.try_send(operation) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %session.id(), "operation queue full");
                reply_error(session, &Error::TooManyPending)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ClientClosed),
        },
        Ok(ClientMessage::Close { reason }) => {
            debug!(session_id = %session.id(), reason = reason.as_deref().unwrap_or(""), "client closing");
            return ControlFlow::Break(());
        }
        Err(e) => {
            debug!(session_id = %session.id(), error = %e, "malformed frame");
            reply_error(session, &e)
        }
    };

    match reply {
        Ok(()) => ControlFlow::Continue(()),
        Err(_) => ControlFlow::Break(()),
    }
}

/// Sends an error frame to `session` only.
fn reply_error(session: &SessionHandle, error: &Error) -> Result<()> {
    match error.to_frame() {
        Some(message) => session.send(message.encode()?),
        None => Err(Error::SlowConsumer),
    }
}

//! HTTP surface for chat turns.
//!
//! `POST /api/chat` answers with a JSON error until the first event exists,
//! then switches to `text/event-stream`. Each event's data is a serialized
//! [`StreamMessage`].

use crate::core::chat_stream::{OpenRouterStreamer, StreamMessage};
use crate::core::config::Config;
use crate::core::credentials::SealedKeyCipher;
use crate::core::error::ChatError;
use crate::core::orchestrator::ChatOrchestrator;
use crate::mcp::transport::HttpConnector;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 64;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub cookie_name: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Binds the configured address and serves until Ctrl-C.
pub async fn serve(config: Config) -> Result<(), Box<dyn Error>> {
    let secret = config.cookie_secret(|name| std::env::var(name).ok());
    if secret.is_none() {
        warn!(
            env = %config.credentials.secret_env,
            "Cookie secret is not set; chat requests will be rejected"
        );
    }

    let connector = HttpConnector::new(config.mcp.connect_timeout())?;
    let streamer = OpenRouterStreamer::new(&config.provider)?;
    let orchestrator = ChatOrchestrator::new(
        &config.mcp,
        Arc::new(connector),
        Arc::new(streamer),
        Arc::new(SealedKeyCipher),
        secret,
    );
    let app = router(AppState {
        orchestrator: Arc::new(orchestrator),
        cookie_name: config.credentials.cookie_name.clone(),
    });

    let listener = TcpListener::bind(&config.bind).await?;
    let addr = listener.local_addr()?;
    info!("Chat server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Chat server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn chat(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let cookie = cookie_value(&headers, &state.cookie_name);
    let prepared = match state.orchestrator.prepare(&body, cookie) {
        Ok(prepared) => prepared,
        Err(err) => {
            debug!(status = %err.status_code(), error = %err, "Rejected chat request");
            return error_response(&err);
        }
    };

    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    let orchestrator = state.orchestrator.clone();
    let task_cancel = cancel.clone();
    let task =
        tokio::spawn(async move { orchestrator.execute(prepared, tx, task_cancel).await });
    // Dropping the response body (client gone) cancels the turn.
    let guard = cancel.drop_guard();

    let Some(first) = rx.recv().await else {
        return match join_turn(task).await {
            Ok(()) => sse(stream::empty()),
            Err(err) => error_response(&err),
        };
    };

    sse(event_stream(TurnStream {
        pending: Some(first),
        rx,
        task: Some(task),
        _guard: guard,
    }))
}

fn error_response(err: &ChatError) -> Response {
    (err.status_code(), Json(err.body())).into_response()
}

fn sse<S>(events: S) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping"))
        .into_response()
}

async fn join_turn(task: JoinHandle<Result<(), ChatError>>) -> Result<(), ChatError> {
    match task.await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "Chat turn task did not complete");
            Err(ChatError::StreamFailure("chat turn task aborted".to_string()))
        }
    }
}

struct TurnStream {
    pending: Option<StreamMessage>,
    rx: mpsc::Receiver<StreamMessage>,
    task: Option<JoinHandle<Result<(), ChatError>>>,
    _guard: DropGuard,
}

fn event_stream(turn: TurnStream) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(turn, |mut turn| async move {
        if let Some(message) = turn.pending.take() {
            return Some((Ok(to_event(&message)), turn));
        }
        if let Some(message) = turn.rx.recv().await {
            return Some((Ok(to_event(&message)), turn));
        }
        let task = turn.task.take()?;
        match join_turn(task).await {
            Ok(()) => None,
            Err(err) => {
                let message = StreamMessage::Error(err.public_message().to_string());
                Some((Ok(to_event(&message)), turn))
            }
        }
    })
}

fn to_event(message: &StreamMessage) -> Event {
    match serde_json::to_string(message) {
        Ok(json) => Event::default().data(json),
        Err(err) => {
            warn!(error = %err, "Failed to encode stream event");
            Event::default().data(r#"{"type":"error","data":"Failed to encode event"}"#)
        }
    }
}

/// Value of the named cookie from any `Cookie` header.
fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().trim_matches('"'))
}

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tracing::debug;

use lumberjack_logs::{LogBuffer, Subscription};
use lumberjack_proxy::Framing;
use lumberjack_types::{LiveFrame, LogLine, WireError};

use super::{AppState, wants_json};

/// `GET /logs/{slug}` - live NDJSON stream, or the current contents as text
pub async fn view(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(buffer) = state.buffers.get(&path) else {
        return not_tailing(&path);
    };

    if !wants_json(&headers) {
        return buffer.export_raw().into_response();
    }

    let mut subscription = buffer.subscribe_channel(state.subscriber_queue);
    debug!(path = %path, subscriber = %subscription.id(), "Subscribed as streaming request");

    let snapshot = subscription.take_snapshot();
    let first = futures::stream::once(async move { chunk(&snapshot) });
    let live = futures::stream::unfold(subscription, |mut subscription| async move {
        let batch = subscription.recv().await?;
        Some((chunk(&batch), subscription))
    });

    (
        [(CONTENT_TYPE, "application/json")],
        Body::from_stream(first.chain(live)),
    )
        .into_response()
}

/// `GET /logs/{slug}/socket` - snapshot frame, then one message per batch
pub async fn socket(
    State(state): State<AppState>,
    Path(path): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(buffer) = state.buffers.get(&path).cloned() else {
        return not_tailing(&path);
    };

    let queue_len = state.subscriber_queue;
    ws.on_upgrade(move |socket| serve_socket(socket, buffer, queue_len, path))
}

async fn serve_socket(mut socket: WebSocket, buffer: LogBuffer, queue_len: usize, path: String) {
    let mut subscription = buffer.subscribe_channel(queue_len);
    debug!(path = %path, subscriber = %subscription.id(), "Subscribed as websocket");

    let snapshot = subscription.take_snapshot();
    if send_frame(&mut socket, &snapshot).await {
        pump_socket(&mut socket, &mut subscription).await;
    }

    let _ = socket.close().await;
    debug!(path = %path, subscriber = %subscription.id(), "Unsubscribed from websocket");
}

async fn pump_socket(socket: &mut WebSocket, subscription: &mut Subscription) {
    loop {
        tokio::select! {
            batch = subscription.recv() => match batch {
                Some(batch) => {
                    if !send_frame(socket, &batch).await {
                        break;
                    }
                }
                None => break,
            },

            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Returns false once the peer is gone
async fn send_frame(socket: &mut WebSocket, lines: &[LogLine]) -> bool {
    match LiveFrame::encode(lines) {
        Ok(frame) => socket
            .send(Message::Text(Framing::Socket.frame(&frame)))
            .await
            .is_ok(),
        Err(_) => false,
    }
}

fn chunk(lines: &[LogLine]) -> Result<String, WireError> {
    Ok(Framing::Chunked.frame(&LiveFrame::encode(lines)?))
}

fn not_tailing(path: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("Not tailing {}\n", path)).into_response()
}

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use lumberjack_proxy::{BridgeCloser, FrameSink, Framing, ProxyBridge, SinkClosed};
use lumberjack_types::{NodeAddr, slug};

use super::{AppState, wants_json};

/// Chunked HTTP response fed through a bounded queue
struct ChunkedSink {
    tx: mpsc::Sender<String>,
}

impl FrameSink for ChunkedSink {
    async fn send_frame(&mut self, frame: String) -> Result<(), SinkClosed> {
        self.tx.send(frame).await.map_err(|_| SinkClosed)
    }

    async fn close(&mut self) {}
}

/// Write half of a viewer's WebSocket
struct SocketSink {
    sender: SplitSink<WebSocket, Message>,
}

impl FrameSink for SocketSink {
    async fn send_frame(&mut self, frame: String) -> Result<(), SinkClosed> {
        self.sender
            .send(Message::Text(frame))
            .await
            .map_err(|_| SinkClosed)
    }

    async fn close(&mut self) {
        let _ = self.sender.close().await;
    }
}

/// Closes the bridge when the response body is dropped
struct CloseOnDrop(BridgeCloser);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// `GET /proxy/{host}/{slug}` - another node's live stream, relayed
pub async fn view(
    State(state): State<AppState>,
    Path((host, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let addr = match host.parse::<NodeAddr>() {
        Ok(addr) => addr,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    if !wants_json(&headers) {
        return describe(&addr, &host, &path).into_response();
    }

    let bridge = match connect(&state, &addr, &path, Framing::Chunked).await {
        Ok(bridge) => bridge,
        Err(response) => return response,
    };
    debug!(host = %addr, path = %path, "Subscribed as streaming proxy");

    let (tx, rx) = mpsc::channel(state.subscriber_queue);
    let guard = CloseOnDrop(bridge.closer());
    tokio::spawn(async move {
        let end = bridge.pump(ChunkedSink { tx }).await;
        debug!(host = %addr, path = %path, ?end, "Unsubscribed as streaming proxy");
    });

    let body = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let frame = rx.recv().await?;
        Some((Ok::<_, Infallible>(frame), (rx, guard)))
    });

    (
        [(CONTENT_TYPE, "application/json")],
        Body::from_stream(body),
    )
        .into_response()
}

/// `GET /proxy/{host}/{slug}/socket` - another node's live socket, relayed
pub async fn socket(
    State(state): State<AppState>,
    Path((host, path)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let addr = match host.parse::<NodeAddr>() {
        Ok(addr) => addr,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let bridge = match connect(&state, &addr, &path, Framing::Socket).await {
        Ok(bridge) => bridge,
        Err(response) => return response,
    };
    debug!(host = %addr, path = %path, "Subscribed as websocket proxy");

    ws.on_upgrade(move |socket| bridge_socket(socket, bridge, addr, path))
}

async fn bridge_socket(socket: WebSocket, bridge: ProxyBridge, addr: NodeAddr, path: String) {
    let (sender, mut receiver) = socket.split();
    let closer = bridge.closer();

    // Nothing is expected from the viewer; reading only detects its close
    let watcher = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
        closer.close();
    });

    let end = bridge.pump(SocketSink { sender }).await;
    watcher.abort();
    debug!(host = %addr, path = %path, ?end, "Unsubscribed websocket proxy");
}

async fn connect(
    state: &AppState,
    addr: &NodeAddr,
    path: &str,
    framing: Framing,
) -> Result<ProxyBridge, Response> {
    let url = ProxyBridge::upstream_url(&addr.authority(state.listen_port), path);

    ProxyBridge::connect(url, framing, state.proxy_connect_timeout)
        .await
        .map_err(|e| {
            warn!(error = %e, "Proxy upstream unreachable");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        })
}

fn describe(addr: &NodeAddr, host: &str, path: &str) -> String {
    format!(
        "{} on {}\nstream: /proxy/{}/{} (Accept: application/json)\nsocket: /proxy/{}/{}/socket\n",
        path,
        addr,
        host,
        slug(path),
        host,
        slug(path),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_links_both_transports() {
        let addr: NodeAddr = "oak:8080".parse().unwrap();
        let text = describe(&addr, "oak:8080", "/var/log/syslog");

        assert!(text.starts_with("/var/log/syslog on oak:8080\n"));
        assert!(text.contains("/proxy/oak:8080/%2Fvar%2Flog%2Fsyslog (Accept"));
        assert!(text.contains("/proxy/oak:8080/%2Fvar%2Flog%2Fsyslog/socket"));
    }

    #[tokio::test]
    async fn test_chunked_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = ChunkedSink { tx };

        sink.send_frame("a\n".into()).await.unwrap();
        drop(rx);
        assert!(sink.send_frame("b\n".into()).await.is_err());
    }
}

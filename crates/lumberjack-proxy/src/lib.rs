//! Cross-node stream proxy for lumberjack
//!
//! A [`ProxyBridge`] holds a WebSocket to another node's live view of one
//! file and relays every frame it receives into a local viewer's transport.
//! The bridge keeps no buffer of its own: the upstream connection is itself a
//! subscriber of the remote log buffer, so the viewer gets the remote
//! snapshot first and live frames after.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lumberjack_types::slug;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("could not reach upstream {url}: {source}")]
    Connect {
        url: String,
        source: Box<tungstenite::Error>,
    },

    #[error("timed out connecting to upstream {url}")]
    Timeout { url: String },
}

/// The viewer went away
#[derive(Debug, thiserror::Error)]
#[error("downstream closed")]
pub struct SinkClosed;

/// How frames are written to the downstream transport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// Long-lived HTTP response, one JSON frame per line
    Chunked,
    /// One WebSocket message per frame
    Socket,
}

impl Framing {
    pub fn frame(&self, message: &str) -> String {
        match self {
            Self::Chunked => format!("{}\n", message),
            Self::Socket => message.to_owned(),
        }
    }
}

/// Downstream side of a bridge
pub trait FrameSink: Send {
    /// Write one already-framed message
    fn send_frame(&mut self, frame: String) -> impl Future<Output = Result<(), SinkClosed>> + Send;

    /// Release the transport; called once when the bridge ends
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Why a bridge stopped pumping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeEnd {
    UpstreamClosed,
    DownstreamClosed,
    /// [`BridgeCloser::close`] was called
    Closed,
}

/// Ends a running bridge from outside; closing twice is harmless
#[derive(Clone, Debug)]
pub struct BridgeCloser(CancellationToken);

impl BridgeCloser {
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// One viewer's bridge to a remote live stream
pub struct ProxyBridge {
    upstream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
    framing: Framing,
    cancel: CancellationToken,
}

impl ProxyBridge {
    /// Live socket of `path` on the node at `authority` (`host:port`)
    pub fn upstream_url(authority: &str, path: &str) -> String {
        format!("ws://{}/logs/{}/socket", authority, slug(path))
    }

    /// Open the upstream connection
    pub async fn connect(
        url: impl Into<String>,
        framing: Framing,
        connect_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let url = url.into();

        let upstream = match tokio::time::timeout(
            connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((upstream, _response))) => upstream,
            Ok(Err(source)) => {
                return Err(ProxyError::Connect {
                    url,
                    source: Box::new(source),
                });
            }
            Err(_) => return Err(ProxyError::Timeout { url }),
        };

        debug!(url = %url, ?framing, "Proxy bridge connected");
        Ok(Self {
            upstream,
            url,
            framing,
            cancel: CancellationToken::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn closer(&self) -> BridgeCloser {
        BridgeCloser(self.cancel.clone())
    }

    /// Relay upstream frames into `sink` until either side ends
    ///
    /// Both sides are torn down exactly once, whichever ends first.
    pub async fn pump<S: FrameSink>(self, mut sink: S) -> BridgeEnd {
        let Self {
            mut upstream,
            url,
            framing,
            cancel,
        } = self;

        let end = loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break BridgeEnd::Closed,
                message = upstream.next() => message,
            };

            let text = match message {
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!(url = %url, "Skipping non-UTF-8 upstream frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break BridgeEnd::UpstreamClosed,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(url = %url, error = %e, "Upstream failed");
                    break BridgeEnd::UpstreamClosed;
                }
            };

            if sink.send_frame(framing.frame(&text)).await.is_err() {
                break BridgeEnd::DownstreamClosed;
            }
        };

        cancel.cancel();
        let _ = upstream.close(None).await;
        sink.close().await;
        debug!(url = %url, ?end, "Proxy bridge closed");

        end
    }
}

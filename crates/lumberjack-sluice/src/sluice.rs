use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::decoder::{Decoded, FrameDecoder, is_end_of_stream, record_count};
use crate::stats::{SluiceStats, StatsSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum SluiceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("refusing to reopen {0}: connection still outstanding")]
    ReopenWhileStreaming(String),

    #[error("sluice for {0} is closed")]
    Closed(String),

    #[error("sluice for {0} is already open")]
    AlreadyOpen(String),
}

/// Turns one decoded frame into application effects
pub trait FrameParser: Send {
    fn parse(&mut self, frame: Value) -> anyhow::Result<()>;
}

impl<F> FrameParser for F
where
    F: FnMut(Value) -> anyhow::Result<()> + Send,
{
    fn parse(&mut self, frame: Value) -> anyhow::Result<()> {
        self(frame)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SluiceState {
    Closed,
    Opening,
    Streaming,
    BackoffWait,
}

impl fmt::Display for SluiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Streaming => "streaming",
            Self::BackoffWait => "backoff",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct SluiceConfig {
    /// First reopen delay
    pub initial_delay: Duration,

    /// Ceiling for the reopen delay
    pub max_delay: Option<Duration>,

    /// Bound on establishing a connection; streams themselves never time out
    pub connect_timeout: Duration,
}

impl Default for SluiceConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(600)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// What the driver does after a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FrameOutcome {
    Continue,
    EndOfStream,
}

/// How an attempt ended without a transport error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AttemptEnd {
    EndOfStream,
    TransportClosed,
}

/// Connection state plus the reopen guard
#[derive(Debug)]
struct Valve {
    state: SluiceState,
    connection_open: bool,
    backoff: Backoff,
}

impl Valve {
    fn new(config: &SluiceConfig) -> Self {
        Self {
            state: SluiceState::Closed,
            connection_open: false,
            backoff: Backoff::new(config.initial_delay, config.max_delay),
        }
    }

    /// Returns false once closed
    fn begin_attempt(&mut self, closed: bool) -> bool {
        if closed {
            return false;
        }
        self.state = SluiceState::Opening;
        self.connection_open = true;
        true
    }

    fn streaming(&mut self) {
        if self.state == SluiceState::Opening {
            self.state = SluiceState::Streaming;
        }
    }

    fn complete(&mut self) {
        self.connection_open = false;
    }

    /// Schedule the next attempt and return how long to wait for it
    fn reopen(&mut self, url: &str, stats: &SluiceStats) -> Result<Duration, SluiceError> {
        if self.state == SluiceState::Closed {
            return Err(SluiceError::Closed(url.to_owned()));
        }
        if self.connection_open {
            return Err(SluiceError::ReopenWhileStreaming(url.to_owned()));
        }

        stats.add_reconnect();
        self.state = SluiceState::BackoffWait;
        Ok(self.backoff.next_delay())
    }

    fn close(&mut self) {
        self.state = SluiceState::Closed;
        self.connection_open = false;
    }
}

struct Shared {
    url: String,
    valve: Mutex<Valve>,
    stats: SluiceStats,
    cancel: CancellationToken,
}

/// Resilient subscriber to one remote stream of JSON frames
///
/// Every transport failure or end-of-stream frame schedules a reconnect after
/// an exponentially growing delay. Frames are handed to the parser in order.
pub struct Sluice {
    shared: Arc<Shared>,
    config: SluiceConfig,
    parser: Option<Box<dyn FrameParser>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Sluice {
    pub fn new(
        url: impl Into<String>,
        parser: impl FrameParser + 'static,
        config: SluiceConfig,
    ) -> Self {
        let valve = Valve::new(&config);
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                valve: Mutex::new(valve),
                stats: SluiceStats::default(),
                cancel: CancellationToken::new(),
            }),
            config,
            parser: Some(Box::new(parser)),
            task: None,
        }
    }

    /// Start streaming in the background
    pub fn open(&mut self) -> Result<(), SluiceError> {
        if self.shared.cancel.is_cancelled() {
            return Err(SluiceError::Closed(self.shared.url.clone()));
        }
        let Some(parser) = self.parser.take() else {
            return Err(SluiceError::AlreadyOpen(self.shared.url.clone()));
        };

        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .build()?;

        info!(url = %self.shared.url, "Opening sluice");
        let shared = self.shared.clone();
        self.task = Some(tokio::spawn(drive(shared, client, parser)));
        Ok(())
    }

    /// Stop for good; no further reopen happens
    pub fn close(&mut self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();
        self.shared.valve.lock().close();
        self.parser = None;
        debug!(url = %self.shared.url, "Sluice closed");
    }

    pub fn state(&self) -> SluiceState {
        self.shared.valve.lock().state
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Wait for the background driver to finish after [`Sluice::close`]
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Sluice {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive(shared: Arc<Shared>, client: reqwest::Client, mut parser: Box<dyn FrameParser>) {
    let url = shared.url.as_str();

    loop {
        if !shared
            .valve
            .lock()
            .begin_attempt(shared.cancel.is_cancelled())
        {
            break;
        }

        let result = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = attempt(&shared, &client, parser.as_mut()) => result,
        };
        shared.valve.lock().complete();

        match result {
            Ok(AttemptEnd::EndOfStream) => debug!(url = %url, "End of stream, reopening"),
            Ok(AttemptEnd::TransportClosed) => warn!(url = %url, "Stream closed by peer"),
            Err(e) => warn!(url = %url, error = %e, "Stream failed"),
        }

        let delay = match shared.valve.lock().reopen(url, &shared.stats) {
            Ok(delay) => delay,
            Err(SluiceError::Closed(_)) => break,
            Err(e) => {
                error!(error = %e, "Reopen refused");
                continue;
            }
        };
        warn!(url = %url, delay_ms = delay.as_millis() as u64, "Reconnecting");

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.valve.lock().close();
    debug!(url = %url, "Sluice driver stopped");
}

async fn attempt(
    shared: &Shared,
    client: &reqwest::Client,
    parser: &mut dyn FrameParser,
) -> Result<AttemptEnd, SluiceError> {
    let url = shared.url.as_str();
    let response = client
        .get(url)
        .header(ACCEPT, "application/json")
        .send()
        .await?
        .error_for_status()?;

    shared.valve.lock().streaming();
    info!(url = %url, "Streaming");

    let mut body = response.bytes_stream();
    let mut decoder = FrameDecoder::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        shared.stats.add_raw(chunk.len());

        for item in decoder.push(&chunk) {
            match item {
                Decoded::Frame(frame) => {
                    if handle_frame(parser, &shared.stats, url, frame) == FrameOutcome::EndOfStream
                    {
                        return Ok(AttemptEnd::EndOfStream);
                    }
                }
                Decoded::Malformed(e) => {
                    shared.stats.add_decode_failure();
                    warn!(url = %url, error = %e, "Undecodable frame");
                }
            }
        }
    }

    Ok(AttemptEnd::TransportClosed)
}

pub(crate) fn handle_frame(
    parser: &mut dyn FrameParser,
    stats: &SluiceStats,
    url: &str,
    frame: Value,
) -> FrameOutcome {
    stats.add_records(record_count(&frame));
    if is_end_of_stream(&frame) {
        return FrameOutcome::EndOfStream;
    }

    if let Err(e) = parser.parse(frame) {
        stats.add_parse_failure();
        warn!(url = %url, error = %e, "Parse failed");
    }
    FrameOutcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::routing::get;
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn fast_config() -> SluiceConfig {
        SluiceConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Some(Duration::from_millis(200)),
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/stream", addr)
    }

    fn ignore(_frame: Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn wait_for(sluice: &Sluice, done: impl Fn(&StatsSnapshot) -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done(&sluice.stats()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_reopen_refused_while_connection_outstanding() {
        let stats = SluiceStats::default();
        let mut valve = Valve::new(&fast_config());

        assert!(valve.begin_attempt(false));
        assert!(matches!(
            valve.reopen("u", &stats),
            Err(SluiceError::ReopenWhileStreaming(_))
        ));
        assert_eq!(stats.snapshot().reconnects, 0);

        valve.complete();
        assert_eq!(valve.reopen("u", &stats).unwrap(), Duration::from_millis(20));
        assert_eq!(valve.state, SluiceState::BackoffWait);
        assert_eq!(stats.snapshot().reconnects, 1);
    }

    #[test]
    fn test_reopen_delays_double_and_never_reset() {
        let stats = SluiceStats::default();
        let mut valve = Valve::new(&fast_config());
        let mut delays = Vec::new();

        for _ in 0..5 {
            valve.begin_attempt(false);
            valve.streaming();
            valve.complete();
            delays.push(valve.reopen("u", &stats).unwrap().as_millis());
        }

        assert_eq!(delays, [20, 40, 80, 160, 200]);
    }

    #[test]
    fn test_closed_valve_refuses_everything() {
        let stats = SluiceStats::default();
        let mut valve = Valve::new(&fast_config());
        valve.close();

        assert!(!valve.begin_attempt(true));
        assert!(matches!(valve.reopen("u", &stats), Err(SluiceError::Closed(_))));
    }

    #[test]
    fn test_handle_frame_counts_and_parses() {
        let stats = SluiceStats::default();
        let mut seen = Vec::new();
        let mut parser = |frame: Value| -> anyhow::Result<()> {
            seen.push(frame);
            Ok(())
        };

        let outcome = handle_frame(&mut parser, &stats, "u", json!([1, 2, 3]));

        assert_eq!(outcome, FrameOutcome::Continue);
        assert_eq!(seen, [json!([1, 2, 3])]);
        assert_eq!(stats.snapshot().records_received, 3);
    }

    #[test]
    fn test_handle_frame_empty_is_end_of_stream() {
        let stats = SluiceStats::default();
        let mut calls = 0;
        let mut parser = |_frame: Value| -> anyhow::Result<()> {
            calls += 1;
            Ok(())
        };

        assert_eq!(
            handle_frame(&mut parser, &stats, "u", json!([])),
            FrameOutcome::EndOfStream
        );
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_handle_frame_counts_parse_failure() {
        let stats = SluiceStats::default();
        let mut parser = |_frame: Value| -> anyhow::Result<()> { anyhow::bail!("nope") };

        let outcome = handle_frame(&mut parser, &stats, "u", json!({"logs": ["a"]}));

        assert_eq!(outcome, FrameOutcome::Continue);
        assert_eq!(stats.snapshot().parse_failures, 1);
    }

    #[tokio::test]
    async fn test_empty_frame_triggers_reconnect() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/stream",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // Keep the body open after the empty frame
                    let frames = futures::stream::iter([
                        Ok::<_, Infallible>("{\"logs\":[\"a\",\"b\"]}\n"),
                        Ok("[]\n"),
                    ])
                    .chain(futures::stream::pending());
                    Body::from_stream(frames)
                }
            }),
        );
        let url = serve(router).await;

        let received = Arc::new(AtomicUsize::new(0));
        let parsed = received.clone();
        let mut sluice = Sluice::new(
            url,
            move |_frame: Value| -> anyhow::Result<()> {
                parsed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            fast_config(),
        );
        sluice.open().unwrap();

        wait_for(&sluice, |stats| stats.reconnects >= 2).await;

        assert!(hits.load(Ordering::SeqCst) >= 2);
        assert!(received.load(Ordering::SeqCst) >= 2);
        assert_eq!(sluice.stats().parse_failures, 0);

        sluice.close();
        sluice.closed().await;
        assert_eq!(sluice.state(), SluiceState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_end_stream() {
        let router = Router::new().route(
            "/stream",
            get(|| async {
                let frames = futures::stream::iter([Ok::<_, Infallible>(
                    "{\"logs\":[\"a\"]}\n{oops}\n{\"logs\":[\"b\"]}\n",
                )])
                .chain(futures::stream::pending());
                Body::from_stream(frames)
            }),
        );
        let url = serve(router).await;

        let mut sluice = Sluice::new(url, ignore, fast_config());
        sluice.open().unwrap();

        wait_for(&sluice, |stats| stats.records_received >= 2).await;

        let stats = sluice.stats();
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.reconnects, 0);
        assert_eq!(sluice.state(), SluiceState::Streaming);
    }

    #[tokio::test]
    async fn test_unreachable_url_keeps_backing_off() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut sluice = Sluice::new(
            format!("http://{}/stream", addr),
            ignore,
            fast_config(),
        );
        sluice.open().unwrap();

        wait_for(&sluice, |stats| stats.reconnects >= 3).await;
        assert_eq!(sluice.stats().records_received, 0);

        sluice.close();
        assert!(matches!(sluice.open(), Err(SluiceError::Closed(_))));
    }

    #[tokio::test]
    async fn test_open_twice_is_rejected() {
        let mut sluice = Sluice::new("http://127.0.0.1:9/stream", ignore, fast_config());
        sluice.open().unwrap();
        assert!(matches!(sluice.open(), Err(SluiceError::AlreadyOpen(_))));
    }
}

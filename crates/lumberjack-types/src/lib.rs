//! Shared types for lumberjack
//!
//! This crate contains the data structures and wire formats used across the
//! lumberjack crates: log lines, watched-file descriptors, lodge membership
//! records and node addresses.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Errors raised while encoding or decoding lumberjack wire formats
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp: {0}")]
    Timestamp(String),

    #[error("invalid node address: {0:?}")]
    Address(String),
}

// ============================================================================
// Log Types
// ============================================================================

/// A single immutable log line
///
/// Cloning is a reference count increment, so one line can sit in a buffer
/// and in any number of subscriber queues at once.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LogLine(Arc<str>);

impl LogLine {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for LogLine {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LogLine {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for LogLine {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Debug for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for LogLine {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for LogLine {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Lines delivered to a subscriber as one unit
pub type LogBatch = Arc<[LogLine]>;

/// Frame sent to live viewers: `{"logs": [line, ...]}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveFrame {
    pub logs: Vec<LogLine>,
}

impl LiveFrame {
    /// Encode a slice of lines as a live frame without copying the lines
    pub fn encode(lines: &[LogLine]) -> Result<String, WireError> {
        #[derive(Serialize)]
        struct Borrowed<'a> {
            logs: &'a [LogLine],
        }

        Ok(serde_json::to_string(&Borrowed { logs: lines })?)
    }

    pub fn decode(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// Lodge Types
// ============================================================================

/// Silence allowed before a fellow is considered dead
pub const DEFAULT_CURFEW: Duration = Duration::from_secs(20 * 60);

/// Periodic check-ins fire this long before the curfew would lapse
pub const CHECK_IN_MARGIN: Duration = Duration::from_secs(10);

/// Percent-encode a file path into its public identifier
pub fn slug(path: &str) -> String {
    urlencoding::encode(path).into_owned()
}

/// A watched file, as announced to the lodge
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lumberfile {
    pub path: String,
    pub slug: String,
}

impl Lumberfile {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let slug = slug(&path);
        Self { path, slug }
    }
}

/// A node's identity and liveness record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FellowWire", into = "FellowWire")]
pub struct Fellow {
    /// Unique within a lodge
    pub name: String,

    /// Maximum allowed silence
    pub curfew: Duration,

    pub last_checked_in: DateTime<Utc>,

    /// Files this node is tailing
    pub lumberfiles: Vec<Lumberfile>,
}

impl Fellow {
    /// Create a fellow with the default curfew, checked in now
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            curfew: DEFAULT_CURFEW,
            last_checked_in: Utc::now(),
            lumberfiles: Vec::new(),
        }
    }

    pub fn with_curfew(mut self, curfew: Duration) -> Self {
        self.curfew = curfew;
        self
    }

    pub fn with_lumberfiles(mut self, lumberfiles: Vec<Lumberfile>) -> Self {
        self.lumberfiles = lumberfiles;
        self
    }

    /// Stamp the record with the current time
    pub fn check_in(&mut self) {
        self.last_checked_in = Utc::now();
    }

    pub fn alive(&self) -> bool {
        self.alive_at(Utc::now())
    }

    /// Strictly less than the curfew has elapsed since the last check-in
    ///
    /// A check-in stamped in the future counts as alive.
    pub fn alive_at(&self, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.last_checked_in).to_std() {
            Ok(elapsed) => elapsed < self.curfew,
            Err(_) => true,
        }
    }

    /// Period of the self check-in timer: curfew minus a safety margin
    pub fn check_in_interval(&self) -> Duration {
        self.curfew
            .saturating_sub(CHECK_IN_MARGIN)
            .max(Duration::from_secs(1))
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Check-in wire format
///
/// `curfew` is whole seconds, `last_checked_in` is unix seconds as a string.
#[derive(Serialize, Deserialize)]
struct FellowWire {
    name: String,
    curfew: u64,
    last_checked_in: WireTimestamp,
    #[serde(default)]
    lumberfiles: Vec<Lumberfile>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Text(String),
    Number(f64),
}

impl WireTimestamp {
    fn to_datetime(&self) -> Result<DateTime<Utc>, WireError> {
        let secs = match self {
            Self::Text(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| WireError::Timestamp(text.clone()))?,
            Self::Number(n) => *n,
        };

        if !secs.is_finite() {
            return Err(WireError::Timestamp(secs.to_string()));
        }

        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9) as u32;
        DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
            .ok_or_else(|| WireError::Timestamp(secs.to_string()))
    }
}

impl TryFrom<FellowWire> for Fellow {
    type Error = WireError;

    fn try_from(wire: FellowWire) -> Result<Self, Self::Error> {
        Ok(Self {
            last_checked_in: wire.last_checked_in.to_datetime()?,
            name: wire.name,
            curfew: Duration::from_secs(wire.curfew),
            lumberfiles: wire.lumberfiles,
        })
    }
}

impl From<Fellow> for FellowWire {
    fn from(fellow: Fellow) -> Self {
        Self {
            name: fellow.name,
            curfew: fellow.curfew.as_secs(),
            last_checked_in: WireTimestamp::Text(fellow.last_checked_in.timestamp().to_string()),
            lumberfiles: fellow.lumberfiles,
        }
    }
}

// ============================================================================
// Node Types
// ============================================================================

/// `host` or `host:port` of another lumberjack node
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    host: String,
    port: Option<u16>,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host:port`, using `default_port` when none was given
    ///
    /// Nodes in a fleet usually listen on the same port, so a bare host
    /// inherits the local listen port.
    pub fn authority(&self, default_port: u16) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(default_port))
    }
}

impl FromStr for NodeAddr {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| WireError::Address(s.to_string()))?;
                (host, Some(port))
            }
            None => (s, None),
        };

        if host.is_empty() || host.contains('/') {
            return Err(WireError::Address(s.to_string()));
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

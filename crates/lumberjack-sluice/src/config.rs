use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::parsers::{CountParser, PrintParser};
use crate::sluice::{FrameParser, SluiceConfig};

/// Built-in frame parsers selectable from the config file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    /// Write every log line to stdout
    #[default]
    Print,
    /// Only count records
    Count,
}

impl ParserKind {
    pub fn build(self, url: &str) -> Box<dyn FrameParser> {
        match self {
            Self::Print => Box::new(PrintParser::new(url)),
            Self::Count => Box::new(CountParser::default()),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SluiceEntry {
    pub url: String,
    #[serde(default)]
    pub parser: ParserKind,
}

/// Contents of a `sluice` config file
///
/// ```toml
/// initial_delay_ms = 1000
/// max_delay_secs = 600
///
/// [[sluice]]
/// url = "http://oak:8080/logs/%2Fvar%2Flog%2Fsyslog"
/// parser = "print"
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct SluiceFile {
    #[serde(default, rename = "sluice")]
    pub sluices: Vec<SluiceEntry>,

    pub initial_delay_ms: Option<u64>,

    /// `0` removes the ceiling
    pub max_delay_secs: Option<u64>,

    pub connect_timeout_secs: Option<u64>,
}

impl SluiceFile {
    pub fn parse(content: &str) -> Result<Self> {
        let file: Self = toml::from_str(content).context("Invalid sluice config")?;
        if file.sluices.is_empty() {
            anyhow::bail!("No [[sluice]] entries configured");
        }
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to load {}", path.display()))
    }

    pub fn sluice_config(&self) -> SluiceConfig {
        let defaults = SluiceConfig::default();
        SluiceConfig {
            initial_delay: self
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: match self.max_delay_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.max_delay,
            },
            connect_timeout: self
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
        }
    }
}

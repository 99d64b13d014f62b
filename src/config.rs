use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use lumberjack_types::{DEFAULT_CURFEW, NodeAddr};

pub const DEFAULT_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_BUFFER_LEN: usize = 200;
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 64;
pub const DEFAULT_PROXY_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved settings for one lumberjack node
#[derive(Clone, Debug)]
pub struct Config {
    /// Files to tail
    pub files: Vec<PathBuf>,

    /// Port the HTTP server listens on; also the port assumed for peers
    /// addressed without one
    pub listen_port: u16,

    /// Lines kept in memory per file
    pub buffer_len: usize,

    /// Authoritative lodge to mirror; `None` hosts the lodge here
    pub lodge: Option<NodeAddr>,

    /// Name this node checks in under
    pub name: String,

    pub curfew: Duration,

    /// Batches queued per live viewer before it is dropped
    pub subscriber_queue: usize,

    pub proxy_connect_timeout: Duration,
}

impl Config {
    /// `host:port` of the lodge to mirror, if any
    pub fn lodge_authority(&self) -> Option<String> {
        self.lodge
            .as_ref()
            .map(|addr| addr.authority(self.listen_port))
    }
}

/// One source of settings; every field is optional so sources can be layered
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    #[serde(default)]
    pub files: Vec<PathBuf>,
    pub listen_port: Option<u16>,
    pub buffer_len: Option<usize>,
    pub lodge: Option<String>,
    pub name: Option<String>,
    pub curfew_secs: Option<u64>,
    pub subscriber_queue: Option<usize>,
    pub proxy_connect_timeout_secs: Option<u64>,
}

impl ConfigLayer {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid config file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to load {}", path.display()))
    }

    /// Fill every unset field of `self` from `lower`
    pub fn over(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            files: if self.files.is_empty() {
                lower.files
            } else {
                self.files
            },
            listen_port: self.listen_port.or(lower.listen_port),
            buffer_len: self.buffer_len.or(lower.buffer_len),
            lodge: self.lodge.or(lower.lodge),
            name: self.name.or(lower.name),
            curfew_secs: self.curfew_secs.or(lower.curfew_secs),
            subscriber_queue: self.subscriber_queue.or(lower.subscriber_queue),
            proxy_connect_timeout_secs: self
                .proxy_connect_timeout_secs
                .or(lower.proxy_connect_timeout_secs),
        }
    }

    /// Apply defaults and validate
    pub fn resolve(self) -> Result<Config> {
        let lodge = self
            .lodge
            .map(|lodge| lodge.parse::<NodeAddr>())
            .transpose()
            .context("Invalid --lodge address")?;

        let subscriber_queue = self.subscriber_queue.unwrap_or(DEFAULT_SUBSCRIBER_QUEUE);
        if subscriber_queue == 0 {
            anyhow::bail!("subscriber queue must hold at least one batch");
        }

        Ok(Config {
            files: self.files,
            listen_port: self.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
            buffer_len: self.buffer_len.unwrap_or(DEFAULT_BUFFER_LEN),
            lodge,
            name: self.name.unwrap_or_else(hostname),
            curfew: self
                .curfew_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CURFEW),
            subscriber_queue,
            proxy_connect_timeout: self
                .proxy_connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PROXY_CONNECT_TIMEOUT),
        })
    }
}

/// Best-effort system hostname
fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_owned())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigLayer {
            name: Some("oak".into()),
            ..Default::default()
        }
        .resolve()
        .unwrap();

        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.buffer_len, 200);
        assert_eq!(config.curfew, Duration::from_secs(1200));
        assert_eq!(config.subscriber_queue, 64);
        assert_eq!(config.proxy_connect_timeout, Duration::from_secs(30));
        assert!(config.lodge.is_none());
        assert!(config.lodge_authority().is_none());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = ConfigLayer::parse(
            r#"
            files = ["/var/log/syslog"]
            listen_port = 9000
            buffer_len = 50
            lodge = "elm"
            "#,
        )
        .unwrap();
        let cli = ConfigLayer {
            listen_port: Some(9100),
            name: Some("oak".into()),
            ..Default::default()
        };

        let config = cli.over(file).resolve().unwrap();

        assert_eq!(config.listen_port, 9100);
        assert_eq!(config.buffer_len, 50);
        assert_eq!(config.files, [PathBuf::from("/var/log/syslog")]);
        assert_eq!(config.lodge_authority().as_deref(), Some("elm:9100"));
    }

    #[test]
    fn test_cli_files_replace_file_list() {
        let file = ConfigLayer {
            files: vec!["a.log".into()],
            ..Default::default()
        };
        let cli = ConfigLayer {
            files: vec!["b.log".into()],
            ..Default::default()
        };

        assert_eq!(cli.over(file).files, [PathBuf::from("b.log")]);
    }

    #[test]
    fn test_lodge_with_port() {
        let config = ConfigLayer {
            lodge: Some("elm:7000".into()),
            name: Some("oak".into()),
            ..Default::default()
        }
        .resolve()
        .unwrap();

        assert_eq!(config.lodge_authority().as_deref(), Some("elm:7000"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_lodge = ConfigLayer {
            lodge: Some("http://elm/".into()),
            ..Default::default()
        };
        assert!(bad_lodge.resolve().is_err());

        let empty_queue = ConfigLayer {
            subscriber_queue: Some(0),
            ..Default::default()
        };
        assert!(empty_queue.resolve().is_err());

        assert!(ConfigLayer::parse("colour = \"red\"").is_err());
    }
}

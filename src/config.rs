//! File-based configuration and assembly of the HTTP-backed engine.

use crate::fleet::{
    adapters::{
        HttpHealthCheck, HttpJsonRpcTransport, JsonFileRegistryStore,
        sources::{DocumentLocation, DocumentWatchSource, HttpPollingSource},
    },
    ports::DiscoverySource,
    services::{DEFAULT_EVENTS_CAPACITY, EngineParts, EngineSettings, HealthPolicy, Switchboard},
};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use mockable::DefaultClock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Engine assembled from production adapters.
pub type HttpSwitchboard =
    Switchboard<JsonFileRegistryStore, HttpJsonRpcTransport, HttpHealthCheck, DefaultClock>;

const fn default_file_watch_interval() -> u64 {
    5
}

const fn default_http_polling_interval() -> u64 {
    30
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration '{path}': {source}")]
    Read {
        /// Configuration path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for this schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A discovery source entry is inconsistent.
    #[error("invalid discovery source '{name}': {reason}")]
    InvalidSource {
        /// Source name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A timing or threshold setting is out of range.
    #[error("invalid setting `{field}`: {reason}")]
    InvalidSetting {
        /// Offending field, dotted for nested settings.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// One configured discovery source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoverySourceConfig {
    /// Watch a local file or remote document for changes.
    FileWatch {
        /// Source name used in logs and reports.
        name: String,
        /// Local document path.
        #[serde(default)]
        path: Option<Utf8PathBuf>,
        /// Remote document URL.
        #[serde(default)]
        url: Option<String>,
        /// Seconds between reads.
        #[serde(default = "default_file_watch_interval")]
        interval_secs: u64,
    },
    /// Poll a discovery service.
    HttpPolling {
        /// Source name used in logs and reports.
        name: String,
        /// Discovery endpoint.
        url: String,
        /// Optional tag filter sent with each poll.
        #[serde(default)]
        tags: Vec<String>,
        /// Seconds between polls.
        #[serde(default = "default_http_polling_interval")]
        interval_secs: u64,
    },
}

impl DiscoverySourceConfig {
    /// Returns the source name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::FileWatch { name, .. } | Self::HttpPolling { name, .. } => name,
        }
    }

    /// Builds the configured source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSource`] when a file watch names both
    /// or neither of `path` and `url`, or the interval is zero.
    pub fn build(&self) -> Result<Arc<dyn DiscoverySource>, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSource {
            name: self.name().to_owned(),
            reason: reason.to_owned(),
        };

        match self {
            Self::FileWatch {
                name,
                path,
                url,
                interval_secs,
            } => {
                let location = match (path, url) {
                    (Some(file), None) => DocumentLocation::File(file.clone()),
                    (None, Some(remote)) => DocumentLocation::Url(remote.clone()),
                    _ => return Err(invalid("exactly one of `path` or `url` is required")),
                };
                let interval = interval_from(*interval_secs).ok_or_else(|| invalid("interval must be positive"))?;
                Ok(Arc::new(DocumentWatchSource::new(name.clone(), location, interval)))
            }
            Self::HttpPolling {
                name,
                url,
                tags,
                interval_secs,
            } => {
                let interval = interval_from(*interval_secs).ok_or_else(|| invalid("interval must be positive"))?;
                Ok(Arc::new(
                    HttpPollingSource::new(name.clone(), url.clone(), interval)
                        .with_tags(tags.iter().cloned()),
                ))
            }
        }
    }
}

fn interval_from(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    /// Registry snapshot file.
    pub registry_path: Utf8PathBuf,
    /// Tag written into registry snapshots.
    pub registry_source: String,
    /// Bound for opening a session and listing its tools.
    pub connect_timeout_ms: u64,
    /// Bound for one tool call.
    pub call_timeout_ms: u64,
    /// Registry event buffer size.
    pub events_capacity: usize,
    /// Health monitor policy.
    pub health: HealthPolicy,
    /// Discovery sources.
    pub discovery: Vec<DiscoverySourceConfig>,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            registry_path: Utf8PathBuf::from("switchboard-registry.json"),
            registry_source: env!("CARGO_PKG_NAME").to_owned(),
            connect_timeout_ms: 10_000,
            call_timeout_ms: 30_000,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            health: HealthPolicy::default(),
            discovery: Vec::new(),
        }
    }
}

impl SwitchboardConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`], [`ConfigError::Parse`] or
    /// [`ConfigError::InvalidSetting`].
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let bytes = read_config_file(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks timing and threshold settings.
    ///
    /// Timeouts, the probe interval and the failure threshold must be
    /// positive; a configured stale age must be positive too.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSetting`] naming the first offending
    /// field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("health.probe_interval_ms", self.health.probe_interval_ms),
            ("health.probe_timeout_ms", self.health.probe_timeout_ms),
            (
                "health.failure_threshold",
                u64::from(self.health.failure_threshold),
            ),
            (
                "health.stale_after_secs",
                self.health.stale_after_secs.unwrap_or(1),
            ),
        ];
        positive
            .into_iter()
            .find(|&(_, value)| value == 0)
            .map_or(Ok(()), |(field, _)| {
                Err(ConfigError::InvalidSetting {
                    field,
                    reason: "must be positive",
                })
            })
    }

    /// Returns the engine settings this configuration describes.
    #[must_use]
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            registry_source: self.registry_source.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            events_capacity: self.events_capacity,
            health: self.health,
        }
    }

    /// Builds every configured discovery source.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::InvalidSource`].
    pub fn sources(&self) -> Result<Vec<Arc<dyn DiscoverySource>>, ConfigError> {
        self.discovery.iter().map(DiscoverySourceConfig::build).collect()
    }

    /// Assembles the engine on the JSON file store and HTTP adapters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSetting`] for out-of-range settings or
    /// [`ConfigError::InvalidSource`] for inconsistent sources.
    pub async fn build_switchboard(&self) -> Result<HttpSwitchboard, ConfigError> {
        self.validate()?;
        let sources = self.sources()?;
        let settings = self.settings();
        let client = reqwest::Client::new();
        let parts = EngineParts {
            store: Arc::new(JsonFileRegistryStore::new(self.registry_path.clone())),
            transport: Arc::new(HttpJsonRpcTransport::with_client(
                client.clone(),
                settings.connect_timeout,
            )),
            health_check: Arc::new(HttpHealthCheck::with_client(client)),
            clock: Arc::new(DefaultClock),
            sources,
        };
        Ok(Switchboard::open(parts, settings).await)
    }
}

fn read_config_file(path: &Utf8Path) -> std::io::Result<Vec<u8>> {
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("configuration path must include a file name"))?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    dir.read(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn empty_object_yields_documented_defaults() {
        let config: SwitchboardConfig =
            serde_json::from_str("{}").expect("empty configuration should parse");

        assert_eq!(config, SwitchboardConfig::default());
        assert_eq!(config.health.probe_interval(), Duration::from_secs(60));
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.settings().call_timeout, Duration::from_secs(30));
    }

    #[rstest]
    fn discovery_entries_take_per_kind_interval_defaults() {
        let config: SwitchboardConfig = serde_json::from_str(
            r#"{"discovery":[
                {"kind":"file_watch","name":"local","path":"servers.json"},
                {"kind":"http_polling","name":"central","url":"http://discovery:8080/discover","tags":["math"]}
            ]}"#,
        )
        .expect("configuration should parse");

        let intervals: Vec<u64> = config
            .discovery
            .iter()
            .map(|entry| match entry {
                DiscoverySourceConfig::FileWatch { interval_secs, .. }
                | DiscoverySourceConfig::HttpPolling { interval_secs, .. } => *interval_secs,
            })
            .collect();
        assert_eq!(intervals, vec![5, 30]);
        assert_eq!(config.sources().expect("sources should build").len(), 2);
    }

    #[rstest]
    #[case(r#"{"connect_timeout_ms":0}"#, "connect_timeout_ms")]
    #[case(r#"{"call_timeout_ms":0}"#, "call_timeout_ms")]
    #[case(r#"{"health":{"probe_interval_ms":0}}"#, "health.probe_interval_ms")]
    #[case(r#"{"health":{"probe_timeout_ms":0}}"#, "health.probe_timeout_ms")]
    #[case(r#"{"health":{"failure_threshold":0}}"#, "health.failure_threshold")]
    #[case(r#"{"health":{"stale_after_secs":0}}"#, "health.stale_after_secs")]
    fn zero_timings_are_rejected(#[case] document: &str, #[case] expected: &str) {
        let config: SwitchboardConfig =
            serde_json::from_str(document).expect("configuration should parse");

        let Err(ConfigError::InvalidSetting { field, .. }) = config.validate() else {
            panic!("expected {expected} to be rejected");
        };
        assert_eq!(field, expected);
    }

    #[rstest]
    fn load_rejects_a_zero_check_interval() {
        let dir = tempfile::TempDir::new().expect("temporary directory should be created");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("switchboard.json"))
            .expect("temp path should be UTF-8");
        std::fs::write(&path, r#"{"health":{"probe_interval_ms":0}}"#)
            .expect("configuration should be written");

        assert!(matches!(
            SwitchboardConfig::load(&path),
            Err(ConfigError::InvalidSetting {
                field: "health.probe_interval_ms",
                ..
            })
        ));
    }

    #[rstest]
    fn defaults_and_an_enabled_sweep_validate() {
        let config: SwitchboardConfig =
            serde_json::from_str(r#"{"health":{"stale_after_secs":600}}"#)
                .expect("configuration should parse");

        assert!(config.validate().is_ok());
        assert!(SwitchboardConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case(r#"{"kind":"file_watch","name":"both","path":"a.json","url":"http://x/a.json"}"#)]
    #[case(r#"{"kind":"file_watch","name":"neither"}"#)]
    #[case(r#"{"kind":"http_polling","name":"zero","url":"http://x","interval_secs":0}"#)]
    fn inconsistent_sources_are_rejected(#[case] entry: &str) {
        let source: DiscoverySourceConfig =
            serde_json::from_str(entry).expect("entry should parse");

        assert!(matches!(
            source.build(),
            Err(ConfigError::InvalidSource { .. })
        ));
    }
}

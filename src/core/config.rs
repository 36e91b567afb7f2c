//! Responder and requester configuration.
//!
//! Both configs deserialize from JSON; every field except `endpoint` has a
//! default so minimal files stay minimal.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Default poll wait of the responder loop.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

/// A topic registered when the responder starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    /// Retention window in seconds.
    pub max_remaining_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponderConfig {
    /// Instance name used to prefix log lines.
    /// Default: "responder"
    #[serde(default = "default_responder_name")]
    pub name: String,

    /// `tcp://host:port` or `ipc:///path/to/socket`.
    pub endpoint: String,

    /// How long one poll waits before re-checking the shutdown flag.
    /// Default: 1000 ms
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

impl ResponderConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            name: default_responder_name(),
            endpoint: endpoint.into(),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            topics: Vec::new(),
        }
    }

    pub fn with_topic(mut self, name: impl Into<String>, max_remaining_time: f64) -> Self {
        self.topics.push(TopicConfig {
            name: name.into(),
            max_remaining_time,
        });
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequesterConfig {
    /// Default: "requester"
    #[serde(default = "default_requester_name")]
    pub name: String,

    pub endpoint: String,

    /// Upper bound on one request/reply exchange. `None` blocks indefinitely.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RequesterConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            name: default_requester_name(),
            endpoint: endpoint.into(),
            timeout_ms: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))
    }
}

fn default_responder_name() -> String {
    "responder".to_string()
}

fn default_requester_name() -> String {
    "requester".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

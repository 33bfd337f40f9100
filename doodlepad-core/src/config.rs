use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::error::{CoreResult, DoodlepadError};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ApiCfg {
    /// Base URL every route is appended to, e.g. `http://localhost:5000/api`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ApiCfg {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:5000/api".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total timeout for non-streaming requests in milliseconds (default 60000ms).
    /// Streaming requests are not bounded by it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct StreamCfg {
    /// Fail a session when no bytes arrive for this long. None disables it.
    #[serde(default)]
    pub stall_timeout_ms: Option<u64>,
}

impl StreamCfg {
    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiCfg,
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub stream: StreamCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(DoodlepadError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| DoodlepadError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| DoodlepadError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| DoodlepadError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| DoodlepadError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| DoodlepadError::Other(e.into()))
                })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> CoreResult<()> {
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://")) {
            return Err(DoodlepadError::Validation(format!(
                "api.base_url must be an http(s) url, got '{}'",
                self.api.base_url
            )));
        }
        if self.stream.stall_timeout_ms == Some(0) {
            return Err(DoodlepadError::Validation(
                "stream.stall_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

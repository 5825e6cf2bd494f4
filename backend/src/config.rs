//! Server settings read once from the environment at startup.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 6060;
/// Mount point of the profiling endpoints unless overridden.
pub const DEFAULT_PATH_PREFIX: &str = "/debug/jemalloc/";
/// Metric namespace unless overridden.
pub const DEFAULT_METRICS_NAMESPACE: &str = "heapctl";

/// Listener, routing and metrics settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Interface to listen on (`BIND_ADDR`).
    pub bind_addr: String,
    /// TCP port (`PORT`).
    pub port: u16,
    /// Route prefix, always starting and ending with `/` (`HEAPCTL_PATH_PREFIX`).
    pub path_prefix: String,
    /// Metric namespace (`HEAPCTL_METRICS_NAMESPACE`).
    pub metrics_namespace: String,
    /// Whether `/metrics` is mounted (`ENABLE_HEAPCTL_METRICS`).
    pub metrics_enabled: bool,
    /// Where dump temp files are created (`HEAPCTL_DUMP_DIR`).
    pub dump_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            port: DEFAULT_PORT,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            metrics_namespace: DEFAULT_METRICS_NAMESPACE.to_string(),
            metrics_enabled: true,
            dump_dir: env::temp_dir(),
        }
    }
}

impl ServerConfig {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable lookup. Unset or blank
    /// variables fall back to defaults; a malformed `PORT` is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let port = match read("PORT") {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("invalid PORT: {value}"))?,
            None => defaults.port,
        };
        let path_prefix = read("HEAPCTL_PATH_PREFIX")
            .map(|value| normalize_prefix(&value))
            .unwrap_or(defaults.path_prefix);
        // an explicitly empty namespace is allowed and drops the prefix
        let metrics_namespace = lookup("HEAPCTL_METRICS_NAMESPACE")
            .map(|value| value.trim().to_string())
            .unwrap_or(defaults.metrics_namespace);
        let metrics_enabled = read("ENABLE_HEAPCTL_METRICS")
            .map(|value| parse_bool(&value))
            .unwrap_or(defaults.metrics_enabled);

        Ok(Self {
            bind_addr: read("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port,
            path_prefix,
            metrics_namespace,
            metrics_enabled,
            dump_dir: read("HEAPCTL_DUMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.dump_dir),
        })
    }

    /// `host:port` to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Forces a leading and a trailing `/`, so `debug/mem` becomes `/debug/mem/`.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    format!("/{trimmed}/")
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

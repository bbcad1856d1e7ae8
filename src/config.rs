//! Tracer configuration.
//!
//! Loaded from TOML, with environment overrides:
//!
//! ```toml
//! enabled = true
//! debug = false
//! dynshape = false
//! ```
//!
//! - `GRAPHTRACE_ENABLED`: turn tracing on or off
//! - `GRAPHTRACE_DEBUG`: log guard clauses and output plans at commit
//! - `GRAPHTRACE_DYNSHAPE`: guard tensors by rank instead of exact shape

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Trace and consult the cache at all
    pub enabled: bool,
    /// Log generated guards and output plans
    pub debug: bool,
    /// Relax tensor guards to rank checks
    pub dynshape: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            dynshape: false,
        }
    }
}

impl TracerConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_dynshape(mut self, dynshape: bool) -> Self {
        self.dynshape = dynshape;
        self
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(ConfigError::Parse)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Apply `GRAPHTRACE_*` environment variables. Unparseable values are
    /// ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_flag("GRAPHTRACE_ENABLED") {
            self.enabled = v;
        }
        if let Some(v) = env_flag("GRAPHTRACE_DEBUG") {
            self.debug = v;
        }
        if let Some(v) = env_flag("GRAPHTRACE_DYNSHAPE") {
            self.dynshape = v;
        }
        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| parse_flag(&v))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read {}: {}", path.display(), source),
            Self::Parse(e) => write!(f, "invalid tracer config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(e) => Some(e),
        }
    }
}

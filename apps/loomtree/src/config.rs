//! # Configuration
//!
//! Settings are layered, later layers winning:
//!
//! 1. Built-in defaults
//! 2. `loomtree.toml` (or the file given with `--config`)
//! 3. `LOOMTREE_*` environment variables
//! 4. Command-line flags (applied by the CLI)
//!
//! ## Environment Variables
//!
//! - `LOOMTREE_DATABASE`, `LOOMTREE_BACKEND`
//! - `LOOMTREE_HOST`, `LOOMTREE_PORT`
//! - `LOOMTREE_API_KEY`: If set, requires Bearer token authentication
//! - `LOOMTREE_RATE_LIMIT`: Requests per second (0 disables)
//! - `LOOMTREE_CORS_ORIGINS`: Comma-separated origins, or "*" for all
//! - `LOOMTREE_AGENT_ID`, `LOOMTREE_MODEL_AGENT_ID`
//! - `LOOMTREE_PROVIDER`, `LOOMTREE_KEEP_RAW_BYTES`, `LOOMTREE_MAX_ATTEMPTS`

use loomtree_core::{AgentId, LoomError, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "loomtree.toml";

/// Default rate limit: 100 requests per second.
pub const DEFAULT_RATE_LIMIT: u32 = 100;

/// Default request body limit (8 MB). Raw provider responses travel in bodies.
pub const DEFAULT_BODY_LIMIT: usize = 8 * 1024 * 1024;

// =============================================================================
// RESOLVED CONFIGURATION
// =============================================================================

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// ACID redb database file.
    #[default]
    Redb,
    /// Volatile in-memory store, lost on exit.
    Memory,
}

impl FromStr for Backend {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            other => Err(LoomError::Validation(format!(
                "unknown backend '{}' (expected redb or memory)",
                other
            ))),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub rate_limit: u32,
    pub cors_origins: Option<String>,
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            api_key: None,
            rate_limit: DEFAULT_RATE_LIMIT,
            cors_origins: None,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

/// Generation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Name of the provider adapter.
    pub provider: String,
    /// Agent recorded as the author of generated nodes.
    pub model_agent_id: Option<AgentId>,
    /// Store full raw response bytes next to their hash.
    pub keep_raw_bytes: bool,
    pub retry: RetryPolicy,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "echo".to_string(),
            model_agent_id: None,
            keep_raw_bytes: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database: PathBuf,
    pub backend: Backend,
    /// Agent used by CLI commands that write on behalf of a human.
    pub agent_id: Option<AgentId>,
    pub server: ServerConfig,
    pub generation: GenerationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("loomtree.db"),
            backend: Backend::default(),
            agent_id: None,
            server: ServerConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl Config {
    /// The human agent for CLI writes, or a validation error naming the fix.
    pub fn require_agent(&self) -> Result<AgentId, LoomError> {
        self.agent_id.ok_or_else(|| {
            LoomError::Validation(
                "no agent id: pass --agent, set LOOMTREE_AGENT_ID or agent_id in loomtree.toml"
                    .to_string(),
            )
        })
    }

    /// The agent that authors generated nodes.
    pub fn require_model_agent(&self) -> Result<AgentId, LoomError> {
        self.generation.model_agent_id.ok_or_else(|| {
            LoomError::Validation(
                "no model agent id: set LOOMTREE_MODEL_AGENT_ID or generation.model_agent_id"
                    .to_string(),
            )
        })
    }
}

// =============================================================================
// FILE LAYER
// =============================================================================

/// One partially specified layer as read from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub database: Option<PathBuf>,
    pub backend: Option<Backend>,
    pub agent_id: Option<AgentId>,
    pub server: Option<ServerLayer>,
    pub generation: Option<GenerationLayer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerLayer {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub rate_limit: Option<u32>,
    pub cors_origins: Option<String>,
    pub body_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationLayer {
    pub provider: Option<String>,
    pub model_agent_id: Option<AgentId>,
    pub keep_raw_bytes: Option<bool>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl ConfigLayer {
    /// Write every field this layer sets onto `config`.
    pub fn apply(self, config: &mut Config) {
        if let Some(database) = self.database {
            config.database = database;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if self.agent_id.is_some() {
            config.agent_id = self.agent_id;
        }
        if let Some(server) = self.server {
            let target = &mut config.server;
            if let Some(host) = server.host {
                target.host = host;
            }
            if let Some(port) = server.port {
                target.port = port;
            }
            if server.api_key.is_some() {
                target.api_key = server.api_key;
            }
            if let Some(rate_limit) = server.rate_limit {
                target.rate_limit = rate_limit;
            }
            if server.cors_origins.is_some() {
                target.cors_origins = server.cors_origins;
            }
            if let Some(body_limit) = server.body_limit {
                target.body_limit = body_limit;
            }
        }
        if let Some(generation) = self.generation {
            let target = &mut config.generation;
            if let Some(provider) = generation.provider {
                target.provider = provider;
            }
            if generation.model_agent_id.is_some() {
                target.model_agent_id = generation.model_agent_id;
            }
            if let Some(keep) = generation.keep_raw_bytes {
                target.keep_raw_bytes = keep;
            }
            if let Some(max_attempts) = generation.max_attempts {
                target.retry.max_attempts = max_attempts;
            }
            if let Some(base) = generation.base_delay_ms {
                target.retry.base_delay_ms = base;
            }
            if let Some(max) = generation.max_delay_ms {
                target.retry.max_delay_ms = max;
            }
        }
    }
}

/// Parse a TOML layer.
pub fn parse_layer(contents: &str) -> Result<ConfigLayer, LoomError> {
    toml::from_str(contents).map_err(|e| LoomError::Validation(format!("config: {}", e)))
}

fn read_layer(path: &Path) -> Result<ConfigLayer, LoomError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| LoomError::IoError(format!("read {}: {}", path.display(), e)))?;
    let layer = parse_layer(&contents)?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(layer)
}

// =============================================================================
// ENVIRONMENT LAYER
// =============================================================================

fn parse_env<T: FromStr>(name: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = raw, "ignoring unparsable value");
            None
        }
    }
}

/// Apply `LOOMTREE_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides_with<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = var("LOOMTREE_DATABASE") {
        config.database = PathBuf::from(v);
    }
    if let Some(backend) = var("LOOMTREE_BACKEND").and_then(|v| parse_env("LOOMTREE_BACKEND", &v))
    {
        config.backend = backend;
    }
    if let Some(agent) = var("LOOMTREE_AGENT_ID").and_then(|v| parse_env("LOOMTREE_AGENT_ID", &v)) {
        config.agent_id = Some(agent);
    }
    if let Some(v) = var("LOOMTREE_HOST") {
        config.server.host = v;
    }
    if let Some(port) = var("LOOMTREE_PORT").and_then(|v| parse_env("LOOMTREE_PORT", &v)) {
        config.server.port = port;
    }
    if let Some(v) = var("LOOMTREE_API_KEY") {
        config.server.api_key = Some(v);
    }
    if let Some(rate) = var("LOOMTREE_RATE_LIMIT").and_then(|v| parse_env("LOOMTREE_RATE_LIMIT", &v))
    {
        config.server.rate_limit = rate;
    }
    if let Some(v) = var("LOOMTREE_CORS_ORIGINS") {
        config.server.cors_origins = Some(v);
    }
    if let Some(v) = var("LOOMTREE_PROVIDER") {
        config.generation.provider = v;
    }
    if let Some(agent) =
        var("LOOMTREE_MODEL_AGENT_ID").and_then(|v| parse_env("LOOMTREE_MODEL_AGENT_ID", &v))
    {
        config.generation.model_agent_id = Some(agent);
    }
    if let Some(keep) =
        var("LOOMTREE_KEEP_RAW_BYTES").and_then(|v| parse_env("LOOMTREE_KEEP_RAW_BYTES", &v))
    {
        config.generation.keep_raw_bytes = keep;
    }
    if let Some(attempts) =
        var("LOOMTREE_MAX_ATTEMPTS").and_then(|v| parse_env("LOOMTREE_MAX_ATTEMPTS", &v))
    {
        config.generation.retry.max_attempts = attempts;
    }
}

// =============================================================================
// LOADING
// =============================================================================

/// Load defaults, the config file and the environment.
///
/// An explicitly named file must exist; the default `loomtree.toml` is
/// optional.
pub fn load(explicit: Option<&Path>) -> Result<Config, LoomError> {
    let mut config = Config::default();

    match explicit {
        Some(path) => read_layer(path)?.apply(&mut config),
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            if path.exists() {
                read_layer(path)?.apply(&mut config);
            } else {
                tracing::debug!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
            }
        }
    }

    apply_env_overrides_with(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

// =============================================================================
// TESTS
// =============================================================================

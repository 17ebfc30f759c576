//! Configuration for the gateway.
//!
//! The gateway is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [backend]
//! url = "http://localhost:11434"
//!
//! [[auth.api_keys]]
//! name = "sim-fleet"
//! key = "${SIM_FLEET_KEY}"
//! refill_per_second = 5.0
//! ```

use std::{collections::HashMap, net::IpAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration. All sections are optional with defaults, so a minimal
/// deployment needs only `backend.url` and at least one API key (or the dev
/// key opt-in).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// When set, an unreachable backend or cache at startup is fatal
    /// (exit codes 69 and 74 respectively) instead of degraded readiness.
    #[serde(default)]
    pub strict_startup: bool,
}

impl GatewayConfig {
    /// Load configuration from a TOML file, expanding `${VAR}` references.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: GatewayConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.api_keys.is_empty() && !self.auth.allow_dev_key {
            return Err(ConfigError::Validation(
                "no API keys configured and auth.allow_dev_key is disabled; \
                 the gateway would reject every request"
                    .into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for entry in &self.auth.api_keys {
            if entry.key.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "api key '{}' has an empty key value",
                    entry.name
                )));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate api key name '{}'",
                    entry.name
                )));
            }
        }

        if self.limits.default_rate.capacity < 1.0 {
            return Err(ConfigError::Validation(
                "limits.default_rate.capacity must be at least 1".into(),
            ));
        }
        if self.limits.default_rate.refill_per_second <= 0.0 {
            return Err(ConfigError::Validation(
                "limits.default_rate.refill_per_second must be positive".into(),
            ));
        }

        if self.cache.negative_ttl_secs >= 60 {
            return Err(ConfigError::Validation(
                "cache.negative_ttl_secs must be under a minute".into(),
            ));
        }
        if self.cache.ttl_default_secs == 0 {
            return Err(ConfigError::Validation(
                "cache.ttl_default_secs must be positive".into(),
            ));
        }

        if self.backend.url.is_empty() {
            return Err(ConfigError::Validation("backend.url must be set".into()));
        }
        if self.backend.timeout_secs == 0 || self.backend.total_deadline_secs == 0 {
            return Err(ConfigError::Validation(
                "backend timeouts must be positive".into(),
            ));
        }
        if self.backend.total_deadline_secs < self.backend.timeout_secs {
            return Err(ConfigError::Validation(
                "backend.total_deadline_secs must not be below backend.timeout_secs".into(),
            ));
        }

        if self.batch.max_concurrency == 0 {
            return Err(ConfigError::Validation(
                "batch.max_concurrency must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request body size limit in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_port() -> u16 {
    8080
}

fn default_body_limit() -> usize {
    2 * 1024 * 1024
}

/// Admission configuration: the accepted API keys and their quota overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,

    /// Accept the built-in development key (`dev-key`). Never enable this
    /// outside local development; startup logs a warning when it is set.
    #[serde(default)]
    pub allow_dev_key: bool,
}

/// One accepted API key. `name` is the quota identity the rate limiter
/// buckets on; the optional fields override the default rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub capacity: Option<f64>,
    #[serde(default)]
    pub refill_per_second: Option<f64>,
}

/// Request-shaping limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Token-bucket parameters for keys without an override.
    #[serde(default)]
    pub default_rate: RateConfig,

    /// Hard ceiling on `max_tokens`.
    #[serde(default = "default_max_tokens_ceiling")]
    pub max_tokens_ceiling: u32,

    /// Hard ceiling on the user prompt, in characters.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,

    /// Ceiling on the profile `context` field, in characters.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,

    /// Ceiling on the fully assembled prompt, in characters. Longer persona
    /// sections are truncated; the user prompt never is.
    #[serde(default = "default_max_assembled_chars")]
    pub max_assembled_prompt_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_rate: RateConfig::default(),
            max_tokens_ceiling: default_max_tokens_ceiling(),
            max_prompt_chars: default_max_prompt_chars(),
            max_context_chars: default_max_context_chars(),
            max_assembled_prompt_chars: default_max_assembled_chars(),
        }
    }
}

fn default_max_tokens_ceiling() -> u32 {
    4096
}

fn default_max_prompt_chars() -> usize {
    32_768
}

fn default_max_context_chars() -> usize {
    2000
}

fn default_max_assembled_chars() -> usize {
    8000
}

/// Token-bucket parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateConfig {
    #[serde(default = "default_rate_capacity")]
    pub capacity: f64,
    #[serde(default = "default_rate_refill")]
    pub refill_per_second: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_per_second: default_rate_refill(),
        }
    }
}

fn default_rate_capacity() -> f64 {
    10.0
}

fn default_rate_refill() -> f64 {
    2.0
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Which store backs the cache.
    #[serde(default)]
    pub backend: CacheBackendConfig,

    /// Default TTL for successful responses, in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_default_secs: u64,

    /// TTL for negative entries (deterministic backend rejections). Must be
    /// under a minute.
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_secs: u64,

    /// Fingerprint schema version. Bump to invalidate every cache entry.
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendConfig::default(),
            ttl_default_secs: default_cache_ttl(),
            negative_ttl_secs: default_negative_ttl(),
            schema_version: default_schema_version(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_default_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_negative_ttl() -> u64 {
    30
}

fn default_schema_version() -> u8 {
    1
}

/// Cache store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheBackendConfig {
    /// In-process cache. Single-replica deployments only: entries and
    /// invalidations are not shared across gateway processes.
    Memory {
        #[serde(default = "default_memory_max_entries")]
        max_entries: usize,
        #[serde(default = "default_eviction_batch")]
        eviction_batch_size: usize,
    },
    /// Shared Redis store for multi-replica deployments.
    Redis { url: String },
}

impl Default for CacheBackendConfig {
    fn default() -> Self {
        Self::Memory {
            max_entries: default_memory_max_entries(),
            eviction_batch_size: default_eviction_batch(),
        }
    }
}

fn default_memory_max_entries() -> usize {
    10_000
}

fn default_eviction_batch() -> usize {
    100
}

/// Text-generation backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Base URL of the model host, e.g. `http://localhost:11434`.
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Per-attempt timeout in seconds.
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries on transient failures (attempts = retries + 1).
    #[serde(default = "default_backend_retries")]
    pub max_retries: u32,

    /// Wall-clock budget across all attempts, in seconds.
    #[serde(default = "default_backend_deadline")]
    pub total_deadline_secs: u64,

    /// Retry backoff tuning.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            timeout_secs: default_backend_timeout(),
            max_retries: default_backend_retries(),
            total_deadline_secs: default_backend_deadline(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_backend_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_backend_retries() -> u32 {
    3
}

fn default_backend_deadline() -> u64 {
    90
}

/// Exponential backoff parameters for backend retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Cap on a single backoff sleep.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Fractional jitter applied to each delay, in [0, 1].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after `attempt` (0-based), jittered and capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let jittered = if self.jitter > 0.0 {
            use rand::Rng;
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

/// Batch coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// In-flight pipeline cap shared by every element of a batch.
    #[serde(default = "default_batch_concurrency")]
    pub max_concurrency: usize,

    /// Maximum elements per batch request.
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,

    /// Optional whole-batch deadline in seconds. Element deadlines take the
    /// minimum of this and the per-request deadline.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_batch_concurrency(),
            max_size: default_batch_max_size(),
            deadline_secs: None,
        }
    }
}

fn default_batch_concurrency() -> usize {
    10
}

fn default_batch_max_size() -> usize {
    64
}

/// Model router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// How often the model snapshot is refreshed from the backend.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Logical-name → backend-name alias table, consulted after exact and
    /// suffix-stripped matching.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            aliases: HashMap::new(),
        }
    }
}

fn default_refresh_interval() -> u64 {
    30
}

/// Logging and metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is unset, e.g. `info` or
    /// `agentgate=debug,info`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// When set, `/metrics` is served from a dedicated listener at this
    /// address instead of the main one.
    #[serde(default)]
    pub metrics_bind_address: Option<std::net::SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_bind_address: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand `${VAR_NAME}` references from the environment. References inside
/// TOML comments are left untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let whole = cap.get(0).expect("capture 0 always present");
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);
            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);
            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    Ok(result)
}

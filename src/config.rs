//! Typed configuration for the voice-session core.
//!
//! Every field maps to a recognized key in spec.md §6. Values are loaded
//! from environment variables via [`CoreConfig::from_env`]; malformed values
//! are warned and the default is kept rather than silently producing an
//! unvalidated config (typos must not be silent — spec.md §9).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Top-level configuration for the voice-session core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Failover backend selection policy.
    pub backend_mode: BackendMode,
    /// Failover health-detector and switch behavior.
    pub failover: FailoverConfig,
    /// Bandit confidence/blacklist thresholds and persistence path.
    pub bandit: BanditConfig,
    /// Deploy gate traffic split and persistence path.
    pub deploy: DeployConfig,
    /// Gateway transport limits.
    pub gateway: GatewayConfig,
    /// Recorder retention policy.
    pub recorder: RecorderConfig,
    /// Feedback store ledger location.
    pub feedback: FeedbackConfig,
    /// Reward calculator coefficients.
    pub reward: RewardWeights,
    /// Hard gate on provider (external) backend use.
    pub allow_external_backend: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            backend_mode: BackendMode::default(),
            failover: FailoverConfig::default(),
            bandit: BanditConfig::default(),
            deploy: DeployConfig::default(),
            gateway: GatewayConfig::default(),
            recorder: RecorderConfig::default(),
            feedback: FeedbackConfig::default(),
            reward: RewardWeights::default(),
            allow_external_backend: false,
        }
    }
}

impl CoreConfig {
    /// Load configuration from the process environment, falling back to
    /// spec-table defaults for anything unset or malformed.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.backend_mode = env_parsed_or("BACKEND_MODE", cfg.backend_mode);
        cfg.failover.trigger_ms = env_parsed_or("FALLBACK_TRIGGER_MS", cfg.failover.trigger_ms);
        cfg.failover.error_burst = env_parsed_or("FALLBACK_ERROR_BURST", cfg.failover.error_burst);
        cfg.failover.error_window_secs =
            env_parsed_or("FALLBACK_ERROR_WINDOW_S", cfg.failover.error_window_secs);

        if let Some(path) = std::env::var_os("BANDIT_STATE_PATH") {
            cfg.bandit.state_path = PathBuf::from(path);
        }
        if let Some(path) = std::env::var_os("DEPLOY_STATE_PATH") {
            cfg.deploy.state_path = PathBuf::from(path);
        }

        cfg.deploy.traffic_split_new =
            env_parsed_or("TRAFFIC_SPLIT_NEW", cfg.deploy.traffic_split_new);
        cfg.deploy.traffic_split_uncertain = env_parsed_or(
            "TRAFFIC_SPLIT_UNCERTAIN",
            cfg.deploy.traffic_split_uncertain,
        );

        cfg.bandit.blacklist_min_samples =
            env_parsed_or("BLACKLIST_MIN_SAMPLES", cfg.bandit.blacklist_min_samples);
        cfg.bandit.blacklist_min_reward =
            env_parsed_or("BLACKLIST_MIN_REWARD", cfg.bandit.blacklist_min_reward);

        cfg.gateway.rate_limit_msgs_per_sec = env_parsed_or(
            "RATE_LIMIT_MSGS_PER_SEC",
            cfg.gateway.rate_limit_msgs_per_sec,
        );
        cfg.gateway.max_frame_bytes = env_parsed_or("MAX_FRAME_BYTES", cfg.gateway.max_frame_bytes);
        if let Ok(secret) = std::env::var("GATEWAY_AUTH_SECRET") {
            cfg.gateway.auth_secret = secret;
        }

        cfg.recorder.enabled = env_parsed_or("RECORD_AUDIO", cfg.recorder.enabled);
        cfg.recorder.retention_hours =
            env_parsed_or("RECORD_RETENTION_HOURS", cfg.recorder.retention_hours);
        if let Some(dir) = std::env::var_os("RECORD_DIR") {
            cfg.recorder.dir = PathBuf::from(dir);
        }
        if let Some(path) = std::env::var_os("FEEDBACK_STORE_PATH") {
            cfg.feedback.state_path = PathBuf::from(path);
        }

        cfg.allow_external_backend =
            env_parsed_or("ALLOW_EXTERNAL_BACKEND", cfg.allow_external_backend);

        cfg
    }

    /// Validate range invariants. Called once at startup before any
    /// component is constructed.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::CoreError::Validation`] describing the
    /// first invariant that fails.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CoreError;

        let unit_interval = |name: &str, v: f64| -> crate::error::Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(CoreError::Validation(format!(
                    "{name} must be within [0, 1], got {v}"
                )));
            }
            Ok(())
        };
        unit_interval("deploy.traffic_split_new", self.deploy.traffic_split_new)?;
        unit_interval(
            "deploy.traffic_split_uncertain",
            self.deploy.traffic_split_uncertain,
        )?;
        if self.deploy.traffic_split_new + self.deploy.traffic_split_uncertain > 1.0 {
            return Err(CoreError::Validation(
                "deploy.traffic_split_new + traffic_split_uncertain must not exceed 1.0"
                    .to_owned(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.bandit.blacklist_min_reward) {
            return Err(CoreError::Validation(
                "bandit.blacklist_min_reward must be within [-1, 1]".to_owned(),
            ));
        }
        if self.gateway.max_frame_bytes == 0 {
            return Err(CoreError::Validation(
                "gateway.max_frame_bytes must be positive".to_owned(),
            ));
        }
        if self.gateway.rate_limit_msgs_per_sec == 0 {
            return Err(CoreError::Validation(
                "gateway.rate_limit_msgs_per_sec must be positive".to_owned(),
            ));
        }
        if self.failover.error_window_secs == 0 {
            return Err(CoreError::Validation(
                "failover.error_window_secs must be positive".to_owned(),
            ));
        }
        if self.gateway.auth_secret.is_empty() {
            tracing::warn!(
                "gateway.auth_secret is empty; bearer token signatures cannot be verified"
            );
        }
        Ok(())
    }
}

/// Parse `key` from the environment; on missing or malformed value fall
/// back to `default` (warning on malformed, matching spec.md §9's
/// "typos must not be silent").
fn env_parsed_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("ignoring malformed {key}={raw:?}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Failover policy values (spec.md §4.8).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    ProviderOnly,
    LocalOnly,
    #[default]
    ProviderThenLocal,
    LocalThenProvider,
}

impl FromStr for BackendMode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "provider_only" => Ok(Self::ProviderOnly),
            "local_only" => Ok(Self::LocalOnly),
            "provider_then_local" => Ok(Self::ProviderThenLocal),
            "local_then_provider" => Ok(Self::LocalThenProvider),
            _ => Err(()),
        }
    }
}

/// Failover health-detector configuration (spec.md §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// p95 end-to-end latency trigger, in milliseconds.
    pub trigger_ms: u64,
    /// Consecutive/rolling error count trigger.
    pub error_burst: u32,
    /// Rolling error-count window, in seconds.
    pub error_window_secs: u64,
    /// How long latency must stay above `trigger_ms` before tripping.
    pub sustained_secs: u64,
    /// Cooldown after a switch during which re-switching is inhibited.
    pub cooldown_secs: u64,
    /// Maximum handover window while both sessions briefly overlap.
    pub handover_window_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            trigger_ms: 800,
            error_burst: 3,
            error_window_secs: 60,
            sustained_secs: 120,
            cooldown_secs: 600,
            handover_window_ms: 200,
        }
    }
}

/// Bandit thresholds and persistence path (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    /// Path to the atomically-persisted bandit state file.
    pub state_path: PathBuf,
    /// Pulls below which a variant is considered `uncertain`.
    pub min_pulls_for_confidence: u32,
    /// Minimum pulls before a variant is eligible for blacklisting.
    pub blacklist_min_samples: u32,
    /// Empirical mean reward at/below which a variant is flagged for blacklisting.
    pub blacklist_min_reward: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("bandit_state.json"),
            min_pulls_for_confidence: 10,
            blacklist_min_samples: 20,
            blacklist_min_reward: -0.2,
        }
    }
}

/// Deploy gate traffic split and persistence path (spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Path to the atomically-persisted deploy state file.
    pub state_path: PathBuf,
    /// Probability of routing to a `new` variant.
    pub traffic_split_new: f64,
    /// Probability of routing to an `uncertain` variant.
    pub traffic_split_uncertain: f64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("deploy_state.json"),
            traffic_split_new: 0.10,
            traffic_split_uncertain: 0.05,
        }
    }
}

/// Gateway transport limits (spec.md §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Token-bucket rate limit, messages per second per connection.
    pub rate_limit_msgs_per_sec: u32,
    /// Maximum inbound frame size in bytes.
    pub max_frame_bytes: usize,
    /// Allowed CORS origins (empty = deny all).
    pub allowed_origins: Vec<String>,
    /// Shared HMAC secret used to verify bearer token signatures
    /// (spec.md §6 "Authentication"; not itself a named spec key, carried
    /// as the symmetric-signature secret the spec leaves unspecified).
    pub auth_secret: String,
    /// Nonce TTL ceiling; actual TTL is the token's own remaining lifetime,
    /// capped by this value (spec.md §4.10 "Nonce MUST be one-shot").
    pub nonce_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 7088,
            rate_limit_msgs_per_sec: 120,
            max_frame_bytes: 65_536,
            allowed_origins: Vec::new(),
            auth_secret: String::new(),
            nonce_ttl_secs: 3600,
        }
    }
}

/// Recorder retention policy (spec.md §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Whether the recorder is enabled at all.
    pub enabled: bool,
    /// Directory PCM capture files are written under.
    pub dir: PathBuf,
    /// Janitor retention window, in hours.
    pub retention_hours: u64,
    /// Per-call size cap in bytes. See DESIGN.md for the rationale (50 MiB).
    pub max_bytes_per_call: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("recordings"),
            retention_hours: 24,
            max_bytes_per_call: 50 * 1024 * 1024,
        }
    }
}

/// Feedback Store ledger location (spec.md §4.2). Not itself a named
/// spec-table key; carried the same way `RECORD_DIR` supplements the
/// Recorder's table entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Path to the append-only JSONL feedback ledger.
    pub state_path: PathBuf,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("feedback.jsonl"),
        }
    }
}

/// Reward calculator coefficients (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    pub resolution: f64,
    pub rating: f64,
    pub barge_in: f64,
    pub repeats: f64,
    pub handover: f64,
    /// Center of the linear duration bonus, in seconds.
    pub duration_bonus_center_sec: f64,
    /// Clip bounds applied to the duration bonus term before summation.
    pub duration_bonus_clip: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            resolution: 0.6,
            rating: 0.2,
            barge_in: 0.1,
            repeats: 0.1,
            handover: 0.1,
            duration_bonus_center_sec: 180.0,
            duration_bonus_clip: 0.2,
        }
    }
}

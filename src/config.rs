//! Client configuration
//!
//! Default timeouts and retry parameters for the inverter link, with
//! environment variable overrides recognized at construction time.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

// ============================================================================
// Default configuration constants
// ============================================================================

/// Default TCP connect timeout in milliseconds
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5000;

/// Default receive timeout for an outstanding request in milliseconds
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 3000;

/// Default maximum attempts per job
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default initial retry backoff in milliseconds
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default backoff multiplier applied after each failed attempt
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Backoff delay cap in milliseconds
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Default idle period after which a connection closes itself, in milliseconds
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 90_000;

/// Default response cache time-to-live in milliseconds
pub const DEFAULT_CACHE_TTL_MS: u64 = 10_000;

/// Default response cache capacity (entries)
pub const DEFAULT_CACHE_MAX: usize = 128;

// ============================================================================
// Environment variable names
// ============================================================================

/// Environment variable for the TCP connect timeout (ms)
pub const ENV_DIAL_TIMEOUT: &str = "DIAL_TIMEOUT";

/// Environment variable for the maximum attempts per job
pub const ENV_MAX_RETRIES: &str = "MAX_RETRIES";

/// Environment variable for the initial retry backoff (ms)
pub const ENV_INITIAL_BACKOFF: &str = "INITIAL_BACKOFF";

/// Environment variable for the backoff multiplier
pub const ENV_BACKOFF_MULTIPLIER: &str = "BACKOFF_MULTIPLIER";

/// Per-connection link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// TCP connect timeout (milliseconds)
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Receive timeout for an outstanding request (milliseconds)
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Maximum attempts per job
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial retry backoff (milliseconds)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff multiplier applied after each failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Idle period after which the connection closes itself (milliseconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT_MS
}

fn default_receive_timeout_ms() -> u64 {
    DEFAULT_RECEIVE_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl LinkConfig {
    /// Build a configuration from defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_override::<u64>(ENV_DIAL_TIMEOUT) {
            config.dial_timeout_ms = v;
        }
        if let Some(v) = env_override::<u32>(ENV_MAX_RETRIES) {
            config.max_retries = v;
        }
        if let Some(v) = env_override::<u64>(ENV_INITIAL_BACKOFF) {
            config.initial_backoff_ms = v;
        }
        if let Some(v) = env_override::<f64>(ENV_BACKOFF_MULTIPLIER) {
            config.backoff_multiplier = v;
        }
        config
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Read an environment override, ignoring unset or unparseable values.
fn env_override<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", name, raw);
            None
        },
    }
}

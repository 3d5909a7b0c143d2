//! Endpoint configuration, loadable from a TOML file with defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Default per-call timeout (milliseconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default time a transient handler may go unused before eviction (seconds).
pub const DEFAULT_TRANSIENT_TTL_SECS: u64 = 30;

/// Name prefix marking transient handler registrations.
pub const DEFAULT_TRANSIENT_PREFIX: &str = "temp_fn_";

/// Maximum single frame size on stream transports (16 MB).
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Settings for one side of a Tether channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Timeout applied to calls that do not set their own.
    pub default_timeout_ms: u64,
    /// Unused transient handlers older than this are evicted.
    pub transient_ttl_secs: u64,
    /// How often the sweeper looks for stale transient handlers.
    pub sweep_interval_secs: u64,
    /// Prefix for generated transient handler names.
    pub transient_prefix: String,
    /// Largest frame a stream transport will accept.
    pub max_frame_bytes: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            transient_ttl_secs: DEFAULT_TRANSIENT_TTL_SECS,
            sweep_interval_secs: DEFAULT_TRANSIENT_TTL_SECS,
            transient_prefix: DEFAULT_TRANSIENT_PREFIX.to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl EndpointConfig {
    /// Timeout for calls that do not set their own.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// How long an unused transient handler survives.
    pub fn transient_ttl(&self) -> Duration {
        Duration::from_secs(self.transient_ttl_secs)
    }

    /// Sweep period; never zero so the sweeper cannot spin.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Load endpoint configuration from a TOML file.
///
/// A missing, unreadable or malformed file logs the problem and yields
/// [`EndpointConfig::default`]; fields absent from the file keep their defaults.
pub fn load_config(path: &Path) -> EndpointConfig {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return EndpointConfig::default();
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %path.display(),
                "Failed to read config file, using defaults"
            );
            return EndpointConfig::default();
        }
    };

    match toml::from_str::<EndpointConfig>(&contents) {
        Ok(config) => {
            info!(path = %path.display(), "Loaded endpoint configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %path.display(),
                "Failed to parse config, using defaults"
            );
            EndpointConfig::default()
        }
    }
}

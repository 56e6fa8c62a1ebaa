use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::activity::ActivityConfig;
use crate::replay::{BufferLimits, DEFAULT_MAX_BYTES, DEFAULT_MAX_ENTRIES};

// =============================================================================
// File config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   relay.toml:      [buffer]
//                    max_entries = 500
//
//   env var:         AGENT_RELAY_BUFFER__MAX_ENTRIES=500   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub buffer: BufferFileConfig,
    #[serde(default)]
    pub activity: ActivityFileConfig,
    #[serde(default)]
    pub subscriber: SubscriberFileConfig,
}

/// Listener settings (lives under `[server]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Replay buffer caps (lives under `[buffer]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferFileConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for BufferFileConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
        }
    }
}

/// Activity smoothing timings in milliseconds (lives under `[activity]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityFileConfig {
    #[serde(default = "default_thinking_delay_ms")]
    pub thinking_delay_ms: u64,
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_progress_min_elapsed_ms")]
    pub progress_min_elapsed_ms: u64,
    #[serde(default = "default_description_after_ms")]
    pub description_after_ms: u64,
    #[serde(default = "default_elapsed_after_ms")]
    pub elapsed_after_ms: u64,
}

impl Default for ActivityFileConfig {
    fn default() -> Self {
        Self {
            thinking_delay_ms: default_thinking_delay_ms(),
            throttle_ms: default_throttle_ms(),
            progress_min_elapsed_ms: default_progress_min_elapsed_ms(),
            description_after_ms: default_description_after_ms(),
            elapsed_after_ms: default_elapsed_after_ms(),
        }
    }
}

/// Per-connection queue sizing (lives under `[subscriber]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriberFileConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for SubscriberFileConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7878
}
fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}
fn default_max_bytes() -> usize {
    DEFAULT_MAX_BYTES
}
fn default_thinking_delay_ms() -> u64 {
    1000
}
fn default_throttle_ms() -> u64 {
    500
}
fn default_progress_min_elapsed_ms() -> u64 {
    5000
}
fn default_description_after_ms() -> u64 {
    3000
}
fn default_elapsed_after_ms() -> u64 {
    5000
}
fn default_channel_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → relay.toml → AGENT_RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `AGENT_RELAY_SERVER__PORT=9000`  →  `server.port = 9000`
///   `AGENT_RELAY_ACTIVITY__THROTTLE_MS=250`  →  `activity.throttle_ms = 250`
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(RelayFileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("AGENT_RELAY_").split("__"))
}

/// Load and extract the file config in one step.
pub fn load_file_config(path: &Path) -> Result<RelayFileConfig> {
    load_config(path)
        .extract()
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

// =============================================================================
// Runtime config (derived from RelayFileConfig, used throughout the server)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub buffer: BufferLimits,
    pub activity: ActivityConfig,
    /// Outbound queue size for each connected client
    pub channel_capacity: usize,
}

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Self {
        Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            buffer: BufferLimits {
                max_entries: fc.buffer.max_entries,
                max_bytes: fc.buffer.max_bytes,
            },
            activity: ActivityConfig {
                thinking_delay: Duration::from_millis(fc.activity.thinking_delay_ms),
                throttle_window: Duration::from_millis(fc.activity.throttle_ms),
                progress_min_elapsed: Duration::from_millis(fc.activity.progress_min_elapsed_ms),
                description_after: Duration::from_millis(fc.activity.description_after_ms),
                elapsed_after: Duration::from_millis(fc.activity.elapsed_after_ms),
            },
            channel_capacity: fc.subscriber.channel_capacity.max(1),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(&RelayFileConfig::default())
    }
}

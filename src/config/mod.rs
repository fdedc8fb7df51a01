//! Orchestrator configuration: one sub-struct per concern, all fields
//! defaulted so a host can embed `Config::default()` or deserialize a
//! partial TOML table.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub bulk: BulkConfig,
}

impl Config {
    /// Parse a TOML fragment. Missing tables and fields fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid orchestrator config")
    }
}

// ── Per-session limits ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Cap on concurrently open transports per session. Guards against
    /// duplicate pairing; decremented on every close.
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: u32,
    /// Validity window for a pairing QR code, in seconds.
    #[serde(default = "default_qr_ttl_secs")]
    pub qr_ttl_secs: u64,
}

fn default_max_concurrent_connections() -> u32 {
    5
}

fn default_qr_ttl_secs() -> u64 {
    300
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: default_max_concurrent_connections(),
            qr_ttl_secs: default_qr_ttl_secs(),
        }
    }
}

// ── Reconnection policy ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Progressive backoff table (seconds) between unplanned-close
    /// reconnection attempts. The last entry repeats once exhausted.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    /// How long `connect` waits for the transport's first decisive event
    /// before returning with the record still `connecting`.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_backoff_secs() -> Vec<u64> {
    vec![3, 10, 30, 60, 120]
}

fn default_connect_timeout_secs() -> u64 {
    60
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_secs: default_backoff_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the `attempt`-th consecutive reconnection (0-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> std::time::Duration {
        let secs = self
            .backoff_secs
            .get(attempt)
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(default_connect_timeout_secs());
        std::time::Duration::from_secs(secs)
    }
}

// ── Health monitor ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Sweep cadence in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// A `connected` session idle longer than this is marked `inactive`.
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    45
}

fn default_inactivity_threshold_secs() -> u64 {
    1800
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
        }
    }
}

// ── Bulk dispatch ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Items sent concurrently within one batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between batches, skipped after the last one.
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
}

fn default_batch_size() -> usize {
    3
}

fn default_inter_batch_delay_ms() -> u64 {
    1000
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
        }
    }
}

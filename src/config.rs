// Shim Configuration
//
// Tunables for the bridge and the reference surface. Every field has a
// default, so an empty JSON object is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    /// How long to wait for a navigation to finish. `None` waits forever.
    #[serde(alias = "navigationTimeoutMs")]
    pub navigation_timeout_ms: Option<u64>,
    /// How long to wait for an awaited page script to settle
    #[serde(alias = "scriptTimeoutMs")]
    pub script_timeout_ms: Option<u64>,
    /// Forward page `console.*` output to the log
    #[serde(alias = "forwardConsole")]
    pub forward_console: bool,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            navigation_timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            script_timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            forward_console: true,
        }
    }
}

impl ShimConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse shim config")
    }

    pub fn navigation_timeout(&self) -> Option<Duration> {
        self.navigation_timeout_ms.map(Duration::from_millis)
    }

    pub fn script_timeout(&self) -> Option<Duration> {
        self.script_timeout_ms.map(Duration::from_millis)
    }
}

//! Configuration loading and persistence.
//!
//! Reads `config.json` from the config directory, then applies `SIM_*`
//! environment overrides. Command-line flags are applied on top by the
//! binary. The shared secret is never part of the configuration; it comes
//! from `SIM_PIN` only.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants;

/// Configuration for the relay daemon.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the relay functions (push dispatch and reply store).
    pub relay_url: String,
    /// Push registration tokens of the approving devices.
    pub devices: Vec<String>,
    /// Directory where requesters create their endpoints.
    pub sock_dir: PathBuf,
    /// Seconds between reply store polls.
    pub poll_interval_secs: u64,
    /// Seconds a session polls before giving up.
    pub session_deadline_secs: u64,
    /// Milliseconds to wait after a creation event before connecting.
    pub debounce_millis: u64,
    /// Maximum number of concurrently running sessions.
    pub max_sessions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: constants::DEFAULT_RELAY_URL.to_string(),
            devices: Vec::new(),
            sock_dir: PathBuf::from(constants::DEFAULT_SOCK_DIR),
            poll_interval_secs: constants::DEFAULT_POLL_INTERVAL.as_secs(),
            session_deadline_secs: constants::DEFAULT_SESSION_DEADLINE.as_secs(),
            debounce_millis: constants::DEFAULT_DEBOUNCE.as_millis() as u64,
            max_sessions: constants::DEFAULT_MAX_SESSIONS,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `SIM_CONFIG_DIR` env var: explicit override
    /// 2. `SIM_ENV=test`: `tmp/sim-relay-test` under the crate root
    /// 3. Default: platform config dir + `sim-relay`
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("SIM_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if crate::env::is_test_mode() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/sim-relay-test")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("sim-relay")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the default config directory, with
    /// environment variable overrides.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(&Self::config_dir()?)
    }

    /// Loads `config.json` from `dir` (defaults if absent), then applies
    /// environment overrides.
    pub fn load_from_dir(dir: &std::path::Path) -> Result<Self> {
        let config_path = dir.join("config.json");
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(relay_url) = std::env::var("SIM_RELAY_URL") {
            self.relay_url = relay_url;
        }

        if let Ok(devices) = std::env::var("SIM_DEVICES") {
            self.devices = parse_devices(&devices);
        }

        if let Ok(sock_dir) = std::env::var("SIM_SOCK_DIR") {
            self.sock_dir = PathBuf::from(sock_dir);
        }

        if let Ok(interval) = std::env::var("SIM_POLL_INTERVAL") {
            if let Ok(interval) = interval.parse::<u64>() {
                self.poll_interval_secs = interval;
            }
        }

        if let Ok(deadline) = std::env::var("SIM_SESSION_DEADLINE") {
            if let Ok(deadline) = deadline.parse::<u64>() {
                self.session_deadline_secs = deadline;
            }
        }

        if let Ok(max_sessions) = std::env::var("SIM_MAX_SESSIONS") {
            if let Ok(max) = max_sessions.parse::<usize>() {
                self.max_sessions = max;
            }
        }
    }

    /// Persists the configuration to `dir/config.json` (mode 0600).
    pub fn save_to_dir(&self, dir: &std::path::Path) -> Result<()> {
        let config_path = dir.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Check the settings the daemon needs before it starts.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            anyhow::bail!("Need at least one device token (--devices or SIM_DEVICES)");
        }
        if self.relay_url.is_empty() {
            anyhow::bail!("Relay URL is empty");
        }
        if self.poll_interval_secs == 0 || self.session_deadline_secs == 0 {
            anyhow::bail!("Poll interval and session deadline must be non-zero");
        }
        if self.poll_interval_secs > self.session_deadline_secs {
            anyhow::bail!(
                "Poll interval ({}s) is longer than the session deadline ({}s)",
                self.poll_interval_secs,
                self.session_deadline_secs
            );
        }
        if self.max_sessions == 0 {
            anyhow::bail!("max_sessions must be at least 1");
        }
        Ok(())
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Session deadline as a [`Duration`].
    pub fn session_deadline(&self) -> Duration {
        Duration::from_secs(self.session_deadline_secs)
    }

    /// Debounce delay as a [`Duration`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }
}

/// Split a comma-separated token list, dropping blanks.
pub fn parse_devices(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

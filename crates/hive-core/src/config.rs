//! Daemon configuration.
//!
//! All knobs come from the environment with sane defaults; there is no
//! config file. Durations are stored resolved so callers never re-parse.

use crate::types::FeaturePhase;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("no home directory available")]
    NoHome,
}

/// Daemon and worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite store.
    pub db_path: PathBuf,
    /// Root directory for isolated checkouts.
    pub workspace_root: PathBuf,
    /// Directory for per-session log files.
    pub log_dir: PathBuf,
    /// Sessions unseen for this long (and with a dead pid) are swept.
    pub stale_ttl: Duration,
    /// Keep-alive heartbeat period for workers.
    pub heartbeat_interval: Duration,
    /// Default timeout for each VCS host call.
    pub vcs_timeout: Duration,
    /// Absolute ceiling on rework cycles, regardless of overrides.
    pub max_rework_cycles_hard: u32,
    /// Default rework-cycle budget when neither project nor item overrides.
    pub default_max_rework_cycles: u32,
    /// Phase timeout in minutes for most SpecFlow phases.
    pub phase_timeout_min_default: u32,
    /// Phase timeout in minutes for the implementing phase.
    pub phase_timeout_min_implementing: u32,
    /// Agent name of the orchestrator itself; excluded from dispatcher
    /// concurrency counts.
    pub orchestrator_agent_name: String,
    /// Coding-agent binary invoked by the launcher.
    pub agent_bin: PathBuf,
    /// Tana Input API token; write-back is disabled when unset.
    pub tana_api_token: Option<String>,
    /// Minimum rubric score for quality gates (0-10 scale).
    pub quality_threshold: f64,
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).map(PathBuf::from)
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidInt {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("hive"))
        .unwrap_or_else(|| PathBuf::from(".hive"))
}

impl Default for Config {
    fn default() -> Self {
        let data = data_dir();
        let workspace_root = dirs::home_dir()
            .map(|h| h.join(".pai").join("worktrees"))
            .unwrap_or_else(|| PathBuf::from(".pai/worktrees"));
        Self {
            db_path: data.join("hive.db"),
            workspace_root,
            log_dir: data.join("logs"),
            stale_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            vcs_timeout: Duration::from_millis(30_000),
            max_rework_cycles_hard: 3,
            default_max_rework_cycles: 2,
            phase_timeout_min_default: 20,
            phase_timeout_min_implementing: 180,
            orchestrator_agent_name: "ivy-heartbeat".to_string(),
            agent_bin: PathBuf::from("claude"),
            tana_api_token: None,
            quality_threshold: 7.0,
        }
    }
}

impl Config {
    /// Build the configuration from the environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = env_path("HIVE_DB_PATH") {
            config.db_path = path;
        }
        if let Some(path) = env_path("WORKSPACE_ROOT") {
            config.workspace_root = path;
        }
        if let Some(path) = env_path("HIVE_LOG_DIR") {
            config.log_dir = path;
        }
        if let Some(secs) = env_u64("STALE_TTL_SECONDS")? {
            config.stale_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("HEARTBEAT_INTERVAL_SECONDS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("VCS_API_TIMEOUT_MS")? {
            config.vcs_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("MAX_REWORK_CYCLES_HARD")? {
            config.max_rework_cycles_hard = n as u32;
        }
        if let Some(n) = env_u64("DEFAULT_MAX_REWORK_CYCLES")? {
            config.default_max_rework_cycles = n as u32;
        }
        if let Some(n) = env_u64("PHASE_TIMEOUT_MIN_DEFAULT")? {
            config.phase_timeout_min_default = n as u32;
        }
        if let Some(n) = env_u64("PHASE_TIMEOUT_MIN_IMPLEMENTING")? {
            config.phase_timeout_min_implementing = n as u32;
        }
        if let Ok(name) = std::env::var("HIVE_ORCHESTRATOR_NAME") {
            if !name.is_empty() {
                config.orchestrator_agent_name = name;
            }
        }
        if let Some(bin) = env_path("HIVE_AGENT_BIN") {
            config.agent_bin = bin;
        }
        if let Ok(token) = std::env::var("TANA_API_TOKEN") {
            if !token.is_empty() {
                config.tana_api_token = Some(token);
            }
        }

        Ok(config)
    }

    /// Timeout in minutes for a SpecFlow phase. Implementation runs get a
    /// much longer budget than the planning-family phases.
    pub fn phase_timeout_min(&self, phase: FeaturePhase) -> u32 {
        match phase {
            FeaturePhase::Implementing => self.phase_timeout_min_implementing,
            _ => self.phase_timeout_min_default,
        }
    }

    /// Log file path for a session.
    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.log_dir.join(format!("{session_id}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.stale_ttl, Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.vcs_timeout, Duration::from_millis(30_000));
        assert_eq!(config.max_rework_cycles_hard, 3);
        assert_eq!(config.default_max_rework_cycles, 2);
        assert_eq!(config.orchestrator_agent_name, "ivy-heartbeat");
        assert!(config
            .workspace_root
            .to_string_lossy()
            .contains(".pai/worktrees"));
    }

    #[test]
    fn phase_timeouts_distinguish_implementing() {
        let config = Config::default();
        assert_eq!(config.phase_timeout_min(FeaturePhase::Implementing), 180);
        assert_eq!(config.phase_timeout_min(FeaturePhase::Specifying), 20);
        assert_eq!(config.phase_timeout_min(FeaturePhase::Completing), 20);
    }

    #[test]
    fn session_log_path_uses_session_id() {
        let config = Config::default();
        let path = config.session_log_path("abc-123");
        assert!(path.to_string_lossy().ends_with("abc-123.log"));
    }
}

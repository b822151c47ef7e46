use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Relative location of the mirror database when no path is configured.
pub const DEFAULT_DB_FILE: &str = ".buildmirror/mirror.sqlite3";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Queued/running builds this far below the newest one are reloaded
    /// directly instead of searched for in history pages.
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: u32,
    #[serde(default = "default_proactive_lanes")]
    pub proactive_lanes: usize,
    #[serde(default = "default_lane_delay_secs")]
    pub lane_delay_secs: u64,
    #[serde(default = "default_actualize_delay_secs")]
    pub actualize_delay_secs: u64,
    #[serde(default = "default_resync_after_secs")]
    pub resync_after_secs: u64,
    #[serde(default = "default_full_reindex_delay_secs")]
    pub full_reindex_delay_secs: u64,
    /// Upper bound on one full reindex walk; unbounded when unset.
    #[serde(default)]
    pub resync_timeout_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: default_stuck_threshold(),
            proactive_lanes: default_proactive_lanes(),
            lane_delay_secs: default_lane_delay_secs(),
            actualize_delay_secs: default_actualize_delay_secs(),
            resync_after_secs: default_resync_after_secs(),
            full_reindex_delay_secs: default_full_reindex_delay_secs(),
            resync_timeout_secs: None,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn lane_delay(&self) -> Duration {
        Duration::from_secs(self.lane_delay_secs)
    }

    #[must_use]
    pub const fn actualize_delay(&self) -> Duration {
        Duration::from_secs(self.actualize_delay_secs)
    }

    #[must_use]
    pub const fn resync_after(&self) -> Duration {
        Duration::from_secs(self.resync_after_secs)
    }

    #[must_use]
    pub const fn full_reindex_delay(&self) -> Duration {
        Duration::from_secs(self.full_reindex_delay_secs)
    }

    #[must_use]
    pub fn resync_timeout(&self) -> Option<Duration> {
        self.resync_timeout_secs.map(Duration::from_secs)
    }

    /// # Errors
    ///
    /// Returns an error when the configuration cannot drive a sync.
    pub fn validate(&self) -> Result<()> {
        if self.proactive_lanes == 0 {
            bail!("sync.proactive_lanes must be at least 1");
        }
        Ok(())
    }
}

/// A mirrored server served from a captured directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub replay_dir: PathBuf,
}

impl MirrorConfig {
    /// # Errors
    ///
    /// Returns an error if the sync section is invalid or a server id repeats.
    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        for (idx, server) in self.servers.iter().enumerate() {
            if server.id.trim().is_empty() {
                bail!("servers[{idx}].id must not be empty");
            }
            if self.servers[..idx].iter().any(|s| s.id == server.id) {
                bail!("server id '{}' is configured twice", server.id);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }
}

/// Default config file: `<config dir>/buildmirror/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("buildmirror/config.toml"))
}

/// Load and validate a config file; a missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config(path: &Path) -> Result<MirrorConfig> {
    if !path.exists() {
        return Ok(MirrorConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<MirrorConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}

/// Load from `explicit`, falling back to the default location.
///
/// # Errors
///
/// Same as [`load_config`].
pub fn resolve_config(explicit: Option<&Path>) -> Result<MirrorConfig> {
    match explicit.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) => load_config(&path),
        None => Ok(MirrorConfig::default()),
    }
}

/// Output mode: `--json`, then `BMIRROR_FORMAT`, then the config file,
/// then `pretty` on a terminal and `text` otherwise.
#[must_use]
pub fn resolve_output(cli_json: bool, config_output: Option<&str>) -> String {
    resolve_output_from(cli_json, config_output, env::var("BMIRROR_FORMAT").ok().as_deref())
}

fn resolve_output_from(
    cli_json: bool,
    config_output: Option<&str>,
    env_format: Option<&str>,
) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some("pretty"),
            "text" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if let Some(mode) = config_output.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if std::io::stdout().is_terminal() {
        "pretty".to_string()
    } else {
        "text".to_string()
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_FILE)
}

const fn default_stuck_threshold() -> u32 {
    3000
}

const fn default_proactive_lanes() -> usize {
    4
}

const fn default_lane_delay_secs() -> u64 {
    120
}

const fn default_actualize_delay_secs() -> u64 {
    120
}

const fn default_resync_after_secs() -> u64 {
    15 * 60
}

const fn default_full_reindex_delay_secs() -> u64 {
    120 * 60
}

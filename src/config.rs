use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::media::MediaKind;

const APP_DIR: &str = "trakt-scrobbler";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trakt: TraktConfig,
    #[serde(default)]
    pub players: PlayersConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    #[serde(default)]
    pub filters: ScrobbleFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraktConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for TraktConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            access_token: String::new(),
            api_url: default_api_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.trakt.tv".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayersConfig {
    #[serde(default)]
    pub monitored: Vec<String>,
    #[serde(default)]
    pub defaults: MonitorSettings,
    #[serde(default)]
    pub entries: BTreeMap<String, PlayerConfig>,
}

/// Thresholds steering the per-source state machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Minimum progress jump (percent) worth a mid-playback scrobble.
    pub skip_interval: f64,
    /// Progress (percent) above which a first sighting counts as a preview.
    pub preview_threshold: f64,
    /// Seconds a preview must last before it is scrobbled.
    pub preview_duration: f64,
    /// Max seconds between play and pause for the pause to look accidental.
    pub fast_pause_threshold: f64,
    /// Seconds to hold back a fast pause before committing it.
    pub fast_pause_duration: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            skip_interval: 5.0,
            preview_threshold: 80.0,
            preview_duration: 60.0,
            fast_pause_threshold: 1.0,
            fast_pause_duration: 5.0,
        }
    }
}

impl MonitorSettings {
    pub fn preview_delay(&self) -> Duration {
        secs(self.preview_duration)
    }

    pub fn fast_pause_delay(&self) -> Duration {
        secs(self.fast_pause_duration)
    }

    pub fn merged(mut self, overrides: &MonitorOverrides) -> Self {
        if let Some(value) = overrides.skip_interval {
            self.skip_interval = value;
        }
        if let Some(value) = overrides.preview_threshold {
            self.preview_threshold = value;
        }
        if let Some(value) = overrides.preview_duration {
            self.preview_duration = value;
        }
        if let Some(value) = overrides.fast_pause_threshold {
            self.fast_pause_threshold = value;
        }
        if let Some(value) = overrides.fast_pause_duration {
            self.fast_pause_duration = value;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MonitorOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_pause_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_pause_duration: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    pub adapter: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    #[serde(flatten)]
    pub overrides: MonitorOverrides,
}

impl PlayerConfig {
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }
}

fn default_poll_interval_secs() -> f64 {
    10.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    #[serde(default = "default_clear_interval_secs")]
    pub clear_interval_secs: u64,
    #[serde(default = "default_completion_threshold")]
    pub completion_threshold: f64,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            clear_interval_secs: default_clear_interval_secs(),
            completion_threshold: default_completion_threshold(),
        }
    }
}

impl BacklogConfig {
    pub fn clear_interval(&self) -> Duration {
        Duration::from_secs(self.clear_interval_secs)
    }
}

fn default_clear_interval_secs() -> u64 {
    30 * 60
}

fn default_completion_threshold() -> f64 {
    80.0
}

/// Which queued items are eligible to reach the tracking service at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrobbleFilter {
    #[serde(default = "default_media_types")]
    pub media_types: Vec<MediaKind>,
    #[serde(default = "default_min_pause_progress")]
    pub min_pause_progress: f64,
}

impl Default for ScrobbleFilter {
    fn default() -> Self {
        Self {
            media_types: default_media_types(),
            min_pause_progress: default_min_pause_progress(),
        }
    }
}

fn default_media_types() -> Vec<MediaKind> {
    vec![MediaKind::Movie, MediaKind::Episode]
}

fn default_min_pause_progress() -> f64 {
    1.0
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Config {
    /// Monitor thresholds for one player, defaults overlaid by its entry.
    pub fn monitor_settings(&self, player: &str) -> MonitorSettings {
        match self.players.entries.get(player) {
            Some(entry) => self.players.defaults.merged(&entry.overrides),
            None => self.players.defaults,
        }
    }

    pub fn player(&self, name: &str) -> Result<&PlayerConfig> {
        match self.players.entries.get(name) {
            Some(entry) => Ok(entry),
            None => bail!("No configuration entry for player {name}"),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let fallback = PathBuf::from(".config").join(APP_DIR).join("config.json");
    dirs::config_dir().map_or(fallback, |dir| dir.join(APP_DIR).join("config.json"))
}

pub fn default_data_dir() -> PathBuf {
    let fallback = PathBuf::from(".local/share").join(APP_DIR);
    dirs::data_dir().map_or(fallback, |dir| dir.join(APP_DIR))
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading config at {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing config at {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating config directory {}", parent.display()))?;
    }
    let serialized =
        serde_json::to_string_pretty(config).context("Failed serializing config to JSON")?;
    fs::write(path, format!("{serialized}\n"))
        .with_context(|| format!("Failed writing config at {}", path.display()))?;
    Ok(())
}

pub fn set_credentials(config: &mut Config, client_id: &str, access_token: &str) {
    config.trakt.client_id = client_id.to_string();
    config.trakt.access_token = access_token.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.players.defaults, MonitorSettings::default());
        assert_eq!(config.backlog.clear_interval_secs, 1800);
        assert_eq!(config.trakt.api_url, "https://api.trakt.tv");
    }

    #[test]
    fn player_entry_overrides_defaults() {
        let raw = r#"{
            "players": {
                "monitored": ["living-room"],
                "defaults": {"skip_interval": 3},
                "entries": {
                    "living-room": {
                        "adapter": "http-json",
                        "url": "http://localhost:8080/status",
                        "preview_duration": 30
                    }
                }
            }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        let settings = config.monitor_settings("living-room");
        assert_eq!(settings.skip_interval, 3.0);
        assert_eq!(settings.preview_duration, 30.0);
        assert_eq!(settings.preview_threshold, 80.0);
        assert_eq!(
            config.player("living-room").unwrap().poll_interval(),
            Duration::from_secs(10)
        );
        assert!(config.player("kitchen").is_err());
    }

    #[test]
    fn credentials_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        set_credentials(&mut config, "client", "token");
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.trakt.client_id, "client");
        assert_eq!(loaded.trakt.access_token, "token");
    }
}

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::PlayerConfig;
use crate::error::AdapterError;
use crate::media::{MediaDescriptor, MediaKind, PlaybackState, StatusSnapshot};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Produces normalized snapshots for one player.
pub trait StatusAdapter: Send {
    fn name(&self) -> &str;

    fn poll_interval(&self) -> Duration;

    fn can_connect(&mut self) -> bool;

    /// `Ok(None)` means nothing is meaningfully playing.
    fn poll(&mut self) -> Result<Option<StatusSnapshot>, AdapterError>;
}

pub type AdapterFactory = fn(&str, &PlayerConfig) -> Result<Box<dyn StatusAdapter>>;

/// Adapter kinds that can be named in a player's `adapter` field.
pub const REGISTRY: &[(&str, AdapterFactory)] = &[(HttpJsonAdapter::KIND, HttpJsonAdapter::boxed)];

pub fn build_adapter(name: &str, config: &PlayerConfig) -> Result<Box<dyn StatusAdapter>> {
    let Some((_, factory)) = REGISTRY.iter().find(|(kind, _)| *kind == config.adapter) else {
        bail!("Unknown adapter {} for player {name}", config.adapter);
    };
    factory(name, config)
}

pub fn adapter_kinds() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(kind, _)| *kind)
}

/// Player status as reported before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStatus {
    pub state: PlaybackState,
    #[serde(default)]
    pub position: f64,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub media_info: Option<RawMedia>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMedia {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<EpisodeField>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EpisodeField {
    One(u32),
    Many(Vec<u32>),
    Text(String),
}

impl RawStatus {
    pub fn normalize(self, now: DateTime<Utc>) -> Option<StatusSnapshot> {
        let duration = self.duration.filter(|d| d.is_finite() && *d > 0.0)?;
        let media = self.media_info?;
        let position = self.position.max(0.0);
        let (media_info, position, duration) = media.resolve(position, duration)?;
        let progress = (position * 100.0 / duration * 100.0).round() / 100.0;
        Some(StatusSnapshot::new(
            self.state,
            progress.min(100.0),
            media_info,
            now,
        ))
    }
}

impl RawMedia {
    /// Picks the single episode being watched. A file spanning several
    /// episodes is split evenly and the position rebased into that episode.
    fn resolve(self, position: f64, duration: f64) -> Option<(MediaDescriptor, f64, f64)> {
        match self.kind {
            MediaKind::Movie => Some((
                MediaDescriptor::movie(self.title, self.year),
                position,
                duration,
            )),
            MediaKind::Episode => {
                let Some(season) = self.season else {
                    warn!(title = %self.title, "Episode without season; ignoring");
                    return None;
                };
                let (episode, position, duration) = match self.episode? {
                    EpisodeField::One(episode) => (episode, position, duration),
                    EpisodeField::Text(raw) => (raw.trim().parse().ok()?, position, duration),
                    EpisodeField::Many(episodes) if episodes.is_empty() => return None,
                    EpisodeField::Many(episodes) => {
                        let count = episodes.len();
                        let per_episode = duration / count as f64;
                        let mut index = (position / per_episode).floor() as usize;
                        let mut offset = position - index as f64 * per_episode;
                        if index >= count {
                            index = count - 1;
                            offset = per_episode;
                        }
                        (episodes[index], offset, per_episode)
                    }
                };
                Some((
                    MediaDescriptor::episode(self.title, self.year, season, episode),
                    position,
                    duration,
                ))
            }
        }
    }
}

/// Polls a local HTTP endpoint that returns a [`RawStatus`] JSON document.
pub struct HttpJsonAdapter {
    name: String,
    url: String,
    poll_interval: Duration,
    http: Client,
}

impl HttpJsonAdapter {
    pub const KIND: &'static str = "http-json";

    pub fn new(name: &str, config: &PlayerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow!("Player {name} needs a `url` for the {} adapter", Self::KIND))?;
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed building HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            url,
            poll_interval: config.poll_interval(),
            http,
        })
    }

    fn boxed(name: &str, config: &PlayerConfig) -> Result<Box<dyn StatusAdapter>> {
        Ok(Box::new(Self::new(name, config)?))
    }

    fn fetch(&self) -> Result<Option<RawStatus>, AdapterError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .map_err(|err| AdapterError::Unreachable(err.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AdapterError::Fatal(format!(
                "{} answered {status} for {}",
                self.name, self.url
            )));
        }
        let text = response
            .text()
            .map_err(|err| AdapterError::Protocol(err.to_string()))?;
        if text.trim().is_empty() || text.trim() == "null" {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|err| AdapterError::Protocol(format!("invalid status JSON: {err}")))
    }
}

impl StatusAdapter for HttpJsonAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn can_connect(&mut self) -> bool {
        match self.fetch() {
            Ok(_) => true,
            Err(err) => {
                debug!(source = %self.name, "Unable to connect: {err}");
                false
            }
        }
    }

    fn poll(&mut self) -> Result<Option<StatusSnapshot>, AdapterError> {
        Ok(self.fetch()?.and_then(|raw| raw.normalize(Utc::now())))
    }
}

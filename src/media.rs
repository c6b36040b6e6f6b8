use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped = 0,
    Paused = 1,
    Playing = 2,
}

impl PlaybackState {
    pub fn verb(self) -> Verb {
        match self {
            PlaybackState::Stopped => Verb::Stop,
            PlaybackState::Paused => Verb::Pause,
            PlaybackState::Playing => Verb::Start,
        }
    }
}

/// Scrobble verb sent to the tracking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Start,
    Pause,
    Stop,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Pause => "pause",
            Verb::Stop => "stop",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Episode,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Episode => "episode",
        }
    }
}

/// What is being watched. Episodes always carry a single resolved episode
/// number; multi-episode files are split by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MediaDescriptor {
    Movie {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        year: Option<i32>,
    },
    Episode {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        year: Option<i32>,
        season: u32,
        episode: u32,
    },
}

impl MediaDescriptor {
    pub fn movie(title: impl Into<String>, year: Option<i32>) -> Self {
        MediaDescriptor::Movie {
            title: title.into(),
            year,
        }
    }

    pub fn episode(title: impl Into<String>, year: Option<i32>, season: u32, episode: u32) -> Self {
        MediaDescriptor::Episode {
            title: title.into(),
            year,
            season,
            episode,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            MediaDescriptor::Movie { title, .. } | MediaDescriptor::Episode { title, .. } => title,
        }
    }

    pub fn year(&self) -> Option<i32> {
        match self {
            MediaDescriptor::Movie { year, .. } | MediaDescriptor::Episode { year, .. } => *year,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            MediaDescriptor::Movie { .. } => MediaKind::Movie,
            MediaDescriptor::Episode { .. } => MediaKind::Episode,
        }
    }

    /// `"{title}{year}"`, with the year omitted when unknown.
    pub fn lookup_key(&self) -> String {
        lookup_key(self.title(), self.year())
    }
}

pub fn lookup_key(title: &str, year: Option<i32>) -> String {
    match year {
        Some(year) => format!("{title}{year}"),
        None => title.to_string(),
    }
}

impl fmt::Display for MediaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaDescriptor::Movie { title, year } => match year {
                Some(year) => write!(f, "{title} ({year})"),
                None => f.write_str(title),
            },
            MediaDescriptor::Episode {
                title,
                season,
                episode,
                ..
            } => write!(f, "{title} S{season:02}E{episode:02}"),
        }
    }
}

/// One normalized observation of a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: PlaybackState,
    pub progress: f64,
    pub media_info: MediaDescriptor,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn new(
        state: PlaybackState,
        progress: f64,
        media_info: MediaDescriptor,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            state,
            progress: clamp_progress(progress),
            media_info,
            updated_at,
        }
    }
}

pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}

use std::collections::BTreeMap;
use std::fmt;

use crate::backlog::Backlog;
use crate::error::ApiError;
use crate::media::{MediaDescriptor, Verb};

/// The remote tracking service, as seen by the delivery pipeline.
///
/// `Err` from `scrobble` means the item could not be delivered right now;
/// `Ok(Discarded)` means the service will never accept it as sent.
pub trait TrackerApi: Send + Sync {
    fn scrobble(
        &self,
        verb: Verb,
        media: &MediaDescriptor,
        progress: f64,
    ) -> Result<ScrobbleOutcome, ApiError>;

    fn bulk_add_to_history(&self, backlog: &Backlog) -> Result<HistorySync, ApiError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScrobbleOutcome {
    Confirmed(ScrobbleConfirmation),
    Discarded(DiscardReason),
}

/// What the service says it recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrobbleConfirmation {
    pub action: String,
    pub progress: f64,
    pub item: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    NotFound,
    AlreadyScrobbled,
    UnknownMedia,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiscardReason::NotFound => "not found on trakt, the media info is incorrect",
            DiscardReason::AlreadyScrobbled => "scrobble already exists on trakt",
            DiscardReason::UnknownMedia => "no trakt id for this media",
        })
    }
}

/// Backlog keys the service could not resolve to an id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidKeys {
    pub movies: Vec<String>,
    pub shows: Vec<String>,
}

impl InvalidKeys {
    pub fn is_empty(&self) -> bool {
        self.movies.is_empty() && self.shows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.movies.len() + self.shows.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistorySync {
    pub invalid: InvalidKeys,
    /// Newly added items per category, as counted by the service.
    pub added: BTreeMap<String, u64>,
    /// Items the service reports it has never seen, per category.
    pub not_found: BTreeMap<String, u64>,
}

impl HistorySync {
    pub fn added_total(&self) -> u64 {
        self.added.values().sum()
    }

    pub fn not_found_total(&self) -> u64 {
        self.not_found.values().sum()
    }
}

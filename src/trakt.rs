use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::api::{
    DiscardReason, HistorySync, InvalidKeys, ScrobbleConfirmation, ScrobbleOutcome, TrackerApi,
};
use crate::backlog::{Backlog, BacklogMedia};
use crate::config::TraktConfig;
use crate::error::ApiError;
use crate::media::{MediaDescriptor, MediaKind, Verb, lookup_key};

const CACHE_FILE: &str = "trakt_cache.json";
const API_VERSION: &str = "2";
/// Search results scoring below this are treated as no match.
const MIN_SEARCH_SCORE: f64 = 5.0;
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Cached id for titles the search could not resolve.
const UNRESOLVED: i64 = -1;

/// Title to trakt id memo, persisted between runs.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IdCache {
    #[serde(default)]
    movie: BTreeMap<String, i64>,
    #[serde(default)]
    show: BTreeMap<String, i64>,
}

impl IdCache {
    fn table(&mut self, kind: MediaKind) -> &mut BTreeMap<String, i64> {
        match kind {
            MediaKind::Movie => &mut self.movie,
            MediaKind::Episode => &mut self.show,
        }
    }
}

fn search_type(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Movie => "movie",
        MediaKind::Episode => "show",
    }
}

pub struct TraktClient {
    api_url: String,
    client_id: String,
    access_token: String,
    max_retries: u32,
    retry_base: Duration,
    http: Client,
    cache_path: PathBuf,
    cache: Mutex<IdCache>,
}

impl TraktClient {
    pub fn new(config: &TraktConfig, data_dir: &Path) -> Result<Self> {
        if config.client_id.is_empty() || config.access_token.is_empty() {
            bail!("Missing trakt credentials; run `auth set-token` first");
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed building HTTP client")?;
        let cache_path = data_dir.join(CACHE_FILE);
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            access_token: config.access_token.clone(),
            max_retries: config.max_retries,
            retry_base: Duration::from_secs(1),
            http,
            cache: Mutex::new(load_cache(&cache_path)),
            cache_path,
        })
    }

    /// Sends the request, retrying 429s, server errors and connection
    /// failures with exponential backoff.
    fn execute(&self, build: impl Fn(&Client) -> RequestBuilder) -> Result<Response, ApiError> {
        let mut attempt = 0;
        let response = loop {
            let result = build(&self.http)
                .header("trakt-api-version", API_VERSION)
                .header("trakt-api-key", &self.client_id)
                .bearer_auth(&self.access_token)
                .send();
            let delay = match &result {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    Some(retry_after(response).unwrap_or_else(|| self.backoff(attempt)))
                }
                Ok(response) if response.status().is_server_error() => Some(self.backoff(attempt)),
                Err(err) if err.is_connect() || err.is_timeout() => Some(self.backoff(attempt)),
                _ => None,
            };
            match delay {
                Some(delay) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, ?delay, "Trakt request failed, retrying");
                    thread::sleep(delay);
                }
                _ => break result?,
            }
        };
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        Ok(response)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF)
    }

    fn search(
        &self,
        title: &str,
        kind: MediaKind,
        year: Option<i32>,
    ) -> Result<Vec<SearchResult>, ApiError> {
        let url = format!("{}/search/{}", self.api_url, search_type(kind));
        let mut query = vec![
            ("query", title.to_string()),
            ("field", "title".to_string()),
            ("limit", "1".to_string()),
        ];
        if let Some(year) = year {
            query.push(("years", year.to_string()));
        }
        let response = self.execute(|http| http.get(&url).query(&query))?;
        let response = ensure_success(response)?;
        response
            .json()
            .map_err(|err| ApiError::Decode(format!("search results: {err}")))
    }

    /// Resolves a title to its trakt id. `None` means the title is known to
    /// be unresolvable; transport failures are returned and not cached.
    fn trakt_id(
        &self,
        title: &str,
        kind: MediaKind,
        year: Option<i32>,
    ) -> Result<Option<i64>, ApiError> {
        let key = lookup_key(title, year);
        if let Some(&id) = self.cache.lock().table(kind).get(&key) {
            return Ok((id > 0).then_some(id));
        }

        debug!(title, ?year, "Searching trakt");
        let mut results = self.search(title, kind, year)?;
        if results.is_empty() && year.is_some() {
            warn!(title, ?year, "No {} match; retrying without year", search_type(kind));
            results = self.search(title, kind, None)?;
        }

        let id = match results.first() {
            Some(result) if result.score >= MIN_SEARCH_SCORE => result.trakt_id(kind),
            _ => None,
        };
        if id.is_none() {
            warn!(title, ?year, "Trakt search yielded no {} match", search_type(kind));
        }
        self.remember(kind, key, id.unwrap_or(UNRESOLVED));
        Ok(id)
    }

    fn remember(&self, kind: MediaKind, key: String, id: i64) {
        let mut cache = self.cache.lock();
        cache.table(kind).insert(key, id);
        if let Err(err) = save_cache(&self.cache_path, &cache) {
            warn!("Failed saving trakt id cache: {err:#}");
        }
    }

    /// Builds the `/sync/history` body, collecting keys with no trakt id.
    fn history_payload(&self, backlog: &Backlog) -> Result<(Value, InvalidKeys), ApiError> {
        let mut invalid = InvalidKeys::default();
        let mut movies = Vec::new();
        for (key, entry) in &backlog.movies {
            match self.backlog_id(&entry.media_info)? {
                Some(id) => movies.push(json!({
                    "ids": {"trakt": id},
                    "watched_at": watched_at(entry.watch.updated_at),
                })),
                None => invalid.movies.push(key.clone()),
            }
        }

        let mut shows = Vec::new();
        for (key, entry) in &backlog.shows {
            let Some(id) = self.backlog_id(&entry.media_info)? else {
                invalid.shows.push(key.clone());
                continue;
            };
            let seasons: Vec<Value> = entry
                .seasons
                .iter()
                .map(|(season, episodes)| {
                    let episodes: Vec<Value> = episodes
                        .iter()
                        .map(|(number, watch)| {
                            json!({"number": number, "watched_at": watched_at(watch.updated_at)})
                        })
                        .collect();
                    json!({"number": season, "episodes": episodes})
                })
                .collect();
            shows.push(json!({"ids": {"trakt": id}, "seasons": seasons}));
        }

        Ok((json!({"movies": movies, "shows": shows}), invalid))
    }

    fn backlog_id(&self, media: &BacklogMedia) -> Result<Option<i64>, ApiError> {
        self.trakt_id(&media.title, media.item_type, media.year)
    }
}

impl TrackerApi for TraktClient {
    fn scrobble(
        &self,
        verb: Verb,
        media: &MediaDescriptor,
        progress: f64,
    ) -> Result<ScrobbleOutcome, ApiError> {
        let Some(id) = self.trakt_id(media.title(), media.kind(), media.year())? else {
            warn!(media = %media, "Invalid trakt id");
            return Ok(ScrobbleOutcome::Discarded(DiscardReason::UnknownMedia));
        };
        let body = scrobble_body(media, id, progress);
        let url = format!("{}/scrobble/{verb}", self.api_url);
        let response = self.execute(|http| http.post(&url).json(&body))?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                warn!(media = %media, "Not found on trakt. The media info is incorrect");
                Ok(ScrobbleOutcome::Discarded(DiscardReason::NotFound))
            }
            StatusCode::CONFLICT => {
                warn!(media = %media, "Scrobble already exists on trakt");
                Ok(ScrobbleOutcome::Discarded(DiscardReason::AlreadyScrobbled))
            }
            _ => {
                let payload: ScrobbleResponse = ensure_success(response)?
                    .json()
                    .map_err(|err| ApiError::Decode(format!("scrobble response: {err}")))?;
                Ok(ScrobbleOutcome::Confirmed(payload.into_confirmation()))
            }
        }
    }

    fn bulk_add_to_history(&self, backlog: &Backlog) -> Result<HistorySync, ApiError> {
        let (body, invalid) = self.history_payload(backlog)?;
        if body["movies"].as_array().is_some_and(Vec::is_empty)
            && body["shows"].as_array().is_some_and(Vec::is_empty)
        {
            info!(invalid = invalid.len(), "Nothing resolvable to add to history");
            return Ok(HistorySync {
                invalid,
                ..HistorySync::default()
            });
        }
        let url = format!("{}/sync/history", self.api_url);
        let response = self.execute(|http| http.post(&url).json(&body))?;
        let payload: HistoryResponse = ensure_success(response)?
            .json()
            .map_err(|err| ApiError::Decode(format!("history response: {err}")))?;
        Ok(payload.into_sync(invalid))
    }
}

fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(ApiError::Status {
        code: status.as_u16(),
        body,
    })
}

fn retry_after(response: &Response) -> Option<Duration> {
    let secs = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(secs).min(MAX_BACKOFF))
}

fn watched_at(updated_at: DateTime<Utc>) -> String {
    updated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn scrobble_body(media: &MediaDescriptor, id: i64, progress: f64) -> Value {
    match media {
        MediaDescriptor::Movie { .. } => json!({
            "movie": {"ids": {"trakt": id}},
            "progress": progress,
        }),
        MediaDescriptor::Episode {
            season, episode, ..
        } => json!({
            "show": {"ids": {"trakt": id}},
            "episode": {"season": season, "number": episode},
            "progress": progress,
        }),
    }
}

fn load_cache(path: &Path) -> IdCache {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return IdCache::default(),
    };
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        warn!(path = %path.display(), "Ignoring unreadable trakt id cache: {err}");
        IdCache::default()
    })
}

fn save_cache(path: &Path, cache: &IdCache) -> Result<()> {
    let serialized = serde_json::to_string_pretty(cache).context("Failed serializing id cache")?;
    fs::write(path, format!("{serialized}\n"))
        .with_context(|| format!("Failed writing {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    score: f64,
    #[serde(default)]
    movie: Option<SearchItem>,
    #[serde(default)]
    show: Option<SearchItem>,
}

impl SearchResult {
    fn trakt_id(&self, kind: MediaKind) -> Option<i64> {
        let item = match kind {
            MediaKind::Movie => self.movie.as_ref(),
            MediaKind::Episode => self.show.as_ref(),
        }?;
        Some(item.ids.trakt)
    }
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    ids: TraktIds,
}

#[derive(Debug, Deserialize)]
struct TraktIds {
    trakt: i64,
}

#[derive(Debug, Deserialize)]
struct ScrobbleResponse {
    #[serde(default)]
    action: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    movie: Option<Titled>,
    #[serde(default)]
    show: Option<Titled>,
    #[serde(default)]
    episode: Option<EpisodeNumber>,
}

#[derive(Debug, Deserialize)]
struct Titled {
    title: String,
}

#[derive(Debug, Deserialize)]
struct EpisodeNumber {
    season: u32,
    number: u32,
}

impl ScrobbleResponse {
    fn into_confirmation(self) -> ScrobbleConfirmation {
        let item = match (self.movie, self.show, self.episode) {
            (Some(movie), _, _) => movie.title,
            (None, Some(show), Some(episode)) => {
                format!("{} S{:02}E{:02}", show.title, episode.season, episode.number)
            }
            (None, Some(show), None) => show.title,
            (None, None, _) => "unknown item".to_string(),
        };
        ScrobbleConfirmation {
            action: self.action,
            progress: self.progress,
            item,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    added: BTreeMap<String, u64>,
    #[serde(default)]
    not_found: BTreeMap<String, Value>,
}

impl HistoryResponse {
    fn into_sync(self, invalid: InvalidKeys) -> HistorySync {
        let not_found = self
            .not_found
            .into_iter()
            .map(|(category, items)| {
                let count = match items {
                    Value::Array(items) => items.len() as u64,
                    Value::Number(count) => count.as_u64().unwrap_or(0),
                    _ => 0,
                };
                (category, count)
            })
            .collect();
        HistorySync {
            invalid,
            added: self.added,
            not_found,
        }
    }
}

//! Durable retry queue for watches the tracking service has not confirmed.
//!
//! Everything goes through [`BacklogStore`], which serializes access with an
//! in-process mutex plus an advisory lock file, so the periodic flush of a
//! running scrobbler and a manual `backlog clear` never interleave.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::api::{HistorySync, TrackerApi};
use crate::error::{ApiError, BacklogError};
use crate::media::{MediaDescriptor, MediaKind, PlaybackState, StatusSnapshot};
use crate::timer::ResumableTimer;

const BACKLOG_FILE: &str = "watched_backlog.json";
const LOCK_FILE: &str = "watched_backlog.json.lock";
const UNKNOWN_FILE: &str = "unknown_items.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Movies,
    Shows,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogMedia {
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    pub item_type: MediaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WatchRecord {
    pub progress: f64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieEntry {
    pub media_info: BacklogMedia,
    #[serde(flatten)]
    pub watch: WatchRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowEntry {
    pub media_info: BacklogMedia,
    #[serde(default)]
    pub seasons: BTreeMap<u32, BTreeMap<u32, WatchRecord>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BacklogItem {
    Movie(MovieEntry),
    Show(ShowEntry),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Backlog {
    #[serde(default)]
    pub movies: BTreeMap<String, MovieEntry>,
    #[serde(default)]
    pub shows: BTreeMap<String, ShowEntry>,
}

impl Backlog {
    pub fn is_empty(&self) -> bool {
        self.movies.is_empty() && self.shows.values().all(|show| show.episode_count() == 0)
    }

    /// Number of movies plus individual episodes.
    pub fn len(&self) -> usize {
        self.movies.len() + self.shows.values().map(ShowEntry::episode_count).sum::<usize>()
    }

    /// Records a finished watch, returning its key.
    pub fn insert(&mut self, snapshot: &StatusSnapshot) -> String {
        let key = snapshot.media_info.lookup_key();
        let watch = WatchRecord {
            progress: snapshot.progress,
            updated_at: snapshot.updated_at,
        };
        match &snapshot.media_info {
            MediaDescriptor::Movie { title, year } => {
                self.movies.insert(
                    key.clone(),
                    MovieEntry {
                        media_info: BacklogMedia {
                            title: title.clone(),
                            year: *year,
                            item_type: MediaKind::Movie,
                        },
                        watch,
                    },
                );
            }
            MediaDescriptor::Episode {
                title,
                year,
                season,
                episode,
            } => {
                let show = self.shows.entry(key.clone()).or_insert_with(|| ShowEntry {
                    media_info: BacklogMedia {
                        title: title.clone(),
                        year: *year,
                        item_type: MediaKind::Episode,
                    },
                    seasons: BTreeMap::new(),
                });
                show.seasons
                    .entry(*season)
                    .or_default()
                    .insert(*episode, watch);
            }
        }
        key
    }

    pub fn take(&mut self, category: Category, key: &str) -> Option<BacklogItem> {
        match category {
            Category::Movies => self.movies.remove(key).map(BacklogItem::Movie),
            Category::Shows => self.shows.remove(key).map(BacklogItem::Show),
        }
    }

    /// Adds an item, merging episodes into an existing show.
    pub fn merge(&mut self, key: &str, item: BacklogItem) {
        match item {
            BacklogItem::Movie(movie) => {
                self.movies.insert(key.to_string(), movie);
            }
            BacklogItem::Show(show) => match self.shows.get_mut(key) {
                Some(existing) => {
                    for (season, episodes) in show.seasons {
                        existing.seasons.entry(season).or_default().extend(episodes);
                    }
                }
                None => {
                    self.shows.insert(key.to_string(), show);
                }
            },
        }
    }
}

impl ShowEntry {
    pub fn episode_count(&self) -> usize {
        self.seasons.values().map(BTreeMap::len).sum()
    }
}

#[derive(Debug)]
pub enum ClearOutcome {
    Empty,
    Synced(HistorySync),
    Failed(ApiError),
}

#[derive(Debug)]
pub struct BacklogStore {
    backlog_path: PathBuf,
    lock_path: PathBuf,
    unknown_path: PathBuf,
    guard: Mutex<()>,
}

impl BacklogStore {
    pub fn open(data_dir: &Path) -> Result<Self, BacklogError> {
        fs::create_dir_all(data_dir).map_err(|err| BacklogError::io(data_dir, err))?;
        Ok(Self {
            backlog_path: data_dir.join(BACKLOG_FILE),
            lock_path: data_dir.join(LOCK_FILE),
            unknown_path: data_dir.join(UNKNOWN_FILE),
            guard: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.backlog_path
    }

    pub fn read(&self) -> Result<Backlog, BacklogError> {
        self.exclusive(|| self.load())
    }

    pub fn unknown_items(&self) -> Result<Backlog, BacklogError> {
        self.exclusive(|| Ok(read_backlog_file(&self.unknown_path)?.unwrap_or_default()))
    }

    pub fn add(&self, snapshot: &StatusSnapshot) -> Result<(), BacklogError> {
        self.exclusive(|| {
            let mut backlog = self.load()?;
            let key = backlog.insert(snapshot);
            self.save(&backlog)?;
            info!(key, progress = snapshot.progress, "Added to backlog");
            Ok(())
        })
    }

    /// Empties the backlog without syncing, returning what was dropped.
    pub fn purge(&self) -> Result<Backlog, BacklogError> {
        self.exclusive(|| {
            let old = self.load()?;
            self.save(&Backlog::default())?;
            Ok(old)
        })
    }

    /// Pushes the whole backlog to the service in one call. Keys the service
    /// cannot resolve move to the unknown-items file; everything else is
    /// dropped once the call succeeds. On failure nothing changes.
    pub fn clear(&self, api: &dyn TrackerApi) -> Result<ClearOutcome, BacklogError> {
        self.exclusive(|| {
            let mut backlog = self.load()?;
            if backlog.is_empty() {
                debug!("Backlog is empty");
                return Ok(ClearOutcome::Empty);
            }

            let sync = match api.bulk_add_to_history(&backlog) {
                Ok(sync) => sync,
                Err(err) => {
                    warn!("Failed syncing backlog: {err}");
                    return Ok(ClearOutcome::Failed(err));
                }
            };

            if !sync.invalid.is_empty() {
                let mut unknown = read_backlog_file(&self.unknown_path)?.unwrap_or_default();
                let invalid = sync
                    .invalid
                    .movies
                    .iter()
                    .map(|key| (Category::Movies, key))
                    .chain(sync.invalid.shows.iter().map(|key| (Category::Shows, key)));
                for (category, key) in invalid {
                    match backlog.take(category, key) {
                        Some(item) => {
                            info!(?category, key, "Adding to unknown items");
                            unknown.merge(key, item);
                        }
                        None => warn!(?category, key, "Could not find item in backlog"),
                    }
                }
                write_backlog_file(&self.unknown_path, &unknown)?;
            }

            if sync.added_total() > 0 {
                info!(added = ?sync.added, "Added to history");
            }
            if sync.not_found_total() > 0 {
                warn!(not_found = ?sync.not_found, "Not found on trakt");
            }
            self.save(&Backlog::default())?;
            Ok(ClearOutcome::Synced(sync))
        })
    }

    fn exclusive<T>(
        &self,
        f: impl FnOnce() -> Result<T, BacklogError>,
    ) -> Result<T, BacklogError> {
        let _guard = self.guard.lock();
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|err| BacklogError::io(&self.lock_path, err))?;
        lock_file
            .lock()
            .map_err(|err| BacklogError::io(&self.lock_path, err))?;
        let result = f();
        drop(lock_file);
        result
    }

    fn load(&self) -> Result<Backlog, BacklogError> {
        let raw = match fs::read_to_string(&self.backlog_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.backlog_path.display(), "No backlog file yet");
                return Ok(Backlog::default());
            }
            Err(err) => return Err(BacklogError::io(&self.backlog_path, err)),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => self.import_legacy(items),
            Ok(Value::Null) => Ok(Backlog::default()),
            Ok(value) => match serde_json::from_value(value) {
                Ok(backlog) => Ok(backlog),
                Err(err) => {
                    let kept = set_aside(&self.backlog_path)?;
                    warn!(kept = %kept.display(), "Unreadable backlog, starting fresh: {err}");
                    Ok(Backlog::default())
                }
            },
            Err(err) => {
                let kept = set_aside(&self.backlog_path)?;
                warn!(kept = %kept.display(), "Invalid JSON in backlog: {err}");
                Ok(Backlog::default())
            }
        }
    }

    /// Rewrites a list-style backlog in the categorized layout. The original
    /// file is kept next to it if any item could not be imported.
    fn import_legacy(&self, items: Vec<Value>) -> Result<Backlog, BacklogError> {
        let (backlog, skipped) = migrate_legacy(items);
        if skipped > 0 {
            let kept = set_aside(&self.backlog_path)?;
            warn!(skipped, kept = %kept.display(), "Some legacy backlog items were not imported");
        }
        self.save(&backlog)?;
        Ok(backlog)
    }

    fn save(&self, backlog: &Backlog) -> Result<(), BacklogError> {
        write_backlog_file(&self.backlog_path, backlog)
    }
}

/// One entry of an older list-style backlog. Its playback state is ignored
/// since only finished watches were ever stored.
#[derive(Debug, Deserialize)]
struct LegacyItem {
    progress: f64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    updated_at: DateTime<Utc>,
    media_info: MediaDescriptor,
}

/// Returns the imported backlog and the number of items that were skipped.
fn migrate_legacy(items: Vec<Value>) -> (Backlog, usize) {
    let mut backlog = Backlog::default();
    let mut skipped = 0;
    for item in items {
        match serde_json::from_value::<LegacyItem>(item) {
            Ok(item) => {
                backlog.insert(&StatusSnapshot::new(
                    PlaybackState::Stopped,
                    item.progress,
                    item.media_info,
                    item.updated_at,
                ));
            }
            Err(err) => {
                warn!("Skipping legacy backlog item: {err}");
                skipped += 1;
            }
        }
    }
    info!(items = backlog.len(), skipped, "Imported legacy backlog");
    (backlog, skipped)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(DateTime<Utc>),
    Seconds(f64),
}

/// Accepts RFC3339 strings as well as epoch seconds, which older files use.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Text(at) => Ok(at),
        RawTimestamp::Seconds(secs) => from_epoch_seconds(secs)
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {secs}"))),
    }
}

fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

/// Moves an unreadable file out of the way so the next write cannot clobber
/// it. Returns where it went.
fn set_aside(path: &Path) -> Result<PathBuf, BacklogError> {
    let mut target = PathBuf::from(format!("{}.bak", path.display()));
    let mut attempt = 1;
    while target.exists() {
        target = PathBuf::from(format!("{}.bak.{attempt}", path.display()));
        attempt += 1;
    }
    fs::rename(path, &target).map_err(|err| BacklogError::io(path, err))?;
    Ok(target)
}

fn read_backlog_file(path: &Path) -> Result<Option<Backlog>, BacklogError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(BacklogError::io(path, err)),
    };
    match serde_json::from_str(&raw) {
        Ok(backlog) => Ok(Some(backlog)),
        Err(err) => {
            let kept = set_aside(path)?;
            warn!(path = %path.display(), kept = %kept.display(), "Unreadable file: {err}");
            Ok(None)
        }
    }
}

fn write_backlog_file(path: &Path, backlog: &Backlog) -> Result<(), BacklogError> {
    let serialized = serde_json::to_string_pretty(backlog).map_err(|source| BacklogError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let staging = path.with_extension("json.tmp");
    let mut file = File::create(&staging).map_err(|err| BacklogError::io(&staging, err))?;
    file.write_all(format!("{serialized}\n").as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|err| BacklogError::io(&staging, err))?;
    fs::rename(&staging, path).map_err(|err| BacklogError::io(path, err))
}

/// Owns the periodic flush of a [`BacklogStore`].
pub struct BacklogCleaner {
    store: Arc<BacklogStore>,
    api: Arc<dyn TrackerApi>,
    interval: Duration,
    timer: Mutex<Option<ResumableTimer>>,
    periodic: AtomicBool,
    flushing: AtomicBool,
}

impl BacklogCleaner {
    pub fn new(store: Arc<BacklogStore>, api: Arc<dyn TrackerApi>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            api,
            interval,
            timer: Mutex::new(None),
            periodic: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
        })
    }

    /// Arms the periodic flush and kicks off a first one right away.
    pub fn start(self: &Arc<Self>) {
        self.periodic.store(true, Ordering::SeqCst);
        self.reschedule();
        self.clear_in_background();
    }

    pub fn add(&self, snapshot: &StatusSnapshot) -> Result<(), BacklogError> {
        self.store.add(snapshot)
    }

    /// Flushes now and restarts the periodic countdown.
    pub fn clear(self: &Arc<Self>) -> Result<ClearOutcome, BacklogError> {
        let outcome = self.store.clear(&*self.api);
        self.reschedule();
        outcome
    }

    /// Flushes on a separate thread; skipped if a flush is already running.
    pub fn clear_in_background(self: &Arc<Self>) {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Backlog flush already in progress");
            return;
        }
        let cleaner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("backlog-flush".to_string())
            .spawn(move || {
                cleaner.clear_logged();
                cleaner.flushing.store(false, Ordering::SeqCst);
            });
        if let Err(err) = spawned {
            error!("Failed spawning backlog flush: {err}");
            self.flushing.store(false, Ordering::SeqCst);
        }
    }

    pub fn shutdown(&self) {
        self.periodic.store(false, Ordering::SeqCst);
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }

    fn clear_logged(self: &Arc<Self>) {
        match self.clear() {
            Ok(ClearOutcome::Synced(sync)) => {
                debug!(added = sync.added_total(), invalid = sync.invalid.len(), "Backlog flushed");
            }
            Ok(ClearOutcome::Failed(err)) => debug!("Backlog kept for retry: {err}"),
            Ok(ClearOutcome::Empty) => {}
            Err(err) => error!("Backlog flush failed: {err}"),
        }
    }

    fn reschedule(self: &Arc<Self>) {
        let mut slot = self.timer.lock();
        if let Some(old) = slot.take() {
            old.cancel();
        }
        if !self.periodic.load(Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = ResumableTimer::new("backlog", self.interval, move || {
            if let Some(cleaner) = weak.upgrade() {
                cleaner.clear_logged();
            }
        });
        timer.start();
        *slot = Some(timer);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::api::InvalidKeys;
    use crate::api::testing::{FakeTracker, Reply};

    fn stopped(media: MediaDescriptor, progress: f64) -> StatusSnapshot {
        StatusSnapshot::new(
            PlaybackState::Stopped,
            progress,
            media,
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )
    }

    fn store() -> (tempfile::TempDir, BacklogStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn episodes_nest_under_season_and_number() {
        let (_dir, store) = store();
        store
            .add(&stopped(MediaDescriptor::episode("Dark", Some(2017), 2, 7), 93.5))
            .unwrap();
        store
            .add(&stopped(MediaDescriptor::episode("Dark", Some(2017), 2, 8), 88.0))
            .unwrap();

        let backlog = store.read().unwrap();
        let show = &backlog.shows["Dark2017"];
        assert_eq!(show.seasons[&2][&7].progress, 93.5);
        assert_eq!(show.seasons[&2][&8].progress, 88.0);
        assert_eq!(backlog.len(), 2);
        assert!(backlog.movies.is_empty());
    }

    #[test]
    fn file_uses_string_keys_for_numbers() {
        let (_dir, store) = store();
        store
            .add(&stopped(MediaDescriptor::episode("Dark", None, 1, 3), 90.0))
            .unwrap();
        store
            .add(&stopped(MediaDescriptor::movie("Heat", Some(1995)), 97.0))
            .unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["shows"]["Dark"]["seasons"]["1"]["3"]["progress"], 90.0);
        assert_eq!(raw["movies"]["Heat1995"]["progress"], 97.0);
        assert_eq!(raw["movies"]["Heat1995"]["media_info"]["item_type"], "movie");
    }

    #[test]
    fn purge_returns_previous_contents() {
        let (_dir, store) = store();
        store
            .add(&stopped(MediaDescriptor::movie("Heat", Some(1995)), 97.0))
            .unwrap();
        let before = store.read().unwrap();

        let purged = store.purge().unwrap();
        assert_eq!(purged, before);
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn clear_moves_invalid_keys_to_unknown_items() {
        let (_dir, store) = store();
        store
            .add(&stopped(MediaDescriptor::movie("Heat", Some(1995)), 97.0))
            .unwrap();
        store
            .add(&stopped(MediaDescriptor::movie("Untitled Home Video", None), 99.0))
            .unwrap();
        store
            .add(&stopped(MediaDescriptor::episode("Dark", None, 1, 3), 90.0))
            .unwrap();

        let api = FakeTracker::new(Reply::Confirm);
        *api.history.lock() = Some(HistorySync {
            invalid: InvalidKeys {
                movies: vec!["Untitled Home Video".to_string()],
                shows: Vec::new(),
            },
            added: BTreeMap::from([("movies".to_string(), 1), ("episodes".to_string(), 1)]),
            not_found: BTreeMap::new(),
        });

        let outcome = store.clear(&api).unwrap();
        assert!(matches!(outcome, ClearOutcome::Synced(_)));
        assert!(store.read().unwrap().is_empty());

        let unknown = store.unknown_items().unwrap();
        assert_eq!(unknown.movies.len(), 1);
        assert!(unknown.movies.contains_key("Untitled Home Video"));
        assert!(unknown.shows.is_empty());
        assert_eq!(api.history_calls.lock()[0].len(), 3);
    }

    #[test]
    fn failed_clear_keeps_backlog() {
        let (_dir, store) = store();
        store
            .add(&stopped(MediaDescriptor::movie("Heat", Some(1995)), 97.0))
            .unwrap();
        let api = FakeTracker::new(Reply::Confirm);
        *api.history.lock() = None;

        let outcome = store.clear(&api).unwrap();
        assert!(matches!(outcome, ClearOutcome::Failed(_)));
        assert_eq!(store.read().unwrap().len(), 1);
        assert!(store.unknown_items().unwrap().is_empty());
    }

    #[test]
    fn empty_backlog_skips_remote_call() {
        let (_dir, store) = store();
        let api = FakeTracker::new(Reply::Confirm);
        assert!(matches!(store.clear(&api).unwrap(), ClearOutcome::Empty));
        assert!(api.history_calls.lock().is_empty());
    }

    #[test]
    fn unknown_shows_merge_episodes() {
        let mut unknown = Backlog::default();
        let mut first = Backlog::default();
        first.insert(&stopped(MediaDescriptor::episode("Dark", None, 1, 3), 90.0));
        let mut second = Backlog::default();
        second.insert(&stopped(MediaDescriptor::episode("Dark", None, 1, 4), 91.0));

        unknown.merge("Dark", first.take(Category::Shows, "Dark").unwrap());
        unknown.merge("Dark", second.take(Category::Shows, "Dark").unwrap());
        assert_eq!(unknown.shows["Dark"].episode_count(), 2);
    }

    #[test]
    fn legacy_list_is_migrated() {
        let (_dir, store) = store();
        let legacy = serde_json::to_string(&vec![
            stopped(MediaDescriptor::movie("Heat", Some(1995)), 97.0),
            stopped(MediaDescriptor::episode("Dark", None, 1, 3), 90.0),
        ])
        .unwrap();
        fs::write(store.path(), legacy).unwrap();

        let backlog = store.read().unwrap();
        assert_eq!(backlog.len(), 2);
        assert!(backlog.movies.contains_key("Heat1995"));
        let on_disk: Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert!(on_disk.is_object());
    }

    fn backup_path(store: &BacklogStore) -> PathBuf {
        PathBuf::from(format!("{}.bak", store.path().display()))
    }

    #[test]
    fn legacy_list_with_epoch_timestamps_is_migrated() {
        let (_dir, store) = store();
        let legacy = r#"[
            {"state": 0, "progress": 95.0, "updated_at": 1700000000.5,
             "media_info": {"type": "movie", "title": "Heat", "year": 1995}},
            {"state": 0, "progress": 91.0, "updated_at": 1700000100,
             "media_info": {"type": "episode", "title": "Dark", "year": null,
                            "season": 1, "episode": 3}}
        ]"#;
        fs::write(store.path(), legacy).unwrap();

        let backlog = store.read().unwrap();
        assert_eq!(backlog.len(), 2);
        let heat = &backlog.movies["Heat1995"].watch;
        assert_eq!(heat.progress, 95.0);
        assert_eq!(
            heat.updated_at,
            Utc.timestamp_opt(1_700_000_000, 500_000_000).unwrap()
        );
        assert_eq!(
            backlog.shows["Dark"].seasons[&1][&3].updated_at,
            Utc.timestamp_opt(1_700_000_100, 0).unwrap()
        );
        assert!(!backup_path(&store).exists());
    }

    #[test]
    fn partially_readable_legacy_list_keeps_original() {
        let (_dir, store) = store();
        let legacy = r#"[
            {"state": 0, "progress": 95.0, "updated_at": 1700000000.5,
             "media_info": {"type": "movie", "title": "Heat", "year": 1995}},
            {"state": 0, "progress": 99.0, "updated_at": 1700000000}
        ]"#;
        fs::write(store.path(), legacy).unwrap();

        let backlog = store.read().unwrap();
        assert_eq!(backlog.len(), 1);
        assert!(backlog.movies.contains_key("Heat1995"));
        assert_eq!(fs::read_to_string(backup_path(&store)).unwrap(), legacy);
    }

    #[test]
    fn entries_with_epoch_timestamps_survive_add() {
        let (_dir, store) = store();
        let existing = r#"{
            "movies": {"Heat1995": {
                "media_info": {"title": "Heat", "year": 1995, "item_type": "movie"},
                "progress": 95.0, "updated_at": 1700000000.25}},
            "shows": {}
        }"#;
        fs::write(store.path(), existing).unwrap();

        store
            .add(&stopped(MediaDescriptor::movie("Alien", Some(1979)), 92.0))
            .unwrap();
        let backlog = store.read().unwrap();
        let keys: Vec<&str> = backlog.movies.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["Alien1979", "Heat1995"]);
    }

    #[test]
    fn unexpected_layout_is_set_aside_before_writing() {
        let (_dir, store) = store();
        fs::write(store.path(), r#"{"movies": 5}"#).unwrap();

        store
            .add(&stopped(MediaDescriptor::movie("Alien", Some(1979)), 92.0))
            .unwrap();
        assert_eq!(store.read().unwrap().len(), 1);
        assert_eq!(
            fs::read_to_string(backup_path(&store)).unwrap(),
            r#"{"movies": 5}"#
        );
    }

    #[test]
    fn invalid_json_reads_as_empty() {
        let (_dir, store) = store();
        fs::write(store.path(), "{not json").unwrap();
        assert!(store.read().unwrap().is_empty());
        assert_eq!(fs::read_to_string(backup_path(&store)).unwrap(), "{not json");
    }

    fn is_scheduled(cleaner: &BacklogCleaner) -> bool {
        cleaner.timer.lock().as_ref().is_some_and(ResumableTimer::is_running)
    }

    #[test]
    fn cleaner_reschedules_after_clear_and_stops_on_shutdown() {
        let (_dir, store) = store();
        let api: Arc<dyn TrackerApi> = Arc::new(FakeTracker::new(Reply::Confirm));
        let cleaner = BacklogCleaner::new(Arc::new(store), api, Duration::from_secs(60));

        cleaner.clear().unwrap();
        assert!(!is_scheduled(&cleaner));

        cleaner.periodic.store(true, Ordering::SeqCst);
        cleaner.clear().unwrap();
        assert!(is_scheduled(&cleaner));

        cleaner.shutdown();
        assert!(!is_scheduled(&cleaner));
    }

    #[test]
    fn periodic_timer_flushes_backlog() {
        let (_dir, store) = store();
        store
            .add(&stopped(MediaDescriptor::movie("Heat", Some(1995)), 97.0))
            .unwrap();
        let api = Arc::new(FakeTracker::new(Reply::Confirm));
        let cleaner = BacklogCleaner::new(
            Arc::new(store),
            Arc::clone(&api) as Arc<dyn TrackerApi>,
            Duration::from_millis(50),
        );
        cleaner.periodic.store(true, Ordering::SeqCst);
        cleaner.reschedule();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while api.history_calls.lock().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(api.history_calls.lock().len(), 1);
        cleaner.shutdown();
        assert!(cleaner.store.read().unwrap().is_empty());
    }
}

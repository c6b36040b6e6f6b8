use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use crate::api::{ScrobbleConfirmation, ScrobbleOutcome, TrackerApi};
use crate::backlog::BacklogCleaner;
use crate::config::ScrobbleFilter;
use crate::media::Verb;
use crate::queue::{DeliveryItem, DeliveryReceiver};
use crate::supervisor::SupervisorEvent;

/// What became of one delivery item.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Confirmed(ScrobbleConfirmation),
    /// Undelivered but complete enough to retry through the backlog.
    Backlogged,
    Discarded,
    /// Filtered out before reaching the service.
    Skipped,
    Failed,
}

pub struct Scrobbler {
    api: Arc<dyn TrackerApi>,
    cleaner: Arc<BacklogCleaner>,
    filter: ScrobbleFilter,
    completion_threshold: f64,
    events: Sender<SupervisorEvent>,
}

impl Scrobbler {
    pub fn new(
        api: Arc<dyn TrackerApi>,
        cleaner: Arc<BacklogCleaner>,
        filter: ScrobbleFilter,
        completion_threshold: f64,
        events: Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            api,
            cleaner,
            filter,
            completion_threshold,
            events,
        }
    }

    /// Drains the queue until every sender is gone.
    pub fn run(self, queue: DeliveryReceiver) {
        info!("Started scrobbler thread");
        for item in queue.iter() {
            self.scrobble(&item);
        }
        info!("Delivery queue closed, scrobbler stopping");
    }

    pub fn spawn(self, queue: DeliveryReceiver) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("scrobbler".to_string())
            .spawn(move || self.run(queue))
    }

    pub fn scrobble(&self, item: &DeliveryItem) -> Delivery {
        let DeliveryItem { verb, snapshot } = item;
        let media = &snapshot.media_info;
        if !self.filter.media_types.contains(&media.kind()) {
            debug!(media = %media, kind = media.kind().as_str(), "Media type not enabled, skipping");
            return Delivery::Skipped;
        }
        if *verb == Verb::Pause && snapshot.progress < self.filter.min_pause_progress {
            debug!(media = %media, progress = snapshot.progress, "Pause too early to scrobble");
            return Delivery::Skipped;
        }

        debug!(%verb, progress = snapshot.progress, media = %media, "Scrobbling");
        match self.api.scrobble(*verb, media, snapshot.progress) {
            Ok(ScrobbleOutcome::Confirmed(confirmation)) => {
                info!(
                    action = %confirmation.action,
                    progress = confirmation.progress,
                    "Scrobble {verb} successful for {}",
                    confirmation.item
                );
                self.cleaner.clear_in_background();
                Delivery::Confirmed(confirmation)
            }
            Ok(ScrobbleOutcome::Discarded(reason)) => {
                warn!(%verb, media = %media, "Scrobble unsuccessful: {reason}");
                Delivery::Discarded
            }
            Err(err) => {
                if err.is_fatal() {
                    error!("Scrobbling disabled: {err}");
                    let _ = self.events.send(SupervisorEvent::Fatal(err.to_string()));
                }
                if *verb == Verb::Stop && snapshot.progress > self.completion_threshold {
                    warn!(media = %media, "Scrobble unsuccessful, will try again later: {err}");
                    match self.cleaner.add(snapshot) {
                        Ok(()) => Delivery::Backlogged,
                        Err(backlog_err) => {
                            error!(media = %media, "Could not save to backlog: {backlog_err}");
                            Delivery::Failed
                        }
                    }
                } else {
                    warn!(%verb, media = %media, "Scrobble unsuccessful: {err}");
                    Delivery::Failed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::api::testing::{FakeTracker, Reply};
    use crate::backlog::BacklogStore;
    use crate::media::{MediaDescriptor, MediaKind, PlaybackState, StatusSnapshot};
    use crate::queue::delivery_queue;

    struct Harness {
        _dir: tempfile::TempDir,
        api: Arc<FakeTracker>,
        store: Arc<BacklogStore>,
        scrobbler: Scrobbler,
        events: crossbeam_channel::Receiver<SupervisorEvent>,
    }

    fn harness(reply: Reply, filter: ScrobbleFilter) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BacklogStore::open(dir.path()).unwrap());
        let api = Arc::new(FakeTracker::new(reply));
        let shared: Arc<dyn TrackerApi> = api.clone();
        let cleaner = BacklogCleaner::new(
            Arc::clone(&store),
            Arc::clone(&shared),
            Duration::from_secs(600),
        );
        let (tx, events) = crossbeam_channel::unbounded();
        let scrobbler = Scrobbler::new(shared, cleaner, filter, 80.0, tx);
        Harness {
            _dir: dir,
            api,
            store,
            scrobbler,
            events,
        }
    }

    fn item(verb: Verb, media: MediaDescriptor, progress: f64) -> DeliveryItem {
        let state = match verb {
            Verb::Start => PlaybackState::Playing,
            Verb::Pause => PlaybackState::Paused,
            Verb::Stop => PlaybackState::Stopped,
        };
        DeliveryItem::new(verb, StatusSnapshot::new(state, progress, media, Utc::now()))
    }

    fn backlog_len(harness: &Harness) -> usize {
        harness.store.read().unwrap().len()
    }

    #[test]
    fn failed_stop_past_threshold_is_backlogged() {
        let h = harness(Reply::Fail, ScrobbleFilter::default());
        let outcome = h
            .scrobbler
            .scrobble(&item(Verb::Stop, MediaDescriptor::movie("Heat", Some(1995)), 85.0));
        assert_eq!(outcome, Delivery::Backlogged);
        let backlog = h.store.read().unwrap();
        assert_eq!(backlog.movies["Heat1995"].watch.progress, 85.0);
    }

    #[test]
    fn failed_stop_below_threshold_is_dropped() {
        let h = harness(Reply::Fail, ScrobbleFilter::default());
        let outcome = h
            .scrobbler
            .scrobble(&item(Verb::Stop, MediaDescriptor::movie("Heat", Some(1995)), 50.0));
        assert_eq!(outcome, Delivery::Failed);
        assert_eq!(backlog_len(&h), 0);
    }

    #[test]
    fn failed_pause_is_not_backlogged() {
        let h = harness(Reply::Fail, ScrobbleFilter::default());
        let outcome = h
            .scrobbler
            .scrobble(&item(Verb::Pause, MediaDescriptor::episode("Dark", None, 1, 1), 95.0));
        assert_eq!(outcome, Delivery::Failed);
        assert_eq!(backlog_len(&h), 0);
    }

    #[test]
    fn discarded_stop_is_never_backlogged() {
        let h = harness(Reply::Discard, ScrobbleFilter::default());
        let outcome = h
            .scrobbler
            .scrobble(&item(Verb::Stop, MediaDescriptor::movie("Heat", Some(1995)), 99.0));
        assert_eq!(outcome, Delivery::Discarded);
        assert_eq!(backlog_len(&h), 0);
    }

    #[test]
    fn confirmed_scrobble_reports_item() {
        let h = harness(Reply::Confirm, ScrobbleFilter::default());
        let outcome = h
            .scrobbler
            .scrobble(&item(Verb::Start, MediaDescriptor::episode("Dark", None, 2, 7), 3.0));
        let Delivery::Confirmed(confirmation) = outcome else {
            panic!("expected confirmation, got {outcome:?}");
        };
        assert_eq!(confirmation.item, "Dark S02E07");
        assert_eq!(h.api.scrobbles.lock().len(), 1);
    }

    #[test]
    fn low_progress_pause_is_skipped() {
        let h = harness(Reply::Confirm, ScrobbleFilter::default());
        let outcome = h
            .scrobbler
            .scrobble(&item(Verb::Pause, MediaDescriptor::movie("Heat", Some(1995)), 0.5));
        assert_eq!(outcome, Delivery::Skipped);
        assert!(h.api.scrobbles.lock().is_empty());
    }

    #[test]
    fn disabled_media_type_is_skipped() {
        let filter = ScrobbleFilter {
            media_types: vec![MediaKind::Movie],
            ..ScrobbleFilter::default()
        };
        let h = harness(Reply::Confirm, filter);
        let outcome = h
            .scrobbler
            .scrobble(&item(Verb::Start, MediaDescriptor::episode("Dark", None, 1, 1), 10.0));
        assert_eq!(outcome, Delivery::Skipped);
        assert!(h.api.scrobbles.lock().is_empty());
    }

    #[test]
    fn unauthorized_is_reported_and_still_backlogged() {
        let h = harness(Reply::Unauthorized, ScrobbleFilter::default());
        let outcome = h
            .scrobbler
            .scrobble(&item(Verb::Stop, MediaDescriptor::movie("Heat", Some(1995)), 97.0));
        assert_eq!(outcome, Delivery::Backlogged);
        assert!(matches!(h.events.try_recv(), Ok(SupervisorEvent::Fatal(_))));
    }

    #[test]
    fn run_delivers_in_order_until_queue_closes() {
        let h = harness(Reply::Confirm, ScrobbleFilter::default());
        let api = Arc::clone(&h.api);
        let (tx, rx) = delivery_queue();
        tx.send(item(Verb::Start, MediaDescriptor::movie("Heat", Some(1995)), 10.0))
            .unwrap();
        tx.send(item(Verb::Pause, MediaDescriptor::movie("Heat", Some(1995)), 40.0))
            .unwrap();
        drop(tx);

        let handle = h.scrobbler.spawn(rx).unwrap();
        handle.join().unwrap();
        let verbs: Vec<Verb> = api.scrobbles.lock().iter().map(|(verb, _, _)| *verb).collect();
        assert_eq!(verbs, vec![Verb::Start, Verb::Pause]);
    }
}

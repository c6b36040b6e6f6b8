use std::cell::OnceCell;

use crate::media::{PlaybackState, StatusSnapshot};

/// Facts derived from two consecutive snapshots of the same source.
#[derive(Debug)]
pub struct Transition<'a> {
    prev: &'a StatusSnapshot,
    current: &'a StatusSnapshot,
    same_media: OnceCell<bool>,
}

impl<'a> Transition<'a> {
    pub fn new(prev: &'a StatusSnapshot, current: &'a StatusSnapshot) -> Self {
        Self {
            prev,
            current,
            same_media: OnceCell::new(),
        }
    }

    pub fn is_same_media(&self) -> bool {
        *self
            .same_media
            .get_or_init(|| self.prev.media_info == self.current.media_info)
    }

    pub fn state_changed(&self) -> bool {
        self.prev.state != self.current.state
    }

    pub fn is_state_jump(&self, from: PlaybackState, to: PlaybackState) -> bool {
        self.prev.state == from && self.current.state == to
    }

    pub fn from_playing_to_paused(&self) -> bool {
        self.is_state_jump(PlaybackState::Playing, PlaybackState::Paused)
    }

    /// Wall-clock seconds between the two observations.
    pub fn elapsed_realtime(&self) -> f64 {
        let elapsed = self.current.updated_at - self.prev.updated_at;
        elapsed.num_microseconds().map_or_else(
            || elapsed.num_milliseconds() as f64 / 1_000.0,
            |micros| micros as f64 / 1_000_000.0,
        )
    }

    pub fn progress_delta(&self) -> f64 {
        self.current.progress - self.prev.progress
    }

    pub fn abs_progress_delta(&self) -> f64 {
        self.progress_delta().abs()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::media::MediaDescriptor;

    fn snapshot(state: PlaybackState, progress: f64, secs: i64, title: &str) -> StatusSnapshot {
        StatusSnapshot::new(
            state,
            progress,
            MediaDescriptor::episode(title, None, 1, 1),
            Utc.timestamp_opt(secs, 500_000_000).unwrap(),
        )
    }

    #[test]
    fn derives_facts_from_both_snapshots() {
        let prev = snapshot(PlaybackState::Playing, 40.0, 10, "Dark");
        let current = snapshot(PlaybackState::Paused, 35.5, 12, "Dark");
        let transition = Transition::new(&prev, &current);

        assert!(transition.is_same_media());
        assert!(transition.state_changed());
        assert!(transition.from_playing_to_paused());
        assert_eq!(transition.elapsed_realtime(), 2.0);
        assert_eq!(transition.progress_delta(), -4.5);
        assert_eq!(transition.abs_progress_delta(), 4.5);
    }

    #[test]
    fn different_titles_are_different_media() {
        let prev = snapshot(PlaybackState::Playing, 40.0, 10, "Dark");
        let current = snapshot(PlaybackState::Playing, 40.0, 10, "Lost");
        let transition = Transition::new(&prev, &current);

        assert!(!transition.is_same_media());
        assert!(!transition.state_changed());
        assert!(!transition.from_playing_to_paused());
    }
}

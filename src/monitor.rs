//! Per-source state machine turning consecutive player snapshots into
//! scrobble actions.
//!
//! A source is in one of three modes. `Normal` scrobbles every meaningful
//! change right away. `Preview` is entered when playback is first seen past
//! the preview threshold and holds the scrobble back until the preview timer
//! runs out. `FastPause` is entered when a pause follows play suspiciously
//! fast; the next resume is committed only after the fast-pause timer runs out.
//!
//! Timer callbacks and the polling loop both mutate the same [`MonitorState`],
//! so every step happens under one lock. Deferred commits take the buffered
//! snapshot out of the state, which makes a second commit send nothing, and
//! carry the epoch they were armed in so a callback from an older deferral
//! cannot flush a newer one.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::MonitorSettings;
use crate::media::{PlaybackState, StatusSnapshot, Verb};
use crate::queue::{DeliveryItem, DeliverySender};
use crate::timer::ResumableTimer;
use crate::transition::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Normal,
    Preview,
    FastPause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Scrobble,
    StopPrevious,
    EnterPreview,
    PausePreview,
    ResumePreview,
    ExitPreview,
    EnterFastPause,
    ClearBuf,
    DelayedPlay,
    ExitFastPause,
    InvalidState,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Scrobble => "scrobble",
            Action::StopPrevious => "stop_previous",
            Action::EnterPreview => "enter_preview",
            Action::PausePreview => "pause_preview",
            Action::ResumePreview => "resume_preview",
            Action::ExitPreview => "exit_preview",
            Action::EnterFastPause => "enter_fast_pause",
            Action::ClearBuf => "clear_buf",
            Action::DelayedPlay => "delayed_play",
            Action::ExitFastPause => "exit_fast_pause",
            Action::InvalidState => "invalid_state",
        }
    }
}

/// Ordered actions for the step from `prev` to `current` while in `mode`.
pub fn decide_action(
    settings: &MonitorSettings,
    mode: Mode,
    prev: Option<&StatusSnapshot>,
    current: Option<&StatusSnapshot>,
) -> Vec<Action> {
    let mut actions = Vec::new();
    let transition = match (prev, current) {
        (None, None) => return actions,
        (Some(prev), Some(current)) => Some(Transition::new(prev, current)),
        _ => None,
    };

    let media_boundary = match (&transition, prev) {
        (Some(transition), Some(prev)) => {
            !transition.is_same_media() || prev.state == PlaybackState::Stopped
        }
        _ => true,
    };

    if media_boundary {
        if mode == Mode::Preview {
            actions.push(Action::ExitPreview);
        } else if prev.is_some_and(|prev| prev.state != PlaybackState::Stopped) {
            actions.push(Action::StopPrevious);
        }
        if mode == Mode::FastPause {
            actions.push(Action::ExitFastPause);
        }
        if let Some(current) = current {
            let fresh = transition.as_ref().is_none_or(|transition| {
                !transition.is_same_media()
                    || transition.state_changed()
                    || transition.abs_progress_delta() > settings.skip_interval
            });
            if current.progress > settings.preview_threshold {
                actions.push(Action::EnterPreview);
            } else if fresh {
                actions.push(Action::Scrobble);
            }
        }
        return actions;
    }

    let (Some(transition), Some(current)) = (transition, current) else {
        return actions;
    };
    if !transition.state_changed() && transition.abs_progress_delta() <= settings.skip_interval {
        return actions;
    }

    match mode {
        Mode::Preview => actions.push(if current.state == PlaybackState::Stopped {
            Action::ExitPreview
        } else if transition.from_playing_to_paused() {
            Action::PausePreview
        } else if current.state == PlaybackState::Playing {
            Action::ResumePreview
        } else {
            Action::InvalidState
        }),
        Mode::FastPause => {
            if current.state == PlaybackState::Stopped
                || transition.abs_progress_delta() > settings.skip_interval
            {
                actions.push(Action::Scrobble);
                actions.push(Action::ExitFastPause);
            } else if current.state == PlaybackState::Paused {
                actions.push(Action::ClearBuf);
            } else if current.state == PlaybackState::Playing {
                actions.push(Action::DelayedPlay);
            }
        }
        Mode::Normal => {
            actions.push(Action::Scrobble);
            if transition.from_playing_to_paused()
                && transition.elapsed_realtime() < settings.fast_pause_threshold
            {
                actions.push(Action::EnterFastPause);
            }
        }
    }
    actions
}

#[derive(Debug, Default)]
pub struct MonitorState {
    mode: Mode,
    buffer: Option<StatusSnapshot>,
    prev: Option<StatusSnapshot>,
    preview_timer: Option<ResumableTimer>,
    fast_pause_timer: Option<ResumableTimer>,
    epoch: u64,
}

impl MonitorState {
    #[cfg(test)]
    pub fn buffer(&self) -> Option<&StatusSnapshot> {
        self.buffer.as_ref()
    }

    fn exit_preview(&mut self) {
        if self.mode == Mode::Preview {
            debug!("Exiting preview");
            self.mode = Mode::Normal;
            self.buffer = None;
            self.epoch += 1;
            cancel_timer(&mut self.preview_timer);
        }
    }

    fn exit_fast_pause(&mut self) {
        if self.mode == Mode::FastPause {
            debug!("Exiting fast pause");
            self.mode = Mode::Normal;
            self.buffer = None;
            self.epoch += 1;
            cancel_timer(&mut self.fast_pause_timer);
        }
    }

    fn cancel_timers(&mut self) {
        self.epoch += 1;
        cancel_timer(&mut self.preview_timer);
        cancel_timer(&mut self.fast_pause_timer);
    }
}

fn cancel_timer(slot: &mut Option<ResumableTimer>) {
    if let Some(timer) = slot.take() {
        timer.cancel();
    }
}

#[derive(Debug, Clone, Copy)]
enum Deferral {
    Preview,
    FastPause,
}

/// State machine for one monitored player.
#[derive(Debug)]
pub struct Monitor {
    name: String,
    settings: MonitorSettings,
    queue: DeliverySender,
    state: Arc<Mutex<MonitorState>>,
}

impl Monitor {
    pub fn new(name: impl Into<String>, settings: MonitorSettings, queue: DeliverySender) -> Self {
        let name = name.into();
        info!(source = %name, "Started monitor");
        Self {
            name,
            settings,
            queue,
            state: Arc::new(Mutex::new(MonitorState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    /// Feeds one poll result through the state machine. `None` means nothing
    /// is playing.
    pub fn handle_status_update(&self, current: Option<StatusSnapshot>) {
        let mut state = self.state.lock();
        let prev = state.prev.take();
        let actions = decide_action(&self.settings, state.mode, prev.as_ref(), current.as_ref());
        for action in actions {
            debug!(source = %self.name, action = action.as_str());
            self.apply(&mut state, action, prev.as_ref(), current.as_ref());
        }
        state.prev = current;
    }

    /// Cancels outstanding deferrals without committing them.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.cancel_timers();
        state.buffer = None;
        state.mode = Mode::Normal;
    }

    fn apply(
        &self,
        state: &mut MonitorState,
        action: Action,
        prev: Option<&StatusSnapshot>,
        current: Option<&StatusSnapshot>,
    ) {
        match action {
            Action::Scrobble => {
                if let Some(current) = current {
                    push(&self.queue, &self.name, DeliveryItem::for_state(current.clone()));
                }
            }
            Action::StopPrevious => {
                if let Some(prev) = prev {
                    push(&self.queue, &self.name, DeliveryItem::new(Verb::Stop, prev.clone()));
                }
            }
            Action::ExitPreview => state.exit_preview(),
            Action::EnterPreview => {
                if state.mode != Mode::Normal || state.buffer.is_some() {
                    warn!(source = %self.name, mode = ?state.mode, "Entering preview from unexpected state");
                    state.cancel_timers();
                }
                state.mode = Mode::Preview;
                state.buffer = current.cloned();
                let timer = self.deferred_commit(state, Deferral::Preview);
                timer.start();
                state.preview_timer = Some(timer);
            }
            Action::PausePreview => {
                state.buffer = current.cloned();
                if let Some(timer) = &state.preview_timer {
                    timer.pause();
                }
            }
            Action::ResumePreview => {
                state.buffer = current.cloned();
                if let Some(timer) = &state.preview_timer {
                    timer.resume();
                }
            }
            Action::EnterFastPause => {
                if state.mode != Mode::Normal {
                    warn!(source = %self.name, mode = ?state.mode, "Entering fast pause from unexpected state");
                }
                state.mode = Mode::FastPause;
            }
            Action::ClearBuf => {
                state.epoch += 1;
                cancel_timer(&mut state.fast_pause_timer);
                state.buffer = None;
            }
            Action::DelayedPlay => {
                cancel_timer(&mut state.fast_pause_timer);
                state.buffer = current.cloned();
                let timer = self.deferred_commit(state, Deferral::FastPause);
                timer.start();
                state.fast_pause_timer = Some(timer);
            }
            Action::ExitFastPause => state.exit_fast_pause(),
            Action::InvalidState => {
                warn!(source = %self.name, mode = ?state.mode, "Invalid state transition; ignoring");
            }
        }
    }

    /// Timer that, when it runs out, flushes the buffered snapshot and leaves
    /// the deferral it was armed for.
    fn deferred_commit(&self, state: &mut MonitorState, deferral: Deferral) -> ResumableTimer {
        state.epoch += 1;
        let epoch = state.epoch;
        let shared: Weak<Mutex<MonitorState>> = Arc::downgrade(&self.state);
        let queue = self.queue.clone();
        let name = self.name.clone();
        let (label, delay) = match deferral {
            Deferral::Preview => ("preview", self.settings.preview_delay()),
            Deferral::FastPause => ("fast-pause", self.settings.fast_pause_delay()),
        };

        ResumableTimer::new(label, delay, move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut state = shared.lock();
            if state.epoch != epoch {
                debug!(source = %name, "Dropping stale {label} commit");
                return;
            }
            debug!(source = %name, "Delayed scrobble");
            if let Some(buffered) = state.buffer.take() {
                push(&queue, &name, DeliveryItem::for_state(buffered));
            }
            match deferral {
                Deferral::Preview => state.exit_preview(),
                Deferral::FastPause => state.exit_fast_pause(),
            }
        })
    }

    #[cfg(test)]
    fn with_state<T>(&self, f: impl FnOnce(&MonitorState) -> T) -> T {
        f(&self.state.lock())
    }
}

fn push(queue: &DeliverySender, source: &str, item: DeliveryItem) {
    debug!(
        source,
        verb = %item.verb,
        progress = item.snapshot.progress,
        media = %item.snapshot.media_info,
        "Queueing scrobble"
    );
    if queue.send(item).is_err() {
        warn!(source, "Delivery queue closed; dropping scrobble");
    }
}

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::error;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// One-shot countdown that can be paused and resumed.
///
/// Each arming spawns a short-lived thread that waits on a channel with a
/// deadline. Dropping the sender held in `Phase::Running` wakes that thread
/// without firing, which is how pause and cancel disarm it. A generation
/// counter makes sure a thread from an older arming can never fire.
pub struct ResumableTimer {
    label: &'static str,
    inner: Arc<Mutex<TimerInner>>,
    callback: Callback,
}

struct TimerInner {
    remaining: Duration,
    generation: u64,
    phase: Phase,
}

enum Phase {
    Idle,
    Running {
        started_at: Instant,
        _disarm: Sender<()>,
    },
    Paused,
    Done,
}

impl ResumableTimer {
    pub fn new<F>(label: &'static str, timeout: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            label,
            inner: Arc::new(Mutex::new(TimerInner {
                remaining: timeout,
                generation: 0,
                phase: Phase::Idle,
            })),
            callback: Arc::new(callback),
        }
    }

    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.phase, Phase::Idle) {
            self.arm(&mut inner);
        }
    }

    /// Stops the clock, keeping the time left. No-op unless running.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if let Phase::Running { started_at, .. } = inner.phase {
            inner.remaining = inner.remaining.saturating_sub(started_at.elapsed());
            inner.generation += 1;
            inner.phase = Phase::Paused;
        }
    }

    /// Re-arms with the remaining time. No-op unless paused.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.phase, Phase::Paused) {
            self.arm(&mut inner);
        }
    }

    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.phase = Phase::Done;
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        matches!(self.inner.lock().phase, Phase::Running { .. })
    }

    #[cfg(test)]
    pub fn is_paused(&self) -> bool {
        matches!(self.inner.lock().phase, Phase::Paused)
    }

    pub fn remaining(&self) -> Duration {
        let inner = self.inner.lock();
        match inner.phase {
            Phase::Running { started_at, .. } => {
                inner.remaining.saturating_sub(started_at.elapsed())
            }
            Phase::Done => Duration::ZERO,
            Phase::Idle | Phase::Paused => inner.remaining,
        }
    }

    fn arm(&self, inner: &mut TimerInner) {
        inner.generation += 1;
        let generation = inner.generation;
        let timeout = inner.remaining;
        let (disarm, disarmed) = crossbeam_channel::bounded::<()>(0);
        let shared = Arc::clone(&self.inner);
        let callback = Arc::clone(&self.callback);

        let spawned = thread::Builder::new()
            .name(format!("{}-timer", self.label))
            .spawn(move || {
                if !matches!(disarmed.recv_timeout(timeout), Err(RecvTimeoutError::Timeout)) {
                    return;
                }
                let fire = {
                    let mut inner = shared.lock();
                    if inner.generation == generation
                        && matches!(inner.phase, Phase::Running { .. })
                    {
                        inner.phase = Phase::Done;
                        true
                    } else {
                        false
                    }
                };
                if fire {
                    callback();
                }
            });

        match spawned {
            Ok(_) => {
                inner.phase = Phase::Running {
                    started_at: Instant::now(),
                    _disarm: disarm,
                };
            }
            Err(err) => {
                error!(timer = self.label, "Failed spawning timer thread: {err}");
                inner.phase = Phase::Done;
            }
        }
    }
}

impl Drop for ResumableTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for ResumableTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableTimer")
            .field("label", &self.label)
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crossbeam_channel::Receiver;

    use super::*;

    fn channel_timer(timeout: Duration) -> (ResumableTimer, Receiver<Instant>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let timer = ResumableTimer::new("test", timeout, move || {
            let _ = tx.send(Instant::now());
        });
        (timer, rx)
    }

    #[test]
    fn fires_once_after_timeout() {
        let (timer, fired) = channel_timer(Duration::from_millis(30));
        let started = Instant::now();
        timer.start();
        let at = fired.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(at - started >= Duration::from_millis(30));
        assert!(fired.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!timer.is_running());
    }

    #[test]
    fn pause_then_resume_waits_for_remaining_time() {
        let (timer, fired) = channel_timer(Duration::from_millis(200));
        timer.start();
        thread::sleep(Duration::from_millis(50));
        timer.pause();
        let left = timer.remaining();
        assert!(left <= Duration::from_millis(150));

        thread::sleep(Duration::from_millis(250));
        assert!(fired.try_recv().is_err());

        let resumed = Instant::now();
        timer.resume();
        let at = fired.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(at - resumed >= left);
    }

    #[test]
    fn second_pause_is_noop() {
        let (timer, _fired) = channel_timer(Duration::from_millis(500));
        timer.start();
        thread::sleep(Duration::from_millis(20));
        timer.pause();
        let left = timer.remaining();
        thread::sleep(Duration::from_millis(20));
        timer.pause();
        assert_eq!(timer.remaining(), left);
        assert!(timer.is_paused());
    }

    #[test]
    fn resume_while_running_is_noop() {
        let (timer, fired) = channel_timer(Duration::from_millis(40));
        timer.start();
        timer.resume();
        fired.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn cancel_after_pause_never_fires() {
        let (timer, fired) = channel_timer(Duration::from_millis(30));
        timer.start();
        timer.pause();
        timer.cancel();
        timer.resume();
        assert!(fired.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn cancel_is_safe_on_unstarted_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let timer = ResumableTimer::new("test", Duration::from_millis(10), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        timer.cancel();
        timer.start();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

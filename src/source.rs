use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::adapter::StatusAdapter;
use crate::error::AdapterError;
use crate::monitor::Monitor;

/// One polled player: its adapter feeding its monitor.
pub struct Source {
    adapter: Box<dyn StatusAdapter>,
    monitor: Monitor,
}

impl Source {
    pub fn new(adapter: Box<dyn StatusAdapter>, monitor: Monitor) -> Self {
        Self { adapter, monitor }
    }

    pub fn name(&self) -> &str {
        self.monitor.name()
    }

    /// Polls until `shutdown` fires or disconnects. Only a fatal adapter
    /// error ends the loop early.
    pub fn run(mut self, shutdown: &Receiver<()>) -> Result<(), AdapterError> {
        if !self.adapter.can_connect() {
            info!(source = self.name(), "Player not reachable yet, will keep polling");
        }
        let interval = self.adapter.poll_interval();
        let result = loop {
            match self.adapter.poll() {
                Ok(snapshot) => self.monitor.handle_status_update(snapshot),
                Err(err) if err.is_fatal() => break Err(err),
                Err(AdapterError::Unreachable(reason)) => {
                    debug!(source = self.name(), "Unable to connect: {reason}");
                    self.monitor.handle_status_update(None);
                }
                Err(err) => warn!(source = self.name(), "Skipping poll: {err}"),
            }
            match shutdown.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break Ok(()),
            }
        };
        self.monitor.shutdown();
        result
    }
}

//! Wires sources, the scrobbler thread and the backlog cleaner together and
//! watches them until there is nothing left to monitor.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::adapter::{StatusAdapter, build_adapter};
use crate::api::TrackerApi;
use crate::backlog::{BacklogCleaner, BacklogStore};
use crate::config::Config;
use crate::monitor::Monitor;
use crate::queue::delivery_queue;
use crate::scrobbler::Scrobbler;
use crate::source::Source;
use crate::trakt::TraktClient;

#[derive(Debug)]
pub enum SupervisorEvent {
    SourceExited {
        name: String,
        result: Result<(), String>,
    },
    /// Unrecoverable error; the whole service stops.
    Fatal(String),
}

pub struct Supervisor {
    cleaner: Arc<BacklogCleaner>,
    scrobbler: Option<JoinHandle<()>>,
    sources: Vec<(String, JoinHandle<()>)>,
    shutdown: Option<Sender<()>>,
    events: Receiver<SupervisorEvent>,
}

/// Builds one adapter per monitored player.
pub fn build_adapters(config: &Config) -> Result<Vec<Box<dyn StatusAdapter>>> {
    if config.players.monitored.is_empty() {
        bail!("No players to monitor; add player names to players.monitored");
    }
    config
        .players
        .monitored
        .iter()
        .map(|name| build_adapter(name, config.player(name)?))
        .collect()
}

/// Runs the service until every source is gone or a fatal error occurs.
pub fn run(config: &Config, data_dir: &Path) -> Result<()> {
    let adapters = build_adapters(config)?;
    let store = Arc::new(BacklogStore::open(data_dir)?);
    let api: Arc<dyn TrackerApi> = Arc::new(TraktClient::new(&config.trakt, data_dir)?);
    Supervisor::launch(config, api, store, adapters)?.wait()
}

impl Supervisor {
    pub fn launch(
        config: &Config,
        api: Arc<dyn TrackerApi>,
        store: Arc<BacklogStore>,
        adapters: Vec<Box<dyn StatusAdapter>>,
    ) -> Result<Self> {
        Self::launch_with(config, api, store, adapters, spawn_source)
    }

    /// Anything started before a failure is stopped again before returning.
    fn launch_with<S>(
        config: &Config,
        api: Arc<dyn TrackerApi>,
        store: Arc<BacklogStore>,
        adapters: Vec<Box<dyn StatusAdapter>>,
        spawn: S,
    ) -> Result<Self>
    where
        S: Fn(Source, Receiver<()>, Sender<SupervisorEvent>) -> io::Result<JoinHandle<()>>,
    {
        let (events_tx, events) = crossbeam_channel::unbounded();
        let cleaner = BacklogCleaner::new(store, Arc::clone(&api), config.backlog.clear_interval());
        cleaner.start();

        let (queue, deliveries) = delivery_queue();
        let spawned = Scrobbler::new(
            api,
            Arc::clone(&cleaner),
            config.filters.clone(),
            config.backlog.completion_threshold,
            events_tx.clone(),
        )
        .spawn(deliveries);
        let scrobbler = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                cleaner.shutdown();
                return Err(err).context("Failed spawning scrobbler thread");
            }
        };

        let (shutdown, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let mut supervisor = Self {
            cleaner,
            scrobbler: Some(scrobbler),
            sources: Vec::with_capacity(adapters.len()),
            shutdown: Some(shutdown),
            events,
        };
        for adapter in adapters {
            let name = adapter.name().to_string();
            let monitor = Monitor::new(name.clone(), config.monitor_settings(&name), queue.clone());
            let source = Source::new(adapter, monitor);
            match spawn(source, shutdown_rx.clone(), events_tx.clone()) {
                Ok(handle) => supervisor.sources.push((name, handle)),
                Err(err) => {
                    // The scrobbler only exits once every queue sender is gone.
                    drop(queue);
                    drop(supervisor);
                    return Err(err)
                        .with_context(|| format!("Failed spawning source thread for {name}"));
                }
            }
        }

        Ok(supervisor)
    }

    pub fn wait(mut self) -> Result<()> {
        let mut remaining = self.sources.len();
        let mut fatal = None;
        while remaining > 0 {
            match self.events.recv() {
                Ok(SupervisorEvent::SourceExited { name, result }) => {
                    remaining -= 1;
                    match result {
                        Ok(()) => info!(source = %name, "Source stopped"),
                        Err(reason) => error!(source = %name, "Source exited: {reason}"),
                    }
                }
                Ok(SupervisorEvent::Fatal(reason)) => {
                    fatal = Some(reason);
                    break;
                }
                Err(_) => break,
            }
        }
        if remaining == 0 {
            info!("No sources left to monitor");
        }
        self.stop();
        match fatal {
            Some(reason) => bail!("Stopped after fatal error: {reason}"),
            None => Ok(()),
        }
    }

    /// Stops sources first so their monitors cancel pending timers, then the
    /// backlog timer, then lets the scrobbler drain the closed queue.
    fn stop(&mut self) {
        drop(self.shutdown.take());
        for (name, handle) in self.sources.drain(..) {
            if handle.join().is_err() {
                warn!(source = %name, "Source thread panicked during shutdown");
            }
        }
        self.cleaner.shutdown();
        if let Some(handle) = self.scrobbler.take() {
            if handle.join().is_err() {
                error!("Scrobbler thread panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_source(
    source: Source,
    shutdown: Receiver<()>,
    events: Sender<SupervisorEvent>,
) -> io::Result<JoinHandle<()>> {
    let name = source.name().to_string();
    thread::Builder::new()
        .name(format!("source-{name}"))
        .spawn(move || {
            let result = match panic::catch_unwind(AssertUnwindSafe(|| source.run(&shutdown))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
            };
            let _ = events.send(SupervisorEvent::SourceExited { name, result });
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

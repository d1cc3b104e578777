//! The shared discovery connection.
//!
//! One worker thread per connection owns every backend handle, subscription
//! and piece of browser state. Everything else talks to it through a command
//! channel and wakes it via [`Backend::stop_connection`].

pub(crate) mod flow;
pub(crate) mod routes;
pub mod status;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use parking_lot::Mutex;
use shared::types::{ErrorMessage, InterfaceId};
use tracing::{debug, info, warn};
use crate::backend::{Backend, BackendChain, BackendDescriptor, ConnectionHandle};
use crate::browser::state::BrowserState;
use crate::browser::BrowserId;
use crate::error::{DiscoveryError, Result};
use status::StatusCell;
use worker::Worker;

pub use status::ConnectionStatus;

/// Requests sent from handles to the worker
pub(crate) enum Command {
    AddBrowser(Box<BrowserState>),
    RemoveBrowser(BrowserId),
    StartBrowsing { id: BrowserId, interface: InterfaceId },
    StopBrowsing(BrowserId),
    TriggerRefresh(BrowserId),
    Reconfirm { id: BrowserId, full_name: String },
    Stop,
}

/// Tuning of the worker loop
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Consecutive processing errors tolerated before the connection stops
    pub max_consecutive_errors: u32,

    /// Longest single wait for backend activity
    pub poll_ceiling: Duration,

    /// How long to wait for replies a backend promised with "more coming"
    pub more_coming_grace: Duration,

    /// Pending changes after which a reconciliation runs even mid-burst
    pub flush_threshold: usize,

    /// Pause after a daemon start or a transient liveness check failure
    pub retry_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 10,
            poll_ceiling: Duration::from_secs(5),
            more_coming_grace: Duration::from_millis(100),
            flush_threshold: 50,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// State shared between the worker and the handles
pub(crate) struct ConnectionShared {
    pub status: StatusCell,
    pub history: Mutex<Vec<ErrorMessage>>,
    pub failed: AtomicBool,

    /// Backend and native handle in use, for waking the worker
    pub active: Mutex<Option<(Arc<dyn Backend>, ConnectionHandle)>>,
}

impl ConnectionShared {
    fn new() -> Self {
        Self {
            status: StatusCell::new(),
            history: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }
}

pub struct Connection {
    shared: Arc<ConnectionShared>,
    commands: flume::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Connection {
    /// Spawns the worker, which walks `chain` until one backend answers.
    pub fn spawn(chain: Vec<BackendDescriptor>, settings: ConnectionSettings) -> Result<Self> {
        let shared = Arc::new(ConnectionShared::new());
        let (tx, rx) = flume::unbounded();
        let worker = Worker::new(shared.clone(), rx, BackendChain::new(chain), settings);

        let handle = thread::Builder::new()
            .name("service-watchd-worker".to_string())
            .spawn(move || worker.run())
            .map_err(DiscoveryError::WorkerSpawn)?;
        let worker_id = handle.thread().id();
        debug!("Spawned discovery worker");

        Ok(Self {
            shared,
            commands: tx,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.get()
    }

    /// Blocks until the status reaches `target` or `timeout` elapses.
    pub fn wait_for(&self, target: ConnectionStatus, timeout: Duration) -> ConnectionStatus {
        self.shared.status.wait_for(target, timeout)
    }

    pub fn error_history(&self) -> Vec<ErrorMessage> {
        self.shared.history.lock().clone()
    }

    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Hands a browser to the worker. A browser arriving after the
    /// connection stopped gets the error history replayed right away.
    pub(crate) fn add_browser(&self, state: BrowserState) -> Result<()> {
        // The worker flips to Stopped under this lock and drains the channel
        // afterwards, so a browser is never lost between the two.
        let history = self.shared.history.lock();
        if self.status() == ConnectionStatus::Stopped {
            let failed = self.has_failed();
            state.replay(&history, failed);
            return match failed {
                true => Ok(()),
                false => Err(DiscoveryError::ConnectionStopped),
            };
        }
        self.commands
            .send(Command::AddBrowser(Box::new(state)))
            .map_err(|_| DiscoveryError::ConnectionStopped)?;
        drop(history);
        self.wake();
        Ok(())
    }

    pub(crate) fn send(&self, command: Command) -> Result<()> {
        if !self.status().accepts_requests() {
            return Err(DiscoveryError::ConnectionStopped);
        }
        self.commands
            .send(command)
            .map_err(|_| DiscoveryError::ConnectionStopped)?;
        self.wake();
        Ok(())
    }

    fn wake(&self) {
        let active = self.shared.active.lock().clone();
        if let Some((backend, handle)) = active {
            backend.stop_connection(handle);
        }
    }

    /// Asks the worker to shut down; with `wait`, blocks until it has.
    /// Must not be called from the worker thread itself.
    pub fn stop(&self, wait: bool) -> Result<()> {
        if thread::current().id() == self.worker_id {
            return Err(DiscoveryError::StopFromWorker);
        }

        if self.shared.status.advance_to(ConnectionStatus::Stopping) {
            info!("Stopping discovery connection");
        }
        let _ = self.commands.send(Command::Stop);
        self.wake();

        if wait {
            if let Some(handle) = self.worker.lock().take() {
                if handle.join().is_err() {
                    warn!("Discovery worker panicked");
                }
            }
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.status().accepts_requests() {
            debug!("Connection dropped while running, stopping worker");
        }
        self.shared.status.advance_to(ConnectionStatus::Stopping);
        let _ = self.commands.send(Command::Stop);
        self.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_refused_on_worker_thread() {
        let (tx, rx) = flume::unbounded();
        let connection = Connection {
            shared: Arc::new(ConnectionShared::new()),
            commands: tx,
            worker: Mutex::new(None),
            worker_id: thread::current().id(),
        };

        let err = connection.stop(true).unwrap_err();
        assert!(matches!(err, DiscoveryError::StopFromWorker));
        assert_eq!(connection.status(), ConnectionStatus::Starting);
        assert!(rx.is_empty());

        // Any other thread may stop it
        thread::scope(|s| {
            s.spawn(|| connection.stop(false).unwrap());
        });
        assert_eq!(connection.status(), ConnectionStatus::Stopping);
        assert!(matches!(rx.try_recv(), Ok(Command::Stop)));
    }
}

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use serde::Serialize;

/// Lifecycle of a shared connection. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionStatus {
    Starting = 0,
    Started = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionStatus::Starting,
            1 => ConnectionStatus::Started,
            2 => ConnectionStatus::Running,
            3 => ConnectionStatus::Stopping,
            _ => ConnectionStatus::Stopped,
        }
    }

    /// Whether new requests are still accepted
    pub fn accepts_requests(self) -> bool {
        self < ConnectionStatus::Stopping
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Starting => "starting",
            ConnectionStatus::Started => "started",
            ConnectionStatus::Running => "running",
            ConnectionStatus::Stopping => "stopping",
            ConnectionStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Poll interval of [`StatusCell::wait_for`]
const WAIT_STEP: Duration = Duration::from_millis(5);

/// Atomic, monotonic holder of a [`ConnectionStatus`]
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionStatus::Starting as u8))
    }

    pub fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` if it is strictly later than the current status.
    /// Returns whether the transition happened.
    pub fn advance_to(&self, next: ConnectionStatus) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if next as u8 <= current {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Sleeps in short steps until the status reaches `target` or `timeout`
    /// elapses. Returns the status observed last.
    pub fn wait_for(&self, target: ConnectionStatus, timeout: Duration) -> ConnectionStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.get();
            if status >= target || Instant::now() >= deadline {
                return status;
            }
            thread::sleep(WAIT_STEP);
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

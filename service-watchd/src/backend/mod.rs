//! Capability interface implemented by every discovery backend.
//!
//! Backends never call back into the engine. Every asynchronous answer is
//! queued as a [`BackendReply`] tagged with the [`QueryToken`] the engine
//! handed out when issuing the query, and is returned from the next
//! [`Backend::process_one_event_batch`] call on the connection worker.

pub mod chain;
pub mod mdns;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use shared::types::{InterfaceId, Metadata};
use crate::error::BackendError;

pub use chain::{BackendChain, BackendChainFactory, BackendDescriptor};

/// Backend-native connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

/// Identifies one outstanding subscription or query on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryToken(pub u64);

impl fmt::Display for QueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

impl AddressFamily {
    pub fn accepts(self, address: &IpAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::V4 => address.is_ipv4(),
            AddressFamily::V6 => address.is_ipv6(),
        }
    }
}

/// Outcome of one event-processing round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Nothing happened before the wait bound expired
    Idle,
    /// At least one reply was processed
    Ok,
    /// Recoverable processing error
    Error,
    /// The backend connection is broken
    Failure,
    /// The backend asked the worker to quit
    Quit,
}

/// A tagged asynchronous answer from the backend
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub token: QueryToken,

    /// More replies are already queued behind this one
    pub more_coming: bool,

    pub event: ReplyEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    Browse {
        added: bool,
        interface: InterfaceId,
        name: String,
        service_type: String,
        domain: String,
    },
    Resolve {
        interface: InterfaceId,
        host_target: String,
        port: u16,
        metadata: Option<Metadata>,
    },
    Metadata {
        interface: InterfaceId,
        metadata: Metadata,
    },
    Address {
        interface: InterfaceId,
        hostname: String,
        address: IpAddr,
        added: bool,
    },
    Error(BackendError),
}

/// Result of [`Backend::process_one_event_batch`]
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub status: ProcessStatus,
    pub replies: Vec<BackendReply>,
}

impl EventBatch {
    pub fn idle() -> Self {
        Self {
            status: ProcessStatus::Idle,
            replies: Vec::new(),
        }
    }

    pub fn with_status(status: ProcessStatus) -> Self {
        Self {
            status,
            replies: Vec::new(),
        }
    }

    /// Wraps a batch of replies, flagging every reply but the last as
    /// "more coming".
    pub fn from_replies(mut replies: Vec<BackendReply>) -> Self {
        if replies.is_empty() {
            return Self::idle();
        }
        let last = replies.len() - 1;
        for (i, reply) in replies.iter_mut().enumerate() {
            reply.more_coming = i < last;
        }
        Self {
            status: ProcessStatus::Ok,
            replies,
        }
    }
}

/// A concrete discovery implementation.
///
/// All methods take `&self`; implementations keep their own interior state.
/// Apart from [`Backend::stop_connection`], methods taking a handle are only
/// ever called from the connection worker that created it.
pub trait Backend: Send + Sync {
    /// Human readable name used in error reports
    fn name(&self) -> &str;

    /// Lightweight liveness check
    fn get_property(&self, key: &str) -> Result<String, BackendError>;

    fn create_connection(&self) -> Result<ConnectionHandle, BackendError>;

    fn destroy_connection(&self, handle: ConnectionHandle);

    /// Wakes a worker blocked in [`Backend::process_one_event_batch`].
    /// Safe to call from any thread.
    fn stop_connection(&self, handle: ConnectionHandle);

    fn browse(
        &self,
        handle: ConnectionHandle,
        token: QueryToken,
        interface: InterfaceId,
        service_type: &str,
        domain: &str,
    ) -> Result<(), BackendError>;

    #[allow(clippy::too_many_arguments)]
    fn resolve(
        &self,
        handle: ConnectionHandle,
        token: QueryToken,
        interface: InterfaceId,
        family: AddressFamily,
        name: &str,
        service_type: &str,
        domain: &str,
    ) -> Result<(), BackendError>;

    fn query_metadata(
        &self,
        handle: ConnectionHandle,
        token: QueryToken,
        interface: InterfaceId,
        full_name: &str,
    ) -> Result<(), BackendError>;

    fn get_addr_info(
        &self,
        handle: ConnectionHandle,
        token: QueryToken,
        interface: InterfaceId,
        hostname: &str,
    ) -> Result<(), BackendError>;

    /// Releases a browse subscription or query. Unknown tokens are ignored.
    fn cancel(&self, handle: ConnectionHandle, token: QueryToken);

    /// Hints that a cached record is stale. Best effort.
    fn reconfirm_record(
        &self,
        _handle: ConnectionHandle,
        _interface: InterfaceId,
        _name: &str,
        _service_type: &str,
        _domain: &str,
        _full_name: &str,
    ) -> Result<(), BackendError> {
        Err(BackendError::unsupported(format!(
            "{} cannot reconfirm records",
            self.name()
        )))
    }

    /// Waits up to `max_wait` (forever when `None`) for backend activity and
    /// returns every reply that became available.
    fn process_one_event_batch(
        &self,
        handle: ConnectionHandle,
        max_wait: Option<Duration>,
    ) -> EventBatch;

    /// Asks the backend to start its supporting daemon
    fn try_start_daemon(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(n: u64) -> BackendReply {
        BackendReply {
            token: QueryToken(n),
            more_coming: false,
            event: ReplyEvent::Error(BackendError::invalid("x")),
        }
    }

    #[test]
    fn test_batch_flags_all_but_last() {
        let batch = EventBatch::from_replies(vec![reply(1), reply(2), reply(3)]);
        assert_eq!(batch.status, ProcessStatus::Ok);
        let flags: Vec<bool> = batch.replies.iter().map(|r| r.more_coming).collect();
        assert_eq!(flags, vec![true, true, false]);

        assert_eq!(EventBatch::from_replies(Vec::new()).status, ProcessStatus::Idle);
    }

    #[test]
    fn test_family_filter() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        let v6: IpAddr = "fd00::1".parse().unwrap();
        assert!(AddressFamily::Any.accepts(&v4));
        assert!(AddressFamily::V4.accepts(&v4));
        assert!(!AddressFamily::V4.accepts(&v6));
        assert!(AddressFamily::V6.accepts(&v6));
    }
}

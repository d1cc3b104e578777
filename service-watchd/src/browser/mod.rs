//! Browsing subscriptions: "all instances of type T in domain D".
//!
//! A [`Browser`] is a cheap handle that can be used from any thread. Its
//! working state lives on the connection worker (see [`state`]), which is
//! the only place backend replies are processed.

pub(crate) mod gatherer;
pub(crate) mod state;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::{Mutex, RwLock};
use shared::types::{ErrorMessage, InterfaceId, ServiceRecord};
use tokio::sync::mpsc;
use tracing::debug;
use crate::backend::AddressFamily;
use crate::connection::{Command, Connection};
use crate::discovery::DiscoveryInner;
use crate::error::{DiscoveryError, Result};
use state::BrowserState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BrowserId(pub u64);

impl fmt::Display for BrowserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "browser-{}", self.0)
    }
}

/// Notifications delivered to the owner of a [`Browser`]
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserEvent {
    ServiceAdded(ServiceRecord),

    /// Carries the retired record, with `outdated` set
    ServiceRemoved(ServiceRecord),

    /// Any published change; `old` is the retired record
    ServiceChanged {
        old: Option<ServiceRecord>,
        new: Option<ServiceRecord>,
    },

    /// One per reconciliation pass that changed the visible list
    ServicesUpdated(Vec<ServiceRecord>),

    StartupPhase {
        progress: u8,
        description: String,
    },

    ErrorMessage(ErrorMessage),

    /// Browsing failed for good; carries the whole error history
    HadFailure(Vec<ErrorMessage>),

    StartedBrowsing,
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Only publish instances with at least one resolved address
    pub require_addresses: bool,

    pub address_family: AddressFamily,

    /// How long a removed instance stays visible in case it comes back
    pub removal_debounce: Duration,

    /// How long deletions are held back after a refresh
    pub refresh_debounce: Duration,

    /// Delay between a refresh request and the fresh browse call
    pub refresh_settle: Duration,

    /// Keep last known data when a query times out after succeeding once
    pub retain_on_timeout: bool,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            require_addresses: true,
            address_family: AddressFamily::Any,
            removal_debounce: Duration::from_secs(1),
            refresh_debounce: Duration::from_secs(5),
            refresh_settle: Duration::from_millis(500),
            retain_on_timeout: true,
        }
    }
}

/// State visible both to the handle and to the worker
#[derive(Debug, Default)]
pub(crate) struct BrowserShared {
    pub services: RwLock<Vec<ServiceRecord>>,
    pub browsing: AtomicBool,
    pub failed: AtomicBool,
}

pub struct Browser {
    id: BrowserId,
    service_type: String,
    domain: String,
    options: BrowserOptions,
    discovery: Arc<DiscoveryInner>,
    connection: Mutex<Option<Arc<Connection>>>,
    shared: Arc<BrowserShared>,
    events: mpsc::UnboundedSender<BrowserEvent>,
}

impl Browser {
    pub(crate) fn new(
        id: BrowserId,
        service_type: String,
        domain: String,
        options: BrowserOptions,
        discovery: Arc<DiscoveryInner>,
        events: mpsc::UnboundedSender<BrowserEvent>,
    ) -> Self {
        Self {
            id,
            service_type,
            domain,
            options,
            discovery,
            connection: Mutex::new(None),
            shared: Arc::new(BrowserShared::default()),
            events,
        }
    }

    pub fn id(&self) -> BrowserId {
        self.id
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Snapshot of the currently published services, sorted by full name
    pub fn services(&self) -> Vec<ServiceRecord> {
        self.shared.services.read().clone()
    }

    pub fn is_browsing(&self) -> bool {
        self.shared.browsing.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Starts browsing on `interface`, founding the shared connection if
    /// none exists yet. No-op when browsing already or after a failure.
    pub fn start_browsing(&self, interface: InterfaceId) -> Result<()> {
        if self.has_failed() || self.is_browsing() {
            return Ok(());
        }

        let connection = self.attach()?;
        if self.has_failed() {
            return Ok(());
        }

        let sent = connection.send(Command::StartBrowsing {
            id: self.id,
            interface,
        });
        match sent {
            // The failure history reaches this browser on its own
            Err(DiscoveryError::ConnectionStopped) if connection.has_failed() => return Ok(()),
            other => other?,
        }
        self.shared.browsing.store(true, Ordering::Release);
        Ok(())
    }

    /// Drops the browse subscription and forgets every known instance.
    pub fn stop_browsing(&self) -> Result<()> {
        let Some(connection) = self.attached() else {
            return Ok(());
        };
        self.shared.browsing.store(false, Ordering::Release);
        match connection.send(Command::StopBrowsing(self.id)) {
            Err(DiscoveryError::ConnectionStopped) => Ok(()),
            other => other,
        }
    }

    /// Re-issues the browse call after a short settle delay, holding back
    /// deletions for the refresh debounce window.
    pub fn trigger_refresh(&self) -> Result<()> {
        let Some(connection) = self.attached() else {
            return Ok(());
        };
        connection.send(Command::TriggerRefresh(self.id))
    }

    /// Asks for a published service to be re-verified, for example after a
    /// connection attempt to its advertised address failed.
    pub fn reconfirm_service(&self, full_name: &str) -> Result<()> {
        let known = self
            .shared
            .services
            .read()
            .iter()
            .any(|s| s.full_name == full_name);
        if !known {
            return Err(DiscoveryError::UnknownService(full_name.to_string()));
        }
        let connection = self.attached().ok_or(DiscoveryError::ConnectionStopped)?;
        connection.send(Command::Reconfirm {
            id: self.id,
            full_name: full_name.to_string(),
        })
    }

    fn attached(&self) -> Option<Arc<Connection>> {
        self.connection.lock().clone()
    }

    fn attach(&self) -> Result<Arc<Connection>> {
        let mut slot = self.connection.lock();
        if let Some(connection) = slot.as_ref() {
            // A cleanly stopped connection is replaced once discovery is reset
            if connection.status().accepts_requests() || connection.has_failed() {
                return Ok(connection.clone());
            }
            debug!(browser = %self.id, "Dropping stopped connection");
            *slot = None;
        }

        let (connection, founded) = self.discovery.acquire_connection()?;
        if founded {
            let _ = self.events.send(BrowserEvent::StartupPhase {
                progress: 0,
                description: "Starting service discovery".to_string(),
            });
        }

        let state = BrowserState::new(
            self.id,
            self.service_type.clone(),
            self.domain.clone(),
            self.options.clone(),
            self.shared.clone(),
            self.events.clone(),
        );
        connection.add_browser(state)?;
        *slot = Some(connection.clone());
        Ok(connection)
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            debug!(browser = %self.id, "Detaching browser");
            let _ = connection.send(Command::RemoveBrowser(self.id));
        }
    }
}

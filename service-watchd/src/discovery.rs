//! Process-wide entry point: hands out browsers that share one connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use shared::types::ErrorMessage;
use tokio::sync::mpsc;
use tracing::info;
use crate::backend::BackendChainFactory;
use crate::browser::{Browser, BrowserEvent, BrowserId, BrowserOptions};
use crate::connection::{Connection, ConnectionSettings, ConnectionStatus};
use crate::error::Result;

pub(crate) struct DiscoveryInner {
    factory: Arc<dyn BackendChainFactory>,
    settings: ConnectionSettings,
    connection: Mutex<Option<Arc<Connection>>>,
    next_browser: AtomicU64,
}

impl DiscoveryInner {
    /// Returns the shared connection, founding it if none exists. The flag
    /// tells whether this call founded it.
    pub(crate) fn acquire_connection(&self) -> Result<(Arc<Connection>, bool)> {
        let mut slot = self.connection.lock();
        if let Some(connection) = slot.as_ref() {
            return Ok((connection.clone(), false));
        }
        let connection = Arc::new(Connection::spawn(
            self.factory.build_chain(),
            self.settings.clone(),
        )?);
        info!("Founded discovery connection");
        *slot = Some(connection.clone());
        Ok((connection, true))
    }
}

#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl Discovery {
    pub fn new(factory: Arc<dyn BackendChainFactory>, settings: ConnectionSettings) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                factory,
                settings,
                connection: Mutex::new(None),
                next_browser: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a browser for `service_type` in `domain`. Nothing touches the
    /// network until [`Browser::start_browsing`] is called.
    pub fn browser(
        &self,
        service_type: &str,
        domain: &str,
        options: BrowserOptions,
    ) -> (Browser, mpsc::UnboundedReceiver<BrowserEvent>) {
        let id = BrowserId(self.inner.next_browser.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let browser = Browser::new(
            id,
            service_type.to_string(),
            domain.to_string(),
            options,
            self.inner.clone(),
            tx,
        );
        (browser, rx)
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.connection.lock().clone()
    }

    pub fn status(&self) -> Option<ConnectionStatus> {
        self.connection().map(|c| c.status())
    }

    pub fn error_history(&self) -> Vec<ErrorMessage> {
        self.connection()
            .map(|c| c.error_history())
            .unwrap_or_default()
    }

    /// Stops and forgets the shared connection so the next browser founds a
    /// fresh one with a fresh backend chain.
    pub fn reset(&self) -> Result<()> {
        let previous = self.inner.connection.lock().take();
        if let Some(connection) = previous {
            info!("Resetting discovery connection");
            connection.stop(true)?;
        }
        Ok(())
    }

    /// Stops the shared connection and waits for its worker to finish.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(connection) = self.connection() {
            connection.stop(true)?;
        }
        Ok(())
    }
}

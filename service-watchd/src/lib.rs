//! DNS-SD discovery coordination: one shared connection to a discovery
//! backend, many browsers on top of it, each publishing a debounced list of
//! fully resolved service instances.

pub mod api;
pub mod backend;
pub mod browser;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;

pub use browser::{Browser, BrowserEvent, BrowserId, BrowserOptions};
pub use connection::{Connection, ConnectionSettings, ConnectionStatus};
pub use discovery::Discovery;
pub use error::{BackendError, DiscoveryError, ErrorKind, Result};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::fullname;

/// TXT-style key/value metadata.
///
/// `None` means the key is present without a value, `Some("")` means the key
/// carries an empty value, and a missing key is absent. The three states are
/// distinct on the wire and are kept distinct here.
pub type Metadata = BTreeMap<String, Option<String>>;

/// Opaque handle of the local network interface a service was seen on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceId(pub u32);

impl InterfaceId {
    /// Unspecified interface, meaning "all interfaces"
    pub const ANY: InterfaceId = InterfaceId(crate::protocol::ALL_INTERFACES);

    pub fn is_any(self) -> bool {
        self == Self::ANY
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolved host of a service instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Target hostname, e.g. "printer1.local."
    pub hostname: String,

    /// Resolved IPv4/IPv6 addresses
    pub addresses: BTreeSet<IpAddr>,
}

impl HostInfo {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            addresses: BTreeSet::new(),
        }
    }
}

/// A discovered service instance.
///
/// Records are immutable snapshots once handed out. An update produces a new
/// record, and the superseded one is delivered again with `outdated` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Instance name, unescaped, e.g. "Office Printer"
    pub name: String,

    /// Service type, e.g. "_ipp._tcp"
    pub service_type: String,

    /// Domain, e.g. "local."
    pub domain: String,

    /// Escaped DNS full name, e.g. "Office\032Printer._ipp._tcp.local."
    pub full_name: String,

    /// Port as advertised, kept textual
    pub port: String,

    pub metadata: Metadata,

    pub host: Option<HostInfo>,

    pub interface: InterfaceId,

    /// Set once the record has been superseded or removed
    pub outdated: bool,
}

impl ServiceRecord {
    pub fn new(
        name: impl Into<String>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
        interface: InterfaceId,
    ) -> Self {
        let name = name.into();
        let service_type = fullname::normalize_type(&service_type.into());
        let domain = fullname::normalize_domain(&domain.into());
        let full_name = fullname::escape(&name, &service_type, &domain);

        Self {
            name,
            service_type,
            domain,
            full_name,
            port: String::new(),
            metadata: Metadata::new(),
            host: None,
            interface,
            outdated: false,
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        self.host.as_ref().map(|h| h.hostname.as_str())
    }

    pub fn addresses(&self) -> impl Iterator<Item = &IpAddr> {
        self.host.iter().flat_map(|h| h.addresses.iter())
    }

    pub fn has_addresses(&self) -> bool {
        self.host.as_ref().map(|h| !h.addresses.is_empty()).unwrap_or(false)
    }

    /// Returns the superseded copy of this record.
    pub fn retired(&self) -> Self {
        Self {
            outdated: true,
            ..self.clone()
        }
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name)?;
        if let Some(host) = &self.host {
            write!(f, " -> {}:{}", host.hostname, self.port)?;
        }
        Ok(())
    }
}

/// Severity of an error report delivered to browsers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Note,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// One entry of the error history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub severity: Severity,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl ErrorMessage {
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
            at: Utc::now(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

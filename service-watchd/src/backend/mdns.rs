//! Multicast DNS backend built on the `mdns-sd` daemon.
//!
//! `mdns-sd` reports fully resolved instances on its browse channels rather
//! than answering separate resolve, TXT and address queries. This backend
//! caches what the browse channels deliver and answers the engine's
//! sub-queries from that cache, queueing a tagged reply whenever a cached
//! instance changes.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use shared::fullname;
use shared::types::{InterfaceId, Metadata};
use tracing::{debug, info, warn};
use super::{
    AddressFamily, Backend, BackendChainFactory, BackendDescriptor, BackendReply, ConnectionHandle,
    EventBatch, ProcessStatus, QueryToken, ReplyEvent,
};
use crate::config::BackendConfig;
use crate::error::BackendError;

const MDNS_DOMAIN: &str = "local.";
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);

/// One browse channel of the daemon, shared by every token browsing the
/// same type.
struct BrowseGroup {
    service_type: String,
    receiver: flume::Receiver<ServiceEvent>,
    tokens: Vec<QueryToken>,

    /// Raw daemon full names currently present
    found: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Query {
    Resolve { fullname: String },
    Metadata { fullname: String },
    Address { hostname: String },
}

struct ConnState {
    groups: HashMap<String, BrowseGroup>,
    queries: HashMap<QueryToken, Query>,

    /// Last resolution of each instance, by raw daemon full name
    resolved: HashMap<String, ServiceInfo>,
    ready: Vec<BackendReply>,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
}

impl ConnState {
    fn new() -> Self {
        let (wake_tx, wake_rx) = flume::bounded(1);
        Self {
            groups: HashMap::new(),
            queries: HashMap::new(),
            resolved: HashMap::new(),
            ready: Vec::new(),
            wake_tx,
            wake_rx,
        }
    }

    fn push(&mut self, token: QueryToken, event: ReplyEvent) {
        self.ready.push(BackendReply {
            token,
            more_coming: false,
            event,
        });
    }

    /// Answers a freshly issued query from the cache.
    fn answer(&mut self, token: QueryToken, query: &Query) {
        let events: Vec<ReplyEvent> = match query {
            Query::Resolve { fullname } => self.resolved.get(fullname).map(resolve_event).into_iter().collect(),
            Query::Metadata { fullname } => self.resolved.get(fullname).map(metadata_event).into_iter().collect(),
            Query::Address { hostname } => self
                .resolved
                .values()
                .filter(|info| info.get_hostname() == hostname)
                .flat_map(|info| info.get_addresses().iter().copied())
                .collect::<BTreeSet<IpAddr>>()
                .into_iter()
                .map(|address| address_event(hostname, address, true))
                .collect(),
        };
        for event in events {
            self.push(token, event);
        }
    }

    fn on_event(&mut self, ty_domain: &str, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceFound(_, fullname) => {
                let Some(group) = self.groups.get_mut(ty_domain) else {
                    return;
                };
                if !group.found.insert(fullname.clone()) {
                    return;
                }
                let Some(event) = browse_event(&group.service_type, &fullname, ty_domain, true) else {
                    warn!(fullname = %fullname, "Ignoring instance with a malformed name");
                    return;
                };
                let tokens = group.tokens.clone();
                for token in tokens {
                    self.push(token, event.clone());
                }
            }
            ServiceEvent::ServiceResolved(info) => self.on_resolved(ty_domain, info),
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let Some(group) = self.groups.get_mut(ty_domain) else {
                    return;
                };
                group.found.remove(&fullname);
                let event = browse_event(&group.service_type, &fullname, ty_domain, false);
                let tokens = group.tokens.clone();
                if let Some(event) = event {
                    for token in tokens {
                        self.push(token, event.clone());
                    }
                }
                self.resolved.remove(&fullname);
            }
            _ => {}
        }
    }

    fn on_resolved(&mut self, ty_domain: &str, info: ServiceInfo) {
        let fullname = info.get_fullname().to_string();

        // Resolution without a prior "found" still counts as a sighting
        if self
            .groups
            .get(ty_domain)
            .map(|g| !g.found.contains(&fullname))
            .unwrap_or(false)
        {
            self.on_event(ty_domain, ServiceEvent::ServiceFound(ty_domain.to_string(), fullname.clone()));
        }

        let previous = self.resolved.insert(fullname.clone(), info.clone());
        let old_addresses: BTreeSet<IpAddr> = previous
            .as_ref()
            .filter(|p| p.get_hostname() == info.get_hostname())
            .map(|p| p.get_addresses().iter().copied().collect())
            .unwrap_or_default();
        let new_addresses: BTreeSet<IpAddr> = info.get_addresses().iter().copied().collect();

        let mut replies = Vec::new();
        for (token, query) in &self.queries {
            match query {
                Query::Resolve { fullname: f } if *f == fullname => {
                    replies.push((*token, resolve_event(&info)));
                }
                Query::Metadata { fullname: f } if *f == fullname => {
                    replies.push((*token, metadata_event(&info)));
                }
                Query::Address { hostname } if hostname == info.get_hostname() => {
                    for address in new_addresses.difference(&old_addresses) {
                        replies.push((*token, address_event(hostname, *address, true)));
                    }
                    for address in old_addresses.difference(&new_addresses) {
                        replies.push((*token, address_event(hostname, *address, false)));
                    }
                }
                _ => {}
            }
        }
        for (token, event) in replies {
            self.push(token, event);
        }
    }
}

/// Daemon-side type name, e.g. "_ipp._tcp.local."
fn ty_domain(service_type: &str, domain: &str) -> String {
    format!("{}.{}", fullname::normalize_type(service_type), fullname::normalize_domain(domain))
}

/// Instance label of a raw daemon full name
fn instance_name<'a>(fullname: &'a str, ty_domain: &str) -> Option<&'a str> {
    fullname
        .strip_suffix(ty_domain)
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|name| !name.is_empty())
}

fn browse_event(service_type: &str, fullname: &str, ty_domain: &str, added: bool) -> Option<ReplyEvent> {
    let name = instance_name(fullname, ty_domain)?;
    Some(ReplyEvent::Browse {
        added,
        interface: InterfaceId::ANY,
        name: name.to_string(),
        service_type: service_type.to_string(),
        domain: MDNS_DOMAIN.to_string(),
    })
}

fn txt_metadata(info: &ServiceInfo) -> Metadata {
    info.get_properties()
        .iter()
        .map(|prop| {
            let value = prop.val().map(|v| String::from_utf8_lossy(v).into_owned());
            (prop.key().to_string(), value)
        })
        .collect()
}

fn resolve_event(info: &ServiceInfo) -> ReplyEvent {
    ReplyEvent::Resolve {
        interface: InterfaceId::ANY,
        host_target: info.get_hostname().to_string(),
        port: info.get_port(),
        metadata: Some(txt_metadata(info)),
    }
}

fn metadata_event(info: &ServiceInfo) -> ReplyEvent {
    ReplyEvent::Metadata {
        interface: InterfaceId::ANY,
        metadata: txt_metadata(info),
    }
}

fn address_event(hostname: &str, address: IpAddr, added: bool) -> ReplyEvent {
    ReplyEvent::Address {
        interface: InterfaceId::ANY,
        hostname: hostname.to_string(),
        address,
        added,
    }
}

fn daemon_error(context: &str, err: mdns_sd::Error) -> BackendError {
    BackendError::unreachable(format!("{}: {}", context, err))
}

struct MdnsState {
    daemon: Option<ServiceDaemon>,
    next_handle: u64,
    connections: HashMap<ConnectionHandle, ConnState>,
}

/// mDNS backend bound to a set of network interfaces (all when empty).
///
/// The daemon keeps a single listener per service type, so one backend
/// instance serves one connection at a time.
pub struct MdnsBackend {
    name: String,
    interfaces: Vec<String>,
    state: Mutex<MdnsState>,
}

impl MdnsBackend {
    pub fn new(name: impl Into<String>, interfaces: Vec<String>) -> Self {
        Self {
            name: name.into(),
            interfaces,
            state: Mutex::new(MdnsState {
                daemon: None,
                next_handle: 1,
                connections: HashMap::new(),
            }),
        }
    }

    fn daemon(&self) -> Result<ServiceDaemon, BackendError> {
        self.state
            .lock()
            .daemon
            .clone()
            .ok_or_else(|| BackendError::daemon_not_running("mDNS responder not started"))
    }

    fn start_daemon(&self) -> Result<ServiceDaemon, BackendError> {
        let daemon = ServiceDaemon::new().map_err(|e| daemon_error("Failed to create mDNS daemon", e))?;
        if !self.interfaces.is_empty() {
            daemon
                .disable_interface(IfKind::All)
                .map_err(|e| daemon_error("Failed to disable default interfaces", e))?;
            for interface in &self.interfaces {
                daemon
                    .enable_interface(interface.as_str())
                    .map_err(|e| daemon_error(&format!("Failed to enable interface {}", interface), e))?;
            }
        }
        Ok(daemon)
    }

    fn register_query(
        &self,
        handle: ConnectionHandle,
        token: QueryToken,
        query: Query,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let conn = state
            .connections
            .get_mut(&handle)
            .ok_or_else(|| BackendError::invalid("unknown connection handle"))?;
        conn.answer(token, &query);
        conn.queries.insert(token, query);
        Ok(())
    }
}

impl Backend for MdnsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_property(&self, key: &str) -> Result<String, BackendError> {
        let daemon = self.daemon()?;
        let metrics = daemon
            .get_metrics()
            .map_err(|e| daemon_error("Failed to query mDNS daemon", e))?;
        let counters = metrics
            .recv_timeout(LIVENESS_TIMEOUT)
            .map_err(|e| BackendError::unreachable(format!("mDNS daemon did not answer: {}", e)))?;
        debug!(backend = %self.name, key = %key, counters = counters.len(), "Liveness check answered");
        Ok(format!("mdns-sd ({} counters)", counters.len()))
    }

    fn create_connection(&self) -> Result<ConnectionHandle, BackendError> {
        let mut state = self.state.lock();
        if state.daemon.is_none() {
            return Err(BackendError::daemon_not_running("mDNS responder not started"));
        }
        let handle = ConnectionHandle(state.next_handle);
        state.next_handle += 1;
        state.connections.insert(handle, ConnState::new());
        Ok(handle)
    }

    fn destroy_connection(&self, handle: ConnectionHandle) {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.remove(&handle) else {
            return;
        };
        if let Some(daemon) = state.daemon.as_ref() {
            for ty in conn.groups.keys() {
                if let Err(e) = daemon.stop_browse(ty) {
                    debug!(service_type = %ty, "Failed to stop browse: {}", e);
                }
            }
        }
    }

    fn stop_connection(&self, handle: ConnectionHandle) {
        let state = self.state.lock();
        if let Some(conn) = state.connections.get(&handle) {
            let _ = conn.wake_tx.try_send(());
        }
    }

    fn browse(
        &self,
        handle: ConnectionHandle,
        token: QueryToken,
        _interface: InterfaceId,
        service_type: &str,
        domain: &str,
    ) -> Result<(), BackendError> {
        if fullname::normalize_domain(domain) != MDNS_DOMAIN {
            return Err(BackendError::unsupported(format!(
                "{} only browses {}, not {}",
                self.name, MDNS_DOMAIN, domain
            )));
        }
        let ty = ty_domain(service_type, domain);

        let mut state = self.state.lock();
        let daemon = state
            .daemon
            .clone()
            .ok_or_else(|| BackendError::daemon_not_running("mDNS responder not started"))?;
        let conn = state
            .connections
            .get_mut(&handle)
            .ok_or_else(|| BackendError::invalid("unknown connection handle"))?;

        if let Some(group) = conn.groups.get_mut(&ty) {
            group.tokens.push(token);
            let events: Vec<ReplyEvent> = group
                .found
                .iter()
                .filter_map(|f| browse_event(&group.service_type, f, &ty, true))
                .collect();
            for event in events {
                conn.push(token, event);
            }
            return Ok(());
        }

        let receiver = daemon
            .browse(&ty)
            .map_err(|e| daemon_error(&format!("Failed to browse {}", ty), e))?;
        info!(backend = %self.name, service_type = %ty, "Browsing");
        conn.groups.insert(
            ty,
            BrowseGroup {
                service_type: fullname::normalize_type(service_type),
                receiver,
                tokens: vec![token],
                found: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn resolve(
        &self,
        handle: ConnectionHandle,
        token: QueryToken,
        _interface: InterfaceId,
        _family: AddressFamily,
        name: &str,
        service_type: &str,
        domain: &str,
    ) -> Result<(), BackendError> {
        let fullname = format!("{}.{}", name, ty_domain(service_type, domain));
        self.register_query(handle, token, Query::Resolve { fullname })
    }

    fn query_metadata(
        &self,
        handle: ConnectionHandle,
        token: QueryToken,
        _interface: InterfaceId,
        full_name: &str,
    ) -> Result<(), BackendError> {
        let (name, service_type, domain) =
            fullname::unescape(full_name).map_err(|e| BackendError::invalid(e.to_string()))?;
        let fullname = format!("{}.{}", name, ty_domain(&service_type, &domain));
        self.register_query(handle, token, Query::Metadata { fullname })
    }

    fn get_addr_info(
        &self,
        handle: ConnectionHandle,
        token: QueryToken,
        _interface: InterfaceId,
        hostname: &str,
    ) -> Result<(), BackendError> {
        self.register_query(
            handle,
            token,
            Query::Address {
                hostname: hostname.to_string(),
            },
        )
    }

    fn cancel(&self, handle: ConnectionHandle, token: QueryToken) {
        let mut state = self.state.lock();
        let MdnsState {
            daemon,
            connections,
            ..
        } = &mut *state;
        let Some(conn) = connections.get_mut(&handle) else {
            return;
        };
        conn.ready.retain(|r| r.token != token);
        if conn.queries.remove(&token).is_some() {
            return;
        }

        let emptied: Vec<String> = conn
            .groups
            .iter_mut()
            .filter_map(|(ty, group)| {
                let before = group.tokens.len();
                group.tokens.retain(|t| *t != token);
                (before != group.tokens.len() && group.tokens.is_empty()).then(|| ty.clone())
            })
            .collect();
        for ty in emptied {
            conn.groups.remove(&ty);
            if let Some(daemon) = daemon.as_ref() {
                if let Err(e) = daemon.stop_browse(&ty) {
                    debug!(service_type = %ty, "Failed to stop browse: {}", e);
                }
            }
        }
    }

    fn process_one_event_batch(
        &self,
        handle: ConnectionHandle,
        max_wait: Option<Duration>,
    ) -> EventBatch {
        let (receivers, wake_rx) = {
            let mut state = self.state.lock();
            let Some(conn) = state.connections.get_mut(&handle) else {
                return EventBatch::with_status(ProcessStatus::Failure);
            };
            if !conn.ready.is_empty() {
                return EventBatch::from_replies(std::mem::take(&mut conn.ready));
            }
            let receivers: Vec<(String, flume::Receiver<ServiceEvent>)> = conn
                .groups
                .iter()
                .map(|(ty, group)| (ty.clone(), group.receiver.clone()))
                .collect();
            (receivers, conn.wake_rx.clone())
        };

        let mut selector = flume::Selector::new();
        for (ty, receiver) in &receivers {
            selector = selector.recv(receiver, move |result| Some((ty.clone(), result)));
        }
        selector = selector.recv(&wake_rx, |_| None);
        let first = match max_wait {
            Some(wait) => selector.wait_timeout(wait).ok().flatten(),
            None => selector.wait(),
        };

        let mut state = self.state.lock();
        let Some(conn) = state.connections.get_mut(&handle) else {
            return EventBatch::with_status(ProcessStatus::Failure);
        };

        let mut disconnected = false;
        if let Some((ty, result)) = first {
            match result {
                Ok(event) => conn.on_event(&ty, event),
                Err(_) => disconnected = true,
            }
        }
        for (ty, receiver) in &receivers {
            while let Ok(event) = receiver.try_recv() {
                conn.on_event(ty, event);
            }
        }

        if disconnected {
            warn!(backend = %self.name, "mDNS daemon closed a browse channel");
            return EventBatch::with_status(ProcessStatus::Failure);
        }
        EventBatch::from_replies(std::mem::take(&mut conn.ready))
    }

    fn try_start_daemon(&self) -> bool {
        if self.state.lock().daemon.is_some() {
            return true;
        }
        match self.start_daemon() {
            Ok(daemon) => {
                info!(backend = %self.name, interfaces = ?self.interfaces, "Started mDNS daemon");
                self.state.lock().daemon = Some(daemon);
                true
            }
            Err(e) => {
                warn!(backend = %self.name, "Could not start mDNS daemon: {}", e);
                false
            }
        }
    }
}

impl Drop for MdnsBackend {
    fn drop(&mut self) {
        if let Some(daemon) = self.state.get_mut().daemon.take() {
            if let Err(e) = daemon.shutdown() {
                debug!(backend = %self.name, "Failed to shut down mDNS daemon: {}", e);
            }
        }
    }
}

/// Builds the configured chain of mDNS backends, each with its own daemon.
pub struct MdnsChainFactory {
    backends: Vec<BackendConfig>,
}

impl MdnsChainFactory {
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self { backends }
    }
}

impl BackendChainFactory for MdnsChainFactory {
    fn build_chain(&self) -> Vec<BackendDescriptor> {
        self.backends
            .iter()
            .map(|b| {
                let backend: Arc<dyn Backend> = Arc::new(MdnsBackend::new(&b.name, b.interfaces.clone()));
                BackendDescriptor::new(backend, b.max_errors)
            })
            .collect()
    }
}

//! Scripted in-process backend for tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use parking_lot::Mutex;
use shared::fullname;
use shared::types::{InterfaceId, Metadata};
use super::{
    AddressFamily, Backend, BackendReply, ConnectionHandle, EventBatch, ProcessStatus,
    QueryToken, ReplyEvent,
};
use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeMode {
    Healthy,
    /// The liveness check reports the backend as unsupported on this host
    Unusable,
    /// The liveness check fails with a transient error
    Unreachable,
    /// The liveness check reports the daemon as down; `starts` controls whether
    /// `try_start_daemon` brings it up
    DaemonDown { starts: bool },
    ConnectFails,
    BrowseFails,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeService {
    pub name: String,
    pub service_type: String,
    pub domain: String,
    pub hostname: String,
    pub port: u16,
    pub metadata: Metadata,
    pub addresses: Vec<IpAddr>,
}

impl FakeService {
    pub fn new(name: &str, service_type: &str, hostname: &str, port: u16, addresses: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            service_type: service_type.to_string(),
            domain: "local.".to_string(),
            hostname: hostname.to_string(),
            port,
            metadata: Metadata::new(),
            addresses: addresses.iter().filter_map(|a| a.parse().ok()).collect(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Option<&str>) -> Self {
        self.metadata.insert(key.to_string(), value.map(str::to_string));
        self
    }

    pub fn full_name(&self) -> String {
        fullname::escape(&self.name, &self.service_type, &self.domain)
    }
}

#[derive(Debug, Clone)]
enum Subscription {
    Browse { service_type: String, domain: String },
    Resolve { full_name: String },
    Metadata { full_name: String },
    Address { hostname: String },
}

struct FakeState {
    mode: FakeMode,
    daemon_running: bool,
    silent: bool,
    services: BTreeMap<String, FakeService>,
    subscriptions: HashMap<QueryToken, Subscription>,
    queue: Vec<BackendReply>,
    forced: Vec<ProcessStatus>,
    live: HashSet<ConnectionHandle>,
    next_handle: u64,
    calls: Vec<String>,
}

pub(crate) struct FakeBackend {
    name: String,
    state: Mutex<FakeState>,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
}

fn reply(token: QueryToken, event: ReplyEvent) -> BackendReply {
    BackendReply {
        token,
        more_coming: false,
        event,
    }
}

impl FakeBackend {
    pub fn new(name: &str) -> Self {
        Self::with_mode(name, FakeMode::Healthy)
    }

    pub fn with_mode(name: &str, mode: FakeMode) -> Self {
        let (wake_tx, wake_rx) = flume::unbounded();
        Self {
            name: name.to_string(),
            state: Mutex::new(FakeState {
                mode,
                daemon_running: !matches!(mode, FakeMode::DaemonDown { .. }),
                silent: false,
                services: BTreeMap::new(),
                subscriptions: HashMap::new(),
                queue: Vec::new(),
                forced: Vec::new(),
                live: HashSet::new(),
                next_handle: 1,
                calls: Vec::new(),
            }),
            wake_tx,
            wake_rx,
        }
    }

    /// Stops answering resolve, metadata and address queries.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    pub fn announce(&self, service: FakeService) {
        self.announce_all(vec![service]);
    }

    /// Publishes services as one burst.
    pub fn announce_all(&self, services: Vec<FakeService>) {
        let mut state = self.state.lock();
        for service in services {
            let full_name = service.full_name();
            let previous = state.services.insert(full_name.clone(), service.clone());
            let mut replies = Vec::new();
            for (token, sub) in &state.subscriptions {
                match sub {
                    Subscription::Browse { service_type, domain }
                        if previous.is_none()
                            && *service_type == service.service_type
                            && *domain == service.domain =>
                    {
                        replies.push(reply(*token, browse_event(&service, true)));
                    }
                    Subscription::Resolve { full_name: f } if *f == full_name && !state.silent => {
                        replies.push(reply(*token, resolve_event(&service)));
                    }
                    Subscription::Metadata { full_name: f } if *f == full_name && !state.silent => {
                        replies.push(reply(*token, metadata_event(&service)));
                    }
                    Subscription::Address { hostname } if *hostname == service.hostname && !state.silent => {
                        let old: Vec<IpAddr> = previous
                            .as_ref()
                            .map(|p| p.addresses.clone())
                            .unwrap_or_default();
                        for addr in service.addresses.iter().filter(|a| !old.contains(a)) {
                            replies.push(reply(*token, address_event(&service, *addr, true)));
                        }
                        for addr in old.iter().filter(|a| !service.addresses.contains(a)) {
                            replies.push(reply(*token, address_event(&service, *addr, false)));
                        }
                    }
                    _ => {}
                }
            }
            state.queue.extend(replies);
        }
        drop(state);
        let _ = self.wake_tx.send(());
    }

    pub fn withdraw(&self, full_name: &str) {
        let mut state = self.state.lock();
        if let Some(service) = state.services.remove(full_name) {
            let replies: Vec<BackendReply> = state
                .subscriptions
                .iter()
                .filter_map(|(token, sub)| match sub {
                    Subscription::Browse { service_type, domain }
                        if *service_type == service.service_type && *domain == service.domain =>
                    {
                        Some(reply(*token, browse_event(&service, false)))
                    }
                    _ => None,
                })
                .collect();
            state.queue.extend(replies);
        }
        drop(state);
        let _ = self.wake_tx.send(());
    }

    /// Makes the next processing rounds return `status` without replies.
    pub fn force_status(&self, status: ProcessStatus, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.forced.push(status);
        }
        drop(state);
        let _ = self.wake_tx.send(());
    }

    pub fn set_mode(&self, mode: FakeMode) {
        self.state.lock().mode = mode;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn live_connections(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }
}

fn browse_event(service: &FakeService, added: bool) -> ReplyEvent {
    ReplyEvent::Browse {
        added,
        interface: InterfaceId::ANY,
        name: service.name.clone(),
        service_type: service.service_type.clone(),
        domain: service.domain.clone(),
    }
}

fn resolve_event(service: &FakeService) -> ReplyEvent {
    ReplyEvent::Resolve {
        interface: InterfaceId::ANY,
        host_target: service.hostname.clone(),
        port: service.port,
        metadata: None,
    }
}

fn metadata_event(service: &FakeService) -> ReplyEvent {
    ReplyEvent::Metadata {
        interface: InterfaceId::ANY,
        metadata: service.metadata.clone(),
    }
}

fn address_event(service: &FakeService, address: IpAddr, added: bool) -> ReplyEvent {
    ReplyEvent::Address {
        interface: InterfaceId::ANY,
        hostname: service.hostname.clone(),
        address,
        added,
    }
}

impl Backend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_property(&self, _key: &str) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        state.calls.push("version".to_string());
        match state.mode {
            FakeMode::Unusable => Err(BackendError::unsupported("not available on this host")),
            FakeMode::Unreachable => Err(BackendError::unreachable("no route to daemon")),
            FakeMode::DaemonDown { .. } if !state.daemon_running => {
                Err(BackendError::daemon_not_running("daemon is not running"))
            }
            _ => Ok("fake-1.0".to_string()),
        }
    }

    fn create_connection(&self) -> Result<ConnectionHandle, BackendError> {
        let mut state = self.state.lock();
        state.calls.push("create".to_string());
        if state.mode == FakeMode::ConnectFails {
            return Err(BackendError::unreachable("connection refused"));
        }
        let handle = ConnectionHandle(state.next_handle);
        state.next_handle += 1;
        state.live.insert(handle);
        Ok(handle)
    }

    fn destroy_connection(&self, handle: ConnectionHandle) {
        let mut state = self.state.lock();
        state.calls.push("destroy".to_string());
        state.live.remove(&handle);
        state.subscriptions.clear();
        state.queue.clear();
    }

    fn stop_connection(&self, _handle: ConnectionHandle) {
        let _ = self.wake_tx.send(());
    }

    fn browse(
        &self,
        _handle: ConnectionHandle,
        token: QueryToken,
        _interface: InterfaceId,
        service_type: &str,
        domain: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(format!("browse {}", service_type));
        if state.mode == FakeMode::BrowseFails {
            return Err(BackendError::unreachable("browse refused"));
        }
        let replies: Vec<BackendReply> = state
            .services
            .values()
            .filter(|s| s.service_type == service_type && s.domain == domain)
            .map(|s| reply(token, browse_event(s, true)))
            .collect();
        state.queue.extend(replies);
        state.subscriptions.insert(
            token,
            Subscription::Browse {
                service_type: service_type.to_string(),
                domain: domain.to_string(),
            },
        );
        Ok(())
    }

    fn resolve(
        &self,
        _handle: ConnectionHandle,
        token: QueryToken,
        _interface: InterfaceId,
        _family: AddressFamily,
        name: &str,
        service_type: &str,
        domain: &str,
    ) -> Result<(), BackendError> {
        let full_name = fullname::escape(name, service_type, domain);
        let mut state = self.state.lock();
        state.calls.push(format!("resolve {}", full_name));
        let answer = match state.silent {
            true => None,
            false => state.services.get(&full_name).map(resolve_event),
        };
        if let Some(event) = answer {
            state.queue.push(reply(token, event));
        }
        state
            .subscriptions
            .insert(token, Subscription::Resolve { full_name });
        Ok(())
    }

    fn query_metadata(
        &self,
        _handle: ConnectionHandle,
        token: QueryToken,
        _interface: InterfaceId,
        full_name: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(format!("metadata {}", full_name));
        let answer = match state.silent {
            true => None,
            false => state.services.get(full_name).map(metadata_event),
        };
        if let Some(event) = answer {
            state.queue.push(reply(token, event));
        }
        state.subscriptions.insert(
            token,
            Subscription::Metadata {
                full_name: full_name.to_string(),
            },
        );
        Ok(())
    }

    fn get_addr_info(
        &self,
        _handle: ConnectionHandle,
        token: QueryToken,
        _interface: InterfaceId,
        hostname: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(format!("addr {}", hostname));
        if !state.silent {
            let replies: Vec<BackendReply> = state
                .services
                .values()
                .filter(|s| s.hostname == hostname)
                .flat_map(|s| {
                    s.addresses
                        .iter()
                        .map(move |a| reply(token, address_event(s, *a, true)))
                })
                .collect();
            state.queue.extend(replies);
        }
        state.subscriptions.insert(
            token,
            Subscription::Address {
                hostname: hostname.to_string(),
            },
        );
        Ok(())
    }

    fn cancel(&self, _handle: ConnectionHandle, token: QueryToken) {
        let mut state = self.state.lock();
        state.subscriptions.remove(&token);
        state.queue.retain(|r| r.token != token);
    }

    fn reconfirm_record(
        &self,
        _handle: ConnectionHandle,
        _interface: InterfaceId,
        _name: &str,
        _service_type: &str,
        _domain: &str,
        full_name: &str,
    ) -> Result<(), BackendError> {
        self.state.lock().calls.push(format!("reconfirm {}", full_name));
        Ok(())
    }

    fn process_one_event_batch(
        &self,
        _handle: ConnectionHandle,
        max_wait: Option<Duration>,
    ) -> EventBatch {
        let ready = {
            let mut state = self.state.lock();
            if !state.forced.is_empty() {
                return EventBatch::with_status(state.forced.remove(0));
            }
            !state.queue.is_empty()
        };

        if !ready {
            let _ = match max_wait {
                Some(wait) => self.wake_rx.recv_timeout(wait).ok(),
                None => self.wake_rx.recv().ok(),
            };
        }
        while self.wake_rx.try_recv().is_ok() {}

        let mut state = self.state.lock();
        if !state.forced.is_empty() {
            return EventBatch::with_status(state.forced.remove(0));
        }
        EventBatch::from_replies(std::mem::take(&mut state.queue))
    }

    fn try_start_daemon(&self) -> bool {
        let mut state = self.state.lock();
        state.calls.push("start-daemon".to_string());
        if let FakeMode::DaemonDown { starts: true } = state.mode {
            state.daemon_running = true;
            return true;
        }
        false
    }
}

/// Chain factory handing out the same fake backends for every connection
pub(crate) struct FakeFactory {
    pub backends: Vec<std::sync::Arc<FakeBackend>>,
}

impl super::BackendChainFactory for FakeFactory {
    fn build_chain(&self) -> Vec<super::BackendDescriptor> {
        self.backends
            .iter()
            .map(|b| super::BackendDescriptor::new(b.clone() as std::sync::Arc<dyn Backend>, 1))
            .collect()
    }
}

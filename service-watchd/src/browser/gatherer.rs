//! Per-instance resolution state machine.
//!
//! A gatherer drives three sub-queries for one discovered instance (name
//! resolution, metadata and address resolution), merges their answers into
//! an in-progress record and decides when that record may be published.

use std::collections::HashMap;
use std::time::Instant;
use shared::types::{HostInfo, InterfaceId, ServiceRecord};
use tracing::{debug, warn};
use crate::backend::{AddressFamily, QueryToken, ReplyEvent};
use crate::connection::routes::{QueryCtx, Route};
use crate::error::{BackendError, ErrorKind};
use super::{BrowserId, BrowserOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SubQuery {
    Resolve,
    Metadata,
    Address,
}

impl SubQuery {
    fn shift(self) -> u16 {
        match self {
            SubQuery::Resolve => 0,
            SubQuery::Metadata => 3,
            SubQuery::Address => 6,
        }
    }
}

const ACTIVE: u16 = 0b001;
const FAILED: u16 = 0b010;
const SUCCEEDED: u16 = 0b100;

/// Active/failed/succeeded flags of all sub-queries packed into one word
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct QueryFlags(u16);

impl QueryFlags {
    fn set(&mut self, query: SubQuery, flag: u16) {
        self.0 |= flag << query.shift();
    }

    fn clear(&mut self, query: SubQuery, flag: u16) {
        self.0 &= !(flag << query.shift());
    }

    fn has(self, query: SubQuery, flag: u16) -> bool {
        self.0 & (flag << query.shift()) != 0
    }

    pub fn is_active(self, query: SubQuery) -> bool {
        self.has(query, ACTIVE)
    }

    pub fn has_failed(self, query: SubQuery) -> bool {
        self.has(query, FAILED)
    }

    pub fn has_succeeded(self, query: SubQuery) -> bool {
        self.has(query, SUCCEEDED)
    }
}

/// A published record being replaced (`old`) by another (`new`)
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServiceChange {
    pub old: Option<ServiceRecord>,
    pub new: Option<ServiceRecord>,
}

pub(crate) struct Gatherer {
    browser: BrowserId,
    require_addresses: bool,
    family: AddressFamily,
    retain_on_timeout: bool,
    current: ServiceRecord,
    published: Option<ServiceRecord>,
    flags: QueryFlags,
    /// Set by the first successful sub-query; later errors never clear it
    ever_succeeded: bool,
    /// A timeout dropped data the published record was built from
    data_dropped: bool,
    tokens: HashMap<SubQuery, QueryToken>,
    pending_publish: bool,
    remove_after: Option<Instant>,
}

impl Gatherer {
    pub fn new(
        browser: BrowserId,
        name: &str,
        service_type: &str,
        domain: &str,
        interface: InterfaceId,
        options: &BrowserOptions,
    ) -> Self {
        Self {
            browser,
            require_addresses: options.require_addresses,
            family: options.address_family,
            retain_on_timeout: options.retain_on_timeout,
            current: ServiceRecord::new(name, service_type, domain, interface),
            published: None,
            flags: QueryFlags::default(),
            ever_succeeded: false,
            data_dropped: false,
            tokens: HashMap::new(),
            pending_publish: false,
            remove_after: None,
        }
    }

    pub fn full_name(&self) -> &str {
        &self.current.full_name
    }

    pub fn current(&self) -> &ServiceRecord {
        &self.current
    }

    pub fn published(&self) -> Option<&ServiceRecord> {
        self.published.as_ref()
    }

    pub fn flags(&self) -> QueryFlags {
        self.flags
    }

    pub fn is_pending(&self) -> bool {
        self.pending_publish
    }

    pub fn removal_deadline(&self) -> Option<Instant> {
        self.remove_after
    }

    /// Soft removal hint. The first hint starts the debounce window.
    pub fn mark_removed(&mut self, deadline: Instant) {
        self.remove_after.get_or_insert(deadline);
    }

    pub fn clear_removal(&mut self) {
        self.remove_after = None;
    }

    pub fn is_publishable(&self) -> bool {
        self.current.has_addresses() || (!self.require_addresses && self.ever_succeeded)
    }

    /// Issues the resolve and metadata queries, plus the address query when
    /// a hostname is already known.
    pub fn start(&mut self, ctx: &mut QueryCtx<'_>) {
        self.issue(SubQuery::Resolve, ctx);
        self.issue(SubQuery::Metadata, ctx);
        if self.current.host.is_some() {
            self.issue(SubQuery::Address, ctx);
        }
    }

    /// Re-issues every sub-query, keeping the data gathered so far.
    pub fn reload(&mut self, interface: InterfaceId, ctx: &mut QueryCtx<'_>) {
        if !interface.is_any() {
            self.current.interface = interface;
        }
        self.stop(ctx);
        self.start(ctx);
    }

    pub fn stop(&mut self, ctx: &mut QueryCtx<'_>) {
        for (query, token) in self.tokens.drain() {
            ctx.cancel(token);
            self.flags.clear(query, ACTIVE);
        }
    }

    /// Asks the backend to double-check its cached records, then restarts
    /// all sub-queries.
    pub fn reconfirm(&mut self, ctx: &mut QueryCtx<'_>) {
        let record = &self.current;
        match ctx.backend.reconfirm_record(
            ctx.handle,
            record.interface,
            &record.name,
            &record.service_type,
            &record.domain,
            &record.full_name,
        ) {
            Ok(()) => debug!(service = %record.full_name, "Reconfirm requested"),
            Err(e) if e.kind == ErrorKind::Unsupported => {
                debug!(service = %record.full_name, "Backend cannot reconfirm: {}", e)
            }
            Err(e) => warn!(service = %record.full_name, "Reconfirm failed: {}", e),
        }
        self.stop(ctx);
        self.start(ctx);
    }

    fn issue(&mut self, query: SubQuery, ctx: &mut QueryCtx<'_>) {
        if let Some(old) = self.tokens.remove(&query) {
            ctx.cancel(old);
        }

        let hostname = match (query, &self.current.host) {
            (SubQuery::Address, None) => return,
            (SubQuery::Address, Some(host)) => host.hostname.clone(),
            _ => String::new(),
        };

        let token = ctx.routes.allocate(Route::Query {
            browser: self.browser,
            full_name: self.current.full_name.clone(),
            kind: query,
        });
        let record = &self.current;
        let result = match query {
            SubQuery::Resolve => ctx.backend.resolve(
                ctx.handle,
                token,
                record.interface,
                self.family,
                &record.name,
                &record.service_type,
                &record.domain,
            ),
            SubQuery::Metadata => {
                ctx.backend
                    .query_metadata(ctx.handle, token, record.interface, &record.full_name)
            }
            SubQuery::Address => {
                ctx.backend
                    .get_addr_info(ctx.handle, token, record.interface, &hostname)
            }
        };

        match result {
            Ok(()) => {
                self.tokens.insert(query, token);
                self.flags.set(query, ACTIVE);
                self.flags.clear(query, FAILED);
            }
            Err(e) => {
                ctx.routes.remove(token);
                self.flags.clear(query, ACTIVE);
                self.flags.set(query, FAILED);
                warn!(
                    service = %self.current.full_name,
                    query = ?query,
                    "Failed to issue query: {}",
                    e
                );
            }
        }
    }

    /// Merges one reply into the in-progress record. Returns true when the
    /// record (or its publishability) changed and a publish is now pending.
    pub fn on_reply(&mut self, query: SubQuery, event: ReplyEvent, ctx: &mut QueryCtx<'_>) -> bool {
        let before = self.current.clone();
        let was_publishable = self.is_publishable();

        match event {
            ReplyEvent::Error(err) => self.on_error(query, err, ctx),
            ReplyEvent::Resolve {
                interface,
                host_target,
                port,
                metadata,
            } => {
                self.succeeded(SubQuery::Resolve);
                self.current.port = port.to_string();
                if !interface.is_any() {
                    self.current.interface = interface;
                }
                if let Some(metadata) = metadata {
                    self.current.metadata = metadata;
                }
                if self.current.hostname() != Some(host_target.as_str()) {
                    debug!(
                        service = %self.current.full_name,
                        host = %host_target,
                        "Hostname changed, restarting address resolution"
                    );
                    self.current.host = Some(HostInfo::new(host_target));
                    self.flags.clear(SubQuery::Address, SUCCEEDED);
                    self.issue(SubQuery::Address, ctx);
                }
            }
            ReplyEvent::Metadata { metadata, .. } => {
                self.succeeded(SubQuery::Metadata);
                self.current.metadata = metadata;
            }
            ReplyEvent::Address {
                hostname,
                address,
                added,
                ..
            } => {
                let family = self.family;
                match self.current.host.as_mut() {
                    Some(host) if host.hostname == hostname => {
                        if family.accepts(&address) {
                            if added {
                                host.addresses.insert(address);
                            } else {
                                host.addresses.remove(&address);
                            }
                            self.succeeded(SubQuery::Address);
                        }
                    }
                    _ => debug!(
                        service = %self.current.full_name,
                        host = %hostname,
                        "Ignoring address for stale hostname"
                    ),
                }
            }
            ReplyEvent::Browse { .. } => {
                debug!(service = %self.current.full_name, "Ignoring browse reply on a gatherer query");
            }
        }

        let changed = self.current != before || self.is_publishable() != was_publishable;
        if changed {
            self.pending_publish = true;
        }
        changed
    }

    fn succeeded(&mut self, query: SubQuery) {
        self.ever_succeeded = true;
        self.flags.set(query, SUCCEEDED);
        self.flags.clear(query, FAILED);
    }

    fn on_error(&mut self, query: SubQuery, err: BackendError, ctx: &mut QueryCtx<'_>) {
        if err.is_timeout() && self.flags.has_succeeded(query) && self.retain_on_timeout {
            debug!(
                service = %self.current.full_name,
                query = ?query,
                "Timeout after earlier success, keeping last known data"
            );
            return;
        }

        if err.is_timeout() && self.flags.has_succeeded(query) {
            self.drop_data(query);
            self.data_dropped = true;
        }

        warn!(
            service = %self.current.full_name,
            query = ?query,
            "Query failed: {}",
            err
        );
        if let Some(token) = self.tokens.remove(&query) {
            ctx.cancel(token);
        }
        self.flags.clear(query, ACTIVE | SUCCEEDED);
        self.flags.set(query, FAILED);
    }

    fn drop_data(&mut self, query: SubQuery) {
        match query {
            SubQuery::Resolve => {
                self.current.port.clear();
                self.current.host = None;
            }
            SubQuery::Metadata => self.current.metadata.clear(),
            SubQuery::Address => {
                if let Some(host) = self.current.host.as_mut() {
                    host.addresses.clear();
                }
            }
        }
    }

    /// Publishes the in-progress record if it is publishable and differs
    /// from the published one. An unpublishable record leaves the published
    /// one in place, unless a timeout dropped the data it was built from.
    pub fn enact(&mut self) -> Option<ServiceChange> {
        self.pending_publish = false;
        if !self.is_publishable() {
            return match std::mem::take(&mut self.data_dropped) {
                true => self.retire(),
                false => None,
            };
        }
        self.data_dropped = false;
        if self.published.as_ref() == Some(&self.current) {
            return None;
        }
        let old = self.published.take().map(|r| r.retired());
        self.published = Some(self.current.clone());
        Some(ServiceChange {
            old,
            new: self.published.clone(),
        })
    }

    /// Withdraws the published record, if any.
    pub fn retire(&mut self) -> Option<ServiceChange> {
        self.pending_publish = false;
        let old = self.published.take()?;
        Some(ServiceChange {
            old: Some(old.retired()),
            new: None,
        })
    }
}

//! Worker-side state of one browser: the known-instance list, one gatherer
//! per instance, and the reconciliation that turns both into the published
//! service list.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use shared::fullname;
use shared::types::{ErrorMessage, InterfaceId, ServiceRecord};
use tokio::sync::mpsc;
use tracing::{debug, info};
use crate::backend::{QueryToken, ReplyEvent};
use crate::connection::routes::{QueryCtx, Route};
use crate::error::BackendError;
use super::gatherer::{Gatherer, ServiceChange, SubQuery};
use super::{BrowserEvent, BrowserId, BrowserOptions, BrowserShared};

/// An instance reported by the browse subscription
#[derive(Debug, Clone, PartialEq, Eq)]
struct KnownInstance {
    full_name: String,
    name: String,
    service_type: String,
    domain: String,
    interface: InterfaceId,
}

pub(crate) struct BrowserState {
    pub id: BrowserId,
    service_type: String,
    domain: String,
    options: BrowserOptions,
    shared: Arc<BrowserShared>,
    events: mpsc::UnboundedSender<BrowserEvent>,
    interface: InterfaceId,
    wants_browsing: bool,
    browse_token: Option<QueryToken>,

    /// Sorted by full name
    known: Vec<KnownInstance>,
    gatherers: BTreeMap<String, Gatherer>,

    delay_deletes_until: Option<Instant>,
    refresh_at: Option<Instant>,
    dirty: bool,
}

impl BrowserState {
    pub fn new(
        id: BrowserId,
        service_type: String,
        domain: String,
        options: BrowserOptions,
        shared: Arc<BrowserShared>,
        events: mpsc::UnboundedSender<BrowserEvent>,
    ) -> Self {
        Self {
            id,
            service_type: fullname::normalize_type(&service_type),
            domain: fullname::normalize_domain(&domain),
            options,
            shared,
            events,
            interface: InterfaceId::ANY,
            wants_browsing: false,
            browse_token: None,
            known: Vec::new(),
            gatherers: BTreeMap::new(),
            delay_deletes_until: None,
            refresh_at: None,
            dirty: false,
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn wants_browsing(&self) -> bool {
        self.wants_browsing
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn emit(&self, event: BrowserEvent) {
        // The owner may have dropped its receiver; nothing to do then.
        let _ = self.events.send(event);
    }

    /// Delivers the connection's error history to a browser that attached
    /// late, plus the failure notice if the connection already gave up.
    pub fn replay(&self, history: &[ErrorMessage], failed: bool) {
        for message in history {
            self.emit(BrowserEvent::ErrorMessage(message.clone()));
        }
        if failed {
            self.fail(history);
        }
    }

    pub fn fail(&self, history: &[ErrorMessage]) {
        self.shared.failed.store(true, Ordering::Release);
        self.shared.browsing.store(false, Ordering::Release);
        self.emit(BrowserEvent::HadFailure(history.to_vec()));
    }

    pub fn set_wants(&mut self, interface: InterfaceId) {
        self.wants_browsing = true;
        self.interface = interface;
    }

    /// Opens the browse subscription, replacing any previous one.
    pub fn start_browse(&mut self, ctx: &mut QueryCtx<'_>) -> Result<(), BackendError> {
        if let Some(old) = self.browse_token.take() {
            ctx.cancel(old);
        }

        let token = ctx.routes.allocate(Route::Browse(self.id));
        if let Err(e) = ctx.backend.browse(
            ctx.handle,
            token,
            self.interface,
            &self.service_type,
            &self.domain,
        ) {
            ctx.routes.remove(token);
            return Err(e);
        }

        self.browse_token = Some(token);
        self.shared.browsing.store(true, Ordering::Release);
        info!(
            browser = %self.id,
            service_type = %self.service_type,
            domain = %self.domain,
            interface = %self.interface,
            "Started browsing"
        );
        self.emit(BrowserEvent::StartedBrowsing);
        Ok(())
    }

    /// Reopens the browse subscription and restarts every gatherer on a
    /// freshly established backend connection.
    pub fn resume(&mut self, ctx: &mut QueryCtx<'_>) -> Result<(), BackendError> {
        self.start_browse(ctx)?;
        for gatherer in self.gatherers.values_mut() {
            gatherer.start(ctx);
        }
        Ok(())
    }

    /// Cancels the browse subscription and forgets every known instance.
    /// The next reconciliation retires whatever was published.
    pub fn stop_browsing(&mut self, ctx: &mut QueryCtx<'_>) {
        if let Some(token) = self.browse_token.take() {
            ctx.cancel(token);
        }
        self.forget();
    }

    /// Like [`BrowserState::stop_browsing`], for when no backend connection
    /// exists and therefore no subscription is open.
    pub fn forget(&mut self) {
        self.wants_browsing = false;
        self.refresh_at = None;
        self.delay_deletes_until = None;
        self.shared.browsing.store(false, Ordering::Release);
        if !self.known.is_empty() || !self.gatherers.is_empty() {
            self.known.clear();
            self.dirty = true;
        }
    }

    /// Releases every backend subscription while keeping all state, ahead
    /// of the backend connection going away.
    pub fn shutdown(&mut self, ctx: &mut QueryCtx<'_>) {
        if let Some(token) = self.browse_token.take() {
            ctx.cancel(token);
        }
        for gatherer in self.gatherers.values_mut() {
            gatherer.stop(ctx);
        }
    }

    pub fn trigger_refresh(&mut self, now: Instant) {
        if !self.wants_browsing {
            return;
        }
        debug!(browser = %self.id, "Refresh requested");
        self.delay_deletes_until = Some(now + self.options.refresh_debounce);
        self.refresh_at = Some(now + self.options.refresh_settle);
    }

    /// Runs a scheduled refresh once its settle delay has passed: the
    /// known list is rebuilt from a fresh browse call while deletions stay
    /// on hold.
    pub fn run_refresh(&mut self, now: Instant, ctx: &mut QueryCtx<'_>) -> Result<(), BackendError> {
        match self.refresh_at {
            Some(at) if at <= now => self.refresh_at = None,
            _ => return Ok(()),
        }
        if !self.wants_browsing {
            return Ok(());
        }
        info!(browser = %self.id, service_type = %self.service_type, "Refreshing browse results");
        self.known.clear();
        self.dirty = true;
        self.start_browse(ctx)
    }

    fn search(&self, full_name: &str) -> Result<usize, usize> {
        self.known
            .binary_search_by(|k| k.full_name.as_str().cmp(full_name))
    }

    /// Applies one reply of the browse subscription. Errors are handed back
    /// for the connection to decide on failover.
    pub fn browse_reply(
        &mut self,
        event: ReplyEvent,
        now: Instant,
        ctx: &mut QueryCtx<'_>,
    ) -> Result<(), BackendError> {
        let (added, interface, name, service_type, domain) = match event {
            ReplyEvent::Browse {
                added,
                interface,
                name,
                service_type,
                domain,
            } => (added, interface, name, service_type, domain),
            ReplyEvent::Error(e) => return Err(e),
            other => {
                debug!(browser = %self.id, "Ignoring unexpected browse reply: {:?}", other);
                return Ok(());
            }
        };

        let service_type = fullname::normalize_type(&service_type);
        let domain = fullname::normalize_domain(&domain);
        let full_name = fullname::escape(&name, &service_type, &domain);

        if added {
            debug!(browser = %self.id, service = %full_name, "Instance added");
            match self.search(&full_name) {
                Ok(i) => self.known[i].interface = interface,
                Err(i) => self.known.insert(
                    i,
                    KnownInstance {
                        full_name: full_name.clone(),
                        name,
                        service_type,
                        domain,
                        interface,
                    },
                ),
            }
            match self.gatherers.get_mut(&full_name) {
                Some(gatherer) => {
                    gatherer.clear_removal();
                    gatherer.reload(interface, ctx);
                }
                None => {
                    if let Ok(i) = self.search(&full_name) {
                        let instance = self.known[i].clone();
                        self.spawn_gatherer(instance, ctx);
                    }
                }
            }
        } else {
            debug!(browser = %self.id, service = %full_name, "Instance removed");
            if let Ok(i) = self.search(&full_name) {
                self.known.remove(i);
            }
            if let Some(gatherer) = self.gatherers.get_mut(&full_name) {
                gatherer.mark_removed(now + self.options.removal_debounce);
            }
        }
        self.dirty = true;
        Ok(())
    }

    fn spawn_gatherer(&mut self, instance: KnownInstance, ctx: &mut QueryCtx<'_>) {
        let mut gatherer = Gatherer::new(
            self.id,
            &instance.name,
            &instance.service_type,
            &instance.domain,
            instance.interface,
            &self.options,
        );
        gatherer.start(ctx);
        self.gatherers.insert(instance.full_name, gatherer);
    }

    /// Routes one sub-query reply to its gatherer. Returns whether a
    /// publish became pending.
    pub fn gatherer_reply(
        &mut self,
        full_name: &str,
        query: SubQuery,
        event: ReplyEvent,
        ctx: &mut QueryCtx<'_>,
    ) -> bool {
        let Some(gatherer) = self.gatherers.get_mut(full_name) else {
            debug!(browser = %self.id, service = %full_name, "Reply for a retired gatherer");
            return false;
        };
        let changed = gatherer.on_reply(query, event, ctx);
        if changed {
            self.dirty = true;
        }
        changed
    }

    pub fn reconfirm(&mut self, full_name: &str, ctx: &mut QueryCtx<'_>) {
        match self.gatherers.get_mut(full_name) {
            Some(gatherer) => gatherer.reconfirm(ctx),
            None => debug!(browser = %self.id, service = %full_name, "Nothing to reconfirm"),
        }
    }

    /// Earliest instant at which [`BrowserState::reconcile`] has time-based
    /// work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        // Nothing is retired while deletions are held back
        let held_until = self.delay_deletes_until;
        let removals = self
            .gatherers
            .values()
            .filter_map(|g| g.removal_deadline())
            .map(move |d| held_until.map_or(d, |h| d.max(h)));
        self.refresh_at
            .into_iter()
            .chain(self.delay_deletes_until)
            .chain(removals)
            .min()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_deadline().map(|d| d <= now).unwrap_or(false)
    }

    pub fn refresh_due(&self, now: Instant) -> bool {
        self.refresh_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Brings gatherers in line with the known list and publishes what has
    /// changed. Returns whether the visible list changed.
    pub fn reconcile(&mut self, now: Instant, ctx: &mut QueryCtx<'_>) -> bool {
        self.dirty = false;
        if self.delay_deletes_until.map(|d| d <= now).unwrap_or(false) {
            self.delay_deletes_until = None;
        }
        let deletes_delayed = self.delay_deletes_until.is_some();

        // Both sequences are sorted by full name; walk them together.
        let mut missing = Vec::new();
        let mut absent = Vec::new();
        {
            let mut known = self.known.iter().peekable();
            let mut names = self.gatherers.keys().peekable();
            loop {
                match (known.peek(), names.peek()) {
                    (Some(k), Some(n)) => match k.full_name.as_str().cmp(n.as_str()) {
                        CmpOrdering::Equal => {
                            known.next();
                            names.next();
                        }
                        CmpOrdering::Less => {
                            missing.push((*k).clone());
                            known.next();
                        }
                        CmpOrdering::Greater => {
                            absent.push((*n).clone());
                            names.next();
                        }
                    },
                    (Some(k), None) => {
                        missing.push((*k).clone());
                        known.next();
                    }
                    (None, Some(n)) => {
                        absent.push((*n).clone());
                        names.next();
                    }
                    (None, None) => break,
                }
            }
        }

        for instance in missing {
            self.spawn_gatherer(instance, ctx);
        }

        let mut changes = Vec::new();
        for full_name in absent {
            let hinted = self
                .gatherers
                .get(&full_name)
                .and_then(|g| g.removal_deadline())
                .map(|d| d > now)
                .unwrap_or(false);
            if deletes_delayed || hinted {
                continue;
            }
            if let Some(mut gatherer) = self.gatherers.remove(&full_name) {
                gatherer.stop(ctx);
                debug!(browser = %self.id, service = %full_name, "Retired gatherer");
                changes.extend(gatherer.retire());
            }
        }

        for gatherer in self.gatherers.values_mut() {
            if gatherer.is_pending() && (gatherer.published().is_none() || !deletes_delayed) {
                changes.extend(gatherer.enact());
            }
        }

        if changes.is_empty() {
            return false;
        }

        let visible: Vec<ServiceRecord> = self
            .gatherers
            .values()
            .filter_map(|g| g.published().cloned())
            .collect();
        *self.shared.services.write() = visible.clone();

        for change in changes {
            self.notify(change);
        }
        self.emit(BrowserEvent::ServicesUpdated(visible));
        true
    }

    fn notify(&self, change: ServiceChange) {
        match (&change.old, &change.new) {
            (None, Some(new)) => {
                info!(browser = %self.id, service = %new, "Service added");
                self.emit(BrowserEvent::ServiceAdded(new.clone()));
            }
            (Some(old), None) => {
                info!(browser = %self.id, service = %old.full_name, "Service removed");
                self.emit(BrowserEvent::ServiceRemoved(old.clone()));
            }
            _ => debug!(browser = %self.id, "Service changed"),
        }
        self.emit(BrowserEvent::ServiceChanged {
            old: change.old,
            new: change.new,
        });
    }
}

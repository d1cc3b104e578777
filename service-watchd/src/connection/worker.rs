//! The connection worker loop.
//!
//! Owns the backend chain, the native handle, the token routes and every
//! attached browser. Walks the chain until one backend answers, then
//! alternates between draining commands, processing backend replies and
//! reconciling browsers until asked to stop or the backend gives up.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use shared::protocol::VERSION_PROPERTY;
use shared::types::{ErrorMessage, Severity};
use tracing::{debug, error, info, warn};
use crate::backend::{Backend, BackendChain, BackendReply, ConnectionHandle, ProcessStatus};
use crate::browser::state::BrowserState;
use crate::browser::{BrowserEvent, BrowserId};
use crate::error::{BackendError, ErrorKind};
use super::flow::FlowController;
use super::routes::{QueryCtx, Route, Routes};
use super::{Command, ConnectionSettings, ConnectionShared, ConnectionStatus};

pub(crate) struct Worker {
    shared: Arc<ConnectionShared>,
    commands: flume::Receiver<Command>,
    chain: BackendChain,
    settings: ConnectionSettings,
    native: Option<(Arc<dyn Backend>, ConnectionHandle)>,
    browsers: BTreeMap<BrowserId, BrowserState>,
    routes: Routes,
    flow: FlowController,
    consecutive_errors: u32,

    /// Problems that ended or degraded the loop, for the final report
    loop_errors: Vec<String>,
}

impl Worker {
    pub fn new(
        shared: Arc<ConnectionShared>,
        commands: flume::Receiver<Command>,
        chain: BackendChain,
        settings: ConnectionSettings,
    ) -> Self {
        let flow = FlowController::new(settings.flush_threshold);
        Self {
            shared,
            commands,
            chain,
            settings,
            native: None,
            browsers: BTreeMap::new(),
            routes: Routes::new(),
            flow,
            consecutive_errors: 0,
            loop_errors: Vec::new(),
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.status.get()
    }

    fn stopping(&self) -> bool {
        !self.status().accepts_requests()
    }

    fn request_stop(&self) {
        self.shared.status.advance_to(ConnectionStatus::Stopping);
    }

    pub fn run(mut self) {
        self.shared.status.advance_to(ConnectionStatus::Started);
        info!(backends = ?self.chain.names(), "Discovery worker started");

        self.drain_commands();
        if !self.stopping() && self.establish() {
            self.shared.status.advance_to(ConnectionStatus::Running);
            self.phase(100, "Discovery running".to_string());
            self.resume_all();
        }

        while !self.stopping() {
            self.iterate();
        }

        self.teardown();
    }

    // --- backend selection ---

    /// Walks the chain until a backend passes its liveness check and hands out a
    /// connection. Returns false when the chain is exhausted or a stop was
    /// requested meanwhile.
    fn establish(&mut self) -> bool {
        let budget = self.chain.remaining_fallback_budget().max(1);
        let mut attempts = 0u32;

        loop {
            if self.stopping() {
                return false;
            }
            self.chain.skip_broken();
            let Some(node) = self.chain.current() else {
                self.fatal_exhausted();
                return false;
            };
            let backend = node.backend().clone();
            let name = node.name().to_string();

            attempts += 1;
            let progress = (attempts * 100 / budget).min(99) as u8;
            self.phase(progress, format!("Connecting to {}", name));

            let failure = match backend.get_property(VERSION_PROPERTY) {
                Ok(version) => match backend.create_connection() {
                    Ok(handle) => {
                        info!(backend = %name, version = %version, "Backend connection established");
                        self.native = Some((backend.clone(), handle));
                        *self.shared.active.lock() = Some((backend, handle));
                        return true;
                    }
                    Err(e) => e,
                },
                Err(e) if e.kind == ErrorKind::DaemonNotRunning => {
                    let claimed = self
                        .chain
                        .current_mut()
                        .map(|n| n.claim_daemon_start())
                        .unwrap_or(false);
                    if claimed {
                        self.report(Severity::Note, format!("{}: {}, trying to start it", name, e));
                        if backend.try_start_daemon() {
                            thread::sleep(self.settings.retry_delay);
                        }
                        continue;
                    }
                    if let Some(node) = self.chain.current_mut() {
                        node.mark_broken(e.to_string());
                    }
                    self.fail_over(&name, &e);
                    continue;
                }
                Err(e) => e,
            };

            let usable = match self.chain.current_mut() {
                Some(node) if failure.disables_backend() => {
                    node.mark_broken(failure.to_string());
                    false
                }
                Some(node) => node.record_error(failure.to_string()),
                None => false,
            };
            if usable {
                debug!(backend = %name, "Backend not ready, retrying: {}", failure);
                thread::sleep(self.settings.retry_delay);
            } else {
                self.fail_over(&name, &failure);
            }
        }
    }

    fn fail_over(&mut self, previous: &str, cause: &BackendError) {
        if let Some(next) = self.chain.advance() {
            self.report(
                Severity::Warning,
                format!("{} failed ({}), falling back to {}", previous, cause, next),
            );
        }
    }

    fn fatal_exhausted(&mut self) {
        let tried = self.chain.names().join(", ");
        self.fatal(format!("No usable discovery backend (tried: {})", tried));
    }

    /// Leaves the current backend mid-run and continues on the next one.
    fn switch_backend(&mut self, cause: &BackendError) {
        let previous = self
            .chain
            .current()
            .map(|n| n.name().to_string())
            .unwrap_or_default();
        self.release_native();
        if let Some(node) = self.chain.current_mut() {
            node.mark_broken(cause.to_string());
        }
        self.fail_over(&previous, cause);

        if self.establish() {
            self.resume_all();
        } else {
            self.request_stop();
        }
    }

    /// Counts a browse failure against the current backend and fails over
    /// once its budget is spent. Returns true when the backend was replaced
    /// (or the connection gave up), which invalidates every open query.
    fn escalate(&mut self, id: BrowserId, err: BackendError) -> bool {
        let Some(node) = self.chain.current_mut() else {
            return false;
        };
        let name = node.name().to_string();
        let within_budget = match err.disables_backend() {
            true => false,
            false => node.record_error(err.to_string()),
        };
        if within_budget {
            let service_type = self
                .browsers
                .get(&id)
                .map(|b| b.service_type().to_string())
                .unwrap_or_default();
            self.report(
                Severity::Error,
                format!("Browsing {} on {} failed: {}", service_type, name, err),
            );
            return false;
        }
        self.switch_backend(&err);
        true
    }

    fn release_native(&mut self) {
        if let Some((backend, handle)) = self.native.take() {
            *self.shared.active.lock() = None;
            for browser in self.browsers.values_mut() {
                let mut ctx = QueryCtx::new(backend.as_ref(), handle, &mut self.routes);
                browser.shutdown(&mut ctx);
            }
            backend.destroy_connection(handle);
            debug!(backend = %backend.name(), "Backend connection destroyed");
        }
        self.routes.clear();
    }

    // --- browsers ---

    fn with_browser(&mut self, id: BrowserId, f: impl FnOnce(&mut BrowserState, &mut QueryCtx<'_>)) -> bool {
        let Some((backend, handle)) = self.native.clone() else {
            return false;
        };
        let Some(browser) = self.browsers.get_mut(&id) else {
            return false;
        };
        let mut ctx = QueryCtx::new(backend.as_ref(), handle, &mut self.routes);
        f(browser, &mut ctx);
        true
    }

    fn attach(&mut self, state: BrowserState) {
        let history = self.shared.history.lock().clone();
        state.replay(&history, self.shared.failed.load(Ordering::Acquire));
        info!(browser = %state.id, service_type = %state.service_type(), "Browser attached");
        self.browsers.insert(state.id, state);
    }

    fn start_browse(&mut self, id: BrowserId) {
        let mut result = Ok(());
        self.with_browser(id, |browser, ctx| result = browser.start_browse(ctx));
        if let Err(e) = result {
            self.escalate(id, e);
        }
    }

    /// Opens subscriptions for every browser that wants them, after the
    /// backend connection was (re)established.
    fn resume_all(&mut self) {
        let ids: Vec<BrowserId> = self
            .browsers
            .values()
            .filter(|b| b.wants_browsing())
            .map(|b| b.id)
            .collect();
        for id in ids {
            let mut result = Ok(());
            self.with_browser(id, |browser, ctx| result = browser.resume(ctx));
            if let Err(e) = result {
                if self.escalate(id, e) {
                    // The replacement backend already resumed everyone
                    return;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddBrowser(state) => self.attach(*state),
            Command::RemoveBrowser(id) => {
                self.with_browser(id, |browser, ctx| browser.shutdown(ctx));
                if self.browsers.remove(&id).is_some() {
                    debug!(browser = %id, "Browser detached");
                }
            }
            Command::StartBrowsing { id, interface } => {
                if let Some(browser) = self.browsers.get_mut(&id) {
                    browser.set_wants(interface);
                }
                if self.status() == ConnectionStatus::Running {
                    self.start_browse(id);
                }
            }
            Command::StopBrowsing(id) => {
                if !self.with_browser(id, |browser, ctx| browser.stop_browsing(ctx)) {
                    if let Some(browser) = self.browsers.get_mut(&id) {
                        browser.forget();
                    }
                }
            }
            Command::TriggerRefresh(id) => {
                if let Some(browser) = self.browsers.get_mut(&id) {
                    browser.trigger_refresh(Instant::now());
                }
            }
            Command::Reconfirm { id, full_name } => {
                self.with_browser(id, |browser, ctx| browser.reconfirm(&full_name, ctx));
            }
            Command::Stop => self.request_stop(),
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }
    }

    // --- event loop ---

    fn iterate(&mut self) {
        self.drain_commands();
        if self.stopping() {
            return;
        }

        self.run_timers(Instant::now());

        let Some((backend, handle)) = self.native.clone() else {
            self.request_stop();
            return;
        };
        let wait = self.next_wait(Instant::now());
        let batch = backend.process_one_event_batch(handle, Some(wait));

        match batch.status {
            ProcessStatus::Idle | ProcessStatus::Ok => self.consecutive_errors = 0,
            ProcessStatus::Error => {
                self.consecutive_errors += 1;
                warn!(
                    backend = %backend.name(),
                    errors = self.consecutive_errors,
                    "Event processing error"
                );
                if self.consecutive_errors > self.settings.max_consecutive_errors {
                    self.loop_errors.push(format!(
                        "{} consecutive processing errors on {}",
                        self.consecutive_errors,
                        backend.name()
                    ));
                    self.request_stop();
                }
            }
            ProcessStatus::Failure => {
                error!(backend = %backend.name(), "Backend connection failed");
                self.loop_errors
                    .push(format!("{} reported a connection failure", backend.name()));
                self.request_stop();
            }
            ProcessStatus::Quit => {
                info!(backend = %backend.name(), "Backend asked the worker to quit");
                self.request_stop();
            }
        }

        if batch.replies.is_empty() {
            self.flow.quiesce();
            if self.flow.should_reconcile() {
                self.reconcile_dirty();
            }
            return;
        }
        for reply in batch.replies {
            self.dispatch(reply);
            if self.native.is_none() {
                // A failover replaced the backend; remaining replies are stale
                break;
            }
        }
    }

    fn dispatch(&mut self, reply: BackendReply) {
        let Some(route) = self.routes.get(reply.token).cloned() else {
            debug!(token = %reply.token, "Dropping reply for a released token");
            return;
        };
        let Some((backend, handle)) = self.native.clone() else {
            return;
        };

        let now = Instant::now();
        let mut escalation = None;
        let dirtied = {
            let mut ctx = QueryCtx::new(backend.as_ref(), handle, &mut self.routes);
            match route {
                Route::Browse(id) => match self.browsers.get_mut(&id) {
                    Some(browser) => match browser.browse_reply(reply.event, now, &mut ctx) {
                        Ok(()) => true,
                        Err(e) => {
                            escalation = Some((id, e));
                            false
                        }
                    },
                    None => false,
                },
                Route::Query {
                    browser,
                    full_name,
                    kind,
                } => self
                    .browsers
                    .get_mut(&browser)
                    .map(|b| b.gatherer_reply(&full_name, kind, reply.event, &mut ctx))
                    .unwrap_or(false),
            }
        };

        if let Some((id, e)) = escalation {
            self.escalate(id, e);
        }

        self.flow.observe(reply.more_coming);
        if dirtied {
            self.flow.note_pending();
        }
        if self.flow.should_reconcile() {
            self.reconcile_dirty();
        }
    }

    /// Runs due refreshes and reconciles browsers with expired deadlines,
    /// plus dirty ones when no burst is in progress.
    fn run_timers(&mut self, now: Instant) {
        let Some((backend, handle)) = self.native.clone() else {
            return;
        };
        let waiting = self.flow.is_waiting();
        let mut failed = Vec::new();
        for browser in self.browsers.values_mut() {
            let mut ctx = QueryCtx::new(backend.as_ref(), handle, &mut self.routes);
            if browser.refresh_due(now) {
                if let Err(e) = browser.run_refresh(now, &mut ctx) {
                    failed.push((browser.id, e));
                }
            }
            if browser.is_due(now) || (browser.is_dirty() && !waiting) {
                browser.reconcile(now, &mut ctx);
            }
        }
        for (id, e) in failed {
            self.escalate(id, e);
        }
    }

    fn reconcile_dirty(&mut self) {
        self.flow.reconciled();
        let Some((backend, handle)) = self.native.clone() else {
            return;
        };
        let now = Instant::now();
        for browser in self.browsers.values_mut().filter(|b| b.is_dirty()) {
            let mut ctx = QueryCtx::new(backend.as_ref(), handle, &mut self.routes);
            browser.reconcile(now, &mut ctx);
        }
    }

    fn next_wait(&self, now: Instant) -> Duration {
        let mut wait = self.settings.poll_ceiling;
        if self.flow.is_waiting() {
            wait = wait.min(self.settings.more_coming_grace);
        }
        self.browsers
            .values()
            .filter_map(|b| b.next_deadline())
            .map(|d| d.saturating_duration_since(now))
            .fold(wait, Duration::min)
    }

    // --- reporting ---

    fn phase(&self, progress: u8, description: String) {
        for browser in self.browsers.values() {
            browser.emit(BrowserEvent::StartupPhase {
                progress,
                description: description.clone(),
            });
        }
    }

    fn report(&self, severity: Severity, text: String) {
        match severity {
            Severity::Note => info!("{}", text),
            Severity::Warning => warn!("{}", text),
            Severity::Error | Severity::Fatal => error!("{}", text),
        }
        let message = ErrorMessage::new(severity, text);
        self.shared.history.lock().push(message.clone());
        for browser in self.browsers.values() {
            browser.emit(BrowserEvent::ErrorMessage(message.clone()));
        }
    }

    /// Reports an unrecoverable error and fails every attached browser.
    fn fatal(&self, text: String) {
        self.report(Severity::Fatal, text);
        self.shared.failed.store(true, Ordering::Release);
        let history = self.shared.history.lock().clone();
        for browser in self.browsers.values() {
            browser.fail(&history);
        }
        self.request_stop();
    }

    fn teardown(&mut self) {
        self.request_stop();
        self.release_native();

        if !self.loop_errors.is_empty() && !self.shared.failed.load(Ordering::Acquire) {
            let mut types: Vec<&str> = self.browsers.values().map(|b| b.service_type()).collect();
            types.sort_unstable();
            types.dedup();
            self.fatal(format!(
                "Discovery stopped: {} (browsing {})",
                self.loop_errors.join("; "),
                types.join(", ")
            ));
        }

        for browser in self.browsers.values_mut() {
            browser.forget();
        }
        {
            let _history = self.shared.history.lock();
            self.shared.status.advance_to(ConnectionStatus::Stopped);
        }

        // Browsers that raced with the stop still get the history
        while let Ok(command) = self.commands.try_recv() {
            if let Command::AddBrowser(state) = command {
                self.attach(*state);
            }
        }
        info!("Discovery worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use shared::types::{InterfaceId, Severity};
    use tokio::sync::mpsc;
    use crate::backend::fake::{FakeBackend, FakeMode, FakeService};
    use crate::backend::{Backend, BackendDescriptor, ProcessStatus};
    use crate::browser::state::BrowserState;
    use crate::browser::{BrowserEvent, BrowserId, BrowserOptions, BrowserShared};
    use crate::connection::{Command, Connection, ConnectionSettings, ConnectionStatus};

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            max_consecutive_errors: 3,
            poll_ceiling: Duration::from_millis(50),
            more_coming_grace: Duration::from_millis(20),
            flush_threshold: 50,
            retry_delay: Duration::from_millis(5),
        }
    }

    fn attach(
        connection: &Connection,
        id: u64,
        service_type: &str,
    ) -> (Arc<BrowserShared>, mpsc::UnboundedReceiver<BrowserEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BrowserShared::default());
        let state = BrowserState::new(
            BrowserId(id),
            service_type.to_string(),
            "local.".to_string(),
            BrowserOptions::default(),
            shared.clone(),
            tx,
        );
        connection.add_browser(state).unwrap();
        // Fails once the connection gave up, which some tests expect
        let _ = connection.send(Command::StartBrowsing {
            id: BrowserId(id),
            interface: InterfaceId::ANY,
        });
        (shared, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<BrowserEvent>) -> BrowserEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<BrowserEvent>, mut pred: F) -> Vec<BrowserEvent>
    where
        F: FnMut(&BrowserEvent) -> bool,
    {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<BrowserEvent>) -> Vec<BrowserEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn fatal_count(events: &[BrowserEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, BrowserEvent::ErrorMessage(m) if m.severity == Severity::Fatal))
            .count()
    }

    #[tokio::test]
    async fn test_exhausted_chain_reports_one_fatal() {
        let backends: Vec<Arc<FakeBackend>> = (0..3)
            .map(|i| Arc::new(FakeBackend::with_mode(&format!("fake-{}", i), FakeMode::Unusable)))
            .collect();
        let chain = backends
            .iter()
            .map(|b| BackendDescriptor::new(b.clone() as Arc<dyn Backend>, 2))
            .collect();
        let connection = Connection::spawn(chain, settings()).unwrap();
        let (shared, mut rx) = attach(&connection, 1, "_ipp._tcp");

        assert_eq!(
            connection.wait_for(ConnectionStatus::Stopped, Duration::from_secs(5)),
            ConnectionStatus::Stopped
        );

        let mut all = wait_for(&mut rx, |e| matches!(e, BrowserEvent::HadFailure(_))).await;
        all.extend(drain(&mut rx));
        assert_eq!(fatal_count(&all), 1);
        assert!(shared.failed.load(std::sync::atomic::Ordering::Acquire));
        for backend in &backends {
            assert_eq!(backend.count_calls("create"), 0);
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_next_backend() {
        let broken = Arc::new(FakeBackend::with_mode("broken", FakeMode::Unreachable));
        let good = Arc::new(FakeBackend::new("good"));
        good.announce(FakeService::new("printer1", "_ipp._tcp", "printer1.local.", 631, &["192.168.1.5"]));

        let chain = vec![
            BackendDescriptor::new(broken.clone(), 2),
            BackendDescriptor::new(good.clone(), 2),
        ];
        let connection = Connection::spawn(chain, settings()).unwrap();
        let (_shared, mut rx) = attach(&connection, 1, "_ipp._tcp");

        let events = wait_for(&mut rx, |e| matches!(e, BrowserEvent::ServiceAdded(_))).await;
        let warnings = events
            .iter()
            .filter(|e| matches!(e, BrowserEvent::ErrorMessage(m) if m.severity == Severity::Warning))
            .count();
        assert_eq!(warnings, 1);
        // One initial check plus two retries before giving up on it
        assert_eq!(broken.count_calls("version"), 3);
        assert_eq!(connection.status(), ConnectionStatus::Running);

        connection.stop(true).unwrap();
        assert_eq!(connection.status(), ConnectionStatus::Stopped);
        assert_eq!(good.live_connections(), 0);
        assert_eq!(good.count_calls("destroy"), 1);
    }

    #[tokio::test]
    async fn test_starts_daemon_when_down() {
        let backend = Arc::new(FakeBackend::with_mode("fake", FakeMode::DaemonDown { starts: true }));
        let chain = vec![BackendDescriptor::new(backend.clone(), 2)];
        let connection = Connection::spawn(chain, settings()).unwrap();
        let (_shared, mut rx) = attach(&connection, 1, "_ipp._tcp");

        wait_for(&mut rx, |e| matches!(e, BrowserEvent::StartedBrowsing)).await;
        assert_eq!(backend.count_calls("start-daemon"), 1);
        assert_eq!(backend.count_calls("version"), 2);
        connection.stop(true).unwrap();
    }

    #[tokio::test]
    async fn test_connect_failures_retry_then_fall_back() {
        let refusing = Arc::new(FakeBackend::with_mode("refusing", FakeMode::ConnectFails));
        let good = Arc::new(FakeBackend::new("good"));
        good.announce(FakeService::new("printer1", "_ipp._tcp", "printer1.local.", 631, &["192.168.1.5"]));

        let chain = vec![
            BackendDescriptor::new(refusing.clone(), 2),
            BackendDescriptor::new(good.clone(), 2),
        ];
        let connection = Connection::spawn(chain, settings()).unwrap();
        let (_shared, mut rx) = attach(&connection, 1, "_ipp._tcp");

        let events = wait_for(&mut rx, |e| matches!(e, BrowserEvent::ServiceAdded(_))).await;
        let warnings: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                BrowserEvent::ErrorMessage(m) if m.severity == Severity::Warning => Some(m.text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("refusing"));
        assert!(warnings[0].contains("good"));
        assert_eq!(
            refusing.calls(),
            vec!["version", "create", "version", "create", "version", "create"]
        );
        assert_eq!(refusing.live_connections(), 0);
        assert_eq!(good.count_calls("create"), 1);
        assert_eq!(fatal_count(&events), 0);
        connection.stop(true).unwrap();
    }

    #[tokio::test]
    async fn test_daemon_that_never_starts_falls_back() {
        let down = Arc::new(FakeBackend::with_mode("down", FakeMode::DaemonDown { starts: false }));
        let good = Arc::new(FakeBackend::new("good"));
        let chain = vec![
            BackendDescriptor::new(down.clone(), 2),
            BackendDescriptor::new(good.clone(), 2),
        ];
        let connection = Connection::spawn(chain, settings()).unwrap();
        let (_shared, mut rx) = attach(&connection, 1, "_ipp._tcp");

        let events = wait_for(&mut rx, |e| matches!(e, BrowserEvent::StartedBrowsing)).await;
        let notes = events
            .iter()
            .filter(|e| matches!(e, BrowserEvent::ErrorMessage(m) if m.severity == Severity::Note))
            .count();
        let warnings = events
            .iter()
            .filter(|e| matches!(e, BrowserEvent::ErrorMessage(m) if m.severity == Severity::Warning))
            .count();
        assert_eq!(notes, 2);
        assert_eq!(warnings, 1);
        assert_eq!(down.count_calls("start-daemon"), 2);
        assert_eq!(down.count_calls("version"), 3);
        assert_eq!(down.count_calls("create"), 0);
        assert_eq!(good.count_calls("create"), 1);
        connection.stop(true).unwrap();
    }

    #[tokio::test]
    async fn test_metadata_states_reach_published_record() {
        let backend = Arc::new(FakeBackend::new("fake"));
        backend.announce(
            FakeService::new("printer1", "_ipp._tcp", "printer1.local.", 631, &["192.168.1.5"])
                .with_metadata("rp", Some("ipp/print"))
                .with_metadata("color", None)
                .with_metadata("note", Some("")),
        );
        let chain = vec![BackendDescriptor::new(backend.clone(), 2)];
        let connection = Connection::spawn(chain, settings()).unwrap();
        let (shared, mut rx) = attach(&connection, 1, "_ipp._tcp");

        let events = wait_for(&mut rx, |e| match e {
            BrowserEvent::ServiceAdded(r) | BrowserEvent::ServiceChanged { new: Some(r), .. } => {
                r.metadata.len() == 3
            }
            _ => false,
        })
        .await;
        let record = match events.last() {
            Some(BrowserEvent::ServiceAdded(r)) | Some(BrowserEvent::ServiceChanged { new: Some(r), .. }) => r.clone(),
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(record.metadata.get("rp"), Some(&Some("ipp/print".to_string())));
        // Key present without a value, and key present with an empty value
        assert_eq!(record.metadata.get("color"), Some(&None));
        assert_eq!(record.metadata.get("note"), Some(&Some(String::new())));
        assert_eq!(record.metadata.get("missing"), None);
        assert_eq!(shared.services.read()[0].metadata, record.metadata);
        connection.stop(true).unwrap();
    }

    #[tokio::test]
    async fn test_consecutive_errors_stop_connection() {
        let backend = Arc::new(FakeBackend::new("fake"));
        let chain = vec![BackendDescriptor::new(backend.clone(), 2)];
        let connection = Connection::spawn(chain, settings()).unwrap();
        let (_shared, mut rx) = attach(&connection, 1, "_ipp._tcp");
        wait_for(&mut rx, |e| matches!(e, BrowserEvent::StartedBrowsing)).await;

        backend.force_status(ProcessStatus::Error, 4);
        let events = wait_for(&mut rx, |e| matches!(e, BrowserEvent::HadFailure(_))).await;
        assert_eq!(fatal_count(&events), 1);
        let fatal = events
            .iter()
            .find_map(|e| match e {
                BrowserEvent::ErrorMessage(m) if m.is_fatal() => Some(m.text.clone()),
                _ => None,
            })
            .unwrap();
        assert!(fatal.contains("_ipp._tcp"));

        assert_eq!(
            connection.wait_for(ConnectionStatus::Stopped, Duration::from_secs(5)),
            ConnectionStatus::Stopped
        );
        assert_eq!(backend.count_calls("destroy"), 1);
    }

    #[tokio::test]
    async fn test_browse_failure_fails_over_mid_run() {
        let first = Arc::new(FakeBackend::with_mode("first", FakeMode::BrowseFails));
        let second = Arc::new(FakeBackend::new("second"));
        second.announce(FakeService::new("printer1", "_ipp._tcp", "printer1.local.", 631, &["192.168.1.5"]));

        let chain = vec![
            BackendDescriptor::new(first.clone(), 0),
            BackendDescriptor::new(second.clone(), 2),
        ];
        let connection = Connection::spawn(chain, settings()).unwrap();
        let (_shared, mut rx) = attach(&connection, 1, "_ipp._tcp");

        wait_for(&mut rx, |e| matches!(e, BrowserEvent::ServiceAdded(_))).await;
        assert_eq!(connection.status(), ConnectionStatus::Running);
        assert_eq!(first.live_connections(), 0);
        assert_eq!(second.count_calls("browse _ipp._tcp"), 1);
        connection.stop(true).unwrap();
    }

    #[tokio::test]
    async fn test_late_browser_gets_history() {
        let backend = Arc::new(FakeBackend::with_mode("only", FakeMode::Unusable));
        let chain = vec![BackendDescriptor::new(backend.clone(), 1)];
        let connection = Connection::spawn(chain, settings()).unwrap();
        assert_eq!(
            connection.wait_for(ConnectionStatus::Stopped, Duration::from_secs(5)),
            ConnectionStatus::Stopped
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BrowserShared::default());
        let state = BrowserState::new(
            BrowserId(7),
            "_http._tcp".to_string(),
            "local.".to_string(),
            BrowserOptions::default(),
            shared.clone(),
            tx,
        );
        connection.add_browser(state).unwrap();

        let events = drain(&mut rx);
        assert_eq!(fatal_count(&events), 1);
        assert!(matches!(events.last(), Some(BrowserEvent::HadFailure(h)) if h.len() == 1));
        assert!(shared.failed.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let backend = Arc::new(FakeBackend::new("fake"));
        let chain = vec![BackendDescriptor::new(backend.clone(), 2)];
        let connection = Connection::spawn(chain, settings()).unwrap();
        assert_eq!(
            connection.wait_for(ConnectionStatus::Running, Duration::from_secs(5)),
            ConnectionStatus::Running
        );
        connection.stop(true).unwrap();
        connection.stop(true).unwrap();
        assert_eq!(connection.status(), ConnectionStatus::Stopped);
        assert_eq!(backend.count_calls("destroy"), 1);
        assert_eq!(backend.count_calls("create"), 1);
    }
}

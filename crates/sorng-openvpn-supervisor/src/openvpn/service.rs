//! OpenVPN client: one supervised session at a time.
//!
//! Owns the session state machine, starts the output readers and the
//! exit watcher for every spawn, and resolves `connect` through the
//! connection waiter. All session state sits behind one async mutex;
//! the event bus is read without it.
//!
//! When a session ends its bus is closed and the next session's bus is
//! installed straight away, so subscribing between sessions always
//! yields receivers that will see the next `connect` from its start.

use crate::openvpn::auth::{stage_credentials, StagedCredentials, VpnCredentials};
use crate::openvpn::classifier::{classify, LineSignal};
use crate::openvpn::config::SupervisorConfig;
use crate::openvpn::events::EventBus;
use crate::openvpn::logging::{spawn_output_reader, LineSink, LogBuffer};
use crate::openvpn::process::{self, ExitOutcome};
use crate::openvpn::reaper::{reap_stale_processes, PgrepScanner, ProcessScanner};
use crate::openvpn::types::*;
use crate::openvpn::waiter::{wait_for_connection, WaitOutcome};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything that belongs to the current (or last) session.
#[derive(Default)]
struct Session {
    /// Bumped on every spawn; tasks of older sessions compare against it.
    generation: u64,
    state: SupervisorState,
    running: bool,
    pid: Option<u32>,
    logs: LogBuffer,
    last_cause: Option<ErrorCause>,
    staged: Option<StagedCredentials>,
    cancel: Option<CancellationToken>,
    kill: Option<CancellationToken>,
    /// Exit watcher has reaped the child.
    exited: bool,
    done: Option<watch::Receiver<bool>>,
    /// Cleanup already ran for this session.
    closed: bool,
}

struct ClientInner {
    settings: SupervisorConfig,
    binary: PathBuf,
    config: Vec<u8>,
    credentials: VpnCredentials,
    scanner: Arc<dyn ProcessScanner>,
    session: Mutex<Session>,
    bus: RwLock<Arc<EventBus>>,
    /// Parent of every session token; cancelled when the client is dropped.
    shutdown: CancellationToken,
}

impl ClientInner {
    fn target(&self) -> &str {
        self.settings.log_target.as_str()
    }

    fn current_bus(&self) -> Arc<EventBus> {
        self.bus
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The bus for a new session: the current one if it is still open,
    /// otherwise a fresh one with a new session id.
    fn bus_for_new_session(&self) -> Arc<EventBus> {
        let mut slot = self.bus.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_closed() {
            let next = self.next_bus(&slot);
            *slot = Arc::new(next);
        }
        slot.clone()
    }

    /// Install the next session's bus in place of `ended`, if `ended` is
    /// still the current one. The new bus starts at `ended`'s final status.
    fn retire_bus(&self, ended: &Arc<EventBus>) {
        let mut slot = self.bus.write().unwrap_or_else(PoisonError::into_inner);
        if Arc::ptr_eq(&*slot, ended) {
            *slot = Arc::new(self.next_bus(ended));
        }
    }

    fn next_bus(&self, previous: &EventBus) -> EventBus {
        EventBus::from_config(new_session_id(), &self.settings).with_status(previous.status())
    }

    /// Remove staged files, close the session's bus, and hand over to the
    /// next one. Runs once per session.
    fn cleanup(&self, session: &mut Session, bus: &Arc<EventBus>) {
        if session.closed {
            return;
        }
        session.closed = true;
        if let Some(mut staged) = session.staged.take() {
            if let Err(e) = staged.remove() {
                log::warn!(target: self.target(), "{}", e);
            }
        }
        bus.close();
        self.retire_bus(bus);
    }

    fn reaper_name(&self) -> String {
        self.binary
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("openvpn")
            .to_string()
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Output sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SessionSink {
    inner: Arc<ClientInner>,
    generation: u64,
    bus: Arc<EventBus>,
}

#[async_trait]
impl LineSink for SessionSink {
    async fn on_line(&self, stream: OutputStream, line: String) {
        let target = self.inner.target();
        let mut session = self.inner.session.lock().await;
        if session.generation != self.generation {
            return;
        }
        log::trace!(target: target, "[{}] {}", stream, line);

        let signal = classify(&line, &self.inner.settings.connected_marker);
        session.logs.push(line.clone());
        self.bus.publish_log(stream, line);

        match signal {
            Some(LineSignal::Connected) => {
                if self.bus.status() == ConnectionStatus::Initializing {
                    log::info!(target: target, "tunnel established (session {})", self.bus.session_id());
                    self.bus.publish_status(ConnectionStatus::Connected);
                }
            }
            Some(LineSignal::Failure(cause)) => {
                log::debug!(target: target, "classified failure: {}", cause);
                session.last_cause = Some(cause);
            }
            None => {}
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Exit watcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ExitWatch {
    inner: Arc<ClientInner>,
    generation: u64,
    bus: Arc<EventBus>,
    child: Child,
    cancel: CancellationToken,
    kill: CancellationToken,
    readers: Vec<JoinHandle<()>>,
    done: watch::Sender<bool>,
}

impl ExitWatch {
    async fn run(mut self) {
        let inner = self.inner.clone();
        let target = inner.target();

        let outcome = process::wait_for_exit(
            &mut self.child,
            &self.cancel,
            &self.kill,
            inner.settings.terminate_grace(),
            target,
        )
        .await;
        log::info!(
            target: target,
            "openvpn exited ({}) for session {}",
            outcome.description,
            self.bus.session_id()
        );

        drain_readers(
            std::mem::take(&mut self.readers),
            inner.settings.drain_timeout(),
            target,
        )
        .await;

        {
            let mut session = inner.session.lock().await;
            if session.generation == self.generation {
                self.finish(&mut session, &outcome);
            } else {
                // A newer session took over; ours was already cleaned up
                // by disconnect.
                self.bus.close();
            }
        }

        // Ends the caller link task, if any.
        self.cancel.cancel();
        self.done.send_replace(true);
    }

    fn finish(&self, session: &mut Session, outcome: &ExitOutcome) {
        let stopped = outcome.success || self.cancel.is_cancelled();
        session.running = false;
        session.exited = true;
        session.pid = None;
        session.state = if stopped {
            SupervisorState::Stopped
        } else {
            SupervisorState::Failed
        };

        if !session.closed {
            if stopped {
                self.bus.publish_status(ConnectionStatus::Disconnected);
            } else {
                let cause = session.last_cause.clone().unwrap_or_else(|| {
                    ErrorCause::generic(format!("process exited with error: {}", outcome.description))
                });
                log::warn!(target: self.inner.target(), "openvpn session failed: {}", cause);
                session.last_cause = Some(cause.clone());
                self.bus.publish_error(cause, outcome.code);
                self.bus.publish_status(ConnectionStatus::Error);
            }
        }
        self.inner.cleanup(session, &self.bus);
    }
}

async fn drain_readers(readers: Vec<JoinHandle<()>>, within: Duration, target: &str) {
    let deadline = Instant::now() + within;
    for mut handle in readers {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            log::debug!(target: target, "output reader still busy after exit, aborting");
            handle.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Supervises one `openvpn` process per session.
pub struct OpenVpnClient {
    inner: Arc<ClientInner>,
}

impl OpenVpnClient {
    /// Build a client with default settings. The binary is resolved now.
    pub fn new(
        config: impl Into<Vec<u8>>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, OpenVpnError> {
        Self::with_settings(SupervisorConfig::default(), config, username, password)
    }

    pub fn with_settings(
        settings: SupervisorConfig,
        config: impl Into<Vec<u8>>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, OpenVpnError> {
        Self::with_process_scanner(
            settings,
            Arc::new(PgrepScanner),
            config,
            username,
            password,
        )
    }

    /// Like `with_settings`, with a custom scanner for stale processes.
    pub fn with_process_scanner(
        settings: SupervisorConfig,
        scanner: Arc<dyn ProcessScanner>,
        config: impl Into<Vec<u8>>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, OpenVpnError> {
        settings.validate()?;
        let binary = resolve_binary(&settings.binary).ok_or_else(|| {
            OpenVpnError::new(
                OpenVpnErrorKind::BinaryNotFound,
                "OpenVPN binary not found in PATH or default locations",
            )
            .with_detail(settings.binary.display().to_string())
        })?;
        log::debug!(target: settings.log_target.as_str(), "using openvpn binary {}", binary.display());

        let bus = Arc::new(EventBus::from_config(new_session_id(), &settings));
        let session = Session {
            logs: LogBuffer::new(settings.log_buffer_limit),
            ..Default::default()
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                binary,
                config: config.into(),
                credentials: VpnCredentials::basic(username, password),
                scanner,
                session: Mutex::new(session),
                bus: RwLock::new(bus),
                shutdown: CancellationToken::new(),
                settings,
            }),
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Start a session and wait until the tunnel is up, the session
    /// fails, or `timeout` elapses.
    pub async fn connect(&self, timeout: Duration) -> Result<(), OpenVpnError> {
        self.connect_inner(timeout, None).await
    }

    /// `connect`, additionally aborted when `token` fires. Firing `token`
    /// later still stops the session.
    pub async fn connect_cancellable(
        &self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<(), OpenVpnError> {
        self.connect_inner(timeout, Some(token)).await
    }

    async fn connect_inner(
        &self,
        timeout: Duration,
        caller: Option<&CancellationToken>,
    ) -> Result<(), OpenVpnError> {
        let deadline = Instant::now() + timeout;
        let (bus, status_rx, errors_rx) = self.start_session(caller).await?;

        let inner = self.inner.clone();
        let outcome = wait_for_connection(&bus, status_rx, errors_rx, deadline, caller, move || {
            let inner = inner.clone();
            async move { inner.session.lock().await.last_cause.clone() }
        })
        .await;

        match outcome {
            WaitOutcome::Connected => Ok(()),
            WaitOutcome::Failed(cause) => Err(OpenVpnError::connection_failed(cause)),
            gave_up => {
                log::warn!(
                    target: self.inner.target(),
                    "connect gave up ({:?}), stopping session {}",
                    gave_up,
                    bus.session_id()
                );
                self.disconnect().await?;
                self.force_kill_if_still_running().await;
                let detail = if gave_up == WaitOutcome::Cancelled {
                    "cancelled by caller".to_string()
                } else {
                    format!("no connection within {:?}", timeout)
                };
                Err(OpenVpnError::timeout().with_detail(detail))
            }
        }
    }

    /// Reap, stage, spawn, and start the session tasks. Returns the
    /// session's bus with receivers subscribed before anything was
    /// published.
    async fn start_session(
        &self,
        caller: Option<&CancellationToken>,
    ) -> Result<
        (
            Arc<EventBus>,
            broadcast::Receiver<StatusChangeEvent>,
            broadcast::Receiver<ErrorEvent>,
        ),
        OpenVpnError,
    > {
        let inner = &self.inner;
        let target = inner.target();
        let mut session = inner.session.lock().await;
        if session.running {
            return Err(OpenVpnError::already_running());
        }
        session.state = SupervisorState::Starting;

        if inner.settings.reap_stale_processes {
            if let Err(e) =
                reap_stale_processes(inner.scanner.as_ref(), &inner.reaper_name(), target).await
            {
                session.state = SupervisorState::Failed;
                return Err(e);
            }
        }

        let mut staged = match stage_credentials(
            &inner.settings.staging_dir(),
            &inner.config,
            &inner.credentials,
        ) {
            Ok(s) => s,
            Err(e) => {
                session.state = SupervisorState::Failed;
                return Err(e);
            }
        };

        let bus = inner.bus_for_new_session();
        let status_rx = bus.subscribe_status();
        let errors_rx = bus.subscribe_errors();

        let spawned = match process::spawn_openvpn(&inner.binary, &staged) {
            Ok(s) => s,
            Err(e) => {
                if let Err(rm) = staged.remove() {
                    log::warn!(target: target, "{}", rm);
                }
                session.state = SupervisorState::Failed;
                return Err(e);
            }
        };

        let cancel = inner.shutdown.child_token();
        if let Some(caller) = caller {
            let caller = caller.clone();
            let session_token = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => session_token.cancel(),
                    _ = session_token.cancelled() => {}
                }
            });
        }
        let kill = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        session.generation += 1;
        let generation = session.generation;
        session.state = SupervisorState::Running;
        session.running = true;
        session.pid = spawned.pid;
        session.logs.clear();
        session.last_cause = None;
        session.staged = Some(staged);
        session.cancel = Some(cancel.clone());
        session.kill = Some(kill.clone());
        session.exited = false;
        session.done = Some(done_rx);
        session.closed = false;

        log::info!(
            target: target,
            "openvpn started (pid {:?}) for session {}",
            spawned.pid,
            bus.session_id()
        );
        bus.publish_status(ConnectionStatus::Initializing);

        let sink: Arc<dyn LineSink> = Arc::new(SessionSink {
            inner: inner.clone(),
            generation,
            bus: bus.clone(),
        });
        let readers = vec![
            spawn_output_reader(
                OutputStream::Stdout,
                spawned.stdout,
                sink.clone(),
                target.to_string(),
            ),
            spawn_output_reader(OutputStream::Stderr, spawned.stderr, sink, target.to_string()),
        ];

        let watcher = ExitWatch {
            inner: inner.clone(),
            generation,
            bus: bus.clone(),
            child: spawned.child,
            cancel,
            kill,
            readers,
            done: done_tx,
        };
        tokio::spawn(watcher.run());

        Ok((bus, status_rx, errors_rx))
    }

    /// Stop the session without waiting for the process to exit.
    /// Publishes Disconnected, removes the staged files, and closes the
    /// event channels. A no-op when nothing is running.
    pub async fn disconnect(&self) -> Result<(), OpenVpnError> {
        let mut session = self.inner.session.lock().await;
        if !session.running {
            return Ok(());
        }
        if let Some(cancel) = &session.cancel {
            cancel.cancel();
        }
        session.running = false;
        session.state = SupervisorState::Stopping;
        log::info!(target: self.inner.target(), "disconnect requested (pid {:?})", session.pid);

        let bus = self.inner.current_bus();
        bus.publish_status(ConnectionStatus::Disconnected);
        self.inner.cleanup(&mut session, &bus);
        Ok(())
    }

    /// Disconnect and wait until the session has reached a terminal
    /// status and the process is confirmed gone.
    pub async fn disconnect_and_wait(&self, timeout: Duration) -> Result<(), OpenVpnError> {
        let deadline = Instant::now() + timeout;
        let (done, was_running) = {
            let session = self.inner.session.lock().await;
            (session.done.clone(), session.running)
        };
        let bus = self.inner.current_bus();
        let mut status_rx = bus.subscribe_status();
        let mut errors_rx = bus.subscribe_errors();

        self.disconnect().await?;

        if was_running {
            wait_for_terminal(&bus, &mut status_rx, &mut errors_rx, deadline).await?;
        }

        if let Some(mut done) = done {
            let confirmed = tokio::time::timeout_at(deadline, async {
                done.wait_for(|finished| *finished).await.map(|_| ())
            })
            .await;
            match confirmed {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(OpenVpnError::new(
                        OpenVpnErrorKind::DisconnectFailed,
                        "Exit watcher ended without confirming process exit",
                    ))
                }
                Err(_) => {
                    return Err(OpenVpnError::new(
                        OpenVpnErrorKind::DisconnectFailed,
                        "Process exit not confirmed before deadline",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Disconnect, pause for the configured cooldown, connect again.
    pub async fn reconnect(&self, timeout: Duration) -> Result<(), OpenVpnError> {
        log::info!(target: self.inner.target(), "reconnecting");
        self.disconnect().await?;
        tokio::time::sleep(self.inner.settings.reconnect_cooldown()).await;
        self.connect(timeout).await
    }

    /// Kill the process outright unless its exit is already confirmed.
    /// Returns `true` if a kill was requested.
    pub async fn force_kill_if_still_running(&self) -> bool {
        let session = self.inner.session.lock().await;
        if session.exited {
            return false;
        }
        let (Some(cancel), Some(kill)) = (&session.cancel, &session.kill) else {
            return false;
        };
        log::warn!(target: self.inner.target(), "force-killing openvpn (pid {:?})", session.pid);
        cancel.cancel();
        kill.cancel();
        true
    }

    // ── Accessors ─────────────────────────────────────────────────

    /// Latest connection status; never blocks.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.current_bus().status()
    }

    pub async fn state(&self) -> SupervisorState {
        self.inner.session.lock().await.state
    }

    /// Every line captured in the current (or last) session.
    pub async fn logs(&self) -> Vec<String> {
        self.inner.session.lock().await.logs.snapshot()
    }

    /// The last `n` captured lines.
    pub async fn tail_logs(&self, n: usize) -> Vec<String> {
        self.inner.session.lock().await.logs.tail(n)
    }

    /// Captured lines containing `query`, ignoring case.
    pub async fn search_logs(&self, query: &str) -> Vec<String> {
        self.inner.session.lock().await.logs.search(query)
    }

    pub async fn last_error_cause(&self) -> Option<ErrorCause> {
        self.inner.session.lock().await.last_cause.clone()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.session.lock().await.pid
    }

    pub async fn is_running(&self) -> bool {
        self.inner.session.lock().await.running
    }

    /// Id of the running session, or of the next one once it has ended.
    pub fn session_id(&self) -> String {
        self.inner.current_bus().session_id().to_string()
    }

    pub fn binary_path(&self) -> &Path {
        &self.inner.binary
    }

    pub fn settings(&self) -> &SupervisorConfig {
        &self.inner.settings
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.inner.current_bus().subscribe_logs()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChangeEvent> {
        self.inner.current_bus().subscribe_status()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.inner.current_bus().subscribe_errors()
    }

    pub async fn binary_version(&self) -> Result<String, OpenVpnError> {
        process::get_openvpn_version(&self.inner.binary).await
    }
}

impl Drop for OpenVpnClient {
    fn drop(&mut self) {
        // Session tasks keep the inner state alive; stop the process so
        // the exit watcher runs cleanup and they wind down.
        self.inner.shutdown.cancel();
    }
}

/// Wait for Disconnected/Error after a disconnect request.
async fn wait_for_terminal(
    bus: &EventBus,
    status_rx: &mut broadcast::Receiver<StatusChangeEvent>,
    errors_rx: &mut broadcast::Receiver<ErrorEvent>,
    deadline: Instant,
) -> Result<(), OpenVpnError> {
    use broadcast::error::RecvError;

    let expired = tokio::time::sleep_until(deadline);
    tokio::pin!(expired);
    let mut errors_open = true;
    loop {
        tokio::select! {
            biased;
            res = errors_rx.recv(), if errors_open => match res {
                Ok(ev) => return Err(OpenVpnError::connection_failed(ev.cause)),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => errors_open = false,
            },
            res = status_rx.recv() => match res {
                Ok(ev) if ev.new_status.is_terminal() => return Ok(()),
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => {
                    if bus.status().is_terminal() {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => {
                    return if bus.status().is_terminal() {
                        Ok(())
                    } else {
                        Err(OpenVpnError::new(
                            OpenVpnErrorKind::DisconnectFailed,
                            "Event channels closed before a terminal status",
                        )
                        .with_detail(format!("last status: {}", bus.status())))
                    };
                }
            },
            _ = &mut expired => return Err(OpenVpnError::timeout().with_detail("disconnect did not complete")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SupervisorConfig {
        SupervisorConfig {
            binary: PathBuf::from("sh"),
            reap_stale_processes: false,
            ..Default::default()
        }
    }

    #[test]
    fn missing_binary_is_reported() {
        let s = SupervisorConfig {
            binary: PathBuf::from("definitely-not-openvpn-7f3a"),
            ..Default::default()
        };
        let err = OpenVpnClient::with_settings(s, "client\n", "u", "p")
            .err()
            .expect("construction should fail");
        assert_eq!(err.kind, OpenVpnErrorKind::BinaryNotFound);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let s = SupervisorConfig {
            status_capacity: 0,
            ..settings()
        };
        let err = OpenVpnClient::with_settings(s, "client\n", "u", "p")
            .err()
            .expect("construction should fail");
        assert_eq!(err.kind, OpenVpnErrorKind::ConfigInvalid);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn client() -> OpenVpnClient {
            OpenVpnClient::with_settings(settings(), "client\n", "u", "p").unwrap()
        }

        #[tokio::test]
        async fn fresh_client_is_idle_and_disconnected() {
            let c = client();
            assert_eq!(c.status(), ConnectionStatus::Disconnected);
            assert_eq!(c.state().await, SupervisorState::Idle);
            assert!(c.pid().await.is_none());
            assert!(c.logs().await.is_empty());
            assert!(c.last_error_cause().await.is_none());
            assert!(!c.session_id().is_empty());
        }

        #[tokio::test]
        async fn disconnect_without_session_is_noop() {
            let c = client();
            let mut rx = c.subscribe_status();
            assert!(c.disconnect().await.is_ok());
            assert!(c.disconnect().await.is_ok());
            assert!(rx.try_recv().is_err());
            assert_eq!(c.state().await, SupervisorState::Idle);
        }

        #[tokio::test]
        async fn disconnect_and_wait_without_session_returns() {
            let c = client();
            tokio_test::assert_ok!(c.disconnect_and_wait(Duration::from_millis(200)).await);
        }

        #[tokio::test]
        async fn force_kill_without_session_is_noop() {
            let c = client();
            assert!(!c.force_kill_if_still_running().await);
        }

        #[tokio::test]
        async fn staging_failure_marks_failed() {
            let dir = tempfile::tempdir().unwrap();
            let s = SupervisorConfig {
                staging_dir: Some(dir.path().join("missing")),
                ..settings()
            };
            let c = OpenVpnClient::with_settings(s, "client\n", "u", "p").unwrap();
            let err = tokio_test::assert_err!(c.connect(Duration::from_secs(1)).await);
            assert_eq!(err.kind, OpenVpnErrorKind::StagingFailed);
            assert_eq!(c.state().await, SupervisorState::Failed);
            assert_eq!(c.status(), ConnectionStatus::Disconnected);
        }

        #[tokio::test]
        async fn stale_process_failure_aborts_connect() {
            struct Stubborn;

            #[async_trait]
            impl ProcessScanner for Stubborn {
                async fn find(&self, _name: &str) -> Result<Vec<u32>, OpenVpnError> {
                    Ok(vec![4242])
                }
                async fn terminate(&self, _pids: &[u32]) -> Result<(), OpenVpnError> {
                    Err(OpenVpnError::new(OpenVpnErrorKind::IoError, "EPERM"))
                }
            }

            let s = SupervisorConfig {
                reap_stale_processes: true,
                ..settings()
            };
            let c = OpenVpnClient::with_process_scanner(s, Arc::new(Stubborn), "client\n", "u", "p")
                .unwrap();
            let err = tokio_test::assert_err!(c.connect(Duration::from_secs(1)).await);
            assert_eq!(err.kind, OpenVpnErrorKind::ZombieProcess);
            assert!(!c.is_running().await);
        }

        #[tokio::test]
        async fn cleanup_hands_over_to_an_open_bus() {
            let c = client();
            let first = c.inner.current_bus();
            first.publish_status(ConnectionStatus::Error);
            {
                let mut session = c.inner.session.lock().await;
                c.inner.cleanup(&mut session, &first);
            }

            assert!(first.is_closed());
            let next = c.inner.current_bus();
            assert!(!next.is_closed());
            assert_ne!(next.session_id(), first.session_id());
            assert_eq!(c.status(), ConnectionStatus::Error);
        }

        #[tokio::test]
        async fn retiring_a_stale_bus_keeps_the_current_one() {
            let c = client();
            let stale = Arc::new(EventBus::new("stale", 1, 1, 1));
            let current = c.inner.current_bus();
            c.inner.retire_bus(&stale);
            assert!(Arc::ptr_eq(&c.inner.current_bus(), &current));
        }

        #[tokio::test]
        async fn drop_cancels_sessions_while_the_lock_is_held() {
            let c = client();
            let session_token = c.inner.shutdown.child_token();
            let inner = c.inner.clone();
            let _held = inner.session.lock().await;
            drop(c);
            assert!(session_token.is_cancelled());
        }

        #[tokio::test]
        async fn binary_path_is_resolved() {
            let c = client();
            assert!(c.binary_path().is_absolute());
        }
    }
}

//! Session Controller
//!
//! One controller per shell tab. It drives the connect sequence (transport,
//! authentication, shell), then hands the live pieces to their owner tasks:
//! the handle-owner task keeps the russh `Handle`, the shell task keeps the
//! shell channel and the login scripts, the forward manager keeps the
//! listeners. The controller only holds senders and handles to them.
//!
//! Teardown runs exactly once, whichever of `destroy()`, shell exit or
//! transport loss gets there first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use russh::client::Msg;
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{EventSink, SessionEvent, SessionEvents};
use super::shell::{open_shell, signal_from_name, ShellCommand, ShellOptions, ShellTask};
use super::state::{SessionState, SessionStateMachine};
use crate::auth::AuthNegotiator;
use crate::forwarding::{ForwardInfo, ForwardedPort, PortForwardManager, RemoteForwardTable};
use crate::scripts::LoginScriptRunner;
use crate::secrets::{CredentialCache, PromptProvider, SecretStore};
use crate::ssh::transport::{connect_direct, connect_via};
use crate::ssh::{
    spawn_handle_owner_task, ClientHandler, ConnectionProfile, DisconnectReason, ForwardError,
    HandleController, KnownHostsStore, SshError,
};
use crate::x11::X11Relay;

const SHELL_COMMAND_BUFFER: usize = 1024;

/// Collaborators shared by every session of one application
#[derive(Clone)]
pub struct SessionDeps {
    pub secrets: Arc<dyn SecretStore>,
    pub prompts: Arc<dyn PromptProvider>,
    pub cache: CredentialCache,
    pub known_hosts: Arc<KnownHostsStore>,
}

/// Pieces that exist only while the session is Ready
struct Live {
    controller: HandleController,
    shell_tx: mpsc::Sender<ShellCommand>,
    forwards: Arc<PortForwardManager>,
}

struct SessionInner {
    id: String,
    label: String,
    profile: Arc<ConnectionProfile>,
    deps: SessionDeps,
    events: EventSink,
    state: Mutex<SessionStateMachine>,
    jump: Mutex<Option<HandleController>>,
    live: Mutex<Option<Live>>,
    destroyed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

impl SessionController {
    pub fn new(profile: ConnectionProfile, deps: SessionDeps) -> (Self, SessionEvents) {
        let id = Uuid::new_v4().to_string();
        let label = format!("{} [{}]", profile.label(), &id[..8]);
        let (events, rx) = EventSink::channel(label.clone());
        let (shutdown_tx, _) = watch::channel(false);

        let inner = SessionInner {
            id,
            label,
            profile: Arc::new(profile),
            deps,
            events,
            state: Mutex::new(SessionStateMachine::new()),
            jump: Mutex::new(None),
            live: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            shutdown_tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Tunnel this session's transport through `jump`, which must be Ready
    pub fn with_jump_host(self, jump: &SessionController) -> Result<Self, SshError> {
        let controller = jump.handle_controller().ok_or_else(|| {
            SshError::InvalidState(format!("Jump host {} is not ready", jump.inner.label))
        })?;
        *self.inner.jump.lock() = Some(controller);
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.inner.profile
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().state()
    }

    /// Controller for the transport, while Ready
    pub fn handle_controller(&self) -> Option<HandleController> {
        self.inner.live.lock().as_ref().map(|l| l.controller.clone())
    }

    /// Connect, authenticate and open the shell. Only valid from Idle.
    pub async fn connect(&self) -> Result<(), SshError> {
        self.inner.transition(SessionState::Connecting)?;
        info!("Connecting session {}", self.inner.label);

        // destroy() cancels dialing, auth prompts and the shell open
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let result = tokio::select! {
            result = self.inner.clone().establish() => result,
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                info!("Session {} destroyed while connecting", self.inner.label);
                Err(SshError::InvalidState("Session destroyed while connecting".into()))
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                // A destroy() while connecting already owns the state
                if self.inner.transition(SessionState::Failed).is_ok() {
                    error!("Session {} failed: {}", self.inner.label, e);
                    self.inner.events.service_message(format!(" X  {}", e));
                    self.inner.events.error(e.class(), e.to_string());
                }
                Err(e)
            }
        }
    }

    pub async fn write(&self, data: &[u8]) {
        self.send_shell(ShellCommand::Data(data.to_vec())).await;
    }

    pub async fn resize(&self, cols: u32, rows: u32) {
        self.send_shell(ShellCommand::Resize(cols, rows)).await;
    }

    /// Signal the remote process; `None` sends TERM
    pub async fn kill(&self, signal: Option<&str>) {
        let sig = signal_from_name(signal.unwrap_or("TERM"));
        self.send_shell(ShellCommand::Signal(sig)).await;
    }

    async fn send_shell(&self, cmd: ShellCommand) {
        let tx = self.inner.live.lock().as_ref().map(|l| l.shell_tx.clone());
        match tx {
            Some(tx) => {
                if tx.send(cmd).await.is_err() {
                    debug!("Shell task gone for {}", self.inner.label);
                }
            }
            None => debug!("No shell for {}, ignoring command", self.inner.label),
        }
    }

    fn forwards(&self) -> Option<Arc<PortForwardManager>> {
        self.inner.live.lock().as_ref().map(|l| l.forwards.clone())
    }

    pub async fn add_port_forward(&self, spec: ForwardedPort) -> Result<ForwardedPort, ForwardError> {
        match self.forwards() {
            Some(forwards) => forwards.add_port_forward(spec).await,
            None => {
                self.inner.events.service_message(format!(
                    " X  Failed to forward port {}: {}",
                    spec,
                    ForwardError::NotReady
                ));
                Err(ForwardError::NotReady)
            }
        }
    }

    pub async fn remove_port_forward(&self, spec: &ForwardedPort) -> Result<(), ForwardError> {
        match self.forwards() {
            Some(forwards) => forwards.remove_port_forward(spec).await,
            None => Err(ForwardError::NotReady),
        }
    }

    pub async fn forwarded_ports(&self) -> Vec<ForwardInfo> {
        match self.forwards() {
            Some(forwards) => forwards.list().await,
            None => Vec::new(),
        }
    }

    /// Open a direct-tcpip channel to `host:port` from the remote side
    pub async fn forward_out(&self, host: &str, port: u16) -> Result<Channel<Msg>, SshError> {
        let controller = self.handle_controller().ok_or_else(|| {
            SshError::InvalidState(format!("Session {} is not ready", self.inner.label))
        })?;
        controller
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
    }

    /// Tear everything down. Safe from any state, any number of times.
    pub async fn destroy(&self) {
        self.inner.teardown().await;
    }
}

impl SessionInner {
    fn transition(&self, next: SessionState) -> Result<SessionState, SshError> {
        self.state.lock().transition(next)
    }

    async fn establish(self: Arc<Self>) -> Result<(), SshError> {
        let profile = self.profile.clone();
        profile.validate()?;
        let scripts =
            LoginScriptRunner::new(&profile.scripts)?.with_timeout(profile.login_script_timeout());

        if profile.agent_forward {
            warn!(
                "Agent forwarding requested for {}, but agent channels are not relayed",
                self.label
            );
        }

        let remote = RemoteForwardTable::new();
        let mut handler = ClientHandler::new(
            profile.host.clone(),
            profile.port,
            profile.host_key_policy,
            self.deps.known_hosts.clone(),
            self.events.clone(),
        )
        .skip_banner(profile.skip_banner)
        .with_remote_forwards(remote.clone());
        if profile.x11 {
            handler = handler.with_x11(X11Relay::new(
                self.events.clone(),
                None,
                self.shutdown_tx.subscribe(),
            ));
        }

        let jump = self.jump.lock().clone();
        let mut handle = match jump {
            Some(jump) => connect_via(&jump, &profile, handler).await?,
            None => connect_direct(&profile, handler).await?,
        };

        self.transition(SessionState::Authenticating)?;

        let mut negotiator = AuthNegotiator::new(
            profile.clone(),
            self.deps.secrets.clone(),
            self.deps.prompts.clone(),
            self.deps.cache.clone(),
            self.events.clone(),
        );
        negotiator.load_credentials().await;
        match negotiator.authenticate(&mut handle).await {
            Ok(method) => info!("Authenticated {} with {}", self.label, method),
            Err(e) => {
                self.events.service_message(format!(
                    " X  Authentication failed for {}. Check the credentials in the profile",
                    profile.label()
                ));
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                    .await;
                return Err(e.into());
            }
        }

        let controller = spawn_handle_owner_task(handle, self.label.clone());
        let disconnect_rx = controller.subscribe_disconnect();

        let options = ShellOptions {
            cols: profile.cols,
            rows: profile.rows,
            x11: profile.x11,
        };
        let shell = match tokio::time::timeout(
            profile.ready_timeout(),
            open_shell(&controller, &options, &self.events),
        )
        .await
        {
            Ok(Ok(shell)) => shell,
            Ok(Err(e)) => {
                self.events
                    .service_message(format!(" X  Remote rejected opening a shell channel: {}", e));
                controller.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                controller.disconnect().await;
                return Err(SshError::Timeout("Shell channel did not open in time".into()));
            }
        };

        let (shell_tx, shell_rx) = mpsc::channel(SHELL_COMMAND_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel();
        let forwards = Arc::new(PortForwardManager::new(
            controller.clone(),
            self.events.clone(),
            remote,
        ));

        let live = Live {
            controller: controller.clone(),
            shell_tx,
            forwards: forwards.clone(),
        };
        let ready = {
            let mut state = self.state.lock();
            let ready = state.transition(SessionState::Ready).is_ok();
            if ready {
                *self.live.lock() = Some(live);
            }
            ready
        };
        if !ready {
            controller.disconnect().await;
            return Err(SshError::InvalidState(
                "Session was destroyed while connecting".into(),
            ));
        }

        self.events.emit(SessionEvent::Ready);
        info!("Session {} ready", self.label);

        ShellTask {
            label: self.label.clone(),
            events: self.events.clone(),
            scripts,
        }
        .spawn(shell, shell_rx, exit_tx);

        spawn_watcher(Arc::downgrade(&self), disconnect_rx, exit_rx);

        for spec in profile.forwarded_ports.iter().cloned() {
            // Failures are reported by the manager
            let _ = forwards.add_port_forward(spec).await;
        }
        Ok(())
    }

    async fn teardown(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let was_ready = {
            let mut state = self.state.lock();
            let prev = state.state();
            let _ = state.transition(SessionState::Closing);
            prev == SessionState::Ready
        };
        let live = self.live.lock().take();
        self.shutdown_tx.send_replace(true);

        if let Some(live) = live {
            let _ = live.shell_tx.send(ShellCommand::Close).await;
            live.forwards.stop_all().await;
            live.controller.disconnect().await;
        }

        if was_ready {
            self.events.emit(SessionEvent::Ended);
        }
        let _ = self.transition(SessionState::Closed);
        self.events.close();
        info!("Session {} closed", self.label);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if *self.destroyed.get_mut() {
            return;
        }
        self.shutdown_tx.send_replace(true);
        if let Some(live) = self.live.get_mut().take() {
            let _ = live.shell_tx.try_send(ShellCommand::Close);
            live.controller.request_disconnect();
        }
        self.events.close();
    }
}

/// Tear the session down when the shell ends or the transport drops
fn spawn_watcher(
    inner: Weak<SessionInner>,
    mut disconnect_rx: broadcast::Receiver<DisconnectReason>,
    exit_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        let transport_lost = tokio::select! {
            reason = disconnect_rx.recv() => !matches!(reason, Ok(DisconnectReason::Requested)),
            _ = exit_rx => false,
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if transport_lost && !inner.destroyed.load(Ordering::SeqCst) {
            inner.events.service_message(" X  Connection lost");
        }
        inner.teardown().await;
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::secrets::{MemorySecretStore, PromptRequest, PromptResponse};
    use crate::ssh::ErrorClass;

    struct NoPrompts;

    #[async_trait]
    impl PromptProvider for NoPrompts {
        async fn prompt_secret(&self, _request: PromptRequest) -> Option<PromptResponse> {
            None
        }
    }

    fn deps(dir: &tempfile::TempDir) -> SessionDeps {
        SessionDeps {
            secrets: Arc::new(MemorySecretStore::new()),
            prompts: Arc::new(NoPrompts),
            cache: CredentialCache::new(),
            known_hosts: Arc::new(KnownHostsStore::with_path(dir.path().join("known_hosts"))),
        }
    }

    /// A loopback port nothing listens on
    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (session, mut events) =
            SessionController::new(ConnectionProfile::new("example.com", 22, "bob"), deps(&dir));

        session.destroy().await;
        session.destroy().await;

        assert_eq!(session.state(), SessionState::Closed);
        // Never Ready, so no Ended
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_commands_without_shell_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let (session, mut events) =
            SessionController::new(ConnectionProfile::new("example.com", 22, "bob"), deps(&dir));

        session.write(b"ls\n").await;
        session.resize(120, 40).await;
        session.kill(None).await;
        assert!(session.forwarded_ports().await.is_empty());
        assert!(session.handle_controller().is_none());
        assert_eq!(session.state(), SessionState::Idle);

        let result = session
            .add_port_forward(ForwardedPort::local("127.0.0.1", 0, "db", 5432))
            .await;
        assert!(matches!(result, Err(ForwardError::NotReady)));
        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::ServiceMessage(m)) if m.starts_with(" X  Failed to forward port")
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_moves_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = ConnectionProfile::new("127.0.0.1", closed_port().await, "bob");
        profile.ready_timeout = 2_000;
        let (session, mut events) = SessionController::new(profile, deps(&dir));

        let err = session.connect().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transport);
        assert_eq!(session.state(), SessionState::Failed);

        assert!(matches!(events.recv().await, Some(SessionEvent::ServiceMessage(_))));
        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::Error { class: ErrorClass::Transport, .. })
        ));

        // Only Idle may connect
        assert!(matches!(
            session.connect().await,
            Err(SshError::InvalidState(_))
        ));
        assert_eq!(session.state(), SessionState::Failed);

        session.destroy().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_invalid_profile_fails_before_dialing() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _events) =
            SessionController::new(ConnectionProfile::new("", 22, "bob"), deps(&dir));

        assert!(matches!(
            session.connect().await,
            Err(SshError::InvalidProfile(_))
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_jump_host_must_be_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (jump, _jump_events) =
            SessionController::new(ConnectionProfile::new("bastion", 22, "ops"), deps(&dir));
        let (target, _events) =
            SessionController::new(ConnectionProfile::new("db", 22, "ops"), deps(&dir));

        assert!(matches!(
            target.with_jump_host(&jump),
            Err(SshError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_out_requires_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _events) =
            SessionController::new(ConnectionProfile::new("example.com", 22, "bob"), deps(&dir));
        assert!(session.forward_out("localhost", 80).await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_cancels_pending_connect() {
        let dir = tempfile::tempdir().unwrap();
        // Accepts and never speaks, so the handshake hangs
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let (stream, _) = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });

        let mut profile = ConnectionProfile::new("127.0.0.1", port, "bob");
        profile.ready_timeout = 60_000;
        let (session, mut events) = SessionController::new(profile, deps(&dir));

        let (connected, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(session.connect(), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                assert_eq!(session.state(), SessionState::Connecting);
                session.destroy().await;
            })
        })
        .await
        .expect("connect kept running after destroy");

        assert!(matches!(connected, Err(SshError::InvalidState(_))));
        assert_eq!(session.state(), SessionState::Closed);
        // Cancelled, not failed: no error reaches the UI
        while let Some(event) = events.recv().await {
            assert!(!matches!(event, SessionEvent::Error { .. }), "{:?}", event);
        }
        silent.abort();
    }
}

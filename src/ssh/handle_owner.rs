//! Handle Owner Task
//!
//! Exactly one task owns the russh `Handle`. Shell, forwarding, X11 and
//! jump-host consumers talk to it through a cloneable [`HandleController`]
//! that sends commands over an mpsc channel and waits on oneshot replies.
//! Requests run concurrently inside the task, so a slow channel open never
//! holds up its siblings or a disconnect.
//!
//! The owner also watches the transport: when russh reports the
//! connection closed (keepalive exhaustion, remote EOF) the task exits and
//! notifies every disconnect subscriber.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner polls `Handle::is_closed`
const TRANSPORT_POLL: Duration = Duration::from_millis(500);

type ChannelReply = oneshot::Sender<Result<Channel<Msg>, russh::Error>>;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Session channel for the shell
    ChannelOpenSession { reply_tx: ChannelReply },

    /// direct-tcpip channel (local/dynamic forwards, jump hosts)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: ChannelReply,
    },

    /// tcpip-forward global request, replies with the bound port
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    Disconnect,
}

/// Why the owner task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called or every controller was dropped
    Requested,
    /// The transport closed underneath us
    TransportClosed,
}

/// Full SSH control for in-process consumers. Never hand it to untrusted
/// code: any holder can open channels, create forwards, or disconnect.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<DisconnectReason>,
}

impl HandleController {
    /// Wrap a raw command sender. Tests drive the receiving end themselves.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Receive the reason once the transport is gone
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<DisconnectReason> {
        self.disconnect_tx.subscribe()
    }

    async fn request<T>(
        &self,
        cmd: HandleCommand,
        reply_rx: oneshot::Receiver<Result<T, russh::Error>>,
    ) -> Result<T, SshError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| match e {
                russh::Error::Disconnect => SshError::Disconnected,
                other => SshError::ChannelError(other.to_string()),
            })
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(HandleCommand::ChannelOpenSession { reply_tx }, reply_rx)
            .await
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(
            HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    /// Returns the port the server actually bound (differs when 0 was requested)
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(
            HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(
            HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Non-blocking variant of [`disconnect`](Self::disconnect), for drop paths
    pub fn request_disconnect(&self) {
        let _ = self.cmd_tx.try_send(HandleCommand::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Transport operations the owner task runs on behalf of its controllers.
/// Every method takes `&self` so requests can be in flight together.
#[async_trait]
pub(crate) trait ChannelOps: Send + Sync + 'static {
    async fn open_session(&self) -> Result<Channel<Msg>, russh::Error>;

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error>;

    async fn forward(&self, address: &str, port: u32) -> Result<u32, russh::Error>;

    async fn cancel_forward(&self, address: &str, port: u32) -> Result<(), russh::Error>;

    fn transport_closed(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
impl ChannelOps for Handle<ClientHandler> {
    async fn open_session(&self) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_session().await
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_direct_tcpip(host, port, originator_host, originator_port)
            .await
    }

    async fn forward(&self, address: &str, port: u32) -> Result<u32, russh::Error> {
        self.tcpip_forward(address, port).await
    }

    async fn cancel_forward(&self, address: &str, port: u32) -> Result<(), russh::Error> {
        self.cancel_tcpip_forward(address, port).await
    }

    fn transport_closed(&self) -> bool {
        self.is_closed()
    }

    async fn close(&self) {
        let _ = self
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
    }
}

/// Move the handle into its owner task and return the controller
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    spawn_owner(handle, label)
}

pub(crate) fn spawn_owner<H: ChannelOps>(ops: H, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<DisconnectReason>(1);
    let notify = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut poll = tokio::time::interval(TRANSPORT_POLL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut in_flight: FuturesUnordered<BoxFuture<'_, ()>> = FuturesUnordered::new();

        info!("Handle owner task started for {}", label);

        let reason = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for {}", label);
                        break DisconnectReason::Requested;
                    }
                    Some(cmd) => in_flight.push(Box::pin(execute(&ops, cmd))),
                    None => {
                        debug!("All controllers dropped for {}", label);
                        break DisconnectReason::Requested;
                    }
                },
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                _ = poll.tick() => {
                    if ops.transport_closed() {
                        info!("Transport closed for {}", label);
                        break DisconnectReason::TransportClosed;
                    }
                }
            }
        };

        // Callers of unfinished requests see their reply sender dropped
        drop(in_flight);
        let _ = notify.send(reason);
        drain_pending_commands(&mut cmd_rx);

        if reason == DisconnectReason::Requested {
            ops.close().await;
        }
        info!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

async fn execute<H: ChannelOps>(ops: &H, cmd: HandleCommand) {
    match cmd {
        HandleCommand::ChannelOpenSession { reply_tx } => {
            let result = ops.open_session().await;
            if reply_tx.send(result).is_err() {
                debug!("Caller dropped before channel_open_session completed");
            }
        }

        HandleCommand::ChannelOpenDirectTcpip {
            host,
            port,
            originator_host,
            originator_port,
            reply_tx,
        } => {
            let result = ops
                .open_direct_tcpip(&host, port, &originator_host, originator_port)
                .await;
            if reply_tx.send(result).is_err() {
                debug!("Caller dropped before direct-tcpip to {}:{} completed", host, port);
            }
        }

        HandleCommand::TcpipForward {
            address,
            port,
            reply_tx,
        } => {
            // russh returns 0 when a fixed port was requested
            let result = ops
                .forward(&address, port)
                .await
                .map(|bound| if bound == 0 { port } else { bound });
            if let Err(Ok(bound)) = reply_tx.send(result) {
                // Nobody will ever cancel this forward
                warn!("Cancelling orphaned remote forward {}:{}", address, bound);
                let _ = ops.cancel_forward(&address, bound).await;
            }
        }

        HandleCommand::CancelTcpipForward {
            address,
            port,
            reply_tx,
        } => {
            let result = ops.cancel_forward(&address, port).await;
            let _ = reply_tx.send(result);
        }

        HandleCommand::Disconnect => {}
    }
}

/// Fail every queued command with `Disconnect`
pub(crate) fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx }
            | HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::sync::Notify;

    use super::*;

    /// In-memory transport. A forward to `held_port` signals `parked` and
    /// waits for `release`; channel opens always fail.
    #[derive(Clone, Default)]
    pub(crate) struct FakeOps {
        pub held_port: Option<u32>,
        pub parked: Arc<Notify>,
        pub release: Arc<Notify>,
        pub closed: Arc<AtomicBool>,
        pub close_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChannelOps for FakeOps {
        async fn open_session(&self) -> Result<Channel<Msg>, russh::Error> {
            Err(russh::Error::Disconnect)
        }

        async fn open_direct_tcpip(
            &self,
            _host: &str,
            _port: u32,
            _originator_host: &str,
            _originator_port: u32,
        ) -> Result<Channel<Msg>, russh::Error> {
            Err(russh::Error::Disconnect)
        }

        async fn forward(&self, _address: &str, port: u32) -> Result<u32, russh::Error> {
            if self.held_port == Some(port) {
                self.parked.notify_one();
                self.release.notified().await;
            }
            Ok(port + 1000)
        }

        async fn cancel_forward(&self, _address: &str, _port: u32) -> Result<(), russh::Error> {
            Ok(())
        }

        fn transport_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcpip_forward_reply() {
        let (tx, mut rx) = mpsc::channel(4);
        let controller = HandleController::new(tx);

        tokio::spawn(async move {
            if let Some(HandleCommand::TcpipForward {
                address,
                port,
                reply_tx,
            }) = rx.recv().await
            {
                assert_eq!(address, "0.0.0.0");
                assert_eq!(port, 0);
                let _ = reply_tx.send(Ok(40022));
            }
        });

        assert_eq!(controller.tcpip_forward("0.0.0.0", 0).await.unwrap(), 40022);
    }

    #[tokio::test]
    async fn test_dropped_owner_reports_disconnected() {
        let (tx, rx) = mpsc::channel(4);
        let controller = HandleController::new(tx);
        drop(rx);

        assert!(!controller.is_connected());
        assert!(matches!(
            controller.open_session_channel().await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_drain_fails_queued_commands() {
        let (tx, mut rx) = mpsc::channel(4);
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(HandleCommand::CancelTcpipForward {
            address: "127.0.0.1".into(),
            port: 8080,
            reply_tx,
        })
        .await
        .unwrap();

        drain_pending_commands(&mut rx);
        assert!(matches!(reply_rx.await.unwrap(), Err(russh::Error::Disconnect)));
        assert!(tx.send(HandleCommand::Disconnect).await.is_err());
    }

    #[tokio::test]
    async fn test_slow_forward_does_not_block_later_requests() {
        let ops = testing::FakeOps {
            held_port: Some(1),
            ..Default::default()
        };
        let parked = ops.parked.clone();
        let release = ops.release.clone();
        let controller = spawn_owner(ops, "test".into());

        let slow_controller = controller.clone();
        let slow = tokio::spawn(async move { slow_controller.tcpip_forward("0.0.0.0", 1).await });
        parked.notified().await;

        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            controller.tcpip_forward("0.0.0.0", 2),
        )
        .await
        .expect("second request waited behind the first");
        assert_eq!(fast.unwrap(), 1002);
        assert!(!slow.is_finished());

        release.notify_one();
        assert_eq!(slow.await.unwrap().unwrap(), 1001);
    }

    #[tokio::test]
    async fn test_disconnect_is_not_held_up_by_pending_request() {
        let ops = testing::FakeOps {
            held_port: Some(1),
            ..Default::default()
        };
        let parked = ops.parked.clone();
        let close_calls = ops.close_calls.clone();
        let controller = spawn_owner(ops, "test".into());
        let mut disconnect_rx = controller.subscribe_disconnect();

        let slow_controller = controller.clone();
        let slow = tokio::spawn(async move { slow_controller.tcpip_forward("0.0.0.0", 1).await });
        parked.notified().await;

        controller.disconnect().await;
        let reason = tokio::time::timeout(Duration::from_secs(1), disconnect_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::Requested);
        assert!(matches!(slow.await.unwrap(), Err(SshError::Disconnected)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(close_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!controller.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_notifies_subscribers() {
        let ops = testing::FakeOps::default();
        let closed = ops.closed.clone();
        let close_calls = ops.close_calls.clone();
        let controller = spawn_owner(ops, "test".into());
        let mut disconnect_rx = controller.subscribe_disconnect();

        closed.store(true, std::sync::atomic::Ordering::SeqCst);
        let reason = tokio::time::timeout(TRANSPORT_POLL * 4, disconnect_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::TransportClosed);
        assert_eq!(close_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}

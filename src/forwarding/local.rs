//! Local port forwarding
//!
//! Listens on `host:port` and relays every accepted connection through a
//! direct-tcpip channel to `targetAddress:targetPort`.

use std::sync::Arc;

use tracing::debug;

use super::listener::{bind, spawn_accept_loop, Accepted, ListenerHandle};
use super::port::ForwardedPort;
use super::relay::splice;
use crate::session::EventSink;
use crate::ssh::{ForwardError, HandleController};

/// Bind the listener and start accepting. `spec.port == 0` binds an
/// ephemeral port; read it back from the handle.
pub async fn start_local_forward(
    controller: HandleController,
    spec: &ForwardedPort,
    events: EventSink,
) -> Result<ListenerHandle, ForwardError> {
    let listener = bind(&spec.bind_addr()).await?;
    let mut spec = spec.clone();
    if let Ok(addr) = listener.local_addr() {
        spec.port = addr.port();
    }
    let spec = Arc::new(spec);

    spawn_accept_loop(listener, controller, move |conn| {
        serve_connection(conn, spec.clone(), events.clone())
    })
}

async fn serve_connection(conn: Accepted, spec: Arc<ForwardedPort>, events: EventSink) {
    let Accepted {
        stream,
        peer,
        controller,
        stats,
        shutdown,
    } = conn;

    let channel = match controller
        .open_direct_tcpip(
            &spec.target_address,
            spec.target_port as u32,
            &peer.ip().to_string(),
            peer.port() as u32,
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            events.service_message(format!(
                " X  Remote has rejected the forwarded connection to {}:{} via {}: {}",
                spec.target_address, spec.target_port, spec, e
            ));
            return;
        }
    };

    debug!("Relaying {} to {}:{}", peer, spec.target_address, spec.target_port);
    splice(stream, channel.into_stream(), stats, shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use crate::ssh::HandleCommand;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_rejected_channel_reports_service_message() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        let (events, mut event_rx) = EventSink::channel("test");

        let spec = ForwardedPort::local("127.0.0.1", 0, "db.internal", 5432);
        let handle = start_local_forward(controller, &spec, events).await.unwrap();
        let addr = handle.bound_addr;

        let _client = TcpStream::connect(addr).await.unwrap();
        match cmd_rx.recv().await {
            Some(HandleCommand::ChannelOpenDirectTcpip {
                host,
                port,
                reply_tx,
                ..
            }) => {
                assert_eq!(host, "db.internal");
                assert_eq!(port, 5432);
                let _ = reply_tx.send(Err(russh::Error::ChannelOpenFailure(
                    russh::ChannelOpenFailure::ConnectFailed,
                )));
            }
            _ => panic!("expected direct-tcpip request"),
        }

        match event_rx.recv().await {
            Some(SessionEvent::ServiceMessage(msg)) => {
                let expected = format!(
                    " X  Remote has rejected the forwarded connection to db.internal:5432 via (local) 127.0.0.1:{} → (remote) db.internal:5432: ",
                    addr.port()
                );
                assert!(msg.starts_with(&expected), "{}", msg);
            }
            other => panic!("unexpected event {:?}", other),
        }

        handle.stop().await;
        assert!(tokio::net::TcpListener::bind(addr).await.is_ok());
    }
}

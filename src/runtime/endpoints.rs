//! TCP endpoints: the transfer-server accept loop and the client dialer.
//!
//! Both only move streams around; the runtime worker wraps every stream in a
//! session actor and owns the session table, so accepted and dialed
//! connections end up in exactly the same place.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// Stream-level happenings reported to the runtime worker.
#[derive(Debug)]
pub(crate) enum NetEvent {
    /// The listener accepted a connection.
    Incoming {
        stream: TcpStream,
        peer_addr: SocketAddr,
    },
    /// An outbound dial finished.
    Dialed { peer_id: String, stream: TcpStream },
    DialFailed { peer_id: String, error: String },
}

/// Bind the IPv4 transfer listener. Called before any task is spawned so a
/// bind failure can be surfaced as a top-level error event.
pub(crate) async fn bind_transfer_listener(port: u16) -> Result<TcpListener> {
    let bind_addr = format!("0.0.0.0:{}", port);
    TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding transfer listener on {}", bind_addr))
}

/// Accept connections until cancelled, handing each stream to the worker.
pub(crate) async fn run_acceptor(
    listener: TcpListener,
    events: mpsc::Sender<NetEvent>,
    cancel: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => log::info!("transfer server listening on {}", addr),
        Err(_) => log::info!("transfer server listening"),
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        log::info!("accepted connection from {}", peer_addr);
                        if events
                            .send(NetEvent::Incoming { stream, peer_addr })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("accept error: {}", e);
                    }
                }
            }
        }
    }

    log::debug!("transfer server stopped");
}

/// Dial a peer's transfer endpoint in a detached task; the outcome comes
/// back through the worker's event channel.
pub(crate) fn spawn_dial(
    peer_id: String,
    addr: SocketAddr,
    events: mpsc::Sender<NetEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        log::info!("connecting to {} ({}) …", addr, peer_id);
        let connect = tokio::select! {
            _ = cancel.cancelled() => return,
            result = TcpStream::connect(addr) => result,
        };
        let event = match connect {
            Ok(stream) => NetEvent::Dialed { peer_id, stream },
            Err(e) => NetEvent::DialFailed {
                peer_id,
                error: e.to_string(),
            },
        };
        let _ = events.send(event).await;
    });
}

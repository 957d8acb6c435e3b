//! Witra runtime core.
//!
//! One worker task owns the peer registry, the transfer registry, and the
//! session table; the discovery task, the TCP acceptor, the dialers, and
//! every session actor report into it over channels. The UI (or the CLI
//! binary, or a test) drives the worker through [`RuntimeHandle`] and
//! watches the typed [`RuntimeEvent`] stream. No state is shared across
//! tasks — every mutation happens on the worker.
//!
//! ```text
//!  discovery ──┐                       ┌── session actor (one per TCP conn)
//!  acceptor  ──┤→ worker (registries) ─┤
//!  dialers   ──┘        │              └── session actor
//!                 RuntimeEvent stream → UI / CLI / tests
//! ```

pub mod config;
mod discovery;
mod endpoints;
mod peers;
pub mod protocol;
mod session;
mod transfers;

pub use peers::{PeerInfo, PeerState};
pub use transfers::{TransferDirection, TransferSnapshot, TransferStatus};

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::interval,
};
use tokio_util::sync::CancellationToken;

use discovery::DiscoveryEvent;
use endpoints::NetEvent;
use session::{
    SessionCommand, SessionDirection, SessionEvent, SessionEventKind, SessionHandle,
};

use config::Config;
use protocol::{DISCOVERY_PORT, PEER_TIMEOUT_SECS, TRANSFER_PORT};

// ────────────────────────────────────────────────────────────────────────────
// Public surface
// ────────────────────────────────────────────────────────────────────────────

/// Events the core publishes to whoever is watching (UI, CLI, tests).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuntimeEvent {
    PeerAdded(PeerInfo),
    PeerUpdated(PeerInfo),
    PeerRemoved { peer_id: String },
    ConnectionRequestReceived { peer_id: String, display_name: String },
    ConnectionAccepted { peer_id: String },
    ConnectionRejected { peer_id: String },
    TransferAdded(TransferSnapshot),
    TransferUpdated(TransferSnapshot),
    TransferRemoved { transfer_id: String },
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime is no longer running")]
    NotRunning,
    #[error("cannot disconnect while transfers are in progress")]
    TransfersInProgress,
}

/// Startup parameters. Ports default to the protocol constants when `0`,
/// which is what tests override to run several instances side by side.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub config: Config,
    pub discovery_port: u16,
    pub transfer_port: u16,
}

/// A running core: the command handle plus the event stream.
pub struct Runtime {
    pub handle: RuntimeHandle,
    pub events: mpsc::Receiver<RuntimeEvent>,
}

/// Cheap-to-clone grip on the worker. Every method is a message; queries
/// answer over a oneshot channel.
#[derive(Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<Command>,
    peer_id: String,
    display_name: Arc<RwLock<String>>,
}

impl RuntimeHandle {
    /// Our own peer id (stable for the lifetime of the runtime).
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The display name peers currently see.
    pub fn display_name(&self) -> String {
        self.display_name.read().clone()
    }

    pub async fn set_display_name(&self, name: String) -> Result<(), RuntimeError> {
        self.send(Command::SetDisplayName(name)).await
    }

    pub async fn list_peers(&self) -> Result<Vec<PeerInfo>, RuntimeError> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::ListPeers(reply)).await?;
        answer.await.map_err(|_| RuntimeError::NotRunning)
    }

    /// Dial a discovered peer and ask for a connection.
    pub async fn connect(&self, peer_id: &str) -> Result<(), RuntimeError> {
        self.send(Command::Connect {
            peer_id: peer_id.to_string(),
        })
        .await
    }

    /// Accept a pending incoming connection request.
    pub async fn accept(&self, peer_id: &str) -> Result<(), RuntimeError> {
        self.send(Command::AcceptConnection {
            peer_id: peer_id.to_string(),
        })
        .await
    }

    /// Reject a pending incoming connection request.
    pub async fn reject(&self, peer_id: &str) -> Result<(), RuntimeError> {
        self.send(Command::RejectConnection {
            peer_id: peer_id.to_string(),
        })
        .await
    }

    /// Close every session with the peer. Refused while transfers are
    /// active.
    pub async fn disconnect(&self, peer_id: &str) -> Result<(), RuntimeError> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::DisconnectPeer {
            peer_id: peer_id.to_string(),
            reply,
        })
        .await?;
        answer.await.map_err(|_| RuntimeError::NotRunning)?
    }

    /// Queue files (directories are sent as folders) for a connected peer.
    pub async fn send_files(
        &self,
        peer_id: &str,
        paths: Vec<PathBuf>,
    ) -> Result<(), RuntimeError> {
        self.send(Command::SendFiles {
            peer_id: peer_id.to_string(),
            paths,
        })
        .await
    }

    /// Queue a directory tree for a connected peer.
    pub async fn send_folder(&self, peer_id: &str, path: PathBuf) -> Result<(), RuntimeError> {
        self.send(Command::SendFolder {
            peer_id: peer_id.to_string(),
            path,
        })
        .await
    }

    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<(), RuntimeError> {
        self.send(Command::CancelTransfer {
            transfer_id: transfer_id.to_string(),
        })
        .await
    }

    pub async fn list_transfers(&self) -> Result<Vec<TransferSnapshot>, RuntimeError> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::ListTransfers(reply)).await?;
        answer.await.map_err(|_| RuntimeError::NotRunning)
    }

    pub async fn transfer(
        &self,
        transfer_id: &str,
    ) -> Result<Option<TransferSnapshot>, RuntimeError> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::GetTransfer {
            transfer_id: transfer_id.to_string(),
            reply,
        })
        .await?;
        answer.await.map_err(|_| RuntimeError::NotRunning)
    }

    /// Drop finished transfers from the registry.
    pub async fn clear_finished(&self) -> Result<(), RuntimeError> {
        self.send(Command::ClearFinished).await
    }

    /// Stop everything; the discovery goodbye goes out before this returns.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Shutdown(reply)).await?;
        answer.await.map_err(|_| RuntimeError::NotRunning)
    }

    async fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RuntimeError::NotRunning)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Startup
// ────────────────────────────────────────────────────────────────────────────

/// Bring up discovery, the transfer server, and the worker. A service whose
/// bind fails is reported as an [`RuntimeEvent::Error`] and skipped; the
/// rest keeps running.
pub async fn spawn_runtime(options: StartOptions) -> Runtime {
    let peer_id = protocol::generate_unique_id();
    let device_name = config::device_name();
    let display_name = Arc::new(RwLock::new(options.config.resolve_display_name()));
    let download_dir = options.config.resolve_download_path();
    if let Err(e) = std::fs::create_dir_all(&download_dir) {
        log::warn!(
            "could not create download directory {}: {}",
            download_dir.display(),
            e
        );
    }

    let discovery_port = match options.discovery_port {
        0 => DISCOVERY_PORT,
        port => port,
    };
    let transfer_port = match options.transfer_port {
        0 => TRANSFER_PORT,
        port => port,
    };

    let (event_tx, event_rx) = mpsc::channel(256);
    let (command_tx, command_rx) = mpsc::channel(64);
    let (discovery_tx, discovery_rx) = mpsc::channel(64);
    let (net_tx, net_rx) = mpsc::channel(16);
    let (session_tx, session_rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();

    log::info!(
        "witra starting — id={}, name={}, discovery_port={}, transfer_port={}",
        peer_id,
        display_name.read(),
        discovery_port,
        transfer_port
    );

    let discovery_task = match discovery::bind_discovery_socket(discovery_port) {
        Ok(socket) => Some(tokio::spawn(discovery::run_discovery(
            socket,
            peer_id.clone(),
            display_name.clone(),
            device_name,
            transfer_port,
            discovery_port,
            discovery_tx,
            cancel.child_token(),
        ))),
        Err(e) => {
            let _ = event_tx
                .send(RuntimeEvent::Error {
                    message: format!("discovery unavailable: {:#}", e),
                })
                .await;
            None
        }
    };

    match endpoints::bind_transfer_listener(transfer_port).await {
        Ok(listener) => {
            tokio::spawn(endpoints::run_acceptor(
                listener,
                net_tx.clone(),
                cancel.child_token(),
            ));
        }
        Err(e) => {
            let _ = event_tx
                .send(RuntimeEvent::Error {
                    message: format!("transfer server unavailable: {:#}", e),
                })
                .await;
        }
    }

    let worker = Worker {
        peer_id: peer_id.clone(),
        display_name: display_name.clone(),
        download_dir,
        peers: peers::PeerRegistry::new(),
        transfers: transfers::TransferRegistry::new(),
        sessions: HashMap::new(),
        events: event_tx,
        net_tx,
        session_tx,
        cancel,
        discovery_task,
    };
    tokio::spawn(worker.run(command_rx, discovery_rx, net_rx, session_rx));

    Runtime {
        handle: RuntimeHandle {
            commands: command_tx,
            peer_id,
            display_name,
        },
        events: event_rx,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Worker
// ────────────────────────────────────────────────────────────────────────────

enum Command {
    SetDisplayName(String),
    ListPeers(oneshot::Sender<Vec<PeerInfo>>),
    Connect {
        peer_id: String,
    },
    AcceptConnection {
        peer_id: String,
    },
    RejectConnection {
        peer_id: String,
    },
    DisconnectPeer {
        peer_id: String,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    SendFiles {
        peer_id: String,
        paths: Vec<PathBuf>,
    },
    SendFolder {
        peer_id: String,
        path: PathBuf,
    },
    CancelTransfer {
        transfer_id: String,
    },
    ListTransfers(oneshot::Sender<Vec<TransferSnapshot>>),
    GetTransfer {
        transfer_id: String,
        reply: oneshot::Sender<Option<TransferSnapshot>>,
    },
    ClearFinished,
    Shutdown(oneshot::Sender<()>),
}

struct SessionEntry {
    handle: SessionHandle,
    /// Learned from discovery (outgoing) or the handshake (incoming).
    peer_id: Option<String>,
    peer_name: Option<String>,
}

struct Worker {
    peer_id: String,
    display_name: Arc<RwLock<String>>,
    download_dir: PathBuf,
    peers: peers::PeerRegistry,
    transfers: transfers::TransferRegistry,
    sessions: HashMap<String, SessionEntry>,
    events: mpsc::Sender<RuntimeEvent>,
    net_tx: mpsc::Sender<NetEvent>,
    session_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    discovery_task: Option<JoinHandle<()>>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut discovery_events: mpsc::Receiver<DiscoveryEvent>,
        mut net_events: mpsc::Receiver<NetEvent>,
        mut session_events: mpsc::Receiver<SessionEvent>,
    ) {
        let mut reaper = interval(Duration::from_secs(PEER_TIMEOUT_SECS / 2));

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    // Every handle dropped: shut down like an explicit stop.
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = discovery_events.recv() => self.handle_discovery(event).await,
                Some(event) = net_events.recv() => self.handle_net(event).await,
                Some(event) = session_events.recv() => self.handle_session(event).await,
                _ = reaper.tick() => self.reap_peers().await,
            }
        }

        log::debug!("runtime worker stopped");
    }

    async fn shutdown(&mut self) {
        log::info!("witra shutting down");
        self.cancel.cancel();
        // The discovery task broadcasts its goodbye on the way out; wait for
        // it so the datagram leaves before the process does.
        if let Some(task) = self.discovery_task.take() {
            let _ = task.await;
        }
        self.sessions.clear();
    }

    async fn publish(&self, event: RuntimeEvent) {
        let _ = self.events.send(event).await;
    }

    async fn publish_error(&self, message: String) {
        log::warn!("{}", message);
        self.publish(RuntimeEvent::Error { message }).await;
    }

    async fn publish_peer_update(&self, peer_id: &str) {
        if let Some(info) = self.peers.snapshot(peer_id) {
            self.publish(RuntimeEvent::PeerUpdated(info)).await;
        }
    }

    async fn publish_transfer_update(&self, transfer_id: &str) {
        if let Some(snapshot) = self.transfers.snapshot(transfer_id) {
            self.publish(RuntimeEvent::TransferUpdated(snapshot)).await;
        }
    }

    // ── Discovery ────────────────────────────────────────────────────────

    async fn handle_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerDiscovered {
                peer_id,
                display_name,
                device_name,
                addr,
                transfer_port,
            } => {
                let is_new =
                    self.peers
                        .upsert(&peer_id, &display_name, &device_name, addr, transfer_port);
                if let Some(info) = self.peers.snapshot(&peer_id) {
                    if is_new {
                        log::info!(
                            "peer discovered: {} ({}) at {}:{}",
                            display_name,
                            peer_id,
                            addr,
                            transfer_port
                        );
                        self.publish(RuntimeEvent::PeerAdded(info)).await;
                    } else {
                        self.publish(RuntimeEvent::PeerUpdated(info)).await;
                    }
                }
            }
            DiscoveryEvent::PeerGoodbye { peer_id } => {
                if self.peers.remove(&peer_id) {
                    log::info!("peer said goodbye: {}", peer_id);
                    self.publish(RuntimeEvent::PeerRemoved { peer_id }).await;
                }
            }
        }
    }

    async fn reap_peers(&mut self) {
        for peer_id in self.peers.reap(Duration::from_secs(PEER_TIMEOUT_SECS)) {
            log::info!("peer timed out: {}", peer_id);
            self.publish(RuntimeEvent::PeerRemoved { peer_id }).await;
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetDisplayName(name) => {
                log::info!("display name set to '{}'", name);
                *self.display_name.write() = name;
            }

            Command::ListPeers(reply) => {
                let _ = reply.send(self.peers.list());
            }

            Command::Connect { peer_id } => {
                let Some((addr, port)) = self.peers.endpoint(&peer_id) else {
                    self.publish_error(format!("connect: unknown peer {}", peer_id))
                        .await;
                    return;
                };
                if !self.peers.request_connect(&peer_id) {
                    log::debug!("connect: peer {} not in a connectable state", peer_id);
                    return;
                }
                self.publish_peer_update(&peer_id).await;
                endpoints::spawn_dial(
                    peer_id,
                    SocketAddr::new(addr, port),
                    self.net_tx.clone(),
                    self.cancel.child_token(),
                );
            }

            Command::AcceptConnection { peer_id } => {
                let Some(session_id) = self.session_for_peer(&peer_id) else {
                    self.publish_error(format!("accept: no pending request from {}", peer_id))
                        .await;
                    return;
                };
                self.send_to_session(&session_id, SessionCommand::Accept).await;
                if self.peers.mark_connected(&peer_id) {
                    self.publish_peer_update(&peer_id).await;
                }
                self.publish(RuntimeEvent::ConnectionAccepted { peer_id }).await;
            }

            Command::RejectConnection { peer_id } => {
                let Some(session_id) = self.session_for_peer(&peer_id) else {
                    self.publish_error(format!("reject: no pending request from {}", peer_id))
                        .await;
                    return;
                };
                self.send_to_session(&session_id, SessionCommand::Reject).await;
                if self.peers.mark_rejected(&peer_id) {
                    self.publish_peer_update(&peer_id).await;
                }
                self.publish(RuntimeEvent::ConnectionRejected { peer_id }).await;
            }

            Command::DisconnectPeer { peer_id, reply } => {
                if self.transfers.has_active_with_peer(&peer_id) {
                    self.publish_error(
                        "cannot disconnect while transfers are in progress".to_string(),
                    )
                    .await;
                    let _ = reply.send(Err(RuntimeError::TransfersInProgress));
                    return;
                }
                for session_id in self.sessions_for_peer(&peer_id) {
                    self.send_to_session(&session_id, SessionCommand::Close).await;
                }
                if self.peers.mark_disconnected(&peer_id) {
                    self.publish_peer_update(&peer_id).await;
                }
                let _ = reply.send(Ok(()));
            }

            Command::SendFiles { peer_id, paths } => {
                for path in paths {
                    if path.is_dir() {
                        self.start_folder_transfer(&peer_id, path).await;
                    } else {
                        self.start_file_transfer(&peer_id, path).await;
                    }
                }
            }

            Command::SendFolder { peer_id, path } => {
                self.start_folder_transfer(&peer_id, path).await;
            }

            Command::CancelTransfer { transfer_id } => {
                let Some(peer_id) = self.transfers.peer_of(&transfer_id) else {
                    log::debug!("cancel: unknown transfer {}", transfer_id);
                    return;
                };
                if self.transfers.cancel(&transfer_id) {
                    self.publish_transfer_update(&transfer_id).await;
                }
                for session_id in self.sessions_for_peer(&peer_id) {
                    self.send_to_session(&session_id, SessionCommand::CancelTransfer)
                        .await;
                }
            }

            Command::ListTransfers(reply) => {
                let _ = reply.send(self.transfers.list());
            }

            Command::GetTransfer { transfer_id, reply } => {
                let _ = reply.send(self.transfers.snapshot(&transfer_id));
            }

            Command::ClearFinished => {
                for transfer_id in self.transfers.clear_finished() {
                    self.publish(RuntimeEvent::TransferRemoved { transfer_id })
                        .await;
                }
            }

            // Handled in the select loop.
            Command::Shutdown(_) => unreachable!("shutdown handled by the run loop"),
        }
    }

    /// Validate that `peer_id` is connected and has a session; returns the
    /// session id and the peer's display name.
    async fn sendable_session(&self, peer_id: &str) -> Option<(String, String)> {
        if self.peers.state(peer_id) != Some(PeerState::Connected) {
            self.publish_error(format!("send: peer {} is not connected", peer_id))
                .await;
            return None;
        }
        let Some(session_id) = self.session_for_peer(peer_id) else {
            self.publish_error(format!("send: no session with peer {}", peer_id))
                .await;
            return None;
        };
        let peer_name = self.peers.display_name(peer_id).unwrap_or_default();
        Some((session_id, peer_name))
    }

    async fn start_file_transfer(&mut self, peer_id: &str, path: PathBuf) {
        let Some((session_id, peer_name)) = self.sendable_session(peer_id).await else {
            return;
        };
        let Ok(metadata) = std::fs::metadata(&path) else {
            log::warn!("send: skipping missing file {}", path.display());
            return;
        };
        if !metadata.is_file() {
            log::warn!("send: skipping non-regular file {}", path.display());
            return;
        }

        let transfer_id = protocol::generate_unique_id();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.transfers.insert_outgoing(
            &transfer_id,
            &file_name,
            path.clone(),
            metadata.len(),
            peer_id,
            &peer_name,
            1,
        ) {
            if let Some(snapshot) = self.transfers.snapshot(&transfer_id) {
                self.publish(RuntimeEvent::TransferAdded(snapshot)).await;
            }
        }
        self.send_to_session(&session_id, SessionCommand::SendFile { path, transfer_id })
            .await;
    }

    async fn start_folder_transfer(&mut self, peer_id: &str, path: PathBuf) {
        let Some((session_id, peer_name)) = self.sendable_session(peer_id).await else {
            return;
        };
        let (total_files, total_bytes) = match session::folder_stats(&path) {
            Ok(stats) => stats,
            Err(e) => {
                self.publish_error(format!("send: cannot read folder {}: {}", path.display(), e))
                    .await;
                return;
            }
        };

        let transfer_id = protocol::generate_unique_id();
        let dir_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.transfers.insert_outgoing(
            &transfer_id,
            &dir_name,
            path.clone(),
            total_bytes,
            peer_id,
            &peer_name,
            total_files.max(1),
        ) {
            if let Some(snapshot) = self.transfers.snapshot(&transfer_id) {
                self.publish(RuntimeEvent::TransferAdded(snapshot)).await;
            }
        }
        self.send_to_session(&session_id, SessionCommand::SendFolder { path, transfer_id })
            .await;
    }

    // ── Streams (acceptor / dialer) ──────────────────────────────────────

    async fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Incoming { stream, peer_addr } => {
                // The peer may be unknown to discovery so far; its id arrives
                // with the connection_request frame.
                let session_id = protocol::generate_unique_id();
                log::debug!("incoming session {} from {}", session_id, peer_addr);
                let handle = session::spawn_session(
                    session_id.clone(),
                    stream,
                    SessionDirection::Incoming,
                    self.download_dir.clone(),
                    self.session_tx.clone(),
                    self.cancel.child_token(),
                );
                self.sessions.insert(
                    session_id,
                    SessionEntry {
                        handle,
                        peer_id: None,
                        peer_name: None,
                    },
                );
            }

            NetEvent::Dialed { peer_id, stream } => {
                let session_id = protocol::generate_unique_id();
                log::debug!("outgoing session {} to peer {}", session_id, peer_id);
                let handle = session::spawn_session(
                    session_id.clone(),
                    stream,
                    SessionDirection::Outgoing,
                    self.download_dir.clone(),
                    self.session_tx.clone(),
                    self.cancel.child_token(),
                );
                let peer_name = self.peers.display_name(&peer_id);
                self.sessions.insert(
                    session_id.clone(),
                    SessionEntry {
                        handle,
                        peer_id: Some(peer_id),
                        peer_name,
                    },
                );
                let request = SessionCommand::SendConnectionRequest {
                    sender_name: self.display_name.read().clone(),
                    sender_id: self.peer_id.clone(),
                };
                self.send_to_session(&session_id, request).await;
            }

            NetEvent::DialFailed { peer_id, error } => {
                self.publish_error(format!("connection to {} failed: {}", peer_id, error))
                    .await;
                if self.peers.mark_rejected(&peer_id) {
                    self.publish_peer_update(&peer_id).await;
                }
            }
        }
    }

    // ── Session events ───────────────────────────────────────────────────

    async fn handle_session(&mut self, event: SessionEvent) {
        let SessionEvent { session_id, kind } = event;

        match kind {
            SessionEventKind::ConnectionRequestReceived {
                sender_name,
                sender_id,
            } => {
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    entry.peer_id = Some(sender_id.clone());
                    entry.peer_name = Some(sender_name.clone());
                }
                if self.peers.request_received(&sender_id) {
                    self.publish_peer_update(&sender_id).await;
                }
                self.publish(RuntimeEvent::ConnectionRequestReceived {
                    peer_id: sender_id,
                    display_name: sender_name,
                })
                .await;
            }

            SessionEventKind::ConnectionAccepted => {
                if let Some(peer_id) = self.session_peer(&session_id) {
                    if self.peers.mark_connected(&peer_id) {
                        self.publish_peer_update(&peer_id).await;
                    }
                    self.publish(RuntimeEvent::ConnectionAccepted { peer_id })
                        .await;
                }
            }

            SessionEventKind::ConnectionRejected => {
                if let Some(peer_id) = self.session_peer(&session_id) {
                    if self.peers.mark_rejected(&peer_id) {
                        self.publish_peer_update(&peer_id).await;
                    }
                    self.publish(RuntimeEvent::ConnectionRejected { peer_id })
                        .await;
                }
            }

            SessionEventKind::TransferStarted {
                transfer_id,
                file_name,
                total_size,
                total_files,
            } => {
                let (peer_id, peer_name) = self.session_peer_identity(&session_id);
                if self.transfers.insert_incoming(
                    &transfer_id,
                    &file_name,
                    total_size,
                    &peer_id,
                    &peer_name,
                    total_files,
                ) {
                    if let Some(snapshot) = self.transfers.snapshot(&transfer_id) {
                        self.publish(RuntimeEvent::TransferAdded(snapshot)).await;
                    }
                }
            }

            SessionEventKind::TransferProgress {
                transfer_id,
                transferred,
                total,
            } => {
                if self.transfers.set_transferred(&transfer_id, transferred, total) {
                    self.publish_transfer_update(&transfer_id).await;
                }
            }

            SessionEventKind::FileReceived { transfer_id, path } => {
                log::info!("received {} ({})", path.display(), transfer_id);
                if self.transfers.file_received(&transfer_id, path) {
                    self.publish_transfer_update(&transfer_id).await;
                }
            }

            SessionEventKind::TransferCompleted { transfer_id } => {
                if self.transfers.complete(&transfer_id) {
                    self.publish_transfer_update(&transfer_id).await;
                }
            }

            SessionEventKind::TransferFailed {
                transfer_id,
                reason,
            } => {
                // Unknown ids (e.g. a cancel that raced creation) are dropped.
                if self.transfers.fail(&transfer_id, &reason) {
                    self.publish_transfer_update(&transfer_id).await;
                }
            }

            SessionEventKind::Closed => {
                let Some(entry) = self.sessions.remove(&session_id) else {
                    return;
                };
                log::debug!(
                    "session {} ({:?}) closed",
                    session_id,
                    entry.handle.direction
                );
                if let Some(peer_id) = entry.peer_id {
                    for transfer_id in
                        self.transfers.fail_active_for_peer(&peer_id, "connection lost")
                    {
                        self.publish_transfer_update(&transfer_id).await;
                    }
                    let has_other_session = self
                        .sessions
                        .values()
                        .any(|other| other.peer_id.as_deref() == Some(peer_id.as_str()));
                    if !has_other_session && self.peers.mark_disconnected(&peer_id) {
                        self.publish_peer_update(&peer_id).await;
                    }
                }
            }
        }
    }

    // ── Session table helpers ────────────────────────────────────────────

    fn session_for_peer(&self, peer_id: &str) -> Option<String> {
        self.sessions
            .iter()
            .find(|(_, entry)| entry.peer_id.as_deref() == Some(peer_id))
            .map(|(session_id, _)| session_id.clone())
    }

    fn sessions_for_peer(&self, peer_id: &str) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|(_, entry)| entry.peer_id.as_deref() == Some(peer_id))
            .map(|(session_id, _)| session_id.clone())
            .collect()
    }

    fn session_peer(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.peer_id.clone())
    }

    fn session_peer_identity(&self, session_id: &str) -> (String, String) {
        match self.sessions.get(session_id) {
            Some(entry) => (
                entry.peer_id.clone().unwrap_or_default(),
                entry.peer_name.clone().unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        }
    }

    async fn send_to_session(&self, session_id: &str, command: SessionCommand) {
        if let Some(entry) = self.sessions.get(session_id) {
            if !entry.handle.send(command).await {
                log::debug!("session {} is gone; command dropped", session_id);
            }
        }
    }
}

//! Transfer session actor.
//!
//! One session wraps one TCP stream and drives the connection handshake and
//! the file-transfer protocol on it. The actor task exclusively owns the
//! write half, the in-progress receive-file handle, the in-progress
//! send-file handle, and the queue of files still to send; a small pump task
//! owns the read half and feeds decoded frames through a channel, so a
//! half-read frame can never be lost to `select!` cancellation.
//!
//! The runtime worker talks to the actor through [`SessionCommand`]s and
//! hears back through [`SessionEvent`]s tagged with the session id. The send
//! loop moves one chunk per loop iteration, which is what makes cancellation
//! (and any other command) take effect between chunks.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use anyhow::{bail, Result};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{self, header_kind, Frame, TransferHeader, CHUNK_SIZE};

// ────────────────────────────────────────────────────────────────────────────
// Actor interface
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionDirection {
    /// Accepted by our TCP listener.
    Incoming,
    /// Dialed by us.
    Outgoing,
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Open the handshake (outgoing sessions only).
    SendConnectionRequest {
        sender_name: String,
        sender_id: String,
    },
    /// Answer a received handshake.
    Accept,
    /// Answer a received handshake; the session closes after the frame is
    /// written (a rejected connection leaves no live session behind).
    Reject,
    /// Queue a single file.
    SendFile { path: PathBuf, transfer_id: String },
    /// Queue a directory tree under one transfer id.
    SendFolder { path: PathBuf, transfer_id: String },
    /// Cancel whatever transfer is currently in flight on this session.
    CancelTransfer,
    /// Close the stream.
    Close,
}

#[derive(Debug)]
pub(crate) enum SessionEventKind {
    ConnectionRequestReceived {
        sender_name: String,
        sender_id: String,
    },
    ConnectionAccepted,
    ConnectionRejected,
    TransferStarted {
        transfer_id: String,
        file_name: String,
        total_size: u64,
        total_files: u64,
    },
    TransferProgress {
        transfer_id: String,
        transferred: u64,
        total: u64,
    },
    FileReceived {
        transfer_id: String,
        path: PathBuf,
    },
    TransferCompleted {
        transfer_id: String,
    },
    TransferFailed {
        transfer_id: String,
        reason: String,
    },
    /// The stream is gone — orderly close, transport error, or protocol
    /// violation alike. Always the last event of a session.
    Closed,
}

#[derive(Debug)]
pub(crate) struct SessionEvent {
    pub session_id: String,
    pub kind: SessionEventKind,
}

/// The worker's grip on a running session actor.
pub(crate) struct SessionHandle {
    pub direction: SessionDirection,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }
}

/// Spawn the pump + actor pair for one accepted or dialed stream.
pub(crate) fn spawn_session(
    session_id: String,
    stream: TcpStream,
    direction: SessionDirection,
    download_dir: PathBuf,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) -> SessionHandle {
    let (commands_tx, commands_rx) = mpsc::channel(32);
    let (frames_tx, frames_rx) = mpsc::channel(32);

    let (reader, writer) = stream.into_split();
    let pump = tokio::spawn(pump_frames(reader, frames_tx));

    let actor = SessionActor {
        session_id,
        direction,
        download_dir,
        state: HandshakeState::Idle,
        writer,
        events,
        incoming: None,
        outgoing: None,
        queue: VecDeque::new(),
        discard_recv: None,
        send_carry: None,
        recv_carry: None,
    };
    tokio::spawn(async move {
        actor.run(commands_rx, frames_rx, cancel).await;
        pump.abort();
    });

    SessionHandle {
        direction,
        commands: commands_tx,
    }
}

/// Read frames off the wire until the stream ends, forwarding them to the
/// actor. Ending the channel is how the actor learns the peer is gone.
async fn pump_frames(mut reader: OwnedReadHalf, frames: mpsc::Sender<Frame>) {
    loop {
        match protocol::read_frame(&mut reader).await {
            Ok(frame) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::debug!("session read ended: {:#}", e);
                break;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Actor internals
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Idle,
    WaitingForAccept,
    RequestReceived,
    Accepted,
}

struct IncomingFile {
    transfer_id: String,
    path: PathBuf,
    file: File,
    expected_size: u64,
    received: u64,
    total_files: u64,
    current_index: u64,
    /// Bytes already received for earlier files of the same transfer, so
    /// folder progress is cumulative across the whole transfer id.
    base: u64,
}

struct OutgoingFile {
    transfer_id: String,
    file: File,
    total_size: u64,
    sent: u64,
    total_files: u64,
    current_index: u64,
    /// Bytes already sent for earlier files of the same transfer.
    base: u64,
}

struct QueuedFile {
    path: PathBuf,
    relative_path: String,
    transfer_id: String,
    total_files: u64,
    current_index: u64,
    /// Set on the first file of a folder transfer: the folder's name. The
    /// `folder_header` frame is written lazily when this entry reaches the
    /// front of the queue, so it can never interleave with a transfer that
    /// is still streaming.
    announce_folder: Option<String>,
}

struct SessionActor {
    session_id: String,
    direction: SessionDirection,
    download_dir: PathBuf,
    state: HandshakeState,
    writer: OwnedWriteHalf,
    events: mpsc::Sender<SessionEvent>,
    incoming: Option<IncomingFile>,
    outgoing: Option<OutgoingFile>,
    queue: VecDeque<QueuedFile>,
    /// Transfer id whose residual `file_data` / `file_complete` frames are
    /// swallowed after a local receive-side cancel (or a destination-open
    /// failure) — the peer cannot have observed the cancel yet.
    discard_recv: Option<String>,
    /// `(transfer id, bytes so far)` carried between the files of a folder
    /// transfer, on each side.
    send_carry: Option<(String, u64)>,
    recv_carry: Option<(String, u64)>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut frames: mpsc::Receiver<Frame>,
        cancel: CancellationToken,
    ) {
        let result: Result<()> = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),

                command = commands.recv() => match command {
                    None | Some(SessionCommand::Close) => break Ok(()),
                    Some(command) => match self.handle_command(command).await {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    },
                },

                frame = frames.recv() => match frame {
                    Some(frame) => match self.handle_frame(frame).await {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    },
                    // Peer closed the stream (or the read errored).
                    None => break Ok(()),
                },

                // One chunk per iteration keeps the inbox responsive; the
                // awaits inside are the suspension points cancellation
                // relies on.
                _ = std::future::ready(()), if self.outgoing.is_some() => {
                    if let Err(e) = self.send_next_chunk().await {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = result {
            log::warn!("session {} closed on error: {:#}", self.session_id, e);
        }

        // A partial receive file stays on disk on connection loss; only a
        // peer-initiated cancel deletes it. Flush so everything received so
        // far actually lands.
        if let Some(mut incoming) = self.incoming.take() {
            incoming.file.flush().await.ok();
        }
        self.outgoing = None;
        self.queue.clear();

        self.emit(SessionEventKind::Closed).await;
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: SessionCommand) -> Result<bool> {
        match command {
            SessionCommand::SendConnectionRequest {
                sender_name,
                sender_id,
            } => {
                if self.direction != SessionDirection::Outgoing
                    || self.state != HandshakeState::Idle
                {
                    log::warn!(
                        "session {}: connection request in state {:?} ignored",
                        self.session_id,
                        self.state
                    );
                    return Ok(true);
                }
                let header = TransferHeader::connection_request(&sender_name, &sender_id);
                protocol::write_header(&mut self.writer, &header).await?;
                self.state = HandshakeState::WaitingForAccept;
                Ok(true)
            }

            SessionCommand::Accept => {
                if self.state != HandshakeState::RequestReceived {
                    log::warn!("session {}: accept without pending request", self.session_id);
                    return Ok(true);
                }
                protocol::write_header(&mut self.writer, &TransferHeader::connection_accept())
                    .await?;
                self.state = HandshakeState::Accepted;
                Ok(true)
            }

            SessionCommand::Reject => {
                if self.state == HandshakeState::RequestReceived {
                    protocol::write_header(&mut self.writer, &TransferHeader::connection_reject())
                        .await?;
                }
                self.writer.flush().await.ok();
                Ok(false)
            }

            SessionCommand::SendFile { path, transfer_id } => {
                if !self.require_accepted(&transfer_id).await {
                    return Ok(true);
                }
                self.queue.push_back(QueuedFile {
                    path,
                    relative_path: String::new(),
                    transfer_id,
                    total_files: 1,
                    current_index: 1,
                    announce_folder: None,
                });
                if self.outgoing.is_none() {
                    self.start_next_queued().await?;
                }
                Ok(true)
            }

            SessionCommand::SendFolder { path, transfer_id } => {
                if !self.require_accepted(&transfer_id).await {
                    return Ok(true);
                }
                self.begin_send_folder(path, transfer_id).await?;
                Ok(true)
            }

            SessionCommand::CancelTransfer => {
                self.cancel_current_transfer().await?;
                Ok(true)
            }

            SessionCommand::Close => Ok(false),
        }
    }

    async fn require_accepted(&mut self, transfer_id: &str) -> bool {
        if self.state == HandshakeState::Accepted {
            return true;
        }
        self.emit(SessionEventKind::TransferFailed {
            transfer_id: transfer_id.to_string(),
            reason: "peer connection not accepted".to_string(),
        })
        .await;
        false
    }

    async fn begin_send_folder(&mut self, path: PathBuf, transfer_id: String) -> Result<()> {
        let dir_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "folder".to_string());

        // Snapshot the tree once; later additions or removals are not seen.
        let files = match collect_files(&path) {
            Ok(files) => files,
            Err(e) => {
                self.emit(SessionEventKind::TransferFailed {
                    transfer_id,
                    reason: format!("folder not found: {}: {}", path.display(), e),
                })
                .await;
                return Ok(());
            }
        };
        if files.is_empty() {
            self.emit(SessionEventKind::TransferFailed {
                transfer_id,
                reason: format!("folder is empty: {}", path.display()),
            })
            .await;
            return Ok(());
        }

        let total = files.len() as u64;
        for (index, (file_path, relative)) in files.into_iter().enumerate() {
            self.queue.push_back(QueuedFile {
                path: file_path,
                relative_path: format!("{}/{}", dir_name, relative),
                transfer_id: transfer_id.clone(),
                total_files: total,
                current_index: index as u64 + 1,
                // The folder_header goes out with the first file, once the
                // stream is actually free for this transfer.
                announce_folder: (index == 0).then(|| dir_name.clone()),
            });
        }
        if self.outgoing.is_none() {
            self.start_next_queued().await?;
        }
        Ok(())
    }

    /// Pop queued files until one opens. An unopenable source fails its
    /// transfer and drops that transfer's remaining queue entries; files
    /// belonging to other transfers continue.
    async fn start_next_queued(&mut self) -> Result<()> {
        while let Some(next) = self.queue.pop_front() {
            if self.begin_send_file(next).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Open `queued` and send its `file_header` — preceded by the deferred
    /// `folder_header` when this is the first file of a folder transfer.
    /// Returns `false` when the source could not be opened (transfer
    /// failed, session fine; an unannounced folder stays unannounced).
    async fn begin_send_file(&mut self, queued: QueuedFile) -> Result<bool> {
        let file = match File::open(&queued.path).await {
            Ok(file) => file,
            Err(e) => {
                self.emit(SessionEventKind::TransferFailed {
                    transfer_id: queued.transfer_id.clone(),
                    reason: format!("cannot open file: {}: {}", queued.path.display(), e),
                })
                .await;
                let failed = queued.transfer_id;
                self.queue.retain(|entry| entry.transfer_id != failed);
                return Ok(false);
            }
        };
        let total_size = file.metadata().await.map(|meta| meta.len()).unwrap_or(0);

        if let Some(dir_name) = &queued.announce_folder {
            let header =
                TransferHeader::folder_header(&queued.transfer_id, dir_name, queued.total_files);
            protocol::write_header(&mut self.writer, &header).await?;
        }

        let file_name = queued
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative_path = if queued.relative_path.is_empty() {
            file_name.clone()
        } else {
            queued.relative_path.clone()
        };

        let header = TransferHeader::file_header(
            &queued.transfer_id,
            &file_name,
            &relative_path,
            total_size,
            queued.total_files,
            queued.current_index,
        );
        protocol::write_header(&mut self.writer, &header).await?;

        let base = match self.send_carry.as_ref() {
            Some((transfer_id, bytes)) if *transfer_id == queued.transfer_id => *bytes,
            _ => 0,
        };
        self.outgoing = Some(OutgoingFile {
            transfer_id: queued.transfer_id,
            file,
            total_size,
            sent: 0,
            total_files: queued.total_files,
            current_index: queued.current_index,
            base,
        });
        Ok(true)
    }

    /// Move one chunk. Source-read errors fail the transfer and keep the
    /// session; stream-write errors fail the transfer and end the session.
    async fn send_next_chunk(&mut self) -> Result<()> {
        let Some(outgoing) = self.outgoing.as_mut() else {
            return Ok(());
        };

        let mut chunk = vec![0u8; CHUNK_SIZE];
        let read = match outgoing.file.read(&mut chunk).await {
            Ok(read) => read,
            Err(e) => {
                let transfer_id = outgoing.transfer_id.clone();
                self.outgoing = None;
                self.send_carry = None;
                self.queue.retain(|entry| entry.transfer_id != transfer_id);
                self.emit(SessionEventKind::TransferFailed {
                    transfer_id,
                    reason: format!("read error: {}", e),
                })
                .await;
                return Ok(());
            }
        };

        if read == 0 {
            // EOF: this file is done.
            let finished = self.outgoing.take().expect("checked above");
            let header = TransferHeader::file_complete(&finished.transfer_id);
            if let Err(e) = protocol::write_header(&mut self.writer, &header).await {
                return self.fail_send_fatal(&finished.transfer_id, e).await;
            }
            self.send_carry = Some((
                finished.transfer_id.clone(),
                finished.base + finished.sent,
            ));
            if finished.current_index >= finished.total_files {
                self.emit(SessionEventKind::TransferCompleted {
                    transfer_id: finished.transfer_id,
                })
                .await;
            }
            return self.start_next_queued().await;
        }

        chunk.truncate(read);
        if let Err(e) = protocol::write_data(&mut self.writer, &chunk).await {
            let transfer_id = self
                .outgoing
                .take()
                .map(|outgoing| outgoing.transfer_id)
                .unwrap_or_default();
            return self.fail_send_fatal(&transfer_id, e).await;
        }

        let outgoing = self.outgoing.as_mut().expect("still sending");
        outgoing.sent += read as u64;
        let progress = SessionEventKind::TransferProgress {
            transfer_id: outgoing.transfer_id.clone(),
            transferred: outgoing.base + outgoing.sent,
            total: outgoing.base + outgoing.total_size,
        };
        self.emit(progress).await;
        Ok(())
    }

    async fn fail_send_fatal(&mut self, transfer_id: &str, error: anyhow::Error) -> Result<()> {
        self.emit(SessionEventKind::TransferFailed {
            transfer_id: transfer_id.to_string(),
            reason: format!("{:#}", error),
        })
        .await;
        Err(error)
    }

    /// Local cancel: tell the peer, delete a partial receive file, drop the
    /// send handle and its queued siblings. The receive side arms the
    /// discard window for frames already in flight.
    async fn cancel_current_transfer(&mut self) -> Result<()> {
        let transfer_id = self
            .incoming
            .as_ref()
            .map(|incoming| incoming.transfer_id.clone())
            .or_else(|| {
                self.outgoing
                    .as_ref()
                    .map(|outgoing| outgoing.transfer_id.clone())
            });
        let Some(transfer_id) = transfer_id else {
            return Ok(());
        };

        protocol::write_header(&mut self.writer, &TransferHeader::transfer_cancel(&transfer_id))
            .await?;

        if let Some(incoming) = self.incoming.take() {
            drop(incoming.file);
            if let Err(e) = tokio::fs::remove_file(&incoming.path).await {
                log::warn!(
                    "session {}: could not delete partial {}: {}",
                    self.session_id,
                    incoming.path.display(),
                    e
                );
            }
            self.discard_recv = Some(incoming.transfer_id);
            self.recv_carry = None;
        }
        if let Some(outgoing) = self.outgoing.take() {
            self.queue
                .retain(|entry| entry.transfer_id != outgoing.transfer_id);
            self.send_carry = None;
        }
        Ok(())
    }

    // ── Frames ───────────────────────────────────────────────────────────

    /// Returns `Ok(false)` for an orderly close, `Err` for a protocol
    /// violation (which closes the stream all the same).
    async fn handle_frame(&mut self, frame: Frame) -> Result<bool> {
        match frame {
            Frame::Data(data) => self.handle_data(data).await,
            Frame::Header(header) => match header.kind.as_str() {
                header_kind::CONNECTION_REQUEST => {
                    if self.direction != SessionDirection::Incoming
                        || self.state != HandshakeState::Idle
                    {
                        bail!("unexpected connection_request in state {:?}", self.state);
                    }
                    self.state = HandshakeState::RequestReceived;
                    self.emit(SessionEventKind::ConnectionRequestReceived {
                        sender_name: header.sender_name.clone(),
                        sender_id: header.sender_id().to_string(),
                    })
                    .await;
                    Ok(true)
                }

                header_kind::CONNECTION_ACCEPT => {
                    if self.state != HandshakeState::WaitingForAccept {
                        bail!("unexpected connection_accept in state {:?}", self.state);
                    }
                    self.state = HandshakeState::Accepted;
                    self.emit(SessionEventKind::ConnectionAccepted).await;
                    Ok(true)
                }

                header_kind::CONNECTION_REJECT => {
                    if self.state != HandshakeState::WaitingForAccept {
                        bail!("unexpected connection_reject in state {:?}", self.state);
                    }
                    self.emit(SessionEventKind::ConnectionRejected).await;
                    Ok(false)
                }

                header_kind::FILE_HEADER => self.handle_file_header(header).await,

                header_kind::FOLDER_HEADER => {
                    if self.state != HandshakeState::Accepted {
                        bail!("unexpected folder_header in state {:?}", self.state);
                    }
                    // Transfers are created per file; the folder header only
                    // announces the count.
                    log::debug!(
                        "session {}: folder '{}' with {} files incoming",
                        self.session_id,
                        header.file_name,
                        header.total_files
                    );
                    Ok(true)
                }

                header_kind::FILE_COMPLETE => self.handle_file_complete(header).await,

                header_kind::TRANSFER_CANCEL => {
                    if self.state != HandshakeState::Accepted {
                        bail!("unexpected transfer_cancel in state {:?}", self.state);
                    }
                    self.recv_carry = None;
                    if let Some(incoming) = self.incoming.take() {
                        let path = incoming.path.clone();
                        drop(incoming.file);
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            log::warn!(
                                "session {}: could not delete partial {}: {}",
                                self.session_id,
                                path.display(),
                                e
                            );
                        }
                    }
                    self.emit(SessionEventKind::TransferFailed {
                        transfer_id: header.transfer_id.clone(),
                        reason: "cancelled by peer".to_string(),
                    })
                    .await;
                    Ok(true)
                }

                other => bail!("unexpected {} frame in state {:?}", other, self.state),
            },
        }
    }

    async fn handle_data(&mut self, data: Vec<u8>) -> Result<bool> {
        let Some(incoming) = self.incoming.as_mut() else {
            // No open file: either the peer is blasting past our cancel or
            // the destination failed to open. Either way, drop the bytes.
            return Ok(true);
        };

        if let Err(e) = incoming.file.write_all(&data).await {
            let transfer_id = incoming.transfer_id.clone();
            self.incoming = None;
            self.recv_carry = None;
            self.discard_recv = Some(transfer_id.clone());
            self.emit(SessionEventKind::TransferFailed {
                transfer_id,
                reason: format!("write error: {}", e),
            })
            .await;
            return Ok(true);
        }

        incoming.received += data.len() as u64;
        let progress = SessionEventKind::TransferProgress {
            transfer_id: incoming.transfer_id.clone(),
            transferred: incoming.base + incoming.received,
            total: incoming.base + incoming.expected_size,
        };
        self.emit(progress).await;
        Ok(true)
    }

    async fn handle_file_header(&mut self, header: TransferHeader) -> Result<bool> {
        if self.state != HandshakeState::Accepted {
            bail!("unexpected file_header in state {:?}", self.state);
        }
        if self.incoming.is_some() {
            bail!("file_header while a file is already open");
        }
        // A fresh header ends any discard window from an earlier cancel.
        self.discard_recv = None;

        let path = match resolve_destination(
            &self.download_dir,
            &header.file_name,
            &header.relative_path,
        ) {
            Ok(path) => path,
            Err(e) => {
                self.discard_recv = Some(header.transfer_id.clone());
                self.recv_carry = None;
                self.emit(SessionEventKind::TransferFailed {
                    transfer_id: header.transfer_id,
                    reason: format!("cannot create file: {}", e),
                })
                .await;
                return Ok(true);
            }
        };
        let file = match File::create(&path).await {
            Ok(file) => file,
            Err(e) => {
                self.discard_recv = Some(header.transfer_id.clone());
                self.recv_carry = None;
                self.emit(SessionEventKind::TransferFailed {
                    transfer_id: header.transfer_id,
                    reason: format!("cannot create file: {}: {}", path.display(), e),
                })
                .await;
                return Ok(true);
            }
        };

        // A later file of the same transfer continues the byte count; a new
        // transfer id starts from zero and announces itself.
        let base = match self.recv_carry.as_ref() {
            Some((transfer_id, bytes)) if *transfer_id == header.transfer_id => Some(*bytes),
            _ => None,
        };
        let continuation = base.is_some();

        let total_files = header.total_files.max(1);
        self.incoming = Some(IncomingFile {
            transfer_id: header.transfer_id.clone(),
            path,
            file,
            expected_size: header.file_size,
            received: 0,
            total_files,
            current_index: header.current_file_index.max(1),
            base: base.unwrap_or(0),
        });
        if !continuation {
            self.recv_carry = None;
            self.emit(SessionEventKind::TransferStarted {
                transfer_id: header.transfer_id,
                file_name: header.file_name,
                total_size: header.file_size,
                total_files,
            })
            .await;
        }
        Ok(true)
    }

    async fn handle_file_complete(&mut self, header: TransferHeader) -> Result<bool> {
        if let Some(mut incoming) = self.incoming.take() {
            incoming.file.flush().await.ok();
            drop(incoming.file);

            self.recv_carry = Some((
                incoming.transfer_id.clone(),
                incoming.base + incoming.received,
            ));
            self.emit(SessionEventKind::FileReceived {
                transfer_id: incoming.transfer_id.clone(),
                path: incoming.path.clone(),
            })
            .await;
            if incoming.current_index >= incoming.total_files {
                self.emit(SessionEventKind::TransferCompleted {
                    transfer_id: incoming.transfer_id,
                })
                .await;
            }
            return Ok(true);
        }

        // The tail of a transfer we cancelled locally (or failed to open).
        if self
            .discard_recv
            .as_deref()
            .is_some_and(|id| id == header.transfer_id)
        {
            return Ok(true);
        }
        bail!("file_complete without an open file");
    }

    async fn emit(&self, kind: SessionEventKind) {
        let _ = self
            .events
            .send(SessionEvent {
                session_id: self.session_id.clone(),
                kind,
            })
            .await;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Filesystem helpers
// ────────────────────────────────────────────────────────────────────────────

/// Every regular file under `folder`, as `(absolute path, relative path)`
/// with `/`-separated relative components, sorted for a deterministic send
/// order. The snapshot is taken once and never revisited.
pub(crate) fn collect_files(folder: &Path) -> std::io::Result<Vec<(PathBuf, String)>> {
    fn walk(
        dir: &Path,
        prefix: &str,
        out: &mut Vec<(PathBuf, String)>,
    ) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                walk(&entry.path(), &relative, out)?;
            } else if file_type.is_file() {
                out.push((entry.path(), relative));
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(folder, "", &mut files)?;
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

/// Total `(file count, byte size)` of a folder snapshot.
pub(crate) fn folder_stats(folder: &Path) -> std::io::Result<(u64, u64)> {
    let files = collect_files(folder)?;
    let mut bytes = 0u64;
    for (path, _) in &files {
        bytes += std::fs::metadata(path)?.len();
    }
    Ok((files.len() as u64, bytes))
}

/// Pick the destination for an incoming file: the download base, plus the
/// relative subtree when the path carries one, suffixed ` (N)` on collision.
fn resolve_destination(
    base: &Path,
    file_name: &str,
    relative_path: &str,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(base)?;

    let candidate = if relative_path.contains('/') {
        let relative = Path::new(relative_path);
        if let Some(parent) = relative.parent() {
            std::fs::create_dir_all(base.join(parent))?;
        }
        base.join(relative)
    } else {
        base.join(file_name)
    };

    Ok(unique_destination(&candidate))
}

/// Append ` (N)` before the extension until the name is free, N from 1.
/// Each file resolves independently; earlier files of the same folder
/// transfer are already on disk and count as collisions.
fn unique_destination(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let extension = path.extension().map(|ext| ext.to_string_lossy().into_owned());

    let mut counter = 1u32;
    loop {
        let name = match &extension {
            Some(ext) => format!("{} ({}).{}", stem, counter, ext),
            None => format!("{} ({})", stem, counter),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn collision_suffix_counts_up() {
        let dir = tempdir().unwrap();
        let base = dir.path();

        let first = resolve_destination(base, "foo.txt", "").unwrap();
        assert_eq!(first, base.join("foo.txt"));
        std::fs::write(&first, b"original").unwrap();

        let second = resolve_destination(base, "foo.txt", "").unwrap();
        assert_eq!(second, base.join("foo (1).txt"));
        std::fs::write(&second, b"x").unwrap();

        let third = resolve_destination(base, "foo.txt", "").unwrap();
        assert_eq!(third, base.join("foo (2).txt"));

        // The original is untouched.
        assert_eq!(std::fs::read(base.join("foo.txt")).unwrap(), b"original");
    }

    #[test]
    fn collision_suffix_without_extension() {
        let dir = tempdir().unwrap();
        let base = dir.path();
        std::fs::write(base.join("notes"), b"x").unwrap();

        let next = resolve_destination(base, "notes", "").unwrap();
        assert_eq!(next, base.join("notes (1)"));
    }

    #[test]
    fn relative_path_creates_subtree() {
        let dir = tempdir().unwrap();
        let base = dir.path();

        let dest = resolve_destination(base, "b.bin", "pics/sub/b.bin").unwrap();
        assert_eq!(dest, base.join("pics/sub/b.bin"));
        assert!(base.join("pics/sub").is_dir());
    }

    #[test]
    fn collect_files_is_recursive_and_sorted() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("tree");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("b.bin"), vec![0u8; 3]).unwrap();
        std::fs::write(root.join("a.bin"), vec![0u8; 5]).unwrap();
        std::fs::write(root.join("sub/c.bin"), vec![0u8; 7]).unwrap();
        std::fs::create_dir(root.join("empty")).unwrap();

        let files = collect_files(&root).unwrap();
        let relative: Vec<&str> = files.iter().map(|(_, rel)| rel.as_str()).collect();
        assert_eq!(relative, vec!["a.bin", "b.bin", "sub/c.bin"]);

        let (count, bytes) = folder_stats(&root).unwrap();
        assert_eq!(count, 3);
        assert_eq!(bytes, 15);
    }
}

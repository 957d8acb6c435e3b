//! Wire protocol: discovery datagrams and transfer-session frames.
//!
//! Everything exchanged over UDP (discovery) and TCP (transfer sessions) is
//! defined here so that every sub-module speaks the same language.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// UDP port used for broadcast discovery.
pub const DISCOVERY_PORT: u16 = 45678;

/// TCP port the transfer server listens on.
pub const TRANSFER_PORT: u16 = 45679;

/// How often a discovery announce is broadcast.
pub const DISCOVERY_INTERVAL_SECS: u64 = 3;

/// A peer that has not announced within this window is considered gone.
pub const PEER_TIMEOUT_SECS: u64 = 10;

/// Chunk size for file data frames (64 KiB). Senders never exceed it.
pub const CHUNK_SIZE: usize = 65536;

/// Protocol tag carried in every discovery datagram.
pub const PROTOCOL_TAG: &str = "witra-v1";

/// Frame kind byte: JSON transfer header.
pub const FRAME_KIND_HEADER: u8 = 0;
/// Frame kind byte: raw file data.
pub const FRAME_KIND_DATA: u8 = 1;

/// Largest frame length the receiver accepts (length field is written by the
/// peer as a signed 32-bit quantity). Anything larger is a protocol error.
pub const MAX_FRAME_LEN: u32 = i32::MAX as u32;

/// Discovery datagram kinds.
pub mod discovery_kind {
    pub const ANNOUNCE: &str = "announce";
    pub const GOODBYE: &str = "goodbye";
}

/// Transfer header kinds. Only the first seven plus `transfer_cancel` are
/// ever sent; `transfer_ack`, `ping`, and `pong` are reserved.
pub mod header_kind {
    pub const CONNECTION_REQUEST: &str = "connection_request";
    pub const CONNECTION_ACCEPT: &str = "connection_accept";
    pub const CONNECTION_REJECT: &str = "connection_reject";
    pub const FILE_HEADER: &str = "file_header";
    pub const FILE_DATA: &str = "file_data";
    pub const FILE_COMPLETE: &str = "file_complete";
    pub const FOLDER_HEADER: &str = "folder_header";
    pub const TRANSFER_CANCEL: &str = "transfer_cancel";
    pub const TRANSFER_ACK: &str = "transfer_ack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// Generate an opaque unique id (UUID v4 without braces).
pub fn generate_unique_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ────────────────────────────────────────────────────────────────────────────
// UDP discovery
// ────────────────────────────────────────────────────────────────────────────

/// Discovery datagram payload — compact JSON, one UDP packet, never
/// fragmented (well under 1 KB).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage {
    /// `announce` or `goodbye`.
    #[serde(rename = "type")]
    pub kind: String,
    pub peer_id: String,
    pub display_name: String,
    pub device_name: String,
    pub transfer_port: u16,
    /// Protocol tag; a missing field is tolerated on receive.
    #[serde(default)]
    pub protocol: String,
}

impl DiscoveryMessage {
    pub fn announce(
        peer_id: &str,
        display_name: &str,
        device_name: &str,
        transfer_port: u16,
    ) -> Self {
        Self {
            kind: discovery_kind::ANNOUNCE.to_string(),
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
            device_name: device_name.to_string(),
            transfer_port,
            protocol: PROTOCOL_TAG.to_string(),
        }
    }

    pub fn goodbye(
        peer_id: &str,
        display_name: &str,
        device_name: &str,
        transfer_port: u16,
    ) -> Self {
        Self {
            kind: discovery_kind::GOODBYE.to_string(),
            ..Self::announce(peer_id, display_name, device_name, transfer_port)
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("discovery message serialisation is infallible")
    }

    /// Returns `None` when the datagram is not a JSON object of the expected
    /// shape. Unknown `type` values are kept; the caller drops them.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    /// A datagram is usable when both `type` and `peerId` are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.kind.is_empty() && !self.peer_id.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transfer headers
// ────────────────────────────────────────────────────────────────────────────

/// Transfer-session header payload. Every field is present on the wire for
/// every kind; fields a kind does not use are empty / zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub transfer_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub relative_path: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub current_file_index: u64,
    #[serde(default)]
    pub sender_name: String,
}

impl TransferHeader {
    fn empty(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            transfer_id: String::new(),
            file_name: String::new(),
            relative_path: String::new(),
            file_size: 0,
            total_files: 0,
            current_file_index: 0,
            sender_name: String::new(),
        }
    }

    /// Handshake request. The sender's peer id travels in the `transferId`
    /// field; that overloading is part of the wire format.
    pub fn connection_request(sender_name: &str, sender_id: &str) -> Self {
        Self {
            sender_name: sender_name.to_string(),
            transfer_id: sender_id.to_string(),
            ..Self::empty(header_kind::CONNECTION_REQUEST)
        }
    }

    pub fn connection_accept() -> Self {
        Self::empty(header_kind::CONNECTION_ACCEPT)
    }

    pub fn connection_reject() -> Self {
        Self::empty(header_kind::CONNECTION_REJECT)
    }

    pub fn file_header(
        transfer_id: &str,
        file_name: &str,
        relative_path: &str,
        file_size: u64,
        total_files: u64,
        current_file_index: u64,
    ) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            file_name: file_name.to_string(),
            relative_path: relative_path.to_string(),
            file_size,
            total_files,
            current_file_index,
            ..Self::empty(header_kind::FILE_HEADER)
        }
    }

    pub fn folder_header(transfer_id: &str, dir_name: &str, total_files: u64) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            file_name: dir_name.to_string(),
            total_files,
            ..Self::empty(header_kind::FOLDER_HEADER)
        }
    }

    pub fn file_complete(transfer_id: &str) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            ..Self::empty(header_kind::FILE_COMPLETE)
        }
    }

    pub fn transfer_cancel(transfer_id: &str) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            ..Self::empty(header_kind::TRANSFER_CANCEL)
        }
    }

    /// The peer id a `connection_request` carries in its `transferId` field.
    pub fn sender_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("transfer header serialisation is infallible")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frames
// ────────────────────────────────────────────────────────────────────────────

/// One decoded session frame.
#[derive(Debug)]
pub enum Frame {
    Header(TransferHeader),
    Data(Vec<u8>),
}

/// Encode a frame: `[4-byte BE length covering kind + payload][kind][payload]`.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u32;
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    buf
}

/// Write a header frame to `writer`.
pub async fn write_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &TransferHeader,
) -> Result<()> {
    writer
        .write_all(&encode_frame(FRAME_KIND_HEADER, &header.to_bytes()))
        .await
        .context("writing header frame")
}

/// Write a data frame to `writer`.
pub async fn write_data<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> Result<()> {
    writer
        .write_all(&encode_frame(FRAME_KIND_DATA, chunk))
        .await
        .context("writing data frame")
}

/// Read one frame. Errors on EOF, oversized length, unknown kind byte, or
/// an unparseable header payload; the caller treats any error as the end of
/// the session.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("reading frame length")?;
    let len = u32::from_be_bytes(len_buf);

    if len == 0 {
        bail!("empty frame");
    }
    if len > MAX_FRAME_LEN {
        bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_LEN);
    }

    let mut kind_buf = [0u8; 1];
    reader
        .read_exact(&mut kind_buf)
        .await
        .context("reading frame kind")?;

    let mut payload = vec![0u8; len as usize - 1];
    reader
        .read_exact(&mut payload)
        .await
        .context("reading frame payload")?;

    match kind_buf[0] {
        FRAME_KIND_HEADER => {
            let header: TransferHeader =
                serde_json::from_slice(&payload).context("deserialising transfer header")?;
            Ok(Frame::Header(header))
        }
        FRAME_KIND_DATA => Ok(Frame::Data(payload)),
        other => bail!("unknown frame kind byte: {}", other),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_roundtrip_is_compact_camel_case() {
        let msg = DiscoveryMessage::announce("id-1", "Alice", "alice-laptop", 45679);
        let bytes = msg.to_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();

        assert!(!text.contains('\n'));
        assert!(!text.contains(": "));
        assert!(text.contains("\"type\":\"announce\""));
        assert!(text.contains("\"peerId\":\"id-1\""));
        assert!(text.contains("\"displayName\":\"Alice\""));
        assert!(text.contains("\"deviceName\":\"alice-laptop\""));
        assert!(text.contains("\"transferPort\":45679"));
        assert!(text.contains("\"protocol\":\"witra-v1\""));

        let back = DiscoveryMessage::from_bytes(&bytes).unwrap();
        assert!(back.is_valid());
        assert_eq!(back.kind, discovery_kind::ANNOUNCE);
        assert_eq!(back.peer_id, "id-1");
        assert_eq!(back.transfer_port, 45679);
    }

    #[test]
    fn discovery_tolerates_missing_protocol_and_rejects_garbage() {
        let json = br#"{"type":"announce","peerId":"p","displayName":"n","deviceName":"d","transferPort":1}"#;
        let msg = DiscoveryMessage::from_bytes(json).unwrap();
        assert!(msg.is_valid());
        assert!(msg.protocol.is_empty());

        assert!(DiscoveryMessage::from_bytes(b"not json").is_none());

        let empty_id =
            br#"{"type":"announce","peerId":"","displayName":"","deviceName":"","transferPort":0}"#;
        assert!(!DiscoveryMessage::from_bytes(empty_id).unwrap().is_valid());
    }

    #[test]
    fn connection_request_overloads_transfer_id_with_sender_id() {
        let header = TransferHeader::connection_request("Alice", "peer-abc");
        let text = String::from_utf8(header.to_bytes()).unwrap();

        assert!(text.contains("\"transferId\":\"peer-abc\""));
        assert!(text.contains("\"senderName\":\"Alice\""));
        assert_eq!(header.sender_id(), "peer-abc");
    }

    #[test]
    fn header_wire_fields_are_always_present() {
        let text = String::from_utf8(TransferHeader::connection_accept().to_bytes()).unwrap();
        for field in [
            "\"type\"",
            "\"transferId\"",
            "\"fileName\"",
            "\"relativePath\"",
            "\"fileSize\"",
            "\"totalFiles\"",
            "\"currentFileIndex\"",
            "\"senderName\"",
        ] {
            assert!(text.contains(field), "missing {field} in {text}");
        }
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let header = TransferHeader::file_header("tid", "a.bin", "dir/a.bin", 42, 2, 1);
        let mut wire = encode_frame(FRAME_KIND_HEADER, &header.to_bytes());
        wire.extend_from_slice(&encode_frame(FRAME_KIND_DATA, b"hello"));

        let mut reader = wire.as_slice();
        match read_frame(&mut reader).await.unwrap() {
            Frame::Header(h) => {
                assert_eq!(h.kind, header_kind::FILE_HEADER);
                assert_eq!(h.transfer_id, "tid");
                assert_eq!(h.file_size, 42);
                assert_eq!(h.current_file_index, 1);
            }
            other => panic!("expected header, got {:?}", other),
        }
        match read_frame(&mut reader).await.unwrap() {
            Frame::Data(d) => assert_eq!(d, b"hello"),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn frame_length_covers_kind_byte() {
        let wire = encode_frame(FRAME_KIND_DATA, b"abc");
        assert_eq!(&wire[..4], &4u32.to_be_bytes());
        assert_eq!(wire[4], FRAME_KIND_DATA);
        assert_eq!(&wire[5..], b"abc");
    }

    #[tokio::test]
    async fn oversized_and_malformed_frames_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        wire.push(FRAME_KIND_DATA);
        assert!(read_frame(&mut wire.as_slice()).await.is_err());

        let empty = 0u32.to_be_bytes().to_vec();
        assert!(read_frame(&mut empty.as_slice()).await.is_err());

        let bad_kind = encode_frame(7, b"x");
        assert!(read_frame(&mut bad_kind.as_slice()).await.is_err());

        let bad_json = encode_frame(FRAME_KIND_HEADER, b"{nope");
        assert!(read_frame(&mut bad_json.as_slice()).await.is_err());
    }

    #[tokio::test]
    async fn truncated_frame_errors() {
        let full = encode_frame(FRAME_KIND_DATA, &[0u8; 16]);
        let mut truncated = &full[..10];
        assert!(read_frame(&mut truncated).await.is_err());
    }
}

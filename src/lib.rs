//! Witra — LAN peer-to-peer file transfer.
//!
//! Devices on the same broadcast domain find each other over UDP, negotiate
//! a mutual connection, and stream files or whole directory trees over a
//! framed TCP protocol. This crate is the networking core: discovery,
//! sessions, and the peer/transfer registries, exposed as an event-driven
//! runtime that a UI (or the bundled CLI) observes and drives.

pub mod logging;
pub mod runtime;

pub use runtime::{
    spawn_runtime, PeerInfo, PeerState, Runtime, RuntimeError, RuntimeEvent, RuntimeHandle,
    StartOptions, TransferDirection, TransferSnapshot, TransferStatus,
};

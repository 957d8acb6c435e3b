//! Transfer registry.
//!
//! Single-owner map of transfers keyed by id, owned by the runtime worker.
//! Outgoing transfers are created when the UI enqueues a send; incoming ones
//! when a session reports `TransferStarted`. Terminal states are sticky: a
//! transfer that completed, failed, or was cancelled never changes again
//! (late events from an already-cancelled transfer are dropped here).

use std::{
    collections::HashMap,
    path::PathBuf,
    time::Instant,
};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// Public snapshot of one transfer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub id: String,
    pub file_name: String,
    /// Source path (outgoing) or destination path once known (incoming).
    pub path: Option<PathBuf>,
    pub total_size: u64,
    pub transferred: u64,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub peer_id: String,
    pub peer_name: String,
    pub total_files: u64,
    pub current_file: u64,
    /// Bytes per second, sampled roughly once per second.
    pub speed_bps: u64,
    pub error: Option<String>,
}

struct TransferItem {
    file_name: String,
    path: Option<PathBuf>,
    total_size: u64,
    transferred: u64,
    direction: TransferDirection,
    status: TransferStatus,
    peer_id: String,
    peer_name: String,
    total_files: u64,
    current_file: u64,
    error: Option<String>,
    seq: u64,

    // Speed sampling
    last_sample_bytes: u64,
    last_sample_at: Instant,
    speed_bps: u64,
}

#[derive(Default)]
pub(crate) struct TransferRegistry {
    items: HashMap<String, TransferItem>,
    next_seq: u64,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the transfer was created (`false` for an id that
    /// already exists — a duplicate start must not reset progress).
    #[allow(clippy::too_many_arguments)]
    pub fn insert_outgoing(
        &mut self,
        id: &str,
        file_name: &str,
        source: PathBuf,
        total_size: u64,
        peer_id: &str,
        peer_name: &str,
        total_files: u64,
    ) -> bool {
        self.insert(
            id,
            file_name,
            Some(source),
            total_size,
            TransferDirection::Outgoing,
            peer_id,
            peer_name,
            total_files,
        )
    }

    pub fn insert_incoming(
        &mut self,
        id: &str,
        file_name: &str,
        total_size: u64,
        peer_id: &str,
        peer_name: &str,
        total_files: u64,
    ) -> bool {
        self.insert(
            id,
            file_name,
            None,
            total_size,
            TransferDirection::Incoming,
            peer_id,
            peer_name,
            total_files,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &mut self,
        id: &str,
        file_name: &str,
        path: Option<PathBuf>,
        total_size: u64,
        direction: TransferDirection,
        peer_id: &str,
        peer_name: &str,
        total_files: u64,
    ) -> bool {
        if self.items.contains_key(id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.insert(
            id.to_string(),
            TransferItem {
                file_name: file_name.to_string(),
                path,
                total_size,
                transferred: 0,
                direction,
                status: TransferStatus::InProgress,
                peer_id: peer_id.to_string(),
                peer_name: peer_name.to_string(),
                total_files: total_files.max(1),
                current_file: 1,
                error: None,
                seq,
                last_sample_bytes: 0,
                last_sample_at: Instant::now(),
                speed_bps: 0,
            },
        );
        true
    }

    /// Record progress. Progress is monotonic and capped at the total; the
    /// speed estimate is refreshed once at least a second has elapsed since
    /// the previous sample. A folder transfer's receiver only learns the
    /// byte total file by file, so `total_hint` may grow the total. Returns
    /// `false` for unknown or finished items.
    pub fn set_transferred(&mut self, id: &str, bytes: u64, total_hint: u64) -> bool {
        let Some(item) = self.items.get_mut(id) else {
            return false;
        };
        if item.status.is_terminal() {
            return false;
        }

        if total_hint > item.total_size {
            item.total_size = total_hint;
        }
        let mut bytes = bytes.max(item.transferred);
        if item.total_size > 0 {
            bytes = bytes.min(item.total_size);
        }
        item.transferred = bytes;

        let elapsed_ms = item.last_sample_at.elapsed().as_millis() as u64;
        if elapsed_ms >= 1000 {
            let delta = item.transferred - item.last_sample_bytes;
            item.speed_bps = delta * 1000 / elapsed_ms;
            item.last_sample_bytes = item.transferred;
            item.last_sample_at = Instant::now();
        }
        true
    }

    /// A file of this transfer landed on disk (incoming side).
    pub fn file_received(&mut self, id: &str, path: PathBuf) -> bool {
        let Some(item) = self.items.get_mut(id) else {
            return false;
        };
        if item.status.is_terminal() {
            return false;
        }
        item.path = Some(path);
        if item.current_file < item.total_files {
            item.current_file += 1;
        }
        true
    }

    pub fn complete(&mut self, id: &str) -> bool {
        self.finish(id, TransferStatus::Completed, None)
    }

    pub fn fail(&mut self, id: &str, reason: &str) -> bool {
        self.finish(id, TransferStatus::Failed, Some(reason.to_string()))
    }

    pub fn cancel(&mut self, id: &str) -> bool {
        self.finish(id, TransferStatus::Cancelled, None)
    }

    fn finish(&mut self, id: &str, status: TransferStatus, error: Option<String>) -> bool {
        match self.items.get_mut(id) {
            Some(item) if !item.status.is_terminal() => {
                item.status = status;
                item.error = error;
                item.speed_bps = 0;
                true
            }
            _ => false,
        }
    }

    /// Fail every active transfer bound to `peer_id`, returning the ids that
    /// changed. Used for the connection-lost fan-out.
    pub fn fail_active_for_peer(&mut self, peer_id: &str, reason: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .items
            .iter()
            .filter(|(_, item)| item.peer_id == peer_id && item.status.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.fail(id, reason);
        }
        ids
    }

    pub fn has_active_with_peer(&self, peer_id: &str) -> bool {
        self.items
            .values()
            .any(|item| item.peer_id == peer_id && item.status.is_active())
    }

    pub fn peer_of(&self, id: &str) -> Option<String> {
        self.items.get(id).map(|item| item.peer_id.clone())
    }

    /// Drop all finished transfers, returning the removed ids.
    pub fn clear_finished(&mut self) -> Vec<String> {
        let ids: Vec<String> = self
            .items
            .iter()
            .filter(|(_, item)| item.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.items.remove(id);
        }
        ids
    }

    pub fn snapshot(&self, id: &str) -> Option<TransferSnapshot> {
        self.items.get(id).map(|item| TransferSnapshot {
            id: id.to_string(),
            file_name: item.file_name.clone(),
            path: item.path.clone(),
            total_size: item.total_size,
            transferred: item.transferred,
            direction: item.direction,
            status: item.status,
            peer_id: item.peer_id.clone(),
            peer_name: item.peer_name.clone(),
            total_files: item.total_files,
            current_file: item.current_file,
            speed_bps: item.speed_bps,
            error: item.error.clone(),
        })
    }

    /// All transfers in creation order.
    pub fn list(&self) -> Vec<TransferSnapshot> {
        let mut entries: Vec<(&String, &TransferItem)> = self.items.iter().collect();
        entries.sort_by_key(|(_, item)| item.seq);
        entries
            .into_iter()
            .filter_map(|(id, _)| self.snapshot(id))
            .collect()
    }

    #[cfg(test)]
    fn backdate_sample(&mut self, id: &str, by: std::time::Duration) {
        if let Some(item) = self.items.get_mut(id) {
            item.last_sample_at = Instant::now() - by;
        }
    }
}

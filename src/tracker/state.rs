//! Shared cluster state, guarded by a single mutex. Sessions take the lock
//! only for in-memory reads and writes; network and disk I/O happen outside
//! it. A separate, narrower lock serializes the one-time sync bootstrap so
//! that only one session negotiates a source assignment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::cursor::SyncCursor;
use crate::membership::{MembershipTable, StorageStatus};
use crate::protocol::message::{DiskUsage, UsageStats};

/// Result of the most recent attempt at a given RPC, kept per tracker so
/// other sessions can reason about what each tracker has been told.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RpcOutcome {
    #[default]
    NotAttempted,
    Ok,
    /// Remote error code, or 0 for a local/transport failure.
    Failed(u8),
}

/// Per-tracker view of this node, as reported back by that tracker.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportState {
    /// What this tracker most recently said our own status is.
    pub self_status: Option<StorageStatus>,
    pub last_join: RpcOutcome,
    pub last_sync_notify: RpcOutcome,
    /// Set by the leader tracker's divergence check; the session clears it
    /// after pushing a correcting status report and rejoining.
    pub needs_status_correction: bool,
    /// Set when a tracker pushed a regressed status for us; forces the
    /// session to reconnect and rejoin.
    pub need_rejoin: bool,
}

/// Identity of the current trunk allocator, as announced by trackers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrunkServerAddr {
    pub id: String,
    pub ip: String,
    pub port: u32,
}

/// Trunk allocation role held by this node, plus the values it reports to
/// trackers while holding the role.
#[derive(Debug, Default)]
pub struct TrunkRole {
    pub is_allocator: bool,
    pub server: Option<TrunkServerAddr>,
    pub trunk_file_id: u32,
    pub trunk_free_space_mb: i64,
}

/// All cluster state shared between tracker sessions.
pub struct ClusterState {
    pub table: MembershipTable,
    pub reports: Vec<ReportState>,
    /// Index into the tracker list of the current leader, if known.
    pub leader_index: Option<usize>,
    pub trunk: TrunkRole,
    pub cursor: SyncCursor,
    pub stats: UsageStats,
    /// Bumped whenever `stats` changes; a session attaches stats to its next
    /// heartbeat only when this moved past what it already sent.
    pub stats_version: u64,
    /// Bumped whenever any peer's last-sync timestamp changes.
    pub sync_version: u64,
    pub disk_usage: Vec<DiskUsage>,
    /// Local address as observed by the first tracker we connected to. All
    /// trackers must agree on it.
    pub client_ip: Option<String>,
}

impl ClusterState {
    /// The most advanced status any tracker currently holds for us.
    pub fn best_self_status(&self) -> Option<StorageStatus> {
        self.reports.iter().filter_map(|r| r.self_status).max()
    }
}

pub struct Shared {
    state: Mutex<ClusterState>,
    bootstrap: Mutex<()>,
    running: AtomicBool,
}

impl Shared {
    pub fn new(tracker_count: usize, cursor: SyncCursor) -> Self {
        Self {
            state: Mutex::new(ClusterState {
                table: MembershipTable::new(),
                reports: vec![ReportState::default(); tracker_count],
                leader_index: None,
                trunk: TrunkRole::default(),
                cursor,
                stats: UsageStats::default(),
                stats_version: 0,
                sync_version: 0,
                disk_usage: Vec::new(),
                client_ip: None,
            }),
            bootstrap: Mutex::new(()),
            running: AtomicBool::new(true),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().expect("cluster state lock poisoned")
    }

    /// Serializes the one-time sync source negotiation across sessions.
    pub fn lock_bootstrap(&self) -> MutexGuard<'_, ()> {
        self.bootstrap.lock().expect("bootstrap lock poisoned")
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::StorageStatus;

    #[test]
    fn best_self_status_takes_max_across_trackers() {
        let shared = Shared::new(3, SyncCursor::default());
        let mut state = shared.lock();
        assert_eq!(state.best_self_status(), None);
        state.reports[0].self_status = Some(StorageStatus::WaitSync);
        state.reports[2].self_status = Some(StorageStatus::Active);
        assert_eq!(state.best_self_status(), Some(StorageStatus::Active));
    }

    #[test]
    fn shutdown_clears_running() {
        let shared = Shared::new(1, SyncCursor::default());
        assert!(shared.running());
        shared.shutdown();
        assert!(!shared.running());
    }
}

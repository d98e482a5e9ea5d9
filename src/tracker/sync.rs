//! Sync cursor negotiation.
//!
//! A fresh node asks its tracker for a historical sync source once, before
//! entering steady-state reporting; the replication workers then catch up
//! from that source and eventually mark the cursor done. On every connect
//! the session also pushes the current cursor to its tracker, and reacts to
//! the leader disowning the source (it was deleted) by clearing the cursor,
//! re-querying for a replacement, and re-arming the historical catch-up if
//! the cluster has not yet marked this node available.

use log::{error, info, warn};

use crate::cursor::{CursorStore, SyncCursor};
use crate::error::Result;
use crate::membership::StorageStatus;
use crate::protocol::message::SyncAssignment;
use crate::transport::Connection;

use super::rpc;
use super::state::{RpcOutcome, Shared};

/// Writes the cursor through to disk. A cursor that was accepted in memory
/// but cannot be persisted would silently re-sync or skip data after a
/// restart, so failure shuts the daemon down.
pub fn persist_or_shutdown(shared: &Shared, store: &dyn CursorStore, cursor: &SyncCursor) -> Result<()> {
    if let Err(err) = store.persist(cursor) {
        error!("failed to persist sync cursor: {err}, shutting down");
        shared.shutdown();
        return Err(err);
    }
    Ok(())
}

/// One-time source negotiation, serialized across sessions. An empty
/// assignment means this node is first in its group and has nothing to catch
/// up; a non-empty one hands the assigned source to the replication workers
/// through the cursor. Either way the negotiation itself is done and is not
/// repeated unless a later source deletion re-arms it.
pub fn bootstrap(conn: &mut dyn Connection, shared: &Shared, store: &dyn CursorStore) -> Result<()> {
    let _guard = shared.lock_bootstrap();
    if shared.lock().cursor.old_data_sync_done {
        return Ok(());
    }
    let assignment = rpc::sync_dest_request(conn)?;
    let cursor = {
        let mut state = shared.lock();
        match assignment {
            Some(assignment) => {
                info!(
                    "assigned sync source {} until {}",
                    assignment.source_id, assignment.until_timestamp
                );
                state.cursor.source_id = assignment.source_id;
                state.cursor.until_timestamp = assignment.until_timestamp;
            }
            None => info!("no sync source needed, nothing to catch up"),
        }
        state.cursor.old_data_sync_done = true;
        state.cursor.clone()
    };
    persist_or_shutdown(shared, store, &cursor)
}

/// Pushes the current cursor to the tracker at `index`. When the leader
/// answers not-found the assigned source no longer exists: the cursor is
/// cleared, a replacement is queried, and if the cluster does not yet count
/// us available the historical catch-up is re-armed. The original error is
/// still returned so the session reconnects and rejoins with the new cursor.
pub fn notify(
    conn: &mut dyn Connection,
    shared: &Shared,
    store: &dyn CursorStore,
    index: usize,
) -> Result<()> {
    let assignment = {
        let state = shared.lock();
        if state.cursor.source_id.is_empty() {
            return Ok(());
        }
        SyncAssignment {
            source_id: state.cursor.source_id.clone(),
            until_timestamp: state.cursor.until_timestamp,
        }
    };

    let result = rpc::sync_notify(conn, &assignment);
    let (outcome, from_leader) = {
        let mut state = shared.lock();
        state.reports[index].last_sync_notify = match &result {
            Ok(()) => RpcOutcome::Ok,
            Err(err) => RpcOutcome::Failed(err.remote_code().unwrap_or(0)),
        };
        (result, state.leader_index == Some(index))
    };
    let Err(err) = outcome else { return Ok(()) };
    if !err.is_not_found() || !from_leader {
        return Err(err);
    }

    warn!("leader does not know sync source {}, it was deleted", assignment.source_id);
    {
        let mut state = shared.lock();
        state.cursor.source_id.clear();
        state.cursor.until_timestamp = 0;
    }
    let replacement = rpc::sync_dest_query(conn)?;
    let cursor = {
        let mut state = shared.lock();
        if let Some(replacement) = replacement {
            info!("replacement sync source {}", replacement.source_id);
            state.cursor.source_id = replacement.source_id;
            state.cursor.until_timestamp = replacement.until_timestamp;
        }
        if state.best_self_status().map_or(true, |s| s < StorageStatus::Offline) {
            state.cursor.old_data_sync_done = false;
        }
        state.cursor.clone()
    };
    persist_or_shutdown(shared, store, &cursor)?;
    Err(err)
}

/// Asks the tracker whether (and until when) this node is the historical
/// sync source for a given peer. Called by replication workers before
/// pushing old data to a destination.
pub fn source_for_peer(
    conn: &mut dyn Connection,
    group_name: &str,
    peer_id: &str,
) -> Result<Option<SyncAssignment>> {
    rpc::sync_src_request(conn, group_name, peer_id)
}

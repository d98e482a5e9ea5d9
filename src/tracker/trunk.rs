//! Trunk allocator role control.
//!
//! Trackers elect one group member as the trunk allocator and announce it in
//! change notifications. Accepting the role fetches the authoritative trunk
//! file id, persists it, initializes the allocator subsystem, starts trunk
//! replication toward available peers, and schedules the periodic precreate
//! and compress jobs. Losing the role tears all of that down in reverse and
//! reports the final file id back so the successor continues from it.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::config::Config;
use crate::cursor::CursorStore;
use crate::error::Result;
use crate::protocol::message::TrunkChange;
use crate::transport::Connection;
use crate::workers::{
    Scheduler, SyncWorkers, TrunkAllocator, TRUNK_COMPRESS_TASK, TRUNK_PRECREATE_TASK,
};

use super::rpc;
use super::state::{Shared, TrunkServerAddr};

/// Collaborators the role transitions drive. Arcs so scheduled jobs can
/// outlive the announcing session's borrow.
#[derive(Clone)]
pub struct TrunkDeps {
    pub workers: Arc<dyn SyncWorkers>,
    pub allocator: Arc<dyn TrunkAllocator>,
    pub scheduler: Arc<dyn Scheduler>,
    pub cursor_store: Arc<dyn CursorStore>,
}

enum Transition {
    /// Same holder and same role as before.
    Unchanged,
    /// Another node holds or takes the role; nothing to do locally.
    Observed,
    /// The tracker named us and we already hold the role.
    AlreadyHolding,
    Accept,
    Handoff,
}

/// Applies a trunk-server announcement. Role transitions are decided under
/// the state lock; the resulting RPCs and subsystem calls run outside it.
pub fn apply_trunk_change(
    conn: &mut dyn Connection,
    shared: &Shared,
    config: &Config,
    deps: &TrunkDeps,
    change: &TrunkChange,
) -> Result<()> {
    let holder = resolve_holder(shared, config, change);
    let is_self = !holder.ip.is_empty()
        && (holder.id == config.id || (holder.ip == config.ip && holder.port == config.port));

    let transition = {
        let mut state = shared.lock();
        let new_server = (!holder.ip.is_empty()).then(|| holder.clone());
        let was_allocator = state.trunk.is_allocator;
        if state.trunk.server == new_server && was_allocator == is_self {
            Transition::Unchanged
        } else {
            state.trunk.server = new_server;
            match (is_self, was_allocator) {
                (true, true) => Transition::AlreadyHolding,
                (true, false) => Transition::Accept,
                (false, true) => Transition::Handoff,
                (false, false) => Transition::Observed,
            }
        }
    };

    match transition {
        Transition::Unchanged | Transition::Observed => Ok(()),
        Transition::AlreadyHolding => {
            warn!("tracker re-announced the trunk allocator role we already hold");
            Ok(())
        }
        Transition::Accept => accept(conn, shared, config, deps),
        Transition::Handoff => {
            handoff(conn, shared, deps, &holder);
            Ok(())
        }
    }
}

/// Resolves the announced holder: under storage-id addressing the id wins
/// and the membership table supplies its current address; otherwise the
/// literal address in the announcement is taken as-is.
fn resolve_holder(shared: &Shared, config: &Config, change: &TrunkChange) -> TrunkServerAddr {
    let (ip, port) = if config.use_storage_id && !change.id.is_empty() {
        match shared.lock().table.get(&change.id) {
            Some(record) => (record.ip.clone(), record.port),
            None => (change.ip.clone(), change.port),
        }
    } else {
        (change.ip.clone(), change.port)
    };
    TrunkServerAddr { id: change.id.clone(), ip, port }
}

/// Takes the allocator role. Failing to persist the fetched trunk file id or
/// to initialize the allocator shuts the process down: continuing could hand
/// out ids a restart would reuse.
fn accept(
    conn: &mut dyn Connection,
    shared: &Shared,
    config: &Config,
    deps: &TrunkDeps,
) -> Result<()> {
    info!("accepting the trunk allocator role");
    // A duplicate-code answer means the tracker already served the fetch;
    // continue from the locally known id.
    let file_id = match rpc::fetch_trunk_file_id(conn) {
        Ok(file_id) => Some(file_id),
        Err(err) if err.is_already_done() => None,
        Err(err) => return Err(err),
    };

    let dirty_cursor = file_id.and_then(|file_id| {
        let mut state = shared.lock();
        state.trunk.trunk_file_id = state.trunk.trunk_file_id.max(file_id);
        (file_id > state.cursor.trunk_file_id).then(|| {
            state.cursor.trunk_file_id = file_id;
            state.cursor.clone()
        })
    });
    if let Some(cursor) = dirty_cursor {
        if let Err(err) = deps.cursor_store.persist(&cursor) {
            error!("failed to persist trunk file id {}: {err}, shutting down", cursor.trunk_file_id);
            shared.shutdown();
            return Err(err);
        }
    }

    if let Err(err) = deps.allocator.init() {
        error!("trunk allocator init failed: {err}, shutting down");
        shared.shutdown();
        return Err(err);
    }

    let peers: Vec<String> = {
        let mut state = shared.lock();
        state.trunk.is_allocator = true;
        state
            .table
            .iter()
            .filter(|r| r.status.is_available() && r.id != config.id)
            .map(|r| r.id.clone())
            .collect()
    };
    for peer in peers {
        if let Err(err) = deps.workers.start_peer_trunk_sync(&peer) {
            warn!("trunk replication worker for {peer} failed to start: {err}");
        }
    }

    schedule_jobs(config, deps);
    Ok(())
}

fn schedule_jobs(config: &Config, deps: &TrunkDeps) {
    if config.trunk_precreate_interval > 0 {
        let allocator = deps.allocator.clone();
        deps.scheduler.schedule(
            TRUNK_PRECREATE_TASK,
            Duration::from_secs(config.trunk_precreate_interval),
            Box::new(move || {
                if let Err(err) = allocator.precreate() {
                    warn!("trunk precreate failed: {err}");
                }
            }),
        );
    }
    if config.trunk_compress_interval > 0 {
        let allocator = deps.allocator.clone();
        deps.scheduler.schedule(
            TRUNK_COMPRESS_TASK,
            Duration::from_secs(config.trunk_compress_interval),
            Box::new(move || {
                if let Err(err) = allocator.compress() {
                    warn!("trunk binlog compress failed: {err}");
                }
            }),
        );
    }
}

/// Gives up the allocator role. The final trunk file id is reported
/// best-effort so the successor continues from it.
fn handoff(conn: &mut dyn Connection, shared: &Shared, deps: &TrunkDeps, successor: &TrunkServerAddr) {
    info!("handing the trunk allocator role off to {}:{}", successor.ip, successor.port);
    let file_id = {
        let mut state = shared.lock();
        state.trunk.is_allocator = false;
        state.trunk.trunk_file_id
    };
    if file_id > 0 {
        if let Err(err) = rpc::report_trunk_file_id(conn, file_id) {
            warn!("final trunk file id report failed: {err}");
        }
    }
    deps.scheduler.cancel(TRUNK_PRECREATE_TASK);
    deps.scheduler.cancel(TRUNK_COMPRESS_TASK);
    if let Err(err) = deps.workers.stop_waiting_trunk_sync() {
        warn!("stopping waiting trunk replication workers failed: {err}");
    }
    if let Err(err) = deps.allocator.destroy() {
        warn!("trunk allocator destroy failed: {err}");
    }
}

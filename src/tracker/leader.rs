//! Tracker leader tracking.
//!
//! Any tracker can announce the current leader in a change notification.
//! Before adopting a new leader over a previously known one, the old leader
//! is probed on a fresh connection; if both still claim leadership, both are
//! told to re-run election and the local view resets to unknown. When the
//! leader is unknown and no announcement arrives, each session polls only
//! its own tracker.

use log::{error, info, warn};

use crate::config::Config;
use crate::membership::StorageStatus;
use crate::protocol::message::LeaderChange;
use crate::transport::Transport;

use super::rpc;
use super::state::{ClusterState, Shared};

/// Matches an announced leader address against the configured tracker list.
fn tracker_index(config: &Config, ip: &str, port: u32) -> Option<usize> {
    let addr = format!("{ip}:{port}");
    config.trackers.iter().position(|t| t == &addr)
}

/// Handles a leader announcement from any tracker.
pub fn on_leader_notice(
    shared: &Shared,
    config: &Config,
    transport: &dyn Transport,
    change: &LeaderChange,
) {
    if change.ip.is_empty() {
        let mut state = shared.lock();
        if state.leader_index.take().is_some() {
            warn!("tracker leader revoked, no current leader");
        }
        return;
    }
    let Some(new_index) = tracker_index(config, &change.ip, change.port) else {
        error!("announced leader {}:{} is not a configured tracker", change.ip, change.port);
        return;
    };
    accept_leader(shared, config, transport, new_index);
}

/// Adopts a leader, probing the previously known one first. Two live
/// claimants reset the local view and tell both to re-elect.
pub fn accept_leader(
    shared: &Shared,
    config: &Config,
    transport: &dyn Transport,
    new_index: usize,
) {
    let old_index = shared.lock().leader_index;
    if old_index == Some(new_index) {
        return;
    }

    if let Some(old_index) = old_index {
        // Probe without holding the lock.
        let old_addr = &config.trackers[old_index];
        match rpc::tracker_running_status(transport, old_addr) {
            Ok(status) if status.is_leader => {
                warn!(
                    "split brain: trackers {} and {} both claim leadership, forcing re-election",
                    old_addr, config.trackers[new_index]
                );
                for addr in [old_addr, &config.trackers[new_index]] {
                    if let Err(err) = rpc::notify_reselect_leader(transport, addr) {
                        error!("reselect-leader notice to {addr} failed: {err}");
                    }
                }
                shared.lock().leader_index = None;
                return;
            }
            Ok(_) => {}
            Err(err) => info!("old leader {old_addr} unreachable ({err}), adopting new leader"),
        }
    }

    info!("tracker leader is now {}", config.trackers[new_index]);
    let mut state = shared.lock();
    state.leader_index = Some(new_index);
    divergence_check(&mut state);
}

/// Polls one tracker for its own leadership claim, used by a session on its
/// own tracker while the leader is unknown.
pub fn discover(shared: &Shared, config: &Config, transport: &dyn Transport, index: usize) {
    if shared.lock().leader_index.is_some() {
        return;
    }
    match rpc::tracker_running_status(transport, &config.trackers[index]) {
        Ok(status) if status.is_leader => accept_leader(shared, config, transport, index),
        Ok(_) => {}
        Err(err) => info!("leader poll of {} failed: {err}", config.trackers[index]),
    }
}

/// Flags any tracker whose cached view of our status diverges from the
/// leader's, unless both views are available (Online vs Active churn is
/// normal). Flagged sessions push a correcting status report and rejoin.
pub fn divergence_check(state: &mut ClusterState) {
    let Some(leader_index) = state.leader_index else { return };
    let Some(leader_status) = state.reports[leader_index].self_status else { return };
    for (index, report) in state.reports.iter_mut().enumerate() {
        if index == leader_index {
            continue;
        }
        let Some(status) = report.self_status else { continue };
        if status != leader_status && !(status.is_available() && leader_status.is_available()) {
            warn!(
                "tracker {index} sees us as {status}, leader sees {leader_status}, \
                 scheduling status correction"
            );
            report.needs_status_correction = true;
        }
    }
}

/// The status the leader currently holds for us, if the leader and its view
/// are known. Status corrections push this value.
pub fn leader_self_status(state: &ClusterState) -> Option<StorageStatus> {
    state.reports[state.leader_index?].self_status
}

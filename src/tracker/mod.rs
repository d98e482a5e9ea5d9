//! Tracker-facing control plane: one long-lived session per configured
//! tracker, all driving the shared cluster state through the membership
//! reconciler, the leader tracker, the trunk role controller, and the sync
//! cursor negotiator.

pub mod leader;
pub mod rpc;
pub mod session;
pub mod state;
pub mod sync;
pub mod trunk;

pub use session::{Session, SessionContext};
pub use state::{ClusterState, ReportState, RpcOutcome, Shared, TrunkServerAddr};

use std::sync::Arc;
use std::thread::JoinHandle;

/// Spawns one session thread per configured tracker.
pub fn spawn_sessions(ctx: Arc<SessionContext>) -> Vec<JoinHandle<()>> {
    ctx.config
        .trackers
        .iter()
        .enumerate()
        .map(|(index, addr)| {
            let session = Session::new(index, addr.clone(), ctx.clone());
            std::thread::spawn(move || session.run())
        })
        .collect()
}

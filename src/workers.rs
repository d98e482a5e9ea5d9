//! Upward collaborator interfaces: the replication workers, the trunk
//! allocator subsystem, and the periodic task scheduler. The reconciliation
//! protocol drives these seams; their data paths live elsewhere.

use crate::error::Result;

use crossbeam::channel::{bounded, tick, Sender};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// A stable task id, so a scheduled job can be individually cancelled.
pub type TaskId = u32;

/// Periodic advance pre-creation of trunk files, scheduled while holding the
/// allocator role.
pub const TRUNK_PRECREATE_TASK: TaskId = 1;
/// Periodic trunk binlog compression, scheduled while holding the role.
pub const TRUNK_COMPRESS_TASK: TaskId = 2;

/// Replication workers toward peer storage nodes.
pub trait SyncWorkers: Send + Sync {
    /// Starts the binlog replication worker toward a newly learned peer.
    fn start_peer_sync(&self, peer_id: &str) -> Result<()>;
    /// Starts the trunk replication worker toward a peer. Only meaningful
    /// while this node holds the trunk-allocator role.
    fn start_peer_trunk_sync(&self, peer_id: &str) -> Result<()>;
    /// Stops all trunk workers still waiting to sync, on role handoff.
    fn stop_waiting_trunk_sync(&self) -> Result<()>;
}

/// The trunk allocation subsystem lifecycle. The periodic operations are
/// what the role holder schedules as background tasks.
pub trait TrunkAllocator: Send + Sync {
    fn init(&self) -> Result<()>;
    fn destroy(&self) -> Result<()>;
    /// Pre-creates trunk files ahead of demand.
    fn precreate(&self) -> Result<()>;
    /// Compresses the trunk binlog.
    fn compress(&self) -> Result<()>;
}

/// Schedules periodic background jobs keyed by stable task ids.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, id: TaskId, interval: Duration, job: Box<dyn Fn() + Send + Sync>);
    fn cancel(&self, id: TaskId);
}

/// Thread-per-task scheduler: each job runs on its own thread off a ticker,
/// and cancellation closes a channel the thread selects on.
#[derive(Default)]
pub struct ThreadScheduler {
    tasks: Mutex<HashMap<TaskId, Sender<()>>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, id: TaskId, interval: Duration, job: Box<dyn Fn() + Send + Sync>) {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let mut tasks = self.tasks.lock().expect("lock poisoned");
        // Re-scheduling an id replaces the old task; dropping its sender
        // stops the old thread.
        tasks.insert(id, cancel_tx);
        std::thread::spawn(move || {
            let ticker = tick(interval);
            loop {
                crossbeam::select! {
                    recv(ticker) -> _ => job(),
                    recv(cancel_rx) -> _ => {
                        debug!("scheduled task {id} cancelled");
                        return;
                    }
                }
            }
        });
    }

    fn cancel(&self, id: TaskId) {
        self.tasks.lock().expect("lock poisoned").remove(&id);
    }
}

/// Default worker implementation for deployments where replication runs out
/// of process: logs the lifecycle transitions and succeeds.
pub struct LoggingWorkers;

impl SyncWorkers for LoggingWorkers {
    fn start_peer_sync(&self, peer_id: &str) -> Result<()> {
        info!("starting replication worker for peer {peer_id}");
        Ok(())
    }

    fn start_peer_trunk_sync(&self, peer_id: &str) -> Result<()> {
        info!("starting trunk replication worker for peer {peer_id}");
        Ok(())
    }

    fn stop_waiting_trunk_sync(&self) -> Result<()> {
        info!("stopping waiting trunk replication workers");
        Ok(())
    }
}

impl TrunkAllocator for LoggingWorkers {
    fn init(&self) -> Result<()> {
        info!("initializing trunk allocator");
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        info!("destroying trunk allocator");
        Ok(())
    }

    fn precreate(&self) -> Result<()> {
        debug!("trunk precreate tick");
        Ok(())
    }

    fn compress(&self) -> Result<()> {
        debug!("trunk binlog compress tick");
        Ok(())
    }
}

#[cfg(test)]
pub mod fakes {
    //! Recording fakes shared by unit tests across the crate.

    use super::*;
    use std::sync::Arc;

    /// Records every worker and allocator call, in order.
    #[derive(Clone, Default)]
    pub struct RecordingWorkers {
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingWorkers {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl SyncWorkers for RecordingWorkers {
        fn start_peer_sync(&self, peer_id: &str) -> Result<()> {
            self.record(format!("sync:{peer_id}"));
            Ok(())
        }

        fn start_peer_trunk_sync(&self, peer_id: &str) -> Result<()> {
            self.record(format!("trunk-sync:{peer_id}"));
            Ok(())
        }

        fn stop_waiting_trunk_sync(&self) -> Result<()> {
            self.record("stop-trunk-sync".into());
            Ok(())
        }
    }

    impl TrunkAllocator for RecordingWorkers {
        fn init(&self) -> Result<()> {
            self.record("allocator-init".into());
            Ok(())
        }

        fn destroy(&self) -> Result<()> {
            self.record("allocator-destroy".into());
            Ok(())
        }

        fn precreate(&self) -> Result<()> {
            self.record("allocator-precreate".into());
            Ok(())
        }

        fn compress(&self) -> Result<()> {
            self.record("allocator-compress".into());
            Ok(())
        }
    }

    impl Scheduler for RecordingWorkers {
        fn schedule(&self, id: TaskId, _interval: Duration, _job: Box<dyn Fn() + Send + Sync>) {
            self.record(format!("schedule:{id}"));
        }

        fn cancel(&self, id: TaskId) {
            self.record(format!("cancel:{id}"));
        }
    }
}

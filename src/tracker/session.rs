//! One long-lived session per tracker.
//!
//! A session loops over connect, join, sync-cursor negotiation, and a
//! steady-state reporting phase (heartbeats, sync-timestamp and disk usage
//! reports, trunk reports while holding the allocator role). Any failure
//! drops the connection and restarts the cycle after a pause; a few
//! conditions (status correction sent, status regression observed) end the
//! steady phase deliberately so the cycle rejoins with fresh state.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::cursor::CursorStore;
use crate::error::{Error, Result};
use crate::membership::{reconcile, SelfIdentity, StorageStatus};
use crate::protocol::code;
use crate::protocol::message::{ChangeNotice, JoinRequest, StorageBrief};
use crate::transport::{Connection, Transport};
use crate::workers::{Scheduler, SyncWorkers, TrunkAllocator};

use super::rpc;
use super::state::{RpcOutcome, Shared};
use super::trunk::TrunkDeps;
use super::{leader, sync, trunk};

/// Version tag reported in the join request.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a session needs, shared across all sessions.
pub struct SessionContext {
    pub config: Config,
    pub shared: Arc<Shared>,
    pub transport: Arc<dyn Transport>,
    pub workers: Arc<dyn SyncWorkers>,
    pub allocator: Arc<dyn TrunkAllocator>,
    pub scheduler: Arc<dyn Scheduler>,
    pub cursor_store: Arc<dyn CursorStore>,
    /// First-ever registration time of this node, from its stat file.
    pub join_time: i64,
    /// This process start, reported as up_time.
    pub start_time: i64,
}

impl SessionContext {
    fn identity(&self) -> SelfIdentity {
        SelfIdentity {
            id: self.config.id.clone(),
            ip: self.config.ip.clone(),
            port: self.config.port,
        }
    }

    fn trunk_deps(&self) -> TrunkDeps {
        TrunkDeps {
            workers: self.workers.clone(),
            allocator: self.allocator.clone(),
            scheduler: self.scheduler.clone(),
            cursor_store: self.cursor_store.clone(),
        }
    }
}

/// Why the steady phase ended without a transport error.
#[derive(Debug, PartialEq, Eq)]
enum Cycle {
    /// Shutdown requested; sign off and stop.
    Shutdown,
    /// Reconnect and rejoin: a correction was pushed or a regression seen.
    Rejoin,
}

pub struct Session {
    index: usize,
    addr: String,
    ctx: Arc<SessionContext>,
}

impl Session {
    pub fn new(index: usize, addr: String, ctx: Arc<SessionContext>) -> Self {
        Self { index, addr, ctx }
    }

    /// The session thread body. Returns only on shutdown or when this node's
    /// observed client address conflicts across trackers.
    pub fn run(&self) {
        let mut last_connect_error: Option<Error> = None;
        while self.ctx.shared.running() {
            let mut conn = match self.ctx.transport.connect(&self.addr) {
                Ok(conn) => {
                    if last_connect_error.take().is_some() {
                        info!("reconnected to tracker {}", self.addr);
                    }
                    conn
                }
                Err(err) => {
                    // Log a repeating connect failure only once.
                    if last_connect_error.as_ref() != Some(&err) {
                        error!("connect to tracker {} failed: {err}", self.addr);
                        last_connect_error = Some(err);
                    }
                    self.pause(Duration::from_secs(self.ctx.config.heartbeat_interval));
                    continue;
                }
            };
            debug!("connected to tracker {}", self.addr);

            match conn.local_ip() {
                Ok(ip) => {
                    if !self.pin_client_ip(&ip) {
                        return;
                    }
                }
                Err(err) => warn!("could not read local address: {err}"),
            }

            match self.cycle(conn.as_mut()) {
                Ok(Cycle::Shutdown) => {
                    let _ = rpc::quit(conn.as_mut());
                    return;
                }
                Ok(Cycle::Rejoin) => info!("rejoining tracker {}", self.addr),
                Err(err) => {
                    if !self.ctx.shared.running() {
                        let _ = rpc::quit(conn.as_mut());
                        return;
                    }
                    warn!("session with tracker {} failed: {err}", self.addr);
                }
            }
            drop(conn);
            self.pause(Duration::from_secs(1));
        }
    }

    /// One connected cycle: join, negotiate the sync cursor, then report
    /// until an error or a deliberate end.
    fn cycle(&self, conn: &mut dyn Connection) -> Result<Cycle> {
        self.join(conn)?;
        if !self.ctx.shared.lock().cursor.old_data_sync_done {
            sync::bootstrap(conn, &self.ctx.shared, self.ctx.cursor_store.as_ref())?;
        }
        sync::notify(conn, &self.ctx.shared, self.ctx.cursor_store.as_ref(), self.index)?;
        self.steady(conn)
    }

    /// Records this node's address as one tracker saw it. All trackers must
    /// see the same address; a conflict means the node is multihomed in a
    /// way the cluster cannot represent, and the session gives up.
    fn pin_client_ip(&self, ip: &str) -> bool {
        let mut state = self.ctx.shared.lock();
        match &state.client_ip {
            None => {
                state.client_ip = Some(ip.to_string());
                true
            }
            Some(pinned) if pinned == ip => true,
            Some(pinned) => {
                error!(
                    "tracker {} sees us as {ip} but another tracker saw {pinned}, \
                     giving up on this tracker",
                    self.addr
                );
                false
            }
        }
    }

    /// Builds and sends the join request, caching the returned status. When
    /// the reply carries no source id but a source is locally known, the
    /// tracker just (re)started and is told our cursor right away.
    fn join(&self, conn: &mut dyn Connection) -> Result<()> {
        let request = self.build_join_request();
        let result = rpc::join(conn, &request);
        let reply = {
            let mut state = self.ctx.shared.lock();
            state.reports[self.index].last_join = match &result {
                Ok(_) => RpcOutcome::Ok,
                Err(err) => RpcOutcome::Failed(err.remote_code().unwrap_or(0)),
            };
            let reply = result?;
            state.reports[self.index].self_status = Some(reply.status);
            state.reports[self.index].need_rejoin = false;
            leader::divergence_check(&mut state);
            reply
        };
        debug!("joined tracker {}, status {}", self.addr, reply.status);

        let known_source = !self.ctx.shared.lock().cursor.source_id.is_empty();
        if reply.source_id.is_empty() && known_source {
            sync::notify(conn, &self.ctx.shared, self.ctx.cursor_store.as_ref(), self.index)?;
        }
        Ok(())
    }

    /// The believed own status sent in a join: our table record if any, else
    /// the tracker's last cached answer. The table must win so that a rejoin
    /// forced by a tracker regressing our status resends what we still
    /// believe rather than echoing the regression. With neither, a
    /// single-tracker cluster is fresh and reports Init; with multiple
    /// trackers the status is unknown until every tracker has answered a
    /// join refusing to recognize us.
    fn build_join_request(&self) -> JoinRequest {
        let config = &self.ctx.config;
        let state = self.ctx.shared.lock();
        let status = state
            .table
            .get(&config.id)
            .map(|r| r.status)
            .or(state.reports[self.index].self_status)
            .or_else(|| {
                let fresh = config.trackers.len() == 1
                    || state
                        .reports
                        .iter()
                        .all(|r| r.last_join == RpcOutcome::Failed(code::UNKNOWN_STORAGE));
                fresh.then_some(StorageStatus::Init)
            });
        JoinRequest {
            group_name: config.group_name.clone(),
            port: config.port,
            http_port: config.http_port,
            store_path_count: config.store_path_count,
            subdir_count_per_path: config.subdir_count_per_path,
            upload_priority: config.upload_priority,
            join_time: self.ctx.join_time,
            up_time: self.ctx.start_time,
            version: VERSION.into(),
            domain_name: String::new(),
            init_flag: !state.cursor.old_data_sync_done,
            status,
            tracker_ip: state.client_ip.clone().unwrap_or_default(),
            trackers: config.trackers.clone(),
        }
    }

    /// Steady-state reporting until an error, a shutdown, or a deliberate
    /// rejoin.
    fn steady(&self, conn: &mut dyn Connection) -> Result<Cycle> {
        let heartbeat_interval = Duration::from_secs(self.ctx.config.heartbeat_interval);
        let stat_interval = Duration::from_secs(self.ctx.config.stat_report_interval);
        // None means never sent: the first heartbeat and disk report go out
        // immediately after joining.
        let mut last_beat: Option<Instant> = None;
        let mut last_disk_report: Option<Instant> = None;
        let mut last_sync_report = Instant::now();
        let mut sent_stats_version = 0u64;
        let mut sent_sync_version = 0u64;
        let mut sent_trunk_file_id = 0u32;
        let mut sent_trunk_free = i64::MIN;

        while self.ctx.shared.running() {
            if last_beat.map_or(true, |t| t.elapsed() >= heartbeat_interval) {
                self.beat(conn, &mut sent_stats_version)?;
                last_beat = Some(Instant::now());
                if self.ctx.shared.lock().leader_index.is_none() {
                    leader::discover(
                        &self.ctx.shared,
                        &self.ctx.config,
                        self.ctx.transport.as_ref(),
                        self.index,
                    );
                }
            }

            let sync_version = self.ctx.shared.lock().sync_version;
            if sync_version != sent_sync_version && last_sync_report.elapsed() >= heartbeat_interval
            {
                self.report_sync_timestamps(conn)?;
                sent_sync_version = sync_version;
                last_sync_report = Instant::now();
            }

            if last_disk_report.map_or(true, |t| t.elapsed() >= stat_interval) {
                let paths = self.ctx.shared.lock().disk_usage.clone();
                let notice = rpc::disk_usage(conn, &paths)?;
                self.apply_change(conn, notice)?;
                last_disk_report = Some(Instant::now());
            }

            self.report_trunk(conn, &mut sent_trunk_file_id, &mut sent_trunk_free)?;

            if let Some(target) = self.take_status_correction() {
                let brief = StorageBrief {
                    status: target,
                    port: self.ctx.config.port,
                    id: self.ctx.config.id.clone(),
                    ip: self.ctx.config.ip.clone(),
                };
                rpc::report_status(conn, &self.ctx.config.group_name, &brief)?;
                info!("pushed status correction {target} to tracker {}, rejoining", self.addr);
                return Ok(Cycle::Rejoin);
            }
            if self.take_need_rejoin() {
                info!("tracker {} regressed our status, rejoining", self.addr);
                return Ok(Cycle::Rejoin);
            }

            self.pause(Duration::from_secs(1));
        }
        Ok(Cycle::Shutdown)
    }

    /// One heartbeat, attaching a stats snapshot only when counters moved.
    fn beat(&self, conn: &mut dyn Connection, sent_stats_version: &mut u64) -> Result<()> {
        let (stats, version) = {
            let state = self.ctx.shared.lock();
            let stats =
                (state.stats_version != *sent_stats_version).then(|| state.stats.clone());
            (stats, state.stats_version)
        };
        let notice = rpc::heartbeat(conn, stats.as_ref())?;
        *sent_stats_version = version;
        self.apply_change(conn, notice)
    }

    fn report_sync_timestamps(&self, conn: &mut dyn Connection) -> Result<()> {
        let entries: Vec<(String, i64)> = {
            let state = self.ctx.shared.lock();
            state.table.iter().map(|r| (r.id.clone(), r.last_sync_timestamp)).collect()
        };
        let notice = rpc::sync_report(conn, &entries)?;
        self.apply_change(conn, notice)
    }

    /// Trunk file id and free-space reports, sent only while holding the
    /// allocator role and only when the values moved.
    fn report_trunk(
        &self,
        conn: &mut dyn Connection,
        sent_file_id: &mut u32,
        sent_free: &mut i64,
    ) -> Result<()> {
        let (is_allocator, file_id, free) = {
            let state = self.ctx.shared.lock();
            (state.trunk.is_allocator, state.trunk.trunk_file_id, state.trunk.trunk_free_space_mb)
        };
        if !is_allocator {
            return Ok(());
        }
        // A tracker that already holds the value answers with a duplicate
        // code; that still counts as delivered.
        if file_id > *sent_file_id {
            match rpc::report_trunk_file_id(conn, file_id) {
                Ok(()) => {}
                Err(err) if err.is_already_done() => {}
                Err(err) => return Err(err),
            }
            *sent_file_id = file_id;
        }
        if free != *sent_free {
            match rpc::report_trunk_free(conn, free) {
                Ok(()) => {}
                Err(err) if err.is_already_done() => {}
                Err(err) => return Err(err),
            }
            *sent_free = free;
        }
        Ok(())
    }

    /// Applies a change notification: leader and trunk announcements, then
    /// the membership snapshot through the reconciler. Any resulting diff is
    /// pushed straight back.
    fn apply_change(&self, conn: &mut dyn Connection, notice: ChangeNotice) -> Result<()> {
        if let Some(change) = &notice.leader_change {
            leader::on_leader_notice(
                &self.ctx.shared,
                &self.ctx.config,
                self.ctx.transport.as_ref(),
                change,
            );
        }
        if let Some(change) = &notice.trunk_change {
            trunk::apply_trunk_change(
                conn,
                &self.ctx.shared,
                &self.ctx.config,
                &self.ctx.trunk_deps(),
                change,
            )?;
        }
        let Some(briefs) = notice.briefs else { return Ok(()) };

        let me = self.ctx.identity();
        let (outcome, trunk_role) = {
            let mut state = self.ctx.shared.lock();
            let outcome =
                reconcile(&mut state.table, &briefs, &me, self.ctx.config.use_storage_id);
            if let Some(status) = outcome.self_status {
                state.reports[self.index].self_status = Some(status);
                leader::divergence_check(&mut state);
            }
            if outcome.need_rejoin {
                state.reports[self.index].need_rejoin = true;
            }
            (outcome, state.trunk.is_allocator)
        };

        for peer in &outcome.new_peers {
            if let Err(err) = self.ctx.workers.start_peer_sync(peer) {
                warn!("replication worker for new peer {peer} failed to start: {err}");
            }
            if trunk_role {
                if let Err(err) = self.ctx.workers.start_peer_trunk_sync(peer) {
                    warn!("trunk replication worker for new peer {peer} failed to start: {err}");
                }
            }
        }
        if !outcome.diff.is_empty() {
            rpc::replica_change(conn, &outcome.diff)?;
        }
        Ok(())
    }

    /// Takes the pending correction for this tracker, resolving the target
    /// status from the leader's cached view. Without a leader view the flag
    /// is left set for a later pass.
    fn take_status_correction(&self) -> Option<StorageStatus> {
        let mut state = self.ctx.shared.lock();
        if !state.reports[self.index].needs_status_correction {
            return None;
        }
        let target = leader::leader_self_status(&state)?;
        state.reports[self.index].needs_status_correction = false;
        Some(target)
    }

    fn take_need_rejoin(&self) -> bool {
        let mut state = self.ctx.shared.lock();
        std::mem::take(&mut state.reports[self.index].need_rejoin)
    }

    /// Sleeps in short slices so shutdown stays responsive.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.ctx.shared.running() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            std::thread::sleep(remaining.min(Duration::from_millis(100)));
        }
    }
}

/// Current UNIX time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{FileCursorStore, SyncCursor};
    use crate::membership::StorageRecord;
    use crate::protocol::codec::Header;
    use crate::protocol::message::{JoinReply, LeaderChange, SyncAssignment, TrunkChange};
    use crate::protocol::{code, Command};
    use crate::transport::fakes::{ScriptedConnection, ScriptedTransport};
    use crate::workers::fakes::RecordingWorkers;

    struct Fixture {
        ctx: Arc<SessionContext>,
        workers: RecordingWorkers,
        transport: Arc<ScriptedTransport>,
        _dir: tempfile::TempDir,
    }

    fn fixture(trackers: Vec<String>, cursor: SyncCursor) -> Fixture {
        let workers = RecordingWorkers::new();
        let transport = Arc::new(ScriptedTransport::default());
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_tests(trackers);
        let ctx = Arc::new(SessionContext {
            shared: Arc::new(Shared::new(config.trackers.len(), cursor)),
            config,
            transport: transport.clone(),
            workers: Arc::new(workers.clone()),
            allocator: Arc::new(workers.clone()),
            scheduler: Arc::new(workers.clone()),
            cursor_store: Arc::new(FileCursorStore::new(dir.path().join("cursor"))),
            join_time: 1_700_000_000,
            start_time: 1_700_100_000,
        });
        Fixture { ctx, workers, transport, _dir: dir }
    }

    fn session(fixture: &Fixture) -> Session {
        Session::new(0, fixture.ctx.config.trackers[0].clone(), fixture.ctx.clone())
    }

    fn reply_frame(status: u8, body: &[u8]) -> Vec<u8> {
        let mut header = Header::request(Command::Response, body.len());
        header.status = status;
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    fn brief(id: &str, ip: &str, status: StorageStatus) -> StorageBrief {
        StorageBrief { status, port: 23000, id: id.into(), ip: ip.into() }
    }

    #[test]
    fn first_join_reports_init() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        let request = session(&fixture).build_join_request();
        assert_eq!(request.status, Some(StorageStatus::Init));
        assert!(request.init_flag);
    }

    #[test]
    fn join_status_uses_cached_answer_without_table_record() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        fixture.ctx.shared.lock().reports[0].self_status = Some(StorageStatus::Active);
        let request = session(&fixture).build_join_request();
        assert_eq!(request.status, Some(StorageStatus::Active));
    }

    #[test]
    fn join_status_prefers_table_record_over_cached_answer() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        {
            let mut state = fixture.ctx.shared.lock();
            state.table.insert(StorageRecord::new(
                "s1".into(),
                "10.0.0.1".into(),
                23000,
                StorageStatus::Offline,
            ));
            state.reports[0].self_status = Some(StorageStatus::Active);
        }
        let request = session(&fixture).build_join_request();
        assert_eq!(request.status, Some(StorageStatus::Offline));
    }

    #[test]
    fn rejoin_after_regression_resends_believed_status() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        {
            let mut state = fixture.ctx.shared.lock();
            state.table.insert(StorageRecord::new(
                "s1".into(),
                "10.0.0.1".into(),
                23000,
                StorageStatus::Active,
            ));
            state.reports[0].self_status = Some(StorageStatus::Active);
        }
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(0, &[]));
        // The tracker regresses us to WaitSync; the forced rejoin must carry
        // the still-believed Active, not echo the regression back.
        let notice = ChangeNotice {
            leader_change: None,
            trunk_change: None,
            briefs: Some(vec![brief("s1", "10.0.0.1", StorageStatus::WaitSync)]),
        };
        session(&fixture).apply_change(&mut conn, notice).unwrap();
        assert!(fixture.ctx.shared.lock().reports[0].need_rejoin);
        let request = session(&fixture).build_join_request();
        assert_eq!(request.status, Some(StorageStatus::Active));
    }

    #[test]
    fn join_status_unknown_with_multiple_trackers() {
        let fixture =
            fixture(vec!["10.0.1.1:22122".into(), "10.0.1.2:22122".into()], SyncCursor::default());
        // Fresh start with two trackers: unknown until every tracker has
        // refused to recognize us.
        let request = session(&fixture).build_join_request();
        assert_eq!(request.status, None);

        {
            let mut state = fixture.ctx.shared.lock();
            state.reports[0].last_join = RpcOutcome::Failed(code::UNKNOWN_STORAGE);
            state.reports[1].last_join = RpcOutcome::Failed(code::NOT_FOUND);
        }
        // Not-found is some other lookup failing, not proof of a fresh node.
        let request = session(&fixture).build_join_request();
        assert_eq!(request.status, None);

        fixture.ctx.shared.lock().reports[1].last_join =
            RpcOutcome::Failed(code::UNKNOWN_STORAGE);
        let request = session(&fixture).build_join_request();
        assert_eq!(request.status, Some(StorageStatus::Init));
    }

    #[test]
    fn join_caches_reply_status() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        let mut conn = ScriptedConnection::new("10.0.0.1");
        let reply = JoinReply { status: StorageStatus::WaitSync, source_id: "s2".into() };
        conn.reply(&reply_frame(0, &reply.encode().unwrap()));

        session(&fixture).join(&mut conn).unwrap();
        let state = fixture.ctx.shared.lock();
        assert_eq!(state.reports[0].self_status, Some(StorageStatus::WaitSync));
        assert_eq!(state.reports[0].last_join, RpcOutcome::Ok);
    }

    #[test]
    fn join_notifies_cursor_to_restarted_tracker() {
        let cursor = SyncCursor {
            source_id: "s2".into(),
            until_timestamp: 9,
            old_data_sync_done: true,
            ..SyncCursor::default()
        };
        let fixture = fixture(vec!["10.0.1.1:22122".into()], cursor);
        let mut conn = ScriptedConnection::new("10.0.0.1");
        // Join reply carries no source id even though we have one: the
        // tracker restarted and must be told.
        let reply = JoinReply { status: StorageStatus::Active, source_id: String::new() };
        conn.reply(&reply_frame(0, &reply.encode().unwrap()));
        conn.reply(&reply_frame(0, &[]));

        session(&fixture).join(&mut conn).unwrap();
        let frames = conn.sent_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1][8], Command::SyncNotify as u8);
        let sent = SyncAssignment::decode(&frames[1][crate::protocol::HEADER_SIZE..]).unwrap();
        assert_eq!(sent.source_id, "s2");
    }

    #[test]
    fn join_failure_records_remote_code() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(code::BUSY, &[]));
        assert!(session(&fixture).join(&mut conn).is_err());
        assert_eq!(
            fixture.ctx.shared.lock().reports[0].last_join,
            RpcOutcome::Failed(code::BUSY)
        );
    }

    #[test]
    fn apply_change_reconciles_and_starts_workers() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        let mut conn = ScriptedConnection::new("10.0.0.1");
        let notice = ChangeNotice {
            leader_change: None,
            trunk_change: None,
            briefs: Some(vec![
                brief("s1", "10.0.0.1", StorageStatus::Active),
                brief("s2", "10.0.0.2", StorageStatus::Online),
            ]),
        };
        session(&fixture).apply_change(&mut conn, notice).unwrap();

        let state = fixture.ctx.shared.lock();
        assert_eq!(state.table.len(), 2);
        assert_eq!(state.reports[0].self_status, Some(StorageStatus::Active));
        drop(state);
        // Own record is not a new peer.
        assert_eq!(fixture.workers.calls(), vec!["sync:s2"]);
        assert!(conn.sent_frames().is_empty());
    }

    #[test]
    fn apply_change_pushes_diff_back() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        fixture.ctx.shared.lock().table.insert(StorageRecord::new(
            "s2".into(),
            "10.0.0.2".into(),
            23000,
            StorageStatus::Syncing,
        ));
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(0, &[]));
        // Tracker reports s2 offline while we hold it mid-sync: keep ours
        // and push the correction.
        let notice = ChangeNotice {
            leader_change: None,
            trunk_change: None,
            briefs: Some(vec![brief("s2", "10.0.0.2", StorageStatus::Offline)]),
        };
        session(&fixture).apply_change(&mut conn, notice).unwrap();
        let frames = conn.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][8], Command::ReplicaChange as u8);
        assert_eq!(
            fixture.ctx.shared.lock().table.get("s2").unwrap().status,
            StorageStatus::Syncing
        );
    }

    #[test]
    fn trunk_reports_treat_duplicate_acks_as_sent() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        {
            let mut state = fixture.ctx.shared.lock();
            state.trunk.is_allocator = true;
            state.trunk.trunk_file_id = 5;
            state.trunk.trunk_free_space_mb = 100;
        }
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(code::ALREADY_EXISTS, &[]));
        conn.reply(&reply_frame(code::IN_PROGRESS, &[]));

        let mut sent_file_id = 0u32;
        let mut sent_free = i64::MIN;
        session(&fixture).report_trunk(&mut conn, &mut sent_file_id, &mut sent_free).unwrap();
        assert_eq!(sent_file_id, 5);
        assert_eq!(sent_free, 100);

        // Nothing moved, so a second pass sends nothing.
        session(&fixture).report_trunk(&mut conn, &mut sent_file_id, &mut sent_free).unwrap();
        assert_eq!(conn.sent_frames().len(), 2);
    }

    #[test]
    fn apply_change_handles_leader_and_trunk_prefixes() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(0, &1u32.to_be_bytes()));
        let notice = ChangeNotice {
            leader_change: Some(LeaderChange { ip: "10.0.1.1".into(), port: 22122 }),
            trunk_change: Some(TrunkChange { id: "s1".into(), ip: "10.0.0.1".into(), port: 23000 }),
            briefs: None,
        };
        session(&fixture).apply_change(&mut conn, notice).unwrap();
        let state = fixture.ctx.shared.lock();
        assert_eq!(state.leader_index, Some(0));
        assert!(state.trunk.is_allocator);
    }

    #[test]
    fn regression_notice_sets_rejoin_flag() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        {
            let mut state = fixture.ctx.shared.lock();
            state.table.insert(StorageRecord::new(
                "s1".into(),
                "10.0.0.1".into(),
                23000,
                StorageStatus::Active,
            ));
            state.reports[0].self_status = Some(StorageStatus::Active);
        }
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(0, &[]));
        let notice = ChangeNotice {
            leader_change: None,
            trunk_change: None,
            briefs: Some(vec![brief("s1", "10.0.0.1", StorageStatus::WaitSync)]),
        };
        session(&fixture).apply_change(&mut conn, notice).unwrap();
        assert!(fixture.ctx.shared.lock().reports[0].need_rejoin);
    }

    #[test]
    fn status_correction_resolves_leader_view_and_clears_flag() {
        let fixture =
            fixture(vec!["10.0.1.1:22122".into(), "10.0.1.2:22122".into()], SyncCursor::default());
        {
            let mut state = fixture.ctx.shared.lock();
            state.leader_index = Some(1);
            state.reports[1].self_status = Some(StorageStatus::Active);
            state.reports[0].needs_status_correction = true;
        }
        let session = session(&fixture);
        assert_eq!(session.take_status_correction(), Some(StorageStatus::Active));
        assert!(!fixture.ctx.shared.lock().reports[0].needs_status_correction);
        assert_eq!(session.take_status_correction(), None);
    }

    #[test]
    fn status_correction_waits_for_leader_view() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        fixture.ctx.shared.lock().reports[0].needs_status_correction = true;
        let session = session(&fixture);
        assert_eq!(session.take_status_correction(), None);
        // Flag stays set until the leader's view is known.
        assert!(fixture.ctx.shared.lock().reports[0].needs_status_correction);
    }

    #[test]
    fn pinning_conflicting_client_ip_fails() {
        let fixture = fixture(vec!["10.0.1.1:22122".into()], SyncCursor::default());
        let session = session(&fixture);
        assert!(session.pin_client_ip("10.0.0.1"));
        assert!(session.pin_client_ip("10.0.0.1"));
        assert!(!session.pin_client_ip("10.0.0.99"));
    }

    #[test]
    fn run_quits_when_shut_down_mid_cycle() {
        let cursor = SyncCursor { old_data_sync_done: true, ..SyncCursor::default() };
        let fixture = fixture(vec!["10.0.1.1:22122".into()], cursor);
        // Leader already known, so the steady loop does not open a probe
        // connection of its own.
        fixture.ctx.shared.lock().leader_index = Some(0);
        // Script a full successful first cycle: join reply, then one
        // heartbeat reply.
        let mut stream = Vec::new();
        let reply = JoinReply { status: StorageStatus::Active, source_id: String::new() };
        stream.extend(reply_frame(0, &reply.encode().unwrap()));
        stream.extend(reply_frame(0, &[]));
        // Disk usage report.
        stream.extend(reply_frame(0, &[]));
        fixture.transport.on_connect("10.0.1.1:22122", stream);

        let session = session(&fixture);
        let shared = fixture.ctx.shared.clone();
        let handle = std::thread::spawn(move || session.run());
        std::thread::sleep(Duration::from_millis(300));
        shared.shutdown();
        handle.join().unwrap();
        assert_eq!(fixture.transport.connected(), vec!["10.0.1.1:22122".to_string()]);
    }
}

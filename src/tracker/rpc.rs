//! Request/response calls against a tracker connection.
//!
//! Every call writes one header+body frame, reads the reply header, maps a
//! non-zero status byte to Error::Remote, and length-validates the reply
//! body. A handful of calls (the split-brain probe and the reselect-leader
//! notice) open their own short-lived connections instead of reusing the
//! session's.

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::codec::{put_str, put_u32, Header, Reader};
use crate::protocol::message::{
    encode_disk_usage, encode_report_status, encode_sync_report, ChangeNotice, DiskUsage,
    JoinReply, JoinRequest, StorageBrief, SyncAssignment, TrackerRunningStatus, UsageStats,
};
use crate::protocol::{Command, GROUP_NAME_SIZE, HEADER_SIZE, ID_SIZE};
use crate::transport::{Connection, Transport};

/// Sends one request frame: header followed by the body, as a single write.
fn send(conn: &mut dyn Connection, command: Command, body: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&Header::request(command, body.len()).encode());
    frame.extend_from_slice(body);
    conn.send(&frame)
}

/// Reads one reply frame. A non-zero status byte is a remote error; its
/// body, if any, is drained before failing so the connection stays usable.
fn recv(conn: &mut dyn Connection) -> Result<Vec<u8>> {
    let header = Header::decode(&conn.recv(HEADER_SIZE)?)?;
    let body = conn.recv(header.body_len as usize)?;
    if header.status != 0 {
        return Err(Error::Remote(header.status));
    }
    Ok(body)
}

fn call(conn: &mut dyn Connection, command: Command, body: &[u8]) -> Result<Vec<u8>> {
    send(conn, command, body)?;
    recv(conn)
}

/// A call whose reply body must be empty.
fn call_ack(conn: &mut dyn Connection, command: Command, body: &[u8]) -> Result<()> {
    let reply = call(conn, command, body)?;
    if !reply.is_empty() {
        return crate::errdata!("unexpected {}-byte body in {command:?} ack", reply.len());
    }
    Ok(())
}

/// A call whose reply is either empty (no assignment) or one sync
/// assignment.
fn call_assignment(
    conn: &mut dyn Connection,
    command: Command,
    body: &[u8],
) -> Result<Option<SyncAssignment>> {
    let reply = call(conn, command, body)?;
    if reply.is_empty() {
        return Ok(None);
    }
    Ok(Some(SyncAssignment::decode(&reply)?))
}

pub fn join(conn: &mut dyn Connection, request: &JoinRequest) -> Result<JoinReply> {
    let reply = call(conn, Command::Join, &request.encode()?)?;
    JoinReply::decode(&reply)
}

/// Heartbeat, attaching a stats snapshot only when one is given. The reply
/// body is a (possibly empty) change notification.
pub fn heartbeat(conn: &mut dyn Connection, stats: Option<&UsageStats>) -> Result<ChangeNotice> {
    let body = stats.map(|s| s.encode()).unwrap_or_default();
    ChangeNotice::decode(&call(conn, Command::Beat, &body)?)
}

pub fn sync_report(conn: &mut dyn Connection, entries: &[(String, i64)]) -> Result<ChangeNotice> {
    let body = encode_sync_report(entries)?;
    ChangeNotice::decode(&call(conn, Command::SyncReport, &body)?)
}

pub fn disk_usage(conn: &mut dyn Connection, paths: &[DiskUsage]) -> Result<ChangeNotice> {
    ChangeNotice::decode(&call(conn, Command::DiskUsage, &encode_disk_usage(paths))?)
}

/// Pushes a membership diff back to a lagging tracker.
pub fn replica_change(conn: &mut dyn Connection, diff: &[StorageBrief]) -> Result<()> {
    debug!("pushing membership diff of {} records", diff.len());
    call_ack(conn, Command::ReplicaChange, &crate::protocol::message::encode_briefs(diff)?)
}

/// One-shot status correction for a single peer record.
pub fn report_status(conn: &mut dyn Connection, group_name: &str, brief: &StorageBrief) -> Result<()> {
    call_ack(conn, Command::ReportStatus, &encode_report_status(group_name, brief)?)
}

/// Asks the tracker which peer a given destination should replicate from.
pub fn sync_src_request(
    conn: &mut dyn Connection,
    group_name: &str,
    dest_id: &str,
) -> Result<Option<SyncAssignment>> {
    let mut body = Vec::with_capacity(GROUP_NAME_SIZE + 1 + ID_SIZE);
    put_str(&mut body, group_name, GROUP_NAME_SIZE + 1)?;
    put_str(&mut body, dest_id, ID_SIZE)?;
    call_assignment(conn, Command::SyncSrcRequest, &body)
}

/// Asks the tracker for this node's own sync source assignment.
pub fn sync_dest_request(conn: &mut dyn Connection) -> Result<Option<SyncAssignment>> {
    call_assignment(conn, Command::SyncDestRequest, &[])
}

/// Re-queries the assignment after the previous source was deleted.
pub fn sync_dest_query(conn: &mut dyn Connection) -> Result<Option<SyncAssignment>> {
    call_assignment(conn, Command::SyncDestQuery, &[])
}

/// Pushes this node's current sync cursor to the tracker.
pub fn sync_notify(conn: &mut dyn Connection, assignment: &SyncAssignment) -> Result<()> {
    call_ack(conn, Command::SyncNotify, &assignment.encode()?)
}

pub fn report_trunk_file_id(conn: &mut dyn Connection, file_id: u32) -> Result<()> {
    let mut body = Vec::with_capacity(4);
    put_u32(&mut body, file_id);
    call_ack(conn, Command::ReportTrunkFileId, &body)
}

pub fn fetch_trunk_file_id(conn: &mut dyn Connection) -> Result<u32> {
    let reply = call(conn, Command::FetchTrunkFileId, &[])?;
    crate::protocol::codec::expect_len(reply.len(), 4)?;
    Reader::new(&reply).u32()
}

pub fn report_trunk_free(conn: &mut dyn Connection, free_mb: i64) -> Result<()> {
    let mut body = Vec::with_capacity(8);
    crate::protocol::codec::put_i64(&mut body, free_mb);
    call_ack(conn, Command::ReportTrunkFree, &body)
}

/// Signs off before closing the connection. Fire-and-forget: no reply is
/// read.
pub fn quit(conn: &mut dyn Connection) -> Result<()> {
    send(conn, Command::Quit, &[])
}

/// Probes a tracker's running status over a fresh connection.
pub fn tracker_running_status(
    transport: &dyn Transport,
    addr: &str,
) -> Result<TrackerRunningStatus> {
    let mut conn = transport.connect(addr)?;
    let reply = call(conn.as_mut(), Command::TrackerStatus, &[])?;
    TrackerRunningStatus::decode(&reply)
}

/// Tells a tracker to re-run leader election, over a fresh connection.
pub fn notify_reselect_leader(transport: &dyn Transport, addr: &str) -> Result<()> {
    let mut conn = transport.connect(addr)?;
    call_ack(conn.as_mut(), Command::ReselectLeader, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::StorageStatus;
    use crate::transport::fakes::ScriptedConnection;

    /// Builds a reply frame with the given status and body.
    fn reply_frame(status: u8, body: &[u8]) -> Vec<u8> {
        let mut header = Header::request(Command::Response, body.len());
        header.status = status;
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn heartbeat_without_stats_sends_empty_body() {
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(0, &[]));
        let notice = heartbeat(&mut conn, None).unwrap();
        assert_eq!(notice, ChangeNotice::default());

        let frames = conn.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), HEADER_SIZE);
        assert_eq!(frames[0][8], Command::Beat as u8);
    }

    #[test]
    fn heartbeat_with_stats_attaches_snapshot() {
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(0, &[]));
        let stats = UsageStats { total_upload_count: 7, ..UsageStats::default() };
        heartbeat(&mut conn, Some(&stats)).unwrap();
        let frames = conn.sent_frames();
        assert_eq!(frames[0].len(), HEADER_SIZE + crate::protocol::message::STATS_SIZE);
    }

    #[test]
    fn nonzero_status_maps_to_remote_error() {
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(crate::protocol::code::NOT_FOUND, &[]));
        let err = sync_dest_request(&mut conn).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn join_roundtrip() {
        let mut conn = ScriptedConnection::new("10.0.0.1");
        let reply = JoinReply { status: StorageStatus::WaitSync, source_id: "s2".into() };
        conn.reply(&reply_frame(0, &reply.encode().unwrap()));

        let request = JoinRequest {
            group_name: "group1".into(),
            port: 23000,
            http_port: 0,
            store_path_count: 1,
            subdir_count_per_path: 256,
            upload_priority: 10,
            join_time: 100,
            up_time: 200,
            version: "0.1.0".into(),
            domain_name: String::new(),
            init_flag: true,
            status: None,
            tracker_ip: "10.0.1.1".into(),
            trackers: vec!["10.0.1.1:22122".into()],
        };
        assert_eq!(join(&mut conn, &request).unwrap(), reply);
        assert_eq!(conn.sent_frames()[0][8], Command::Join as u8);
    }

    #[test]
    fn sync_dest_request_empty_reply_is_none() {
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(0, &[]));
        assert_eq!(sync_dest_request(&mut conn).unwrap(), None);
    }

    #[test]
    fn sync_dest_request_decodes_assignment() {
        let mut conn = ScriptedConnection::new("10.0.0.1");
        let assignment = SyncAssignment { source_id: "s5".into(), until_timestamp: 1_700_000_000 };
        conn.reply(&reply_frame(0, &assignment.encode().unwrap()));
        assert_eq!(sync_dest_request(&mut conn).unwrap(), Some(assignment));
    }

    #[test]
    fn ack_with_body_is_invalid() {
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(0, &[1, 2, 3]));
        assert!(sync_notify(&mut conn, &SyncAssignment::default()).is_err());
    }

    #[test]
    fn fetch_trunk_file_id_decodes_u32() {
        let mut conn = ScriptedConnection::new("10.0.0.1");
        conn.reply(&reply_frame(0, &42u32.to_be_bytes()));
        assert_eq!(fetch_trunk_file_id(&mut conn).unwrap(), 42);
    }

    #[test]
    fn quit_sends_without_reading_reply() {
        let mut conn = ScriptedConnection::new("10.0.0.1");
        quit(&mut conn).unwrap();
        assert_eq!(conn.sent_frames()[0][8], Command::Quit as u8);
    }
}

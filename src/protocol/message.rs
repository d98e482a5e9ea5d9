//! Typed message bodies.
//!
//! The combined "change notification" a tracker can attach to any report
//! response is decoded here into an explicit tagged union (leader change,
//! trunk change, membership briefs) before any other component sees it, so
//! the bitmask-prefixed variant records of the wire format never leak past
//! this module.

use crate::errdata;
use crate::error::Result;
use crate::membership::StorageStatus;

use super::codec::{put_i64, put_str, put_u32, Reader};
use super::{
    CHANGE_FLAG_LEADER, CHANGE_FLAG_MEMBERS, CHANGE_FLAG_TRUNK, DOMAIN_NAME_SIZE, GROUP_NAME_SIZE,
    ID_SIZE, IPV4_ADDR_SIZE, IPV6_ADDR_SIZE, IP_PORT_SIZE, VERSION_SIZE,
};

/// Brief record size with an IPv4-sized address field.
pub const BRIEF_V4_SIZE: usize = 1 + 4 + ID_SIZE + IPV4_ADDR_SIZE;
/// Brief record size with an IPv6-sized address field.
pub const BRIEF_V6_SIZE: usize = 1 + 4 + ID_SIZE + IPV6_ADDR_SIZE;
/// Join reply body size.
pub const JOIN_REPLY_SIZE: usize = 1 + ID_SIZE;
/// Sync request/notify body size.
pub const SYNC_REQ_SIZE: usize = ID_SIZE + 8;
/// Tracker running-status reply body size.
pub const TRACKER_STATUS_SIZE: usize = 1 + 8 + 8;
/// Fixed part of the join request body, before the tracker address list.
pub const JOIN_FIXED_SIZE: usize =
    GROUP_NAME_SIZE + 1 + 7 * 8 + VERSION_SIZE + DOMAIN_NAME_SIZE + 1 + 1 + IPV4_ADDR_SIZE + 8;
/// One sync-report entry: storage id plus a 32-bit timestamp.
pub const SYNC_REPORT_ENTRY_SIZE: usize = ID_SIZE + 4;
/// One disk usage entry: total and free megabytes.
pub const DISK_USAGE_ENTRY_SIZE: usize = 16;
/// Usage statistics snapshot size.
pub const STATS_SIZE: usize = 2 * 4 + 12 * 8;

/// A membership brief: the wire form of one storage record. Address fields
/// come in two widths; encoders pick the narrow one unless an address
/// requires the wide one, and decoders branch on total body length only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageBrief {
    pub status: StorageStatus,
    pub port: u32,
    pub id: String,
    pub ip: String,
}

impl StorageBrief {
    pub fn encode_into(&self, buf: &mut Vec<u8>, addr_size: usize) -> Result<()> {
        buf.push(self.status as u8);
        put_u32(buf, self.port);
        put_str(buf, &self.id, ID_SIZE)?;
        put_str(buf, &self.ip, addr_size)
    }

    pub fn decode_from(reader: &mut Reader, addr_size: usize) -> Result<Self> {
        let status = StorageStatus::from_u8(reader.u8()?)?;
        let port = reader.u32()?;
        let id = reader.str(ID_SIZE)?;
        let ip = reader.str(addr_size)?;
        Ok(Self { status, port, id, ip })
    }
}

/// Returns the address field width for a list of briefs: the IPv4 width
/// unless some address needs the wide field.
pub fn brief_addr_size(briefs: &[StorageBrief]) -> usize {
    if briefs.iter().any(|b| b.ip.len() >= IPV4_ADDR_SIZE) {
        IPV6_ADDR_SIZE
    } else {
        IPV4_ADDR_SIZE
    }
}

/// Encodes a list of briefs back-to-back, all with the same address width.
/// This is the replica-change (diff correction) request body.
pub fn encode_briefs(briefs: &[StorageBrief]) -> Result<Vec<u8>> {
    let addr_size = brief_addr_size(briefs);
    let mut buf = Vec::with_capacity(briefs.len() * (1 + 4 + ID_SIZE + addr_size));
    for brief in briefs {
        brief.encode_into(&mut buf, addr_size)?;
    }
    Ok(buf)
}

/// Determines the per-record size of a run of brief records from its total
/// length: the length must be an exact multiple of one of the two valid
/// record sizes.
fn brief_record_size(total: usize) -> Result<usize> {
    if total % BRIEF_V4_SIZE == 0 {
        Ok(BRIEF_V4_SIZE)
    } else if total % BRIEF_V6_SIZE == 0 {
        Ok(BRIEF_V6_SIZE)
    } else {
        errdata!("brief list length {total} is not a multiple of {BRIEF_V4_SIZE} or {BRIEF_V6_SIZE}")
    }
}

/// Decodes a run of brief records, branching on total length for the
/// address width.
pub fn decode_briefs(bytes: &[u8]) -> Result<Vec<StorageBrief>> {
    let record_size = brief_record_size(bytes.len())?;
    let addr_size = record_size - 1 - 4 - ID_SIZE;
    let mut reader = Reader::new(bytes);
    let mut briefs = Vec::with_capacity(bytes.len() / record_size);
    while reader.remaining() > 0 {
        briefs.push(StorageBrief::decode_from(&mut reader, addr_size)?);
    }
    Ok(briefs)
}

/// A tracker-leader announcement. An empty address means the announcing
/// tracker currently knows no leader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaderChange {
    pub ip: String,
    pub port: u32,
}

/// A trunk-server announcement. The id is only meaningful when storage-id
/// addressing is enabled; the address is the literal fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrunkChange {
    pub id: String,
    pub ip: String,
    pub port: u32,
}

/// The decoded combined change notification.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeNotice {
    pub leader_change: Option<LeaderChange>,
    pub trunk_change: Option<TrunkChange>,
    /// The tracker's membership snapshot, present only when the members
    /// flag was set. An empty body yields all-None.
    pub briefs: Option<Vec<StorageBrief>>,
}

impl ChangeNotice {
    /// Decodes a change-notification body: a flags byte followed by brief
    /// records, the first one or two of which are the leader/trunk prefix
    /// records when flagged. An empty body means no changes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let flags = bytes[0];
        let mut records = decode_briefs(&bytes[1..])?.into_iter();
        let mut notice = Self::default();

        if flags & CHANGE_FLAG_LEADER != 0 {
            let record = records
                .next()
                .ok_or_else(|| crate::error::Error::InvalidData("missing leader record".into()))?;
            notice.leader_change = Some(LeaderChange { ip: record.ip, port: record.port });
        }
        if flags & CHANGE_FLAG_TRUNK != 0 {
            let record = records
                .next()
                .ok_or_else(|| crate::error::Error::InvalidData("missing trunk record".into()))?;
            notice.trunk_change =
                Some(TrunkChange { id: record.id, ip: record.ip, port: record.port });
        }
        if flags & CHANGE_FLAG_MEMBERS != 0 {
            notice.briefs = Some(records.collect());
        }
        Ok(notice)
    }

    /// Encodes a change notification. Only used by tests and tooling; the
    /// daemon is the receiving side.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags = 0;
        let mut records = Vec::new();
        if let Some(leader) = &self.leader_change {
            flags |= CHANGE_FLAG_LEADER;
            records.push(StorageBrief {
                status: StorageStatus::None,
                port: leader.port,
                id: String::new(),
                ip: leader.ip.clone(),
            });
        }
        if let Some(trunk) = &self.trunk_change {
            flags |= CHANGE_FLAG_TRUNK;
            records.push(StorageBrief {
                status: StorageStatus::None,
                port: trunk.port,
                id: trunk.id.clone(),
                ip: trunk.ip.clone(),
            });
        }
        if let Some(briefs) = &self.briefs {
            flags |= CHANGE_FLAG_MEMBERS;
            records.extend(briefs.iter().cloned());
        }
        let mut buf = vec![flags];
        buf.extend(encode_briefs(&records)?);
        Ok(buf)
    }
}

/// The join request: this node's identity, capabilities, believed own
/// status, and the full configured tracker list for quorum cross-validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinRequest {
    pub group_name: String,
    pub port: u32,
    pub http_port: u32,
    pub store_path_count: u32,
    pub subdir_count_per_path: u32,
    pub upload_priority: i32,
    pub join_time: i64,
    pub up_time: i64,
    pub version: String,
    pub domain_name: String,
    /// Set when this node has never completed its historical catch-up.
    pub init_flag: bool,
    /// The believed own status, or None when genuinely unknown (reported as
    /// -1 on the wire).
    pub status: Option<StorageStatus>,
    pub tracker_ip: String,
    pub trackers: Vec<String>,
}

impl JoinRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(JOIN_FIXED_SIZE + self.trackers.len() * IP_PORT_SIZE);
        put_str(&mut buf, &self.group_name, GROUP_NAME_SIZE + 1)?;
        put_i64(&mut buf, self.port as i64);
        put_i64(&mut buf, self.http_port as i64);
        put_i64(&mut buf, self.store_path_count as i64);
        put_i64(&mut buf, self.subdir_count_per_path as i64);
        put_i64(&mut buf, self.upload_priority as i64);
        put_i64(&mut buf, self.join_time);
        put_i64(&mut buf, self.up_time);
        put_str(&mut buf, &self.version, VERSION_SIZE)?;
        put_str(&mut buf, &self.domain_name, DOMAIN_NAME_SIZE)?;
        buf.push(self.init_flag as u8);
        buf.push(self.status.map_or(0xff, |s| s as u8));
        put_str(&mut buf, &self.tracker_ip, IPV4_ADDR_SIZE)?;
        put_i64(&mut buf, self.trackers.len() as i64);
        for tracker in &self.trackers {
            put_str(&mut buf, tracker, IP_PORT_SIZE)?;
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let group_name = reader.str(GROUP_NAME_SIZE + 1)?;
        let port = reader.i64()? as u32;
        let http_port = reader.i64()? as u32;
        let store_path_count = reader.i64()? as u32;
        let subdir_count_per_path = reader.i64()? as u32;
        let upload_priority = reader.i64()? as i32;
        let join_time = reader.i64()?;
        let up_time = reader.i64()?;
        let version = reader.str(VERSION_SIZE)?;
        let domain_name = reader.str(DOMAIN_NAME_SIZE)?;
        let init_flag = reader.u8()? != 0;
        let status = match reader.u8()? {
            0xff => None,
            value => Some(StorageStatus::from_u8(value)?),
        };
        let tracker_ip = reader.str(IPV4_ADDR_SIZE)?;
        let tracker_count = reader.i64()?;
        let mut trackers = Vec::with_capacity(tracker_count as usize);
        for _ in 0..tracker_count {
            trackers.push(reader.str(IP_PORT_SIZE)?);
        }
        reader.done()?;
        Ok(Self {
            group_name,
            port,
            http_port,
            store_path_count,
            subdir_count_per_path,
            upload_priority,
            join_time,
            up_time,
            version,
            domain_name,
            init_flag,
            status,
            tracker_ip,
            trackers,
        })
    }
}

/// The join reply: the tracker's authoritative view of this node's status,
/// and (possibly empty) the peer id assigned as this node's sync source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinReply {
    pub status: StorageStatus,
    pub source_id: String,
}

impl JoinReply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![self.status as u8];
        put_str(&mut buf, &self.source_id, ID_SIZE)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        super::codec::expect_len(bytes.len(), JOIN_REPLY_SIZE)?;
        let mut reader = Reader::new(bytes);
        let status = StorageStatus::from_u8(reader.u8()?)?;
        let source_id = reader.str(ID_SIZE)?;
        Ok(Self { status, source_id })
    }
}

/// A sync source assignment: used as the body of sync-src/dest requests,
/// queries, and notifies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncAssignment {
    pub source_id: String,
    pub until_timestamp: i64,
}

impl SyncAssignment {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(SYNC_REQ_SIZE);
        put_str(&mut buf, &self.source_id, ID_SIZE)?;
        put_i64(&mut buf, self.until_timestamp);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        super::codec::expect_len(bytes.len(), SYNC_REQ_SIZE)?;
        let mut reader = Reader::new(bytes);
        let source_id = reader.str(ID_SIZE)?;
        let until_timestamp = reader.i64()?;
        Ok(Self { source_id, until_timestamp })
    }
}

/// A tracker's self-reported running status, used for leader discovery and
/// the split-brain probe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackerRunningStatus {
    pub is_leader: bool,
    pub running_time: i64,
    pub restart_interval: i64,
}

impl TrackerRunningStatus {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.is_leader as u8];
        put_i64(&mut buf, self.running_time);
        put_i64(&mut buf, self.restart_interval);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        super::codec::expect_len(bytes.len(), TRACKER_STATUS_SIZE)?;
        let mut reader = Reader::new(bytes);
        let is_leader = reader.u8()? != 0;
        let running_time = reader.i64()?;
        let restart_interval = reader.i64()?;
        Ok(Self { is_leader, running_time, restart_interval })
    }
}

/// A usage statistics snapshot, attached to a heartbeat only when the local
/// counters changed since the last send.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsageStats {
    pub connection_current: u32,
    pub connection_max: u32,
    pub total_upload_count: i64,
    pub success_upload_count: i64,
    pub total_download_count: i64,
    pub success_download_count: i64,
    pub total_delete_count: i64,
    pub success_delete_count: i64,
    pub total_sync_in_bytes: i64,
    pub success_sync_in_bytes: i64,
    pub total_sync_out_bytes: i64,
    pub success_sync_out_bytes: i64,
    pub last_source_update: i64,
    pub last_sync_update: i64,
}

impl UsageStats {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STATS_SIZE);
        put_u32(&mut buf, self.connection_current);
        put_u32(&mut buf, self.connection_max);
        for value in [
            self.total_upload_count,
            self.success_upload_count,
            self.total_download_count,
            self.success_download_count,
            self.total_delete_count,
            self.success_delete_count,
            self.total_sync_in_bytes,
            self.success_sync_in_bytes,
            self.total_sync_out_bytes,
            self.success_sync_out_bytes,
            self.last_source_update,
            self.last_sync_update,
        ] {
            put_i64(&mut buf, value);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        super::codec::expect_len(bytes.len(), STATS_SIZE)?;
        let mut reader = Reader::new(bytes);
        Ok(Self {
            connection_current: reader.u32()?,
            connection_max: reader.u32()?,
            total_upload_count: reader.i64()?,
            success_upload_count: reader.i64()?,
            total_download_count: reader.i64()?,
            success_download_count: reader.i64()?,
            total_delete_count: reader.i64()?,
            success_delete_count: reader.i64()?,
            total_sync_in_bytes: reader.i64()?,
            success_sync_in_bytes: reader.i64()?,
            total_sync_out_bytes: reader.i64()?,
            success_sync_out_bytes: reader.i64()?,
            last_source_update: reader.i64()?,
            last_sync_update: reader.i64()?,
        })
    }
}

/// One store path's disk usage, in megabytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_mb: i64,
    pub free_mb: i64,
}

/// Encodes a disk usage report, one entry per store path.
pub fn encode_disk_usage(paths: &[DiskUsage]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(paths.len() * DISK_USAGE_ENTRY_SIZE);
    for path in paths {
        put_i64(&mut buf, path.total_mb);
        put_i64(&mut buf, path.free_mb);
    }
    buf
}

/// Encodes a sync-timestamp report: per peer, its id and the locally tracked
/// max-synced timestamp.
pub fn encode_sync_report(entries: &[(String, i64)]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(entries.len() * SYNC_REPORT_ENTRY_SIZE);
    for (id, timestamp) in entries {
        put_str(&mut buf, id, ID_SIZE)?;
        put_u32(&mut buf, *timestamp as u32);
    }
    Ok(buf)
}

/// Encodes a status-correction request: the group name followed by the
/// corrected brief, always with the narrow address width unless required.
pub fn encode_report_status(group_name: &str, brief: &StorageBrief) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    put_str(&mut buf, group_name, GROUP_NAME_SIZE + 1)?;
    let addr_size = brief_addr_size(std::slice::from_ref(brief));
    brief.encode_into(&mut buf, addr_size)?;
    Ok(buf)
}

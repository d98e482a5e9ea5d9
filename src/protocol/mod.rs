//! The tracker/storage wire protocol.
//!
//! Every packet is a fixed 10-byte header (8-byte big-endian body length,
//! 1-byte command, 1-byte status) followed by a command-specific body of
//! fixed-width big-endian integers and fixed-width NUL-padded strings. Bodies
//! never carry length prefixes; each command defines its field widths, and
//! the only size variance is the address width (IPv4 vs IPv6), which the
//! receiver discriminates on total body length alone.

pub mod codec;
pub mod message;

use crate::error::Result;
use crate::errdata;

/// Maximum storage id width on the wire, NUL-padded.
pub const ID_SIZE: usize = 16;
/// Maximum group name width. Carried with one extra NUL pad byte in bodies.
pub const GROUP_NAME_SIZE: usize = 16;
/// IPv4-sized address field width.
pub const IPV4_ADDR_SIZE: usize = 16;
/// IPv6-sized address field width.
pub const IPV6_ADDR_SIZE: usize = 46;
/// Version tag width in the join body.
pub const VERSION_SIZE: usize = 6;
/// Domain name width in the join body.
pub const DOMAIN_NAME_SIZE: usize = 128;
/// Width of one "ip:port" entry in the join body's tracker list.
pub const IP_PORT_SIZE: usize = IPV4_ADDR_SIZE + 6;
/// Fixed header size: body length (8) + command (1) + status (1).
pub const HEADER_SIZE: usize = 10;

/// Change-response flag: the first brief record announces the tracker leader.
pub const CHANGE_FLAG_LEADER: u8 = 1;
/// Change-response flag: the next brief record announces the trunk server.
pub const CHANGE_FLAG_TRUNK: u8 = 2;
/// Change-response flag: the remaining brief records are group membership.
pub const CHANGE_FLAG_MEMBERS: u8 = 4;

/// Remote status codes trackers report in the response header. These follow
/// errno numbering, but only the handful below carry protocol meaning.
pub mod code {
    pub const NOT_FOUND: u8 = 2;
    /// A tracker's answer to a join from a storage it has no record of.
    pub const UNKNOWN_STORAGE: u8 = 14;
    pub const BUSY: u8 = 16;
    pub const ALREADY_EXISTS: u8 = 17;
    pub const INVALID: u8 = 22;
    pub const IN_PROGRESS: u8 = 114;
}

/// A protocol command code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Storage announces itself and its capabilities to a tracker.
    Join = 81,
    /// Storage signs off before closing the connection.
    Quit = 82,
    /// Heartbeat, optionally carrying a usage statistics snapshot.
    Beat = 83,
    /// Per-store-path disk usage report.
    DiskUsage = 84,
    /// Membership diff correction pushed back to a lagging tracker.
    ReplicaChange = 85,
    /// Source storage asks which peer to bootstrap and until when.
    SyncSrcRequest = 86,
    /// Destination storage asks for its assigned sync source.
    SyncDestRequest = 87,
    /// Storage pushes its current sync cursor to a tracker.
    SyncNotify = 88,
    /// Per-peer max-synced-timestamp report.
    SyncReport = 89,
    /// Destination storage re-queries its sync source after a deletion.
    SyncDestQuery = 79,
    /// One-shot status correction for a peer record.
    ReportStatus = 76,
    /// Trunk allocator reports its current trunk file id.
    ReportTrunkFileId = 73,
    /// Newly elected trunk allocator fetches the cluster trunk file id.
    FetchTrunkFileId = 72,
    /// Trunk allocator reports total trunk free space.
    ReportTrunkFree = 74,
    /// Asks a tracker whether it currently believes itself leader.
    TrackerStatus = 64,
    /// Tells a tracker to re-run leader election (split-brain observed).
    ReselectLeader = 68,
    /// Liveness probe.
    ActiveTest = 111,
    /// Generic response command code.
    Response = 100,
}

impl Command {
    pub fn from_u8(value: u8) -> Result<Self> {
        use Command::*;
        Ok(match value {
            81 => Join,
            82 => Quit,
            83 => Beat,
            84 => DiskUsage,
            85 => ReplicaChange,
            86 => SyncSrcRequest,
            87 => SyncDestRequest,
            88 => SyncNotify,
            89 => SyncReport,
            79 => SyncDestQuery,
            76 => ReportStatus,
            73 => ReportTrunkFileId,
            72 => FetchTrunkFileId,
            74 => ReportTrunkFree,
            64 => TrackerStatus,
            68 => ReselectLeader,
            111 => ActiveTest,
            100 => Response,
            value => return errdata!("unknown command code {value}"),
        })
    }
}

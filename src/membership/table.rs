use crate::errdata;
use crate::error::Result;

use std::fmt;

/// The lifecycle status of a storage node, as an ordered enumeration. The
/// numeric values are wire values and their ordering is semantically
/// meaningful: the sync-phase statuses (WaitSync, Syncing) are "less
/// advanced" than the serving statuses (Offline, Online, Active), and
/// reconciliation rules compare them numerically. Higher is not strictly
/// better: Deleted and IpChanged are administrative markers, and None marks
/// a record that only exists to keep table positions stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StorageStatus {
    Init = 0,
    WaitSync = 1,
    Syncing = 2,
    IpChanged = 3,
    Deleted = 4,
    Offline = 5,
    Online = 6,
    Active = 7,
    Recovery = 9,
    None = 99,
}

impl StorageStatus {
    pub fn from_u8(value: u8) -> Result<Self> {
        use StorageStatus::*;
        Ok(match value {
            0 => Init,
            1 => WaitSync,
            2 => Syncing,
            3 => IpChanged,
            4 => Deleted,
            5 => Offline,
            6 => Online,
            7 => Active,
            9 => Recovery,
            99 => None,
            value => return errdata!("unknown storage status {value}"),
        })
    }

    /// True for the statuses in which a node serves traffic.
    pub fn is_available(self) -> bool {
        matches!(self, StorageStatus::Online | StorageStatus::Active)
    }

    /// True for the administrative markers that announce a record as deleted
    /// or address-changed rather than describing a live node.
    pub fn is_administrative(self) -> bool {
        matches!(self, StorageStatus::Deleted | StorageStatus::IpChanged)
    }
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageStatus::Init => "INIT",
            StorageStatus::WaitSync => "WAIT_SYNC",
            StorageStatus::Syncing => "SYNCING",
            StorageStatus::IpChanged => "IP_CHANGED",
            StorageStatus::Deleted => "DELETED",
            StorageStatus::Offline => "OFFLINE",
            StorageStatus::Online => "ONLINE",
            StorageStatus::Active => "ACTIVE",
            StorageStatus::Recovery => "RECOVERY",
            StorageStatus::None => "NONE",
        };
        write!(f, "{name}")
    }
}

/// One known peer storage node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRecord {
    /// Stable cluster identifier. Unique; the table sort key.
    pub id: String,
    /// Current reachable address.
    pub ip: String,
    pub port: u32,
    pub status: StorageStatus,
    /// The peer's max replicated-write timestamp as locally tracked,
    /// reported to trackers via sync-timestamp reports. Not a wire field of
    /// the membership brief.
    pub last_sync_timestamp: i64,
}

impl StorageRecord {
    pub fn new(id: String, ip: String, port: u32, status: StorageStatus) -> Self {
        Self { id, ip, port, status, last_sync_timestamp: 0 }
    }
}

/// The table of known peer storage records, kept strictly sorted by id with
/// unique ids. Records are never physically removed: deletion moves a record
/// to status None so that positions stay stable within a reconciliation
/// pass.
#[derive(Debug, Default)]
pub struct MembershipTable {
    records: Vec<StorageRecord>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Binary-searches for an id, returning its position or the insertion
    /// point.
    pub fn position(&self, id: &str) -> std::result::Result<usize, usize> {
        self.records.binary_search_by(|record| record.id.as_str().cmp(id))
    }

    pub fn get(&self, id: &str) -> Option<&StorageRecord> {
        self.position(id).ok().map(|i| &self.records[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut StorageRecord> {
        self.position(id).ok().map(move |i| &mut self.records[i])
    }

    pub fn record(&self, index: usize) -> &StorageRecord {
        &self.records[index]
    }

    pub fn record_mut(&mut self, index: usize) -> &mut StorageRecord {
        &mut self.records[index]
    }

    /// Inserts a record at its sorted position. Returns false (and leaves
    /// the table unchanged) if the id is already present.
    pub fn insert(&mut self, record: StorageRecord) -> bool {
        match self.position(&record.id) {
            Ok(_) => false,
            Err(at) => {
                self.records.insert(at, record);
                true
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StorageRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StorageRecord> {
        self.records.iter_mut()
    }
}

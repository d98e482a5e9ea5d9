//! Anti-entropy reconciliation of a tracker's membership snapshot against
//! the local table.
//!
//! Trackers are independent, possibly stale authorities. Each snapshot is
//! merged under a fixed decision table; wherever this node believes the
//! tracker is behind, the local record is queued into an outgoing diff that
//! is reported back as a correction. The rules are written to be idempotent
//! and order-tolerant, since every tracker session applies them concurrently
//! against the same table.

use crate::protocol::message::StorageBrief;

use super::table::{MembershipTable, StorageRecord, StorageStatus};

use itertools::{merge_join_by, EitherOrBoth};
use log::warn;

/// This node's own identity, used to recognize its own record in snapshots.
#[derive(Clone, Debug)]
pub struct SelfIdentity {
    pub id: String,
    pub ip: String,
    pub port: u32,
}

impl SelfIdentity {
    /// True if the brief identifies this node, by id or by address.
    fn matches(&self, brief: &StorageBrief) -> bool {
        brief.id == self.id || (brief.ip == self.ip && brief.port == self.port)
    }
}

/// The result of merging one snapshot.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Local records the tracker is missing or has wrong, to be reported
    /// back as a correction.
    pub diff: Vec<StorageBrief>,
    /// Peers first learned of in this snapshot, for which replication
    /// workers should be started.
    pub new_peers: Vec<String>,
    /// The tracker's view of this node's own status, when the snapshot
    /// contained it.
    pub self_status: Option<StorageStatus>,
    /// Set when the tracker reported this node's own state as less advanced
    /// than locally believed: a strong staleness signal, resolved by a full
    /// rejoin rather than by trusting the regression.
    pub need_rejoin: bool,
}

fn to_brief(record: &StorageRecord) -> StorageBrief {
    StorageBrief {
        status: record.status,
        port: record.port,
        id: record.id.clone(),
        ip: record.ip.clone(),
    }
}

/// Merges one ordered membership snapshot into the table. The leader/trunk
/// prefix records must already have been stripped (see
/// `protocol::message::ChangeNotice`).
pub fn reconcile(
    table: &mut MembershipTable,
    briefs: &[StorageBrief],
    me: &SelfIdentity,
    use_storage_id: bool,
) -> Outcome {
    let mut outcome = Outcome::default();
    let mut deleted_count = 0;

    for brief in briefs {
        if brief.id == me.id {
            outcome.self_status = Some(brief.status);
        }

        let index = match table.position(&brief.id) {
            Ok(index) => index,
            Err(_) if brief.status.is_administrative() => {
                // Announced as deleted or address-changed while already
                // absent locally: consistent, nothing to do.
                deleted_count += 1;
                continue;
            }
            Err(_) => {
                table.insert(StorageRecord::new(
                    brief.id.clone(),
                    brief.ip.clone(),
                    brief.port,
                    brief.status,
                ));
                if brief.id != me.id {
                    outcome.new_peers.push(brief.id.clone());
                }
                continue;
            }
        };

        if use_storage_id {
            // With id-based addressing the tracker is authoritative for the
            // current address of an id.
            let record = table.record_mut(index);
            record.ip = brief.ip.clone();
            record.port = brief.port;
        }

        let local = table.record(index).status;
        if local == brief.status {
            continue;
        }

        if brief.status == StorageStatus::Offline {
            if local == StorageStatus::Active || local == StorageStatus::Online {
                table.record_mut(index).status = StorageStatus::Offline;
            } else if local != StorageStatus::None && local != StorageStatus::Init {
                // Keep the local status and tell the tracker what we still
                // believe. Mid-sync nodes are deliberately not marked
                // offline here; only Active/Online fall in the branch above.
                outcome.diff.push(to_brief(table.record(index)));
            }
        } else if local == StorageStatus::Offline {
            table.record_mut(index).status = brief.status;
        } else if local == StorageStatus::None {
            if !brief.status.is_administrative() {
                // First time this node learns the peer is real.
                table.record_mut(index).status = brief.status;
                if brief.id != me.id {
                    outcome.new_peers.push(brief.id.clone());
                }
            }
        } else if matches!(brief.status, StorageStatus::WaitSync | StorageStatus::Syncing)
            && local > brief.status
        {
            if me.matches(brief) {
                warn!(
                    "tracker reports own status {} behind local {}, forcing rejoin",
                    brief.status, local
                );
                outcome.need_rejoin = true;
            }
            outcome.diff.push(to_brief(table.record(index)));
        } else {
            table.record_mut(index).status = brief.status;
        }
    }

    // If the snapshot didn't cover the whole table, sweep both sorted
    // sequences in parallel for local records the tracker never mentioned.
    if table.len() + deleted_count != briefs.len() {
        for pair in merge_join_by(briefs.iter(), table.iter(), |brief, record| {
            brief.id.as_str().cmp(record.id.as_str())
        }) {
            match pair {
                EitherOrBoth::Right(record) if record.status != StorageStatus::None => {
                    outcome.diff.push(to_brief(record));
                }
                EitherOrBoth::Left(brief) if !brief.status.is_administrative() => {
                    // Every non-administrative brief was matched or inserted
                    // above, so an unmatched one here means the tracker sent
                    // an unsorted snapshot.
                    warn!("snapshot record {} not found in table sweep", brief.id);
                }
                _ => {}
            }
        }
    }

    outcome
}

//! Group membership: the known peer storage records and the reconciliation
//! of tracker-reported membership snapshots against them.

pub mod reconciler;
pub mod table;

pub use reconciler::{reconcile, Outcome, SelfIdentity};
pub use table::{MembershipTable, StorageRecord, StorageStatus};

//! Step storage and the version ledger.
//!
//! Steps are stored one row per submitted batch, tagged with the version
//! the batch produced. The ledger owns version assignment; the store only
//! persists rows.

mod ledger;
mod log;

pub use ledger::VersionLedger;
pub use log::{StepLog, StepStore};
pub(crate) use log::LOG_VERSION;

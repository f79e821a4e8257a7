//! Document records, sessions and editor-state snapshots.

mod manager;
mod state;
mod table;

pub use manager::DocumentManager;
pub use state::StateSnapshots;
pub(crate) use state::STATE_VERSION;
pub use table::{DocumentTable, SessionTable};
pub(crate) use table::TABLE_VERSION;

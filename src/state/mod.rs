//! Persistent daemon state: per-repo records and the cost ledger.

pub mod ledger;
pub mod repo;
pub mod store;

pub use ledger::{load_ledger, save_ledger, CostLedger};
pub use repo::RepoState;
pub use store::RepoStateStore;

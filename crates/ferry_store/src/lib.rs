pub mod config;
pub mod datastore;
mod db;
pub mod ledger;
pub mod migration;
pub mod tuples;

pub use config::{DatabaseConfig, FerryConfig, ImportConfig, LimitsConfig, PoolConfig};
pub use datastore::{default_sqlite_path, load_or_init_config, open_ledger};
pub use ferry_core::*;
pub use ledger::LedgerStore;
pub use tuples::LocalTupleStore;

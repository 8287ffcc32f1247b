// PostgreSQL backing store:
// - config: connection parameters and DSN assembly
// - manager: bb8 connection manager for tokio-postgres clients
// - pool: bounded pool, leases and draining stop
// - tx: typestate connection wrapper with explicit transactions
// - query: SQL for the quotes relation

pub mod config;
pub mod manager;
pub mod pool;
pub mod query;
pub mod tx;

pub use config::{PoolSettings, StorageConfig};
pub use manager::{PgClient, PgManager};
pub use pool::{ConnectionPool, PoolLease, PoolStatus};
pub use tx::{Idle, InTx, PgConnection, abort};

//! Convenient imports for common functionality.

pub use crate::context::OpContext;
pub use crate::db::QuoteDb;
pub use crate::error::QuoteStoreError;
pub use crate::lifecycle::{Service, ServiceError, ServiceManager};
pub use crate::model::Quote;
pub use crate::postgres::{ConnectionPool, PoolSettings, PoolStatus, StorageConfig};
pub use crate::store::{QuoteStorage, QuoteStore};

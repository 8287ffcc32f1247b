//! Durable quote storage on PostgreSQL.
//!
//! A bounded [`postgres::ConnectionPool`] feeds [`store::QuoteStore`], which
//! implements the five quote operations. [`db::QuoteDb`] wraps the store in the
//! init/run/stop lifecycle, and the optional application and REST layers sit on
//! top of the [`store::QuoteStorage`] trait.

pub mod application;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod migrations;
pub mod model;
pub mod postgres;
pub mod prelude;
pub mod rest;
pub mod store;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use context::OpContext;
pub use db::QuoteDb;
pub use error::QuoteStoreError;
pub use model::Quote;
pub use postgres::{ConnectionPool, StorageConfig};
pub use store::{QuoteStorage, QuoteStore};

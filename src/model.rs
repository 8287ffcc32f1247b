use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Row;

/// A persisted quote. Rows are never modified after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub id: i64,
    pub author: String,
    #[serde(rename = "quote")]
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Quote {
    /// Map a row from one of the `SELECT`s in `crate::postgres::query`.
    ///
    /// # Errors
    /// Returns the driver error when a column is missing or has an unexpected type.
    pub fn from_row(row: &Row) -> Result<Self, tokio_postgres::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            author: row.try_get("author")?,
            text: row.try_get("quote")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

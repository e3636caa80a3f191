use std::num::NonZeroU32;

use async_trait::async_trait;

use crate::{cursor::CursorName, error::BoxError, row::Row};

/// A database connection able to run the cursor primitives.
///
/// Implementations run each call as a single round trip. Errors are returned
/// as-is; callers tag them with the cursor operation that failed.
#[async_trait]
pub trait Connection: Send + Sync {
    /// A short backend description, used in diagnostics.
    fn backend_name(&self) -> &str;

    /// Whether the backend provides `DECLARE`, `FETCH` and `CLOSE`.
    fn supports_cursors(&self) -> bool {
        true
    }

    /// Executes a statement that returns no rows (`DECLARE`, `CLOSE`,
    /// `BEGIN`, `COMMIT` or `ROLLBACK`).
    async fn execute(&self, sql: &str) -> Result<(), BoxError>;

    /// Fetches forward from the given cursor. Without `max_rows`, the backend
    /// default of one row is fetched. An empty vector means the cursor is
    /// exhausted.
    async fn fetch_rows(
        &self,
        cursor: &CursorName,
        max_rows: Option<NonZeroU32>,
    ) -> Result<Vec<Row>, BoxError>;
}

/// Renders the `FETCH FORWARD` statement for the given cursor.
pub fn fetch_statement(cursor: &CursorName, max_rows: Option<NonZeroU32>) -> String {
    match max_rows {
        Some(count) => format!("FETCH FORWARD {count} FROM {cursor}"),
        None => format!("FETCH FORWARD FROM {cursor}"),
    }
}

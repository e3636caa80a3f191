//! Streams large query results through server-side database cursors.
//!
//! A [`CursorStream`] declares a cursor for a query and fetches it forward in
//! bounded batches, so that only a handful of rows are held in memory at any
//! time. When the query eager-loads one-to-many associations, the flat joined
//! rows are regrouped into one [`Graph`](join::Graph) per parent, even when a
//! parent's rows are split across several fetches.
//!
//! # Example
//! ```no_run
//! use pgcursor::{Session, StreamOpts};
//! use tokio_postgres::NoTls;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (client, connection) =
//!     tokio_postgres::connect("host=localhost user=postgres", NoTls).await?;
//! tokio::spawn(connection);
//!
//! let session = Session::new(client);
//! let mut stream = session
//!     .cursor("SELECT * FROM foos ORDER BY id", StreamOpts::new())
//!     .await?;
//! while let Some(unit) = stream.next().await? {
//!     println!("{:?}", unit.row());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Statements
//! Opening a stream runs, inside a transaction block:
//! ```sql
//! DECLARE "<cursor>" NO SCROLL CURSOR FOR <query>
//! ```
//! Each fetch runs `FETCH FORWARD [<batch_size>] FROM "<cursor>"`, and the
//! stream ends with `CLOSE "<cursor>"`.
//!
//! It's up to the caller to ensure that raw SQL queries are safe from SQL
//! injection.

pub mod error;

pub mod config;

pub mod row;
pub mod value;

pub mod conn;
pub mod cursor;
pub mod join;
pub mod query;
pub mod regroup;
pub mod session;

pub mod backend;

pub use crate::{
    config::StreamOpts,
    conn::Connection,
    cursor::{CursorName, CursorStream, Unit},
    error::{DbResult, Error},
    query::{Association, Materialize, Materialized, Select, TableSchema},
    session::Session,
};

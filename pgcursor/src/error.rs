use std::{error::Error as StdError, fmt};

use crate::value::Value;

pub type DbResult<T, E = Error> = Result<T, E>;

/// Boxed error returned by a [`Connection`](crate::conn::Connection) backend.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection can't declare server-side cursors.
    #[error("backend doesn't support cursors: {0}")]
    UnsupportedBackend(String),

    /// A round trip to the database failed.
    #[error("cursor {op} failed: {source}")]
    CursorIo {
        op: CursorOp,
        #[source]
        source: BoxError,
    },

    /// A parent key showed up again after its group had already been emitted,
    /// i.e., the query didn't order rows of the same parent contiguously.
    #[error("rows for parent key `{key}` are not contiguous; order the query by the parent key")]
    MalformedGroupOrdering { key: Value },

    /// The cursor name can't be used as an identifier.
    #[error("invalid cursor name `{0}`")]
    InvalidCursorName(String),

    /// A row lacks a column the join plan relies on.
    #[error("missing column `{0}`")]
    MissingColumn(String),

    /// The parent key column of a joined row is NULL.
    #[error("parent key column `{0}` is null")]
    NullParentKey(String),

    /// The query descriptor is invalid for its schema.
    #[error("query error: {0}")]
    Query(String),

    /// Flat rows couldn't be assembled into a graph.
    #[error("assembly error: {0}")]
    Assembly(String),
}

impl Error {
    /// Wraps a backend error as a [`Error::CursorIo`].
    pub fn io(op: CursorOp, source: impl Into<BoxError>) -> Self {
        Error::CursorIo {
            op,
            source: source.into(),
        }
    }
}

/// The cursor round trip that failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CursorOp {
    Begin,
    Declare,
    Fetch,
    Close,
    Commit,
    Rollback,
}

impl fmt::Display for CursorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CursorOp::Begin => "begin",
            CursorOp::Declare => "declare",
            CursorOp::Fetch => "fetch",
            CursorOp::Close => "close",
            CursorOp::Commit => "commit",
            CursorOp::Rollback => "rollback",
        })
    }
}

use std::{
    num::NonZeroU32,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use tracing::{debug, instrument, warn};

use crate::{
    config::StreamOpts,
    conn::Connection,
    cursor::{CursorName, CursorStream, Unit},
    error::{CursorOp, DbResult, Error},
    query::Materialize,
    row::Row,
};

/// A database session: a connection plus the transaction scope its cursors
/// live in.
///
/// Transaction scopes nest. The outermost scope issues `BEGIN` and ends with
/// `COMMIT` (or `ROLLBACK` on failure); inner scopes join it. Hence a cursor
/// opened while iterating another one shares its transaction, and must be
/// finished before the outer cursor is.
///
/// Cursors dropped while still open can't be closed right away since closing
/// is a round trip. They are queued and closed before the next command this
/// session runs, or by [`Session::flush_deferred`].
pub struct Session<C: Connection> {
    conn: C,
    depth: AtomicU32,
    deferred: Mutex<Vec<Deferred>>,
}

/// Cleanup left behind by a dropped [`CursorStream`].
#[derive(Debug)]
pub(crate) enum Deferred {
    Close(CursorName),
    EndScope,
}

impl<C: Connection> Session<C> {
    pub fn new(conn: C) -> Self {
        Session {
            conn,
            depth: AtomicU32::new(0),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Returns the number of open transaction scopes.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    pub fn in_transaction(&self) -> bool {
        self.depth() > 0
    }

    /// Returns the number of cleanups waiting for the next command.
    pub fn pending_cleanups(&self) -> usize {
        self.lock_deferred().len()
    }

    /// Opens a cursor stream over the given query.
    pub async fn cursor<Q>(&self, query: &Q, opts: StreamOpts) -> DbResult<CursorStream<'_, C>>
    where
        Q: Materialize + ?Sized,
    {
        CursorStream::open(self, query.materialize()?, opts).await
    }

    /// Streams the given query, passing the callback closure for each yielded
    /// unit. Returning an error from the callback stops the iteration.
    pub async fn for_each<Q, E, F>(&self, query: &Q, opts: StreamOpts, f: F) -> DbResult<Result<(), E>>
    where
        Q: Materialize + ?Sized,
        F: FnMut(Unit) -> Result<(), E>,
    {
        self.cursor(query, opts).await?.for_each(f).await
    }

    /// Runs the cleanups of dropped cursors. Every cleanup is attempted; the
    /// first failure is returned.
    pub async fn flush_deferred(&self) -> DbResult<()> {
        let mut first_error = None;
        loop {
            let next = {
                let mut deferred = self.lock_deferred();
                if deferred.is_empty() {
                    break;
                }
                deferred.remove(0)
            };
            let result = match next {
                Deferred::Close(name) => {
                    debug!(cursor = %name, "closing dropped cursor");
                    self.raw_execute(&format!("CLOSE {name}"), CursorOp::Close)
                        .await
                }
                Deferred::EndScope => self.leave_scope(true).await,
            };
            if let Err(error) = result {
                warn!(%error, "deferred cursor cleanup failed");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Enters a transaction scope, issuing `BEGIN` if it's the outermost one.
    #[instrument(level = "debug", skip_all)]
    pub(crate) async fn begin_scope(&self) -> DbResult<()> {
        self.run_deferred().await;
        if self.depth.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Err(error) = self.raw_execute("BEGIN", CursorOp::Begin).await {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                return Err(error);
            }
        }
        Ok(())
    }

    /// Leaves a transaction scope. The outermost scope commits, or rolls back
    /// if `commit` is false.
    #[instrument(level = "debug", skip_all, fields(commit = commit))]
    pub(crate) async fn end_scope(&self, commit: bool) -> DbResult<()> {
        self.run_deferred().await;
        self.leave_scope(commit).await
    }

    /// Executes a cursor statement.
    pub(crate) async fn execute(&self, sql: &str, op: CursorOp) -> DbResult<()> {
        self.run_deferred().await;
        self.raw_execute(sql, op).await
    }

    /// Fetches the next rows of a cursor.
    pub(crate) async fn fetch(
        &self,
        cursor: &CursorName,
        max_rows: Option<NonZeroU32>,
    ) -> DbResult<Vec<Row>> {
        self.run_deferred().await;
        self.conn
            .fetch_rows(cursor, max_rows)
            .await
            .map_err(|source| Error::io(CursorOp::Fetch, source))
    }

    /// Queues a cleanup for the next command.
    pub(crate) fn defer(&self, cleanup: Deferred) {
        self.lock_deferred().push(cleanup);
    }

    async fn leave_scope(&self, commit: bool) -> DbResult<()> {
        let Ok(prev) = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
        else {
            warn!("transaction scope ended while none was open");
            return Ok(());
        };
        if prev != 1 {
            return Ok(());
        }
        if commit {
            self.raw_execute("COMMIT", CursorOp::Commit).await
        } else {
            self.raw_execute("ROLLBACK", CursorOp::Rollback).await
        }
    }

    /// Best-effort version of [`Session::flush_deferred`].
    async fn run_deferred(&self) {
        if self.pending_cleanups() == 0 {
            return;
        }
        // Failures are already logged.
        let _ = self.flush_deferred().await;
    }

    async fn raw_execute(&self, sql: &str, op: CursorOp) -> DbResult<()> {
        self.conn
            .execute(sql)
            .await
            .map_err(|source| Error::io(op, source))
    }

    fn lock_deferred(&self) -> MutexGuard<'_, Vec<Deferred>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Connection> Drop for Session<C> {
    fn drop(&mut self) {
        let pending = self.lock_deferred().len();
        if pending > 0 {
            warn!(pending, "session dropped with pending cursor cleanups");
        }
    }
}

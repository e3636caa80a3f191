use std::{
    collections::VecDeque,
    fmt,
    num::{NonZeroU32, NonZeroUsize},
};

use futures_util::stream::{self, Stream};
use tracing::{debug, instrument, trace, warn};

use crate::{
    config::{StreamOpts, CURSOR_NAME_PREFIX, IDENTIFIER_SIZE},
    conn::Connection,
    error::{CursorOp, DbResult, Error},
    join::Graph,
    query::{quote_ident, Materialized},
    regroup::Regrouper,
    row::Row,
    session::{Deferred, Session},
    value::Value,
};

/// The name of a server-side cursor.
///
/// It is always rendered as a quoted identifier, so caller-supplied names are
/// declared verbatim.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CursorName {
    name: String,
    quoted: String,
}

impl CursorName {
    /// Validates a caller-supplied cursor name.
    pub fn new(name: impl Into<String>) -> DbResult<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > IDENTIFIER_SIZE || name.contains('\0') {
            return Err(Error::InvalidCursorName(name));
        }
        let quoted = quote_ident(&name);
        Ok(CursorName { name, quoted })
    }

    /// Generates a name with a random suffix.
    ///
    /// Suffixes are random rather than sequential so that nested cursors,
    /// possibly opened by independent code, don't clash. Uniqueness isn't
    /// checked: it is only as likely as two equal random 64-bit numbers.
    pub fn generate() -> Self {
        let name = format!("{CURSOR_NAME_PREFIX}{:016x}", rand::random::<u64>());
        let quoted = quote_ident(&name);
        CursorName { name, quoted }
    }

    /// Returns the unquoted name.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Returns the name as a quoted SQL identifier.
    pub fn quoted(&self) -> &str {
        &self.quoted
    }
}

impl fmt::Display for CursorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.quoted)
    }
}

impl fmt::Debug for CursorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.name, f)
    }
}

/// An element yielded by a [`CursorStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// A flat row of a query without eager-loaded associations.
    Row(Row),
    /// A parent with its eager-loaded children.
    Graph(Graph),
}

impl Unit {
    /// Returns the row, or the parent row of a graph.
    pub fn row(&self) -> &Row {
        match self {
            Unit::Row(row) => row,
            Unit::Graph(graph) => &graph.parent,
        }
    }

    /// Returns the value of a column of [`Unit::row`].
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row().get(column)
    }

    pub fn as_graph(&self) -> Option<&Graph> {
        match self {
            Unit::Row(_) => None,
            Unit::Graph(graph) => Some(graph),
        }
    }
}

/// How fetched rows become units; fixed when the stream is opened.
enum Mode {
    Flat,
    Grouped(Regrouper),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Open,
    Closed,
}

/// A forward-only, single-pass stream over a server-side cursor.
///
/// The cursor is declared on [`open`](CursorStream::open) and fetched lazily,
/// `batch_size` rows per round trip, as units are requested with
/// [`next`](CursorStream::next). It is closed, and its transaction scope
/// ended, when the rows are exhausted, when an error occurs, on
/// [`close`](CursorStream::close), or, deferred to the session's next
/// command, when the stream is dropped.
pub struct CursorStream<'s, C: Connection> {
    session: &'s Session<C>,
    name: CursorName,
    sql: String,
    batch_size: Option<NonZeroU32>,
    mode: Mode,
    ready: VecDeque<Unit>,
    state: State,
}

impl<'s, C: Connection> CursorStream<'s, C> {
    /// Declares a cursor for the given query inside a (possibly joined)
    /// transaction scope of `session`.
    #[instrument(name = "CursorOpen", level = "debug", skip_all)]
    pub async fn open(
        session: &'s Session<C>,
        query: Materialized,
        opts: StreamOpts,
    ) -> DbResult<CursorStream<'s, C>> {
        let conn = session.connection();
        if !conn.supports_cursors() {
            return Err(Error::UnsupportedBackend(conn.backend_name().to_owned()));
        }

        let name = match opts.cursor_name {
            Some(name) => CursorName::new(name)?,
            None => CursorName::generate(),
        };
        let Materialized { sql, join_plan } = query;
        let mode = match join_plan {
            Some(plan) => Mode::Grouped(Regrouper::new(plan, opts.check_ordering)),
            None => Mode::Flat,
        };

        session.begin_scope().await?;
        let declare = format!("DECLARE {name} NO SCROLL CURSOR FOR {sql}");
        if let Err(error) = session.execute(&declare, CursorOp::Declare).await {
            if let Err(end_error) = session.end_scope(false).await {
                warn!(%end_error, "failed to end transaction scope after declare failure");
            }
            return Err(error);
        }
        debug!(cursor = %name, "declared cursor");

        Ok(CursorStream {
            session,
            name,
            sql,
            batch_size: opts.batch_size,
            mode,
            ready: VecDeque::new(),
            state: State::Open,
        })
    }

    /// Returns the cursor name.
    pub fn name(&self) -> &CursorName {
        &self.name
    }

    /// Returns the query the cursor was declared for.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Checks if the cursor was already closed. A closed stream may still
    /// hold units fetched before closing.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Produces the next unit of the stream, fetching from the cursor when
    /// needed.
    ///
    /// After the stream is exhausted, or after it failed, `None` is returned
    /// forever.
    pub async fn next(&mut self) -> DbResult<Option<Unit>> {
        loop {
            if let Some(unit) = self.ready.pop_front() {
                return Ok(Some(unit));
            }
            if self.state == State::Closed {
                return Ok(None);
            }
            if let Err(error) = self.fill().await {
                self.abort().await;
                return Err(error);
            }
        }
    }

    /// Consumes the whole stream, passing the callback closure for each unit.
    ///
    /// If the callback fails, iteration stops, the cursor is closed (rolling
    /// back an outermost transaction) and the callback error is returned
    /// within `Ok`, even if closing fails.
    pub async fn for_each<E, F>(mut self, mut f: F) -> DbResult<Result<(), E>>
    where
        F: FnMut(Unit) -> Result<(), E>,
    {
        while let Some(unit) = self.next().await? {
            if let error @ Err(_) = f(unit) {
                self.stop().await;
                return Ok(error);
            }
        }
        Ok(Ok(()))
    }

    /// Consumes the whole stream, passing the callback closure batches of up
    /// to `size` units. Only the last batch may be shorter. This is unrelated
    /// to the number of rows fetched per round trip.
    pub async fn for_each_batch<E, F>(
        mut self,
        size: NonZeroUsize,
        mut f: F,
    ) -> DbResult<Result<(), E>>
    where
        F: FnMut(Vec<Unit>) -> Result<(), E>,
    {
        let mut batch = Vec::with_capacity(size.get());
        while let Some(unit) = self.next().await? {
            batch.push(unit);
            if batch.len() == size.get() {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(size.get()));
                if let error @ Err(_) = f(full) {
                    self.stop().await;
                    return Ok(error);
                }
            }
        }
        if batch.is_empty() {
            Ok(Ok(()))
        } else {
            Ok(f(batch))
        }
    }

    /// Collects the remaining units.
    pub async fn collect(mut self) -> DbResult<Vec<Unit>> {
        let mut units = Vec::new();
        while let Some(unit) = self.next().await? {
            units.push(unit);
        }
        Ok(units)
    }

    /// Converts this cursor into a [`Stream`] of units.
    pub fn into_stream(self) -> impl Stream<Item = DbResult<Unit>> + 's {
        stream::try_unfold(self, |mut cursor| async move {
            let unit = cursor.next().await?;
            Ok::<_, Error>(unit.map(|unit| (unit, cursor)))
        })
    }

    /// Closes the cursor and ends its transaction scope, discarding units
    /// not consumed yet. Closing an already closed stream does nothing.
    pub async fn close(&mut self) -> DbResult<()> {
        self.ready.clear();
        self.shutdown(true).await
    }

    /// Fetches the next batch and turns it into ready units.
    async fn fill(&mut self) -> DbResult<()> {
        let rows = self.fetch().await?;

        if rows.is_empty() {
            if let Mode::Grouped(regrouper) = &mut self.mode {
                self.ready.extend(regrouper.finish()?.map(Unit::Graph));
            }
            trace!(cursor = %self.name, "cursor exhausted");
            return self.shutdown(true).await;
        }

        match &mut self.mode {
            Mode::Flat => self.ready.extend(rows.into_iter().map(Unit::Row)),
            Mode::Grouped(regrouper) => {
                let mut graphs = Vec::new();
                regrouper.push_batch(rows, &mut graphs)?;
                self.ready.extend(graphs.into_iter().map(Unit::Graph));
                trace!(
                    ready = self.ready.len(),
                    pending = regrouper.pending_rows(),
                    remembered = regrouper.remembered_keys(),
                    "regrouped batch"
                );
            }
        }
        Ok(())
    }

    #[instrument(name = "CursorFetch", level = "debug", skip_all, fields(cursor = %self.name))]
    async fn fetch(&self) -> DbResult<Vec<Row>> {
        let rows = self.session.fetch(&self.name, self.batch_size).await?;
        trace!(count = rows.len(), "fetched rows");
        Ok(rows)
    }

    /// Closes the cursor and ends the transaction scope, once.
    ///
    /// The scope is ended even if `CLOSE` fails, in which case it is rolled
    /// back.
    #[instrument(name = "CursorClose", level = "debug", skip_all, fields(cursor = %self.name))]
    async fn shutdown(&mut self, commit: bool) -> DbResult<()> {
        if self.state == State::Closed {
            return Ok(());
        }
        self.state = State::Closed;

        let close = format!("CLOSE {}", self.name);
        let closed = self.session.execute(&close, CursorOp::Close).await;
        let ended = self.session.end_scope(commit && closed.is_ok()).await;
        closed.and(ended)
    }

    /// Closes the cursor on a visitor's request, rolling back an outermost
    /// transaction. Cleanup failures are only logged, so the visitor error
    /// is what the caller sees.
    async fn stop(&mut self) {
        if let Err(error) = self.shutdown(false).await {
            warn!(cursor = %self.name, %error, "failed to close cursor after early break");
        }
    }

    /// Best-effort cleanup after a failure. The stream is exhausted afterwards.
    async fn abort(&mut self) {
        self.ready.clear();
        if let Err(error) = self.shutdown(false).await {
            warn!(cursor = %self.name, %error, "failed to close cursor after error");
        }
    }
}

impl<C: Connection> fmt::Debug for CursorStream<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorStream")
            .field("cursor_name", &self.name.as_str())
            .field("query", &self.sql)
            .finish()
    }
}

impl<C: Connection> Drop for CursorStream<'_, C> {
    fn drop(&mut self) {
        if self.state == State::Open {
            debug!(cursor = %self.name, "stream dropped while open; deferring close");
            self.session.defer(Deferred::Close(self.name.clone()));
            self.session.defer(Deferred::EndScope);
        }
    }
}

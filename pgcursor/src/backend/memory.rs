//! An in-process [`Connection`] that serves canned result sets.
//!
//! Queries aren't evaluated: each query text is registered along with the
//! rows it yields. The connection then emulates the statements a cursor
//! stream issues with the same rules PostgreSQL applies to them:
//!
//! - cursors may only be declared inside a transaction block, and live until
//!   it ends;
//! - declaring a cursor whose name is taken fails;
//! - after a failed statement, the transaction is aborted and only `COMMIT`
//!   or `ROLLBACK` are accepted (both roll it back).
//!
//! Every statement is logged, and fetches can be made to fail, so tests can
//! check what was sent and how failures are cleaned up.

use std::{
    num::NonZeroU32,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::trace;

use crate::{
    config::DEFAULT_BATCH_SIZE,
    conn::{fetch_statement, Connection},
    cursor::CursorName,
    error::BoxError,
    row::Row,
};

/// See the [module docs](self).
pub struct MemoryConnection {
    results: DashMap<String, Arc<[Row]>>,
    cursors: DashMap<String, OpenCursor>,
    supports_cursors: bool,
    in_transaction: AtomicBool,
    aborted: AtomicBool,
    fetches: AtomicUsize,
    fail_fetch_at: Mutex<Option<usize>>,
    fail_prefix: Mutex<Option<String>>,
    log: Mutex<Vec<String>>,
}

struct OpenCursor {
    rows: Arc<[Row]>,
    position: usize,
}

impl MemoryConnection {
    pub fn new() -> Self {
        MemoryConnection {
            results: DashMap::new(),
            cursors: DashMap::new(),
            supports_cursors: true,
            in_transaction: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            fail_fetch_at: Mutex::new(None),
            fail_prefix: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        }
    }

    /// A connection to a backend without server-side cursors.
    pub fn without_cursors() -> Self {
        MemoryConnection {
            supports_cursors: false,
            ..Self::new()
        }
    }

    /// Registers the rows yielded by the given query text.
    pub fn register(&self, sql: impl Into<String>, rows: impl IntoIterator<Item = Row>) {
        self.results.insert(sql.into(), rows.into_iter().collect());
    }

    /// Makes the fetch after the first `successful` ones fail, as if the
    /// connection dropped. Later fetches succeed again.
    pub fn fail_fetch_after(&self, successful: usize) {
        let at = self.fetches.load(Ordering::Acquire) + successful;
        *lock(&self.fail_fetch_at) = Some(at);
    }

    /// Makes every later statement starting with `prefix` (e.g., `CLOSE`)
    /// fail. Fetches aren't affected.
    pub fn fail_statements_starting_with(&self, prefix: impl Into<String>) {
        *lock(&self.fail_prefix) = Some(prefix.into());
    }

    /// Returns every statement received so far, fetches included.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    /// Returns the statements received so far that start with `prefix`.
    pub fn statements_starting_with(&self, prefix: &str) -> Vec<String> {
        lock(&self.log)
            .iter()
            .filter(|sql| sql.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Returns the names of the open cursors, sorted.
    pub fn open_cursors(&self) -> Vec<String> {
        let mut names: Vec<_> = self.cursors.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    fn record(&self, sql: &str) {
        trace!(sql, "memory backend statement");
        lock(&self.log).push(sql.to_owned());
    }

    /// Fails if the current transaction was aborted by a previous error.
    fn check_not_aborted(&self) -> Result<(), BoxError> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(
                "current transaction is aborted, commands ignored until end of transaction block"
                    .into(),
            );
        }
        Ok(())
    }

    fn end_transaction(&self) {
        self.in_transaction.store(false, Ordering::Release);
        self.aborted.store(false, Ordering::Release);
        self.cursors.clear();
    }

    fn run(&self, sql: &str) -> Result<(), BoxError> {
        if let Some(prefix) = &*lock(&self.fail_prefix) {
            if sql.starts_with(prefix.as_str()) {
                return Err(format!("`{sql}` failed: server closed the connection").into());
            }
        }

        match sql {
            "BEGIN" => {
                // PostgreSQL only warns about nested `BEGIN`s.
                self.in_transaction.store(true, Ordering::Release);
                Ok(())
            }
            "COMMIT" | "ROLLBACK" => {
                self.end_transaction();
                Ok(())
            }
            _ => {
                self.check_not_aborted()?;
                if let Some(rest) = sql.strip_prefix("DECLARE ") {
                    self.declare(rest)
                } else if let Some(rest) = sql.strip_prefix("CLOSE ") {
                    let (name, _) = parse_ident(rest).ok_or("invalid cursor name")?;
                    self.cursors
                        .remove(&name)
                        .map(drop)
                        .ok_or_else(|| format!(r#"cursor "{name}" does not exist"#).into())
                } else {
                    Err(format!("unsupported statement `{sql}`").into())
                }
            }
        }
    }

    fn declare(&self, rest: &str) -> Result<(), BoxError> {
        let (name, rest) = parse_ident(rest).ok_or("invalid cursor name")?;
        let query = rest
            .trim_start()
            .strip_prefix("NO SCROLL ")
            .unwrap_or(rest.trim_start())
            .strip_prefix("CURSOR FOR ")
            .ok_or("syntax error in DECLARE")?;

        if !self.in_transaction() {
            return Err("DECLARE CURSOR can only be used in transaction blocks".into());
        }
        let rows = self
            .results
            .get(query)
            .map(|rows| Arc::clone(rows.value()))
            .ok_or_else(|| format!("no result set registered for `{query}`"))?;

        match self.cursors.entry(name) {
            Entry::Occupied(entry) => {
                Err(format!(r#"cursor "{}" already exists"#, entry.key()).into())
            }
            Entry::Vacant(entry) => {
                entry.insert(OpenCursor { rows, position: 0 });
                Ok(())
            }
        }
    }

    fn fetch(
        &self,
        cursor: &CursorName,
        max_rows: Option<NonZeroU32>,
    ) -> Result<Vec<Row>, BoxError> {
        self.check_not_aborted()?;

        let n = self.fetches.fetch_add(1, Ordering::AcqRel);
        if *lock(&self.fail_fetch_at) == Some(n) {
            return Err("connection reset by peer".into());
        }

        let mut open = self
            .cursors
            .get_mut(cursor.as_str())
            .ok_or_else(|| format!(r#"cursor "{}" does not exist"#, cursor.as_str()))?;
        let count = max_rows.unwrap_or(DEFAULT_BATCH_SIZE).get() as usize;
        let start = open.position;
        let end = (start + count).min(open.rows.len());
        open.position = end;
        Ok(open.rows[start..end].to_vec())
    }

    /// A failure inside a transaction aborts it.
    fn track<T>(&self, result: Result<T, BoxError>) -> Result<T, BoxError> {
        if result.is_err() && self.in_transaction() {
            self.aborted.store(true, Ordering::Release);
        }
        result
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn backend_name(&self) -> &str {
        if self.supports_cursors {
            "memory"
        } else {
            "memory (without cursors)"
        }
    }

    fn supports_cursors(&self) -> bool {
        self.supports_cursors
    }

    async fn execute(&self, sql: &str) -> Result<(), BoxError> {
        self.record(sql);
        self.track(self.run(sql))
    }

    async fn fetch_rows(
        &self,
        cursor: &CursorName,
        max_rows: Option<NonZeroU32>,
    ) -> Result<Vec<Row>, BoxError> {
        self.record(&fetch_statement(cursor, max_rows));
        self.track(self.fetch(cursor, max_rows))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parses a leading, possibly quoted, identifier. Returns the identifier and
/// the remaining input.
fn parse_ident(input: &str) -> Option<(String, &str)> {
    let input = input.trim_start();
    let Some(quoted) = input.strip_prefix('"') else {
        let end = input.find(char::is_whitespace).unwrap_or(input.len());
        return (end > 0).then(|| (input[..end].to_lowercase(), &input[end..]));
    };

    let mut ident = String::new();
    let mut chars = quoted.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '"' {
            ident.push(c);
            continue;
        }
        if let Some((_, '"')) = chars.peek() {
            ident.push('"');
            chars.next();
            continue;
        }
        return Some((ident, &quoted[i + 1..]));
    }
    None
}

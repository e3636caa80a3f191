use std::fmt;

use crate::value::Value;

/// A flat result row that maps column names to database values ([`Value`]).
///
/// Columns keep the order in which the database returned them. Lookups are
/// linear, which is fine for the handful of columns a row usually has.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Row {
    inner: Vec<(String, Value)>,
}

impl Row {
    /// Constructs a new empty row.
    pub fn new() -> Row {
        Row { inner: Vec::new() }
    }

    /// Constructs a new empty row with room for `cap` columns.
    pub fn with_capacity(cap: usize) -> Row {
        Row {
            inner: Vec::with_capacity(cap),
        }
    }

    /// Returns a reference to the value of the given column.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inner
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, value)| value)
    }

    /// Sets a value, replacing the previous one for the same column.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.inner.iter_mut().find(|(col, _)| *col == name) {
            Some((_, slot)) => *slot = value,
            None => self.inner.push((name, value)),
        }
    }

    /// Returns an iterator over the column names.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.inner.iter().map(|(col, _)| col.as_str())
    }

    /// Returns an iterator over the `(column, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.inner.iter().map(|(col, value)| (col.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (name, value) in iter {
            row.set(name, value);
        }
        row
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

/// Builds a [`Row`] from `column => value` pairs.
///
/// ```
/// let row = pgcursor::row! { "id" => 1, "name" => "one" };
/// assert_eq!(row.get("name").and_then(|v| v.as_text()), Some("one"));
/// ```
#[macro_export]
macro_rules! row {
    ($($name:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut row = $crate::row::Row::new();
        $(row.set($name, $crate::value::Value::from($value));)*
        row
    }};
}

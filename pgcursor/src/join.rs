use std::{collections::HashSet, fmt, sync::Arc};

use crate::{
    error::{DbResult, Error},
    row::Row,
    value::Value,
};

/// Builds one parent object graph out of the flat joined rows that belong to
/// the same parent.
///
/// This is the object-instantiation capability of the mapping layer. Rows are
/// handed over in the order the database returned them, and the group is
/// never empty.
pub trait Assemble: Send + Sync {
    fn assemble(&self, rows: Vec<Row>) -> DbResult<Graph>;
}

impl<F> Assemble for F
where
    F: Send + Sync + Fn(Vec<Row>) -> DbResult<Graph>,
{
    fn assemble(&self, rows: Vec<Row>) -> DbResult<Graph> {
        self(rows)
    }
}

/// A parent row with its eager-loaded children, grouped by association name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph {
    pub parent: Row,
    pub children: Vec<(String, Vec<Row>)>,
}

impl Graph {
    pub fn new(parent: Row) -> Self {
        Graph {
            parent,
            children: Vec::new(),
        }
    }

    /// Returns the children loaded for the given association. An association
    /// that was not loaded has no children.
    pub fn children(&self, association: &str) -> &[Row] {
        self.children
            .iter()
            .find(|(name, _)| name == association)
            .map_or(&[], |(_, rows)| rows.as_slice())
    }
}

/// Describes how to regroup flat joined rows into parent graphs.
#[derive(Clone)]
pub struct JoinPlan {
    key_column: String,
    assembler: Arc<dyn Assemble>,
}

impl JoinPlan {
    /// Creates a plan whose parent identity lives in `key_column`.
    pub fn new(key_column: impl Into<String>, assembler: impl Assemble + 'static) -> Self {
        JoinPlan {
            key_column: key_column.into(),
            assembler: Arc::new(assembler),
        }
    }

    /// The (possibly aliased) column holding the parent primary key.
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Returns the parent identity key of a joined row.
    pub fn key_of<'r>(&self, row: &'r Row) -> DbResult<&'r Value> {
        match row.get(&self.key_column) {
            None => Err(Error::MissingColumn(self.key_column.clone())),
            Some(Value::Null) => Err(Error::NullParentKey(self.key_column.clone())),
            Some(key) => Ok(key),
        }
    }

    pub fn assemble(&self, rows: Vec<Row>) -> DbResult<Graph> {
        self.assembler.assemble(rows)
    }
}

impl fmt::Debug for JoinPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinPlan")
            .field("key_column", &self.key_column)
            .finish_non_exhaustive()
    }
}

/// Maps the `t<i>_r<j>` aliases of one joined table back to column names.
#[derive(Debug, Clone)]
pub(crate) struct TableAliases {
    /// `(alias, column)` pairs, in schema order.
    pub columns: Vec<(String, String)>,
    /// Alias of the primary key column.
    pub primary_key: String,
}

impl TableAliases {
    /// Extracts this table's columns out of a joined row.
    fn extract(&self, row: &Row) -> DbResult<Row> {
        let mut out = Row::with_capacity(self.columns.len());
        for (alias, column) in &self.columns {
            let value = row
                .get(alias)
                .ok_or_else(|| Error::MissingColumn(alias.clone()))?;
            out.set(column.as_str(), value.clone());
        }
        Ok(out)
    }
}

/// The assembler produced for eager-loading selects. It rebuilds the parent
/// from its aliased columns and, for each association, one child per distinct
/// non-null child primary key.
#[derive(Debug, Clone)]
pub(crate) struct AliasAssembler {
    pub parent: TableAliases,
    pub associations: Vec<(String, TableAliases)>,
}

impl Assemble for AliasAssembler {
    fn assemble(&self, rows: Vec<Row>) -> DbResult<Graph> {
        let first = rows
            .first()
            .ok_or_else(|| Error::Assembly("empty row group".into()))?;
        let mut graph = Graph::new(self.parent.extract(first)?);

        for (name, aliases) in &self.associations {
            let mut seen = HashSet::new();
            let mut children = Vec::new();
            for row in &rows {
                // Outer joins yield a NULL key for parents without children.
                match row.get(&aliases.primary_key) {
                    None => return Err(Error::MissingColumn(aliases.primary_key.clone())),
                    Some(Value::Null) => continue,
                    Some(key) => {
                        // Several associations multiply the joined rows.
                        if seen.insert(key.clone()) {
                            children.push(aliases.extract(row)?);
                        }
                    }
                }
            }
            graph.children.push((name.clone(), children));
        }

        Ok(graph)
    }
}

//! Turns query descriptors into the SQL text a cursor is declared for.

use std::fmt::Write;

use crate::{
    error::{DbResult, Error},
    join::{AliasAssembler, JoinPlan, TableAliases},
};

/// A query ready to be declared as a cursor.
#[derive(Debug, Clone)]
pub struct Materialized {
    pub sql: String,
    /// Present when the query eager-loads associations, in which case the
    /// flat rows must be regrouped into parent graphs.
    pub join_plan: Option<JoinPlan>,
}

impl Materialized {
    /// A query whose rows are streamed as they are.
    pub fn raw(sql: impl Into<String>) -> Self {
        Materialized {
            sql: sql.into(),
            join_plan: None,
        }
    }

    /// A joined query whose rows are regrouped with `plan`. The query must
    /// order the rows so that those of the same parent are contiguous.
    pub fn joined(sql: impl Into<String>, plan: JoinPlan) -> Self {
        Materialized {
            sql: sql.into(),
            join_plan: Some(plan),
        }
    }
}

/// Produces the executable query (and its join plan, if any) out of a query
/// description.
pub trait Materialize {
    fn materialize(&self) -> DbResult<Materialized>;
}

impl Materialize for str {
    fn materialize(&self) -> DbResult<Materialized> {
        Ok(Materialized::raw(self))
    }
}

impl Materialize for String {
    fn materialize(&self) -> DbResult<Materialized> {
        self.as_str().materialize()
    }
}

impl Materialize for Materialized {
    fn materialize(&self) -> DbResult<Materialized> {
        Ok(self.clone())
    }
}

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for c in ident.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// A table definition, as known by the mapping layer.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: String,
    /// The table columns, in definition order.
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn new<I, S>(name: impl Into<String>, primary_key: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TableSchema {
            name: name.into(),
            primary_key: primary_key.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Checks if the schema contains the given column.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|col| col == name)
    }

    fn validate(&self) -> DbResult<()> {
        if !self.has_column(&self.primary_key) {
            return Err(Error::Query(format!(
                "primary key `{}` is not a column of table `{}`",
                self.primary_key, self.name
            )));
        }
        Ok(())
    }

    /// Returns the qualified and quoted column reference.
    fn column_ref(&self, column: &str) -> String {
        format!("{}.{}", quote_ident(&self.name), quote_ident(column))
    }
}

/// A one-to-many association from a parent table to `table`, whose
/// `foreign_key` column references the parent primary key.
#[derive(Debug, Clone)]
pub struct Association {
    pub name: String,
    pub table: TableSchema,
    pub foreign_key: String,
}

impl Association {
    pub fn has_many(
        name: impl Into<String>,
        table: TableSchema,
        foreign_key: impl Into<String>,
    ) -> Self {
        Association {
            name: name.into(),
            table,
            foreign_key: foreign_key.into(),
        }
    }
}

/// A declarative select over one table, optionally eager-loading
/// associations.
///
/// Filter and ordering expressions are raw SQL fragments; it's up to the
/// caller to keep them free from SQL injection.
#[derive(Debug, Clone)]
pub struct Select {
    table: TableSchema,
    filter: Option<String>,
    order_by: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    includes: Vec<Association>,
}

impl Select {
    pub fn new(table: TableSchema) -> Self {
        Select {
            table,
            filter: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            includes: Vec::new(),
        }
    }

    /// Adds a predicate. Several predicates are joined with `AND`.
    pub fn where_(mut self, predicate: impl Into<String>) -> Self {
        let predicate = predicate.into();
        self.filter = Some(match self.filter.take() {
            Some(prev) => format!("({prev}) AND ({predicate})"),
            None => predicate,
        });
        self
    }

    pub fn order_by(mut self, expr: impl Into<String>) -> Self {
        self.order_by.push(expr.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Eager-loads the given association in the same query.
    pub fn include(mut self, association: Association) -> Self {
        self.includes.push(association);
        self
    }

    fn render_flat(&self) -> String {
        let mut sql = format!("SELECT * FROM {}", quote_ident(&self.table.name));
        self.render_tail(&mut sql, &self.order_by);
        sql
    }

    fn render_joined(&self) -> DbResult<Materialized> {
        for (i, assoc) in self.includes.iter().enumerate() {
            assoc.table.validate()?;
            if !assoc.table.has_column(&assoc.foreign_key) {
                return Err(Error::Query(format!(
                    "foreign key `{}` is not a column of table `{}`",
                    assoc.foreign_key, assoc.table.name
                )));
            }
            if self.includes[..i].iter().any(|prev| prev.name == assoc.name) {
                return Err(Error::Query(format!(
                    "association `{}` included twice",
                    assoc.name
                )));
            }
        }

        let parent = aliases_for(0, &self.table);
        let associations: Vec<_> = self
            .includes
            .iter()
            .enumerate()
            .map(|(i, assoc)| (assoc.name.clone(), aliases_for(i + 1, &assoc.table)))
            .collect();

        let mut selected = Vec::new();
        let joined = self.includes.iter().zip(&associations);
        let tables = std::iter::once((&self.table, &parent))
            .chain(joined.map(|(assoc, (_, aliases))| (&assoc.table, aliases)));
        for (table, aliases) in tables {
            for (alias, column) in &aliases.columns {
                selected.push(format!("{} AS {alias}", table.column_ref(column)));
            }
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            selected.join(", "),
            quote_ident(&self.table.name)
        );
        for assoc in &self.includes {
            let _ = write!(
                sql,
                " LEFT OUTER JOIN {} ON {} = {}",
                quote_ident(&assoc.table.name),
                assoc.table.column_ref(&assoc.foreign_key),
                self.table.column_ref(&self.table.primary_key),
            );
        }

        // Rows of the same parent must be contiguous for regrouping.
        let default_order = [self.table.column_ref(&self.table.primary_key)];
        let order_by = if self.order_by.is_empty() {
            &default_order[..]
        } else {
            &self.order_by[..]
        };

        if self.limit.is_some() || self.offset.is_some() {
            // A limit counts parents, not joined rows, so it is applied to
            // the parent keys in a subquery.
            let pk = self.table.column_ref(&self.table.primary_key);
            let mut sub = format!("SELECT {pk} FROM {}", quote_ident(&self.table.name));
            self.render_tail(&mut sub, order_by);
            let _ = write!(sql, " WHERE {pk} IN ({sub})");
            if let Some(filter) = &self.filter {
                let _ = write!(sql, " AND ({filter})");
            }
        } else if let Some(filter) = &self.filter {
            let _ = write!(sql, " WHERE {filter}");
        }
        let _ = write!(sql, " ORDER BY {}", order_by.join(", "));

        let plan = JoinPlan::new(
            parent.primary_key.clone(),
            AliasAssembler {
                parent,
                associations,
            },
        );
        Ok(Materialized::joined(sql, plan))
    }

    /// Appends the `WHERE`, `ORDER BY`, `LIMIT` and `OFFSET` clauses.
    fn render_tail(&self, sql: &mut String, order_by: &[String]) {
        if let Some(filter) = &self.filter {
            let _ = write!(sql, " WHERE {filter}");
        }
        if !order_by.is_empty() {
            let _ = write!(sql, " ORDER BY {}", order_by.join(", "));
        }
        if let Some(limit) = self.limit {
            let _ = write!(sql, " LIMIT {limit}");
        }
        if let Some(offset) = self.offset {
            let _ = write!(sql, " OFFSET {offset}");
        }
    }
}

impl Materialize for Select {
    fn materialize(&self) -> DbResult<Materialized> {
        self.table.validate()?;
        if self.includes.is_empty() {
            Ok(Materialized::raw(self.render_flat()))
        } else {
            self.render_joined()
        }
    }
}

/// Assigns the `t<table>_r<column>` aliases used by eager-loading selects.
fn aliases_for(table_index: usize, table: &TableSchema) -> TableAliases {
    let alias = |j: usize| format!("t{table_index}_r{j}");
    let columns: Vec<_> = table
        .columns
        .iter()
        .enumerate()
        .map(|(j, column)| (alias(j), column.clone()))
        .collect();
    let primary_key = columns
        .iter()
        .find(|(_, column)| *column == table.primary_key)
        .map(|(alias, _)| alias.clone())
        .unwrap_or_default();
    TableAliases {
        columns,
        primary_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foos() -> TableSchema {
        TableSchema::new("foos", "id", ["id", "name"])
    }

    fn bars() -> Association {
        Association::has_many(
            "bars",
            TableSchema::new("bars", "id", ["id", "name", "foo_id"]),
            "foo_id",
        )
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("my_cursor"), r#""my_cursor""#);
        assert_eq!(quote_ident(r#"my"cursor"#), r#""my""cursor""#);
    }

    #[test]
    fn test_flat_select() {
        let query = Select::new(foos())
            .where_("id >= 3")
            .order_by("id")
            .limit(2)
            .offset(1)
            .materialize()
            .unwrap();
        assert_eq!(
            query.sql,
            r#"SELECT * FROM "foos" WHERE id >= 3 ORDER BY id LIMIT 2 OFFSET 1"#
        );
        assert!(query.join_plan.is_none());
    }

    #[test]
    fn test_joined_select() {
        let query = Select::new(foos()).include(bars()).materialize().unwrap();
        assert_eq!(
            query.sql,
            concat!(
                r#"SELECT "foos"."id" AS t0_r0, "foos"."name" AS t0_r1, "#,
                r#""bars"."id" AS t1_r0, "bars"."name" AS t1_r1, "bars"."foo_id" AS t1_r2 "#,
                r#"FROM "foos" LEFT OUTER JOIN "bars" ON "bars"."foo_id" = "foos"."id" "#,
                r#"ORDER BY "foos"."id""#,
            )
        );
        let plan = query.join_plan.expect("joined query has a plan");
        assert_eq!(plan.key_column(), "t0_r0");
    }

    #[test]
    fn test_joined_select_limit_counts_parents() {
        let query = Select::new(foos())
            .include(bars())
            .order_by(r#""foos"."id""#)
            .limit(2)
            .materialize()
            .unwrap();
        assert!(query.sql.ends_with(concat!(
            r#"WHERE "foos"."id" IN (SELECT "foos"."id" FROM "foos" ORDER BY "foos"."id" LIMIT 2) "#,
            r#"ORDER BY "foos"."id""#
        )));
    }

    #[test]
    fn test_invalid_schema() {
        let err = Select::new(TableSchema::new("foos", "pk", ["id"]))
            .materialize()
            .unwrap_err();
        assert!(matches!(err, Error::Query(_)));

        let bad_assoc = Association::has_many("bars", bars().table, "missing");
        let err = Select::new(foos())
            .include(bad_assoc)
            .materialize()
            .unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }
}

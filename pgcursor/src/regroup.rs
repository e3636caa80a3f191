use std::collections::HashSet;

use tracing::trace;

use crate::{
    error::{DbResult, Error},
    join::{Graph, JoinPlan},
    row::Row,
    value::Value,
};

/// Regroups flat joined rows, delivered in arbitrary chunks, into one
/// [`Graph`] per parent.
///
/// Rows of the same parent must arrive contiguously (the query has to be
/// ordered by the parent key). The regrouper never reorders rows; a group is
/// emitted as soon as a row of a different parent shows up, and the trailing
/// group is only emitted by [`Regrouper::finish`]. This way a group whose
/// rows straddle several fetches is still emitted once, complete.
pub struct Regrouper {
    plan: JoinPlan,
    /// The pending group: its key and the rows collected so far.
    pending: Option<(Value, Vec<Row>)>,
    /// Keys of the emitted groups, kept only when checking the ordering.
    emitted: Option<HashSet<Value>>,
}

impl Regrouper {
    /// Creates a new regrouper. With `check_ordering`, a parent key showing up
    /// again after its group was emitted fails with
    /// [`Error::MalformedGroupOrdering`]; without it, such a parent is silently
    /// emitted as several incomplete groups.
    ///
    /// The check remembers the key of every emitted group, so its memory grows
    /// with the number of parents. Without it, memory is bounded by the
    /// largest group.
    pub fn new(plan: JoinPlan, check_ordering: bool) -> Self {
        Regrouper {
            plan,
            pending: None,
            emitted: check_ordering.then(HashSet::new),
        }
    }

    /// Feeds one row, returning the group it completed, if any.
    pub fn push(&mut self, row: Row) -> DbResult<Option<Graph>> {
        let key = self.plan.key_of(&row)?;

        if let Some((current, rows)) = &mut self.pending {
            if current == key {
                rows.push(row);
                return Ok(None);
            }
        }

        if let Some(emitted) = &self.emitted {
            if emitted.contains(key) {
                return Err(Error::MalformedGroupOrdering { key: key.clone() });
            }
        }

        let key = key.clone();
        match self.pending.replace((key, vec![row])) {
            Some((done_key, rows)) => self.complete(done_key, rows).map(Some),
            None => Ok(None),
        }
    }

    /// Feeds a fetched batch, appending the completed groups to `out`.
    pub fn push_batch(
        &mut self,
        rows: impl IntoIterator<Item = Row>,
        out: &mut impl Extend<Graph>,
    ) -> DbResult<()> {
        for row in rows {
            if let Some(graph) = self.push(row)? {
                out.extend(Some(graph));
            }
        }
        Ok(())
    }

    /// Emits the pending group. Must be called once the rows are exhausted.
    pub fn finish(&mut self) -> DbResult<Option<Graph>> {
        match self.pending.take() {
            Some((key, rows)) => self.complete(key, rows).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the number of parent keys remembered by the ordering check.
    /// Without the check, it is always zero and the regrouper only holds the
    /// pending group.
    pub fn remembered_keys(&self) -> usize {
        self.emitted.as_ref().map_or(0, HashSet::len)
    }

    /// Returns the number of rows of the pending group.
    pub fn pending_rows(&self) -> usize {
        self.pending.as_ref().map_or(0, |(_, rows)| rows.len())
    }

    fn complete(&mut self, key: Value, rows: Vec<Row>) -> DbResult<Graph> {
        trace!(%key, rows = rows.len(), "group complete");
        let graph = self.plan.assemble(rows)?;
        if let Some(emitted) = &mut self.emitted {
            emitted.insert(key);
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    /// Assembles the group with the first row as parent and every row as a
    /// child.
    fn plan() -> JoinPlan {
        JoinPlan::new("parent_id", |rows: Vec<Row>| -> DbResult<Graph> {
            let mut graph = Graph::new(rows[0].clone());
            graph.children.push(("rows".into(), rows));
            Ok(graph)
        })
    }

    fn rows(keys: &[i32]) -> Vec<Row> {
        keys.iter()
            .enumerate()
            .map(|(i, key)| row! { "parent_id" => *key, "seq" => i as i32 })
            .collect()
    }

    fn parent_id(graph: &Graph) -> i64 {
        graph.parent.get("parent_id").unwrap().as_int().unwrap()
    }

    #[test]
    fn test_groups_span_chunks() {
        let input = rows(&[1, 1, 1, 2, 3, 3]);
        for chunk in 1..=input.len() + 1 {
            let mut regrouper = Regrouper::new(plan(), true);
            let mut out = Vec::new();
            for batch in input.chunks(chunk) {
                regrouper.push_batch(batch.to_vec(), &mut out).unwrap();
            }
            out.extend(regrouper.finish().unwrap());

            let ids: Vec<_> = out.iter().map(parent_id).collect();
            assert_eq!(ids, [1, 2, 3], "chunk size {chunk}");
            let sizes: Vec<_> = out.iter().map(|g| g.children("rows").len()).collect();
            assert_eq!(sizes, [3, 1, 2], "chunk size {chunk}");
        }
    }

    #[test]
    fn test_trailing_group_waits_for_finish() {
        let mut regrouper = Regrouper::new(plan(), true);
        assert!(regrouper.push(rows(&[7])[0].clone()).unwrap().is_none());
        assert_eq!(regrouper.pending_rows(), 1);
        let graph = regrouper.finish().unwrap().expect("pending group");
        assert_eq!(parent_id(&graph), 7);
        assert!(regrouper.finish().unwrap().is_none());
    }

    #[test]
    fn test_revisited_key() {
        let mut regrouper = Regrouper::new(plan(), true);
        let mut out: Vec<Graph> = Vec::new();
        let err = regrouper
            .push_batch(rows(&[1, 2, 1]), &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedGroupOrdering { key: Value::Int(1) }));

        let mut regrouper = Regrouper::new(plan(), false);
        let mut out = Vec::new();
        regrouper.push_batch(rows(&[1, 2, 1]), &mut out).unwrap();
        out.extend(regrouper.finish().unwrap());
        assert_eq!(out.iter().map(parent_id).collect::<Vec<_>>(), [1, 2, 1]);
    }

    #[test]
    fn test_unchecked_regrouper_remembers_no_keys() {
        let input = rows(&[1, 1, 2, 3, 4, 4]);

        let mut checked = Regrouper::new(plan(), true);
        let mut unchecked = Regrouper::new(plan(), false);
        let mut out: Vec<Graph> = Vec::new();
        checked.push_batch(input.clone(), &mut out).unwrap();
        unchecked.push_batch(input, &mut out).unwrap();

        // The pending group (4) isn't emitted yet.
        assert_eq!(checked.remembered_keys(), 3);
        assert_eq!(unchecked.remembered_keys(), 0);
        assert_eq!(unchecked.pending_rows(), 2);
        assert!(unchecked.finish().unwrap().is_some());
        assert_eq!(unchecked.remembered_keys(), 0);
    }

    #[test]
    fn test_bad_key_column() {
        let mut regrouper = Regrouper::new(plan(), true);
        let err = regrouper.push(row! { "other" => 1 }).unwrap_err();
        assert!(matches!(err, Error::MissingColumn(_)));
        let err = regrouper
            .push(row! { "parent_id" => Value::Null })
            .unwrap_err();
        assert!(matches!(err, Error::NullParentKey(_)));
    }
}

use std::collections::HashSet;

use pgcursor::{value::Value, DbResult, StreamOpts};

mod test_utils;
use test_utils::{bar_ids_of, bars_of_query, fixture_session, foos_query, name_of, FOO_NAMES};

#[tokio::test]
async fn test_cursors_opened_while_iterating_another() -> DbResult<()> {
    test_utils::setup_tracing(None);

    let session = fixture_session();
    let mut outer = session.cursor(&foos_query(), StreamOpts::new()).await?;
    assert_eq!(session.depth(), 1);

    let mut inner_streams = Vec::new();
    let mut names = Vec::new();
    while let Some(foo) = outer.next().await? {
        names.push(name_of(&foo));
        let foo_id = foo.get("id").and_then(Value::as_int).unwrap() as i32;
        let inner = session
            .cursor(&bars_of_query(foo_id), StreamOpts::new())
            .await?;
        assert_eq!(session.depth(), 2 + inner_streams.len() as u32);
        inner_streams.push((foo_id, inner));
    }
    assert_eq!(names, FOO_NAMES);

    // The outer cursor is exhausted, but its transaction is kept for the
    // inner ones.
    assert!(outer.is_closed());
    assert_eq!(session.connection().open_cursors().len(), 5);
    let distinct: HashSet<_> = inner_streams
        .iter()
        .map(|(_, inner)| inner.name().clone())
        .collect();
    assert_eq!(distinct.len(), 5);

    for (foo_id, inner) in inner_streams {
        let bars = inner.collect().await?;
        let ids: Vec<_> = bars
            .iter()
            .map(|bar| bar.get("id").and_then(Value::as_int).unwrap())
            .collect();
        assert_eq!(ids, bar_ids_of(foo_id).map(i64::from));
    }

    let conn = session.connection();
    assert_eq!(conn.statements_starting_with("BEGIN").len(), 1);
    assert_eq!(conn.statements_starting_with("COMMIT").len(), 1);
    assert_eq!(conn.statements_starting_with("DECLARE").len(), 6);
    assert_eq!(conn.statements_starting_with("CLOSE").len(), 6);
    assert_eq!(conn.statements().last().map(String::as_str), Some("COMMIT"));
    assert!(conn.open_cursors().is_empty());
    assert!(!session.in_transaction());
    Ok(())
}

#[tokio::test]
async fn test_inner_cursor_consumed_per_outer_row() -> DbResult<()> {
    let session = fixture_session();
    let mut outer = session.cursor(&foos_query(), StreamOpts::new()).await?;

    let mut pairs = Vec::new();
    while let Some(foo) = outer.next().await? {
        let foo_id = foo.get("id").and_then(Value::as_int).unwrap() as i32;
        let mut inner = session
            .cursor(&bars_of_query(foo_id), StreamOpts::new().cursor_name("bars"))
            .await?;
        assert_eq!(session.depth(), 2);
        while let Some(bar) = inner.next().await? {
            pairs.push((name_of(&foo), name_of(&bar)));
        }
        // The inner scope ended without ending the transaction.
        assert_eq!(session.depth(), 1);
    }

    assert_eq!(pairs.len(), 10);
    assert_eq!(pairs[0], ("one".to_owned(), "six".to_owned()));
    assert_eq!(pairs[9], ("five".to_owned(), "fifteen".to_owned()));
    let conn = session.connection();
    assert_eq!(conn.statements_starting_with("BEGIN").len(), 1);
    assert_eq!(conn.statements_starting_with("COMMIT").len(), 1);
    assert!(!session.in_transaction());
    Ok(())
}

#[tokio::test]
async fn test_inner_failure_rolls_back_only_at_the_outermost_scope() -> DbResult<()> {
    let session = fixture_session();
    let mut outer = session.cursor(&foos_query(), StreamOpts::new()).await?;
    let first = outer.next().await?.expect("first foo");
    assert_eq!(name_of(&first), "one");

    // An inner visitor failure closes the inner cursor only.
    let outcome = session
        .for_each(&bars_of_query(1), StreamOpts::new(), |_| Err("stop"))
        .await?;
    assert_eq!(outcome, Err("stop"));
    assert_eq!(session.depth(), 1);
    assert!(session.connection().statements_starting_with("ROLLBACK").is_empty());

    let rest = outer.collect().await?;
    assert_eq!(rest.len(), 4);
    assert_eq!(
        session.connection().statements().last().map(String::as_str),
        Some("COMMIT")
    );
    Ok(())
}

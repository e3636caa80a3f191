#![allow(dead_code)]

use pgcursor::{
    backend::memory::MemoryConnection, row, row::Row, value::Value, Association, Materialize,
    Select, Session, TableSchema, Unit,
};

/// Sets up tracing subscriber.
pub fn setup_tracing(level: Option<&str>) {
    use tracing_subscriber::{
        fmt::{format::FmtSpan, layer},
        layer::SubscriberExt,
        util::SubscriberInitExt,
        EnvFilter,
    };

    let filter_layer = level
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or("warn".into()));
    let fmt_layer = layer().with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    // Several tests of the same binary may try to install it.
    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init();
}

pub const FOO_NAMES: [&str; 5] = ["one", "two", "three", "four", "five"];

const BAR_NAMES: [&str; 10] = [
    "six", "seven", "eight", "nine", "ten", "eleven", "twelve", "thirteen", "fourteen", "fifteen",
];

pub fn foos() -> TableSchema {
    TableSchema::new("foos", "id", ["id", "name"])
}

pub fn bars() -> TableSchema {
    TableSchema::new("bars", "id", ["id", "name", "foo_id"])
}

pub fn foo_bars() -> Association {
    Association::has_many("bars", bars(), "foo_id")
}

/// `foos` ordered by id.
pub fn foos_query() -> Select {
    Select::new(foos()).order_by("id")
}

/// `foos` ordered by id, eager-loading their `bars`.
pub fn foos_with_bars_query() -> Select {
    Select::new(foos())
        .include(foo_bars())
        .order_by(r#""foos"."id""#)
}

/// The `bars` of the given foo, ordered by id.
pub fn bars_of_query(foo_id: i32) -> Select {
    Select::new(bars())
        .where_(format!(r#""bars"."foo_id" = {foo_id}"#))
        .order_by("id")
}

pub fn foo_row(id: i32) -> Row {
    row! { "id" => id, "name" => FOO_NAMES[id as usize - 1] }
}

pub fn bar_row(id: i32, foo_id: i32) -> Row {
    row! { "id" => id, "name" => BAR_NAMES[id as usize - 1], "foo_id" => foo_id }
}

/// The ids of the two bars of the given foo: `i` and `i + 5`.
pub fn bar_ids_of(foo_id: i32) -> [i32; 2] {
    [foo_id, foo_id + 5]
}

/// A joined row, aliased the way eager-loading selects do.
pub fn joined_row(foo_id: i32, bar_id: Option<i32>) -> Row {
    let bar = bar_id.map(|id| bar_row(id, foo_id));
    let bar_value = |column: &str| bar.as_ref().and_then(|b| b.get(column).cloned());
    row! {
        "t0_r0" => foo_id,
        "t0_r1" => FOO_NAMES[foo_id as usize - 1],
        "t1_r0" => bar_value("id").unwrap_or(Value::Null),
        "t1_r1" => bar_value("name").unwrap_or(Value::Null),
        "t1_r2" => bar_value("foo_id").unwrap_or(Value::Null),
    }
}

/// Registers the `foos`/`bars` fixture: five foos named one to five, each
/// with two bars.
pub fn register_fixture(conn: &MemoryConnection) {
    conn.register(sql_of(&foos_query()), (1..=5).map(foo_row));

    conn.register(
        sql_of(&foos_with_bars_query()),
        (1..=5).flat_map(|foo_id| {
            bar_ids_of(foo_id)
                .into_iter()
                .map(move |bar_id| joined_row(foo_id, Some(bar_id)))
        }),
    );

    for foo_id in 1..=5 {
        conn.register(
            sql_of(&bars_of_query(foo_id)),
            bar_ids_of(foo_id).into_iter().map(|id| bar_row(id, foo_id)),
        );
    }
}

/// Creates a session over an in-memory connection holding the fixture.
pub fn fixture_session() -> Session<MemoryConnection> {
    let conn = MemoryConnection::new();
    register_fixture(&conn);
    Session::new(conn)
}

pub fn sql_of(query: &impl Materialize) -> String {
    query.materialize().expect("fixture query is valid").sql
}

/// Returns the `name` column of a unit.
pub fn name_of(unit: &Unit) -> String {
    unit.get("name")
        .and_then(|name| name.as_text())
        .expect("unit has a name")
        .to_owned()
}

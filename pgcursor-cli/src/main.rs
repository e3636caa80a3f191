use std::{
    collections::HashMap,
    env,
    error::Error as StdError,
    io::{self, Write},
    num::NonZeroU32,
};

use pgcursor::{
    backend::memory::MemoryConnection, join::Graph, row, row::Row, Association, Connection,
    DbResult, Materialize, Materialized, Select, Session, StreamOpts, TableSchema, Unit,
};
use tokio_postgres::NoTls;
use tracing::{info, warn};

const DEFAULT_URL: &str = "host=localhost user=postgres";

#[tokio::main]
async fn main() -> Result<(), Box<dyn StdError>> {
    setup_tracing();

    let mut batch_size = match env::var("PGCURSOR_BATCH") {
        Ok(raw) => Some(raw.parse::<NonZeroU32>()?),
        Err(_) => None,
    };

    if env::args().nth(1).as_deref() == Some("demo") {
        let (session, shortcuts) = demo_session()?;
        println!("In-memory demo. Shortcuts:");
        for (name, query) in &shortcuts {
            println!("  {name:<10} {}", query.sql);
        }
        repl(&session, &shortcuts, &mut batch_size).await;
        return Ok(());
    }

    let url = env::var("PGCURSOR_URL").unwrap_or_else(|_| DEFAULT_URL.into());
    let (client, connection) = tokio_postgres::connect(&url, NoTls).await?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            warn!(%error, "connection closed");
        }
    });
    info!(%url, "connected");

    let session = Session::new(client);
    repl(&session, &HashMap::new(), &mut batch_size).await;
    session.flush_deferred().await?;
    Ok(())
}

/// Reads statements until `\quit` or end of input, streaming each one.
async fn repl<C: Connection>(
    session: &Session<C>,
    shortcuts: &HashMap<String, Materialized>,
    batch_size: &mut Option<NonZeroU32>,
) {
    println!(r"Type a query, `\batch N` or `\quit`.");
    while let Some(line) = input("sql> ") {
        match line.split_whitespace().collect::<Vec<_>>()[..] {
            [] => continue,
            [r"\quit"] => break,
            [r"\batch", n] => match n.parse::<NonZeroU32>() {
                Ok(n) => {
                    *batch_size = Some(n);
                    println!("batch size is now {n}");
                }
                Err(_) => println!("batch size must be a positive integer"),
            },
            _ => {
                let result = match shortcuts.get(line.as_str()) {
                    Some(query) => stream(session, query, *batch_size).await,
                    None => stream(session, line.as_str(), *batch_size).await,
                };
                if let Err(error) = result {
                    println!("error: {error}");
                }
            }
        }
    }
}

/// Streams a query, printing units as they arrive.
async fn stream<C, Q>(
    session: &Session<C>,
    query: &Q,
    batch_size: Option<NonZeroU32>,
) -> DbResult<()>
where
    C: Connection,
    Q: Materialize + ?Sized,
{
    let mut opts = StreamOpts::new();
    if let Some(size) = batch_size {
        opts = opts.batch_size(size);
    }

    let mut stream = session.cursor(query, opts).await?;
    println!("{}", "-".repeat(50));
    let mut count = 0;
    while let Some(unit) = stream.next().await? {
        match &unit {
            Unit::Row(row) => println!("{}", format_row(row)),
            Unit::Graph(graph) => print_graph(graph),
        }
        count += 1;
    }
    println!("{}", "-".repeat(50));
    println!("({count} units)");
    Ok(())
}

fn print_graph(graph: &Graph) {
    println!("{}", format_row(&graph.parent));
    for (association, children) in &graph.children {
        println!("  {association}:");
        for child in children {
            println!("    {}", format_row(child));
        }
    }
}

fn format_row(row: &Row) -> String {
    row.iter()
        .map(|(_, value)| format!("{value:<12}"))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Sets up tracing subscriber.
fn setup_tracing() {
    use tracing_subscriber::{
        fmt::{format::FmtSpan, layer},
        layer::SubscriberExt,
        util::SubscriberInitExt,
        EnvFilter,
    };

    let filter_layer = EnvFilter::try_from_default_env().unwrap_or("warn".into());
    let fmt_layer = layer().with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

/// Gets a line from the stdin, or `None` at end of input.
fn input(prompt: &str) -> Option<String> {
    print!("{prompt}");
    if io::stdout().flush().is_err() {
        return None;
    }
    let mut buf = String::new();
    match io::stdin().read_line(&mut buf) {
        Ok(0) | Err(_) => {
            println!("\nbye");
            None
        }
        Ok(_) => Some(buf.trim().to_owned()),
    }
}

/// Builds an in-memory session holding five `foos`, each with two `bars`,
/// along with shortcuts to stream them.
fn demo_session() -> DbResult<(Session<MemoryConnection>, HashMap<String, Materialized>)> {
    const FOOS: [&str; 5] = ["one", "two", "three", "four", "five"];
    const BARS: [&str; 10] = [
        "six", "seven", "eight", "nine", "ten", "eleven", "twelve", "thirteen", "fourteen",
        "fifteen",
    ];

    let foos = TableSchema::new("foos", "id", ["id", "name"]);
    let bars = TableSchema::new("bars", "id", ["id", "name", "foo_id"]);
    let flat = Select::new(foos.clone()).order_by("id").materialize()?;
    let eager = Select::new(foos)
        .include(Association::has_many("bars", bars, "foo_id"))
        .materialize()?;

    let conn = MemoryConnection::new();
    conn.register(
        flat.sql.as_str(),
        (1..=5).map(|id: i32| row! { "id" => id, "name" => FOOS[id as usize - 1] }),
    );
    conn.register(
        eager.sql.as_str(),
        (1..=5).flat_map(|foo: i32| {
            [foo, foo + 5].map(|bar| {
                row! {
                    "t0_r0" => foo,
                    "t0_r1" => FOOS[foo as usize - 1],
                    "t1_r0" => bar,
                    "t1_r1" => BARS[bar as usize - 1],
                    "t1_r2" => foo,
                }
            })
        }),
    );

    let shortcuts = HashMap::from([("foos".to_owned(), flat), ("foos+bars".to_owned(), eager)]);
    Ok((Session::new(conn), shortcuts))
}

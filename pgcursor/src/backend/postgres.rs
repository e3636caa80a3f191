//! Cursor support for [`tokio_postgres::Client`].
//!
//! Cursors must be declared inside a transaction block. The transaction is
//! driven with plain `BEGIN`/`COMMIT` statements by the
//! [`Session`](crate::session::Session), so the client is only borrowed
//! immutably.
//!
//! Each `FETCH` is prepared first to learn its column types. Fetches whose
//! columns all have a [`Value`] counterpart are decoded from the binary
//! format. Otherwise (e.g., `numeric`, `timestamp` or `uuid` columns) the
//! fetch runs through the simple query protocol: columns with a `Value`
//! counterpart are parsed from their text form, and every other column is
//! kept as [`Value::Text`].

use std::num::NonZeroU32;

use async_trait::async_trait;
use tokio_postgres::{types::Type, Client, SimpleQueryMessage, SimpleQueryRow};
use tracing::trace;

use crate::{
    conn::{fetch_statement, Connection},
    cursor::CursorName,
    error::BoxError,
    row::Row,
    value::Value,
};

#[async_trait]
impl Connection for Client {
    fn backend_name(&self) -> &str {
        "postgresql"
    }

    async fn execute(&self, sql: &str) -> Result<(), BoxError> {
        trace!(sql, "executing");
        self.batch_execute(sql).await?;
        Ok(())
    }

    async fn fetch_rows(
        &self,
        cursor: &CursorName,
        max_rows: Option<NonZeroU32>,
    ) -> Result<Vec<Row>, BoxError> {
        let sql = fetch_statement(cursor, max_rows);
        let statement = self.prepare(&sql).await?;
        let columns = statement.columns();

        if columns.iter().all(|column| Kind::of(column.type_()).is_some()) {
            let rows = self.query(&statement, &[]).await?;
            return rows.iter().map(convert_row).collect();
        }

        trace!(sql, "fetching as text");
        let types: Vec<_> = columns.iter().map(|column| column.type_().clone()).collect();
        let mut out = Vec::new();
        for message in self.simple_query(&sql).await? {
            if let SimpleQueryMessage::Row(row) = message {
                out.push(convert_text_row(&row, &types)?);
            }
        }
        Ok(out)
    }
}

/// The column types with a [`Value`] counterpart.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Bool,
    ShortInt,
    Int,
    BigInt,
    Oid,
    Float,
    Double,
    Text,
    Bytea,
}

impl Kind {
    fn of(ty: &Type) -> Option<Kind> {
        let kind = if *ty == Type::BOOL {
            Kind::Bool
        } else if *ty == Type::INT2 {
            Kind::ShortInt
        } else if *ty == Type::INT4 {
            Kind::Int
        } else if *ty == Type::INT8 {
            Kind::BigInt
        } else if *ty == Type::OID {
            Kind::Oid
        } else if *ty == Type::FLOAT4 {
            Kind::Float
        } else if *ty == Type::FLOAT8 {
            Kind::Double
        } else if [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME, Type::UNKNOWN].contains(ty) {
            Kind::Text
        } else if *ty == Type::BYTEA {
            Kind::Bytea
        } else {
            return None;
        };
        Some(kind)
    }
}

/// Converts a PostgreSQL row in binary format into a [`Row`].
fn convert_row(row: &tokio_postgres::Row) -> Result<Row, BoxError> {
    let mut out = Row::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = match Kind::of(ty) {
            Some(Kind::Bool) => Value::from(row.try_get::<_, Option<bool>>(i)?),
            Some(Kind::ShortInt) => Value::from(row.try_get::<_, Option<i16>>(i)?),
            Some(Kind::Int) => Value::from(row.try_get::<_, Option<i32>>(i)?),
            Some(Kind::BigInt) => Value::from(row.try_get::<_, Option<i64>>(i)?),
            Some(Kind::Oid) => Value::from(row.try_get::<_, Option<u32>>(i)?.map(i64::from)),
            Some(Kind::Float) => Value::from(row.try_get::<_, Option<f32>>(i)?.map(f64::from)),
            Some(Kind::Double) => Value::from(row.try_get::<_, Option<f64>>(i)?),
            Some(Kind::Text) => Value::from(row.try_get::<_, Option<String>>(i)?),
            Some(Kind::Bytea) => Value::from(row.try_get::<_, Option<Vec<u8>>>(i)?),
            None => {
                return Err(format!("unexpected type `{ty}` of column `{}`", column.name()).into())
            }
        };
        out.set(column.name(), value);
    }
    Ok(out)
}

/// Converts a PostgreSQL row in text format into a [`Row`], given the
/// column types of the fetch.
fn convert_text_row(row: &SimpleQueryRow, types: &[Type]) -> Result<Row, BoxError> {
    if row.len() != types.len() {
        return Err(format!(
            "fetch returned {} columns, {} were described",
            row.len(),
            types.len()
        )
        .into());
    }

    let mut out = Row::with_capacity(row.len());
    for (i, (column, ty)) in row.columns().iter().zip(types).enumerate() {
        let value = match row.try_get(i)? {
            None => Value::Null,
            Some(text) => parse_text(Kind::of(ty), text).map_err(|error| {
                format!("invalid `{ty}` value of column `{}`: {error}", column.name())
            })?,
        };
        out.set(column.name(), value);
    }
    Ok(out)
}

/// Parses the text form of a non-null value. Columns without a [`Value`]
/// counterpart are kept as text.
fn parse_text(kind: Option<Kind>, text: &str) -> Result<Value, BoxError> {
    let value = match kind {
        Some(Kind::Bool) => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => return Err(format!("`{text}` is not a boolean").into()),
        },
        Some(Kind::ShortInt) => Value::ShortInt(text.parse()?),
        Some(Kind::Int) => Value::Int(text.parse()?),
        Some(Kind::BigInt) => Value::BigInt(text.parse()?),
        Some(Kind::Oid) => Value::BigInt(i64::from(text.parse::<u32>()?)),
        Some(Kind::Float) => Value::Double(f64::from(text.parse::<f32>()?)),
        Some(Kind::Double) => Value::Double(text.parse()?),
        Some(Kind::Bytea) => Value::Blob(parse_hex_bytea(text)?),
        Some(Kind::Text) | None => Value::Text(text.to_owned()),
    };
    Ok(value)
}

/// Parses the hex output format of `bytea` (`\x` followed by two hex digits
/// per byte).
fn parse_hex_bytea(text: &str) -> Result<Vec<u8>, BoxError> {
    let digits = text
        .strip_prefix("\\x")
        .ok_or("bytea isn't in hex format")?
        .as_bytes();
    if digits.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    digits
        .chunks(2)
        .map(|pair| -> Result<u8, BoxError> {
            let pair = std::str::from_utf8(pair)?;
            Ok(u8::from_str_radix(pair, 16)?)
        })
        .collect()
}

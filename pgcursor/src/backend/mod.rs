//! [`Connection`](crate::conn::Connection) implementations.

pub mod memory;
pub mod postgres;

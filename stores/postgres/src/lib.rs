//! Contains a [`chronicle`] persistence implementation using PostgreSQL
//! as the backend data store, built on `tokio-postgres` with a `bb8`
//! connection pool.

#![deny(unsafe_code, unused_qualifications)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod dialect;
pub mod store;

pub use crate::dialect::{PostgresDialect, SqlDialect};
pub use crate::store::PostgresPersistence;

use tokio_postgres::types::ToSql;

/// Positional parameters for a statement execution.
pub type Params<'a> = &'a [&'a (dyn ToSql + Sync)];

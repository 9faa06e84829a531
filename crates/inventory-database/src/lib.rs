//! SQLite storage layer for the inventory event outbox.
//!
//! This crate provides:
//! - `AsyncDatabase`, an async executor that runs every statement on one
//!   dedicated SQLite thread
//! - Schema migrations for the outbox table and the thin product catalog
//! - Model types for all tables
//! - Standalone query helpers taking a `&Connection`
//!
//! # Transactions
//!
//! `AsyncDatabase::transaction` runs a closure inside a SQLite transaction on
//! the executor thread. The transaction commits only if the closure returns
//! `Ok`; any error rolls back everything the closure wrote.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let row = db
//!     .transaction(|tx| queries::insert_outbox_message(tx, &message))
//!     .await?;
//! ```

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;

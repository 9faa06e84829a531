//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_catalog(conn)?;
    }
    if current_version < 2 {
        migrate_v2_outbox(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: Product catalog (categories, products, product images).
fn migrate_v1_catalog(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: catalog");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category_id INTEGER NOT NULL REFERENCES categories(id),
            name TEXT NOT NULL,
            price REAL NOT NULL,
            description TEXT,
            address TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS product_images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            product_id INTEGER NOT NULL REFERENCES products(id),
            image_url TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id);
        CREATE INDEX IF NOT EXISTS idx_product_images_product ON product_images(product_id);
        "#,
    )?;

    record_migration(conn, 1, "catalog")?;
    Ok(())
}

/// V2: Event outbox with publisher-confirm states.
fn migrate_v2_outbox(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: event outbox");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS outbox_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            payload BLOB NOT NULL,
            sequence_number INTEGER NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending'
                CHECK (state IN ('pending', 'ack_pending', 'ack_completed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            sent_at TEXT,
            acked_at TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_sequence_unique
            ON outbox_messages(sequence_number);
        CREATE INDEX IF NOT EXISTS idx_outbox_state_sequence
            ON outbox_messages(state, sequence_number);

        -- ack_completed is terminal
        CREATE TRIGGER IF NOT EXISTS trg_outbox_completed_is_terminal
        BEFORE UPDATE OF state ON outbox_messages
        WHEN OLD.state = 'ack_completed' AND NEW.state != 'ack_completed'
        BEGIN
            SELECT RAISE(ABORT, 'outbox message already completed');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_outbox_created_at_immutable
        BEFORE UPDATE OF created_at ON outbox_messages
        WHEN OLD.created_at != NEW.created_at
        BEGIN
            SELECT RAISE(ABORT, 'created_at is immutable');
        END;
        "#,
    )?;

    record_migration(conn, 2, "event_outbox")?;
    Ok(())
}

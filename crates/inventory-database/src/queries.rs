//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter, so it can run
//! either directly on the executor connection or inside a `Transaction`
//! (which derefs to `Connection`).

use crate::{
    Category, DatabaseError, DatabaseResult, NewCategory, NewOutboxMessage, NewProduct,
    NewProductImage, OutboxCounts, OutboxMessage, OutboxState, Product, ProductImage,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

// ==========================================
// Categories
// ==========================================

/// Insert a new category.
pub fn insert_category(conn: &Connection, category: &NewCategory) -> DatabaseResult<Category> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO categories (name, created_at) VALUES (?1, ?2)",
        params![category.name, now.to_rfc3339()],
    )
    .map_err(|e| {
        if DatabaseError::is_unique_violation(&e) {
            DatabaseError::Conflict(format!("category '{}' already exists", category.name))
        } else {
            DatabaseError::from(e)
        }
    })?;

    Ok(Category {
        id: conn.last_insert_rowid(),
        name: category.name.clone(),
        created_at: now,
    })
}

/// Get a category by name.
pub fn get_category_by_name(conn: &Connection, name: &str) -> DatabaseResult<Option<Category>> {
    let category = conn
        .query_row(
            "SELECT id, name, created_at FROM categories WHERE name = ?1",
            params![name],
            |row| {
                Ok(Category {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: parse_datetime(row.get::<_, String>(2)?),
                })
            },
        )
        .optional()?;
    Ok(category)
}

// ==========================================
// Products
// ==========================================

const PRODUCT_COLUMNS: &str = "id, category_id, name, price, description, address, created_at";

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        category_id: row.get(1)?,
        name: row.get(2)?,
        price: row.get(3)?,
        description: row.get(4)?,
        address: row.get(5)?,
        created_at: parse_datetime(row.get::<_, String>(6)?),
    })
}

/// Insert a new product.
pub fn insert_product(conn: &Connection, product: &NewProduct) -> DatabaseResult<Product> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO products (category_id, name, price, description, address, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            product.category_id,
            product.name,
            product.price,
            product.description,
            product.address,
            now.to_rfc3339(),
        ],
    )?;

    Ok(Product {
        id: conn.last_insert_rowid(),
        category_id: product.category_id,
        name: product.name.clone(),
        price: product.price,
        description: product.description.clone(),
        address: product.address.clone(),
        created_at: now,
    })
}

/// Get a product by ID.
pub fn get_product(conn: &Connection, id: i64) -> DatabaseResult<Option<Product>> {
    let product = conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
            params![id],
            product_from_row,
        )
        .optional()?;
    Ok(product)
}

/// List products ordered by ID.
pub fn list_products(conn: &Connection, limit: usize) -> DatabaseResult<Vec<Product>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY id ASC LIMIT ?1"
    ))?;
    let products = stmt
        .query_map(params![limit as i64], product_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(products)
}

/// Delete a product row. Returns the number of rows removed.
pub fn delete_product(conn: &Connection, id: i64) -> DatabaseResult<usize> {
    let count = conn.execute("DELETE FROM products WHERE id = ?1", params![id])?;
    Ok(count)
}

// ==========================================
// Product images
// ==========================================

/// Insert an image for an existing product.
pub fn insert_product_image(
    conn: &Connection,
    image: &NewProductImage,
) -> DatabaseResult<ProductImage> {
    if get_product(conn, image.product_id)?.is_none() {
        return Err(DatabaseError::NotFound(format!("product {}", image.product_id)));
    }

    let now = Utc::now();
    conn.execute(
        "INSERT INTO product_images (product_id, image_url, created_at) VALUES (?1, ?2, ?3)",
        params![image.product_id, image.image_url, now.to_rfc3339()],
    )?;

    Ok(ProductImage {
        id: conn.last_insert_rowid(),
        product_id: image.product_id,
        image_url: image.image_url.clone(),
        created_at: now,
    })
}

/// List images for a product.
pub fn list_product_images(conn: &Connection, product_id: i64) -> DatabaseResult<Vec<ProductImage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, product_id, image_url, created_at
         FROM product_images
         WHERE product_id = ?1
         ORDER BY id ASC",
    )?;
    let images = stmt
        .query_map(params![product_id], |row| {
            Ok(ProductImage {
                id: row.get(0)?,
                product_id: row.get(1)?,
                image_url: row.get(2)?,
                created_at: parse_datetime(row.get::<_, String>(3)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(images)
}

/// Delete all images of a product. Returns the number of rows removed.
pub fn delete_product_images(conn: &Connection, product_id: i64) -> DatabaseResult<usize> {
    let count = conn.execute(
        "DELETE FROM product_images WHERE product_id = ?1",
        params![product_id],
    )?;
    Ok(count)
}

// ==========================================
// Outbox
// ==========================================

const OUTBOX_COLUMNS: &str = "id, event_type, payload, sequence_number, state, attempts, last_error, created_at, sent_at, acked_at";

fn outbox_message_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxMessage> {
    Ok(OutboxMessage {
        id: row.get(0)?,
        event_type: row.get(1)?,
        payload: row.get(2)?,
        sequence_number: row.get(3)?,
        state: row.get(4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        created_at: parse_datetime(row.get::<_, String>(7)?),
        sent_at: row.get::<_, Option<String>>(8)?.map(parse_datetime),
        acked_at: row.get::<_, Option<String>>(9)?.map(parse_datetime),
    })
}

/// Insert a new outbox message in `pending` state.
///
/// A reused sequence number fails with `DatabaseError::Conflict`.
pub fn insert_outbox_message(
    conn: &Connection,
    message: &NewOutboxMessage,
) -> DatabaseResult<OutboxMessage> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO outbox_messages (event_type, payload, sequence_number, state, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.event_type,
            message.payload,
            message.sequence_number,
            OutboxState::Pending,
            now.to_rfc3339(),
        ],
    )
    .map_err(|e| {
        if DatabaseError::is_unique_violation(&e) {
            DatabaseError::Conflict(format!(
                "sequence number {} already used",
                message.sequence_number
            ))
        } else {
            DatabaseError::from(e)
        }
    })?;

    debug!(
        sequence = message.sequence_number,
        event_type = %message.event_type,
        "Inserted outbox message"
    );

    Ok(OutboxMessage {
        id: conn.last_insert_rowid(),
        event_type: message.event_type.clone(),
        payload: message.payload.clone(),
        sequence_number: message.sequence_number,
        state: OutboxState::Pending,
        attempts: 0,
        last_error: None,
        created_at: now,
        sent_at: None,
        acked_at: None,
    })
}

/// Get an outbox message by ID.
pub fn get_outbox_message(conn: &Connection, id: i64) -> DatabaseResult<Option<OutboxMessage>> {
    let message = conn
        .query_row(
            &format!("SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE id = ?1"),
            params![id],
            outbox_message_from_row,
        )
        .optional()?;
    Ok(message)
}

/// Get an outbox message by sequence number.
pub fn get_outbox_message_by_sequence(
    conn: &Connection,
    sequence_number: u64,
) -> DatabaseResult<Option<OutboxMessage>> {
    let message = conn
        .query_row(
            &format!("SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE sequence_number = ?1"),
            params![sequence_number],
            outbox_message_from_row,
        )
        .optional()?;
    Ok(message)
}

/// Get pending outbox messages in ascending sequence order.
///
/// With `after = Some(n)` only rows with a sequence number above `n` are
/// returned, which lets callers page through the backlog.
pub fn get_pending_outbox_messages(
    conn: &Connection,
    after: Option<u64>,
    limit: usize,
) -> DatabaseResult<Vec<OutboxMessage>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS}
         FROM outbox_messages
         WHERE state = 'pending' AND sequence_number > ?1
         ORDER BY sequence_number ASC
         LIMIT ?2"
    ))?;

    // Sequence numbers start at 1, so 0 means "from the beginning".
    let after = after.unwrap_or(0);
    let messages = stmt
        .query_map(params![after, limit as i64], outbox_message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(messages)
}

/// Transition a message from `pending` to `ack_pending`.
///
/// Fails with `NotFound` for an unknown ID and `InvalidState` when the row is
/// not currently pending.
pub fn mark_outbox_message_sent(conn: &Connection, id: i64) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE outbox_messages
         SET state = 'ack_pending', attempts = attempts + 1, sent_at = ?1
         WHERE id = ?2 AND state = 'pending'",
        params![now, id],
    )?;

    if updated == 1 {
        return Ok(());
    }

    let actual: Option<OutboxState> = conn
        .query_row(
            "SELECT state FROM outbox_messages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    match actual {
        Some(actual) => Err(DatabaseError::InvalidState {
            id,
            expected: OutboxState::Pending,
            actual,
        }),
        None => Err(DatabaseError::NotFound(format!("outbox message {id}"))),
    }
}

/// Complete every `ack_pending` message with a sequence number up to and
/// including `sequence_number`. Returns the number of rows completed.
pub fn complete_outbox_messages_up_to(
    conn: &Connection,
    sequence_number: u64,
) -> DatabaseResult<usize> {
    let now = Utc::now().to_rfc3339();
    let count = conn.execute(
        "UPDATE outbox_messages
         SET state = 'ack_completed', acked_at = ?1
         WHERE sequence_number <= ?2 AND state = 'ack_pending'",
        params![now, sequence_number],
    )?;
    Ok(count)
}

/// Complete the single `ack_pending` message with this sequence number.
/// Returns 0 when no such row is awaiting a confirm.
pub fn complete_outbox_message(conn: &Connection, sequence_number: u64) -> DatabaseResult<usize> {
    let now = Utc::now().to_rfc3339();
    let count = conn.execute(
        "UPDATE outbox_messages
         SET state = 'ack_completed', acked_at = ?1
         WHERE sequence_number = ?2 AND state = 'ack_pending'",
        params![now, sequence_number],
    )?;
    Ok(count)
}

/// Return an `ack_pending` message to `pending` after the broker refused it.
pub fn requeue_outbox_message(
    conn: &Connection,
    sequence_number: u64,
    reason: &str,
) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox_messages
         SET state = 'pending', last_error = ?1, sent_at = NULL
         WHERE sequence_number = ?2 AND state = 'ack_pending'",
        params![reason, sequence_number],
    )?;
    Ok(count)
}

/// Reset every `ack_pending` message to `pending` (channel loss, crash recovery).
pub fn reset_in_flight_outbox_messages(conn: &Connection) -> DatabaseResult<usize> {
    let count = conn.execute(
        "UPDATE outbox_messages
         SET state = 'pending', sent_at = NULL
         WHERE state = 'ack_pending'",
        [],
    )?;
    Ok(count)
}

/// Highest sequence number ever stored, if any.
pub fn get_max_outbox_sequence(conn: &Connection) -> DatabaseResult<Option<u64>> {
    let max: Option<u64> = conn.query_row(
        "SELECT MAX(sequence_number) FROM outbox_messages",
        [],
        |row| row.get(0),
    )?;
    Ok(max)
}

/// Count outbox messages per state.
pub fn count_outbox_messages(conn: &Connection) -> DatabaseResult<OutboxCounts> {
    let mut stmt =
        conn.prepare_cached("SELECT state, COUNT(*) FROM outbox_messages GROUP BY state")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, OutboxState>(0)?, row.get::<_, u64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = OutboxCounts::default();
    for (state, count) in rows {
        match state {
            OutboxState::Pending => counts.pending = count,
            OutboxState::AckPending => counts.ack_pending = count,
            OutboxState::AckCompleted => counts.ack_completed = count,
        }
    }
    Ok(counts)
}

// ==========================================
// Helpers
// ==========================================

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn insert_seq(conn: &Connection, sequence_number: u64) -> OutboxMessage {
        insert_outbox_message(
            conn,
            &NewOutboxMessage {
                event_type: "product-deleted".to_string(),
                payload: format!("{{\"id\":{sequence_number}}}").into_bytes(),
                sequence_number,
            },
        )
        .unwrap()
    }

    fn state_of(conn: &Connection, sequence_number: u64) -> OutboxState {
        get_outbox_message_by_sequence(conn, sequence_number)
            .unwrap()
            .unwrap()
            .state
    }

    fn seed_product(conn: &Connection) -> Product {
        let category = insert_category(conn, &NewCategory { name: "tools".to_string() }).unwrap();
        insert_product(
            conn,
            &NewProduct {
                category_id: category.id,
                name: "Drill".to_string(),
                price: 49.5,
                description: Some("Cordless".to_string()),
                address: "Aisle 4".to_string(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_insert_and_get_outbox_message() {
        let conn = setup();
        let inserted = insert_seq(&conn, 1);

        let loaded = get_outbox_message(&conn, inserted.id).unwrap().unwrap();
        assert_eq!(loaded.sequence_number, 1);
        assert_eq!(loaded.state, OutboxState::Pending);
        assert_eq!(loaded.attempts, 0);
        assert_eq!(loaded.payload, b"{\"id\":1}".to_vec());
        assert!(loaded.sent_at.is_none());
    }

    #[test]
    fn test_duplicate_sequence_is_conflict() {
        let conn = setup();
        insert_seq(&conn, 1);

        let err = insert_outbox_message(
            &conn,
            &NewOutboxMessage {
                event_type: "product-deleted".to_string(),
                payload: vec![],
                sequence_number: 1,
            },
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));
    }

    #[test]
    fn test_pending_ordered_by_sequence_and_paged() {
        let conn = setup();
        for seq in [3, 1, 2, 5] {
            insert_seq(&conn, seq);
        }

        let first = get_pending_outbox_messages(&conn, None, 2).unwrap();
        let seqs: Vec<u64> = first.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);

        let rest = get_pending_outbox_messages(&conn, Some(2), 10).unwrap();
        let seqs: Vec<u64> = rest.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![3, 5]);
    }

    #[test]
    fn test_mark_sent_transitions_and_counts_attempt() {
        let conn = setup();
        let message = insert_seq(&conn, 1);

        mark_outbox_message_sent(&conn, message.id).unwrap();

        let loaded = get_outbox_message(&conn, message.id).unwrap().unwrap();
        assert_eq!(loaded.state, OutboxState::AckPending);
        assert_eq!(loaded.attempts, 1);
        assert!(loaded.sent_at.is_some());
        assert!(get_pending_outbox_messages(&conn, None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_mark_sent_twice_is_invalid_state() {
        let conn = setup();
        let message = insert_seq(&conn, 1);
        mark_outbox_message_sent(&conn, message.id).unwrap();

        let err = mark_outbox_message_sent(&conn, message.id).unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::InvalidState {
                expected: OutboxState::Pending,
                actual: OutboxState::AckPending,
                ..
            }
        ));
    }

    #[test]
    fn test_mark_sent_unknown_is_not_found() {
        let conn = setup();
        let err = mark_outbox_message_sent(&conn, 42).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[test]
    fn test_complete_up_to_only_touches_ack_pending() {
        let conn = setup();
        for seq in 1..=3 {
            let m = insert_seq(&conn, seq);
            mark_outbox_message_sent(&conn, m.id).unwrap();
        }
        insert_seq(&conn, 4);

        let completed = complete_outbox_messages_up_to(&conn, 2).unwrap();
        assert_eq!(completed, 2);
        assert_eq!(state_of(&conn, 1), OutboxState::AckCompleted);
        assert_eq!(state_of(&conn, 2), OutboxState::AckCompleted);
        assert_eq!(state_of(&conn, 3), OutboxState::AckPending);
        assert_eq!(state_of(&conn, 4), OutboxState::Pending);

        // A later cumulative confirm never touches pending rows.
        complete_outbox_messages_up_to(&conn, 10).unwrap();
        assert_eq!(state_of(&conn, 4), OutboxState::Pending);
    }

    #[test]
    fn test_complete_one_is_exact() {
        let conn = setup();
        for seq in [4, 5] {
            let m = insert_seq(&conn, seq);
            mark_outbox_message_sent(&conn, m.id).unwrap();
        }

        assert_eq!(complete_outbox_message(&conn, 5).unwrap(), 1);
        assert_eq!(state_of(&conn, 5), OutboxState::AckCompleted);
        assert_eq!(state_of(&conn, 4), OutboxState::AckPending);

        // Confirming again is a no-op.
        assert_eq!(complete_outbox_message(&conn, 5).unwrap(), 0);
    }

    #[test]
    fn test_requeue_and_reset_in_flight() {
        let conn = setup();
        for seq in 1..=3 {
            let m = insert_seq(&conn, seq);
            mark_outbox_message_sent(&conn, m.id).unwrap();
        }
        complete_outbox_message(&conn, 3).unwrap();

        assert_eq!(requeue_outbox_message(&conn, 1, "nack").unwrap(), 1);
        let requeued = get_outbox_message_by_sequence(&conn, 1).unwrap().unwrap();
        assert_eq!(requeued.state, OutboxState::Pending);
        assert_eq!(requeued.last_error.as_deref(), Some("nack"));

        // Completed rows stay completed.
        assert_eq!(requeue_outbox_message(&conn, 3, "nack").unwrap(), 0);

        assert_eq!(reset_in_flight_outbox_messages(&conn).unwrap(), 1);
        assert_eq!(state_of(&conn, 2), OutboxState::Pending);
        assert_eq!(state_of(&conn, 3), OutboxState::AckCompleted);
    }

    #[test]
    fn test_max_sequence_and_counts() {
        let conn = setup();
        assert_eq!(get_max_outbox_sequence(&conn).unwrap(), None);
        assert_eq!(count_outbox_messages(&conn).unwrap(), OutboxCounts::default());

        for seq in [1, 2, 7] {
            insert_seq(&conn, seq);
        }
        let m = get_outbox_message_by_sequence(&conn, 2).unwrap().unwrap();
        mark_outbox_message_sent(&conn, m.id).unwrap();

        assert_eq!(get_max_outbox_sequence(&conn).unwrap(), Some(7));
        let counts = count_outbox_messages(&conn).unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.ack_pending, 1);
        assert_eq!(counts.ack_completed, 0);
        assert_eq!(counts.outstanding(), 3);
    }

    #[test]
    fn test_product_with_images_lifecycle() {
        let conn = setup();
        let product = seed_product(&conn);

        for url in ["https://img/1.png", "https://img/2.png"] {
            insert_product_image(
                &conn,
                &NewProductImage {
                    product_id: product.id,
                    image_url: url.to_string(),
                },
            )
            .unwrap();
        }
        assert_eq!(list_product_images(&conn, product.id).unwrap().len(), 2);

        // Product cannot go while images still reference it.
        assert!(delete_product(&conn, product.id).is_err());

        assert_eq!(delete_product_images(&conn, product.id).unwrap(), 2);
        assert_eq!(delete_product(&conn, product.id).unwrap(), 1);
        assert!(get_product(&conn, product.id).unwrap().is_none());
    }

    #[test]
    fn test_image_for_missing_product_is_not_found() {
        let conn = setup();
        let err = insert_product_image(
            &conn,
            &NewProductImage {
                product_id: 99,
                image_url: "https://img/x.png".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[test]
    fn test_duplicate_category_is_conflict() {
        let conn = setup();
        insert_category(&conn, &NewCategory { name: "tools".to_string() }).unwrap();
        let err = insert_category(&conn, &NewCategory { name: "tools".to_string() }).unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));
        assert!(get_category_by_name(&conn, "tools").unwrap().is_some());
    }
}

//! Event type names carried in `outbox_messages.event_type` and in the
//! `eventType` field of every published envelope.

/// Written by the user service through [`TransactionalWriter::write`]; this
/// crate has no user tables of its own.
///
/// [`TransactionalWriter::write`]: crate::TransactionalWriter::write
pub const USER_CREATED: &str = "user-created";

/// Written by the user service, like [`USER_CREATED`].
pub const USER_DELETED: &str = "user-deleted";

/// Written by [`TransactionalWriter::delete_product`].
///
/// [`TransactionalWriter::delete_product`]: crate::TransactionalWriter::delete_product
pub const PRODUCT_DELETED: &str = "product-deleted";

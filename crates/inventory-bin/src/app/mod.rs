//! Command implementations and pipeline wiring.

mod commands;
mod wiring;

pub use commands::{delete_product, print_status, run_outbox, seed_catalog};

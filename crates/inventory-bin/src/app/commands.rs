//! CLI commands.

use super::wiring::{connector_for, pipeline_config, AppResult};
use inventory_config_and_utils::{Config, Paths};
use inventory_database::{
    queries, AsyncDatabase, DatabaseResult, NewCategory, NewProduct, NewProductImage,
};
use inventory_outbox::{OutboxPipeline, OutboxStore};
use std::time::Duration;
use tracing::{info, warn};

const DEMO_CATEGORY: &str = "demo";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the dispatcher until Ctrl-C.
pub async fn run_outbox(config: &Config, paths: &Paths, demo: bool) -> AppResult<()> {
    let connector = connector_for(config, demo)?;
    let db = AsyncDatabase::open(&paths.database_file()).await?;
    let pipeline = OutboxPipeline::start(db.clone(), connector, pipeline_config(config)).await?;

    info!(
        broker = %broker_label(config, demo),
        queue = %config.queue_name,
        database = %db.path(),
        "Inventory outbox running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping...");

    pipeline.shutdown().await;
    db.close().await?;
    Ok(())
}

/// Print row counts per state and the highest sequence number.
pub async fn print_status(paths: &Paths) -> AppResult<()> {
    let db = AsyncDatabase::open(&paths.database_file()).await?;
    let store = OutboxStore::new(db);

    let counts = store.counts().await?;
    let max = store.max_sequence_number().await?;

    println!("pending:        {}", counts.pending);
    println!("ack_pending:    {}", counts.ack_pending);
    println!("ack_completed:  {}", counts.ack_completed);
    match max {
        Some(sequence) => println!("last sequence:  {sequence}"),
        None => println!("last sequence:  none"),
    }
    Ok(())
}

/// Insert demo products, each with one image.
pub async fn seed_catalog(paths: &Paths, count: usize) -> AppResult<()> {
    let db = AsyncDatabase::open(&paths.database_file()).await?;
    let ids = seed(&db, count).await?;
    for id in &ids {
        println!("created product {id}");
    }
    info!(count = ids.len(), "Seeded demo catalog");
    Ok(())
}

/// Broker URL for logs, without credentials.
fn broker_label(config: &Config, demo: bool) -> String {
    if demo {
        return "memory (demo)".to_string();
    }
    match config.broker_url() {
        Ok(mut url) => {
            let _ = url.set_password(None);
            url.to_string()
        }
        Err(_) => config.broker_url.clone(),
    }
}

async fn seed(db: &AsyncDatabase, count: usize) -> DatabaseResult<Vec<i64>> {
    db.transaction(move |tx| {
        let category = match queries::get_category_by_name(tx, DEMO_CATEGORY)? {
            Some(category) => category,
            None => queries::insert_category(tx, &NewCategory { name: DEMO_CATEGORY.to_string() })?,
        };

        let mut ids = Vec::with_capacity(count);
        for n in 1..=count {
            let product = queries::insert_product(
                tx,
                &NewProduct {
                    category_id: category.id,
                    name: format!("Demo product {n}"),
                    price: 9.99 * n as f64,
                    description: (n % 2 == 0).then(|| format!("Even-numbered demo item {n}")),
                    address: format!("Shelf {n}"),
                },
            )?;
            queries::insert_product_image(
                tx,
                &NewProductImage {
                    product_id: product.id,
                    image_url: format!("https://images.example.com/demo-{n}.png"),
                },
            )?;
            ids.push(product.id);
        }
        Ok(ids)
    })
    .await
}

/// Delete a product, then drain the outbox through the configured broker.
pub async fn delete_product(config: &Config, paths: &Paths, id: i64, demo: bool) -> AppResult<()> {
    let connector = connector_for(config, demo)?;
    let db = AsyncDatabase::open(&paths.database_file()).await?;
    let pipeline = OutboxPipeline::start(db.clone(), connector, pipeline_config(config)).await?;

    let result = pipeline.writer().delete_product(id).await;
    let outcome: AppResult<()> = match result {
        Ok(written) => {
            println!(
                "deleted product {} (event sequence {})",
                written.value.id, written.message.sequence_number
            );
            if pipeline.wait_idle(DRAIN_TIMEOUT).await? {
                println!("event delivered");
            } else {
                warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Outbox not drained before timeout");
                println!("event stored, delivery still pending");
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    };

    pipeline.shutdown().await;
    db.close().await?;
    outcome
}

//! Maps service configuration onto the outbox pipeline.

use inventory_broker::{AmqpConnector, BrokerConnector, MemoryBroker, PublisherConfig};
use inventory_config_and_utils::Config;
use inventory_outbox::{CorrelatorConfig, DispatcherConfig, PipelineConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub(crate) type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

pub(crate) fn pipeline_config(config: &Config) -> PipelineConfig {
    PipelineConfig {
        publisher: PublisherConfig {
            queue: config.queue_name.clone(),
            connect_timeout: config.connect_timeout(),
        },
        dispatcher: DispatcherConfig {
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
            initial_retry_delay_ms: config.initial_retry_delay_ms,
            max_retry_delay_ms: config.max_retry_delay_ms,
        },
        correlator: CorrelatorConfig {
            initial_retry_delay: Duration::from_millis(config.initial_retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
        },
    }
}

/// Pick the broker connector.
///
/// `demo` swaps in the auto-confirming in-process broker: events are
/// completed without leaving the process. Otherwise the configured URL must
/// name an AMQP broker.
pub(crate) fn connector_for(config: &Config, demo: bool) -> AppResult<Arc<dyn BrokerConnector>> {
    if demo {
        warn!("Demo mode: events are confirmed by the in-process broker and never leave this process");
        return Ok(Arc::new(MemoryBroker::auto_confirming()));
    }

    let url = config.broker_url()?;
    match url.scheme() {
        "amqp" | "amqps" => Ok(Arc::new(AmqpConnector::new(url.as_str(), config.queue_name.clone()))),
        "memory" => Err("memory:// is the in-process demo broker; pass --demo to use it".into()),
        other => Err(format!("no broker connector for scheme '{other}'").into()),
    }
}

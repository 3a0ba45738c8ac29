//! Metric descriptions for the flash-sale pipeline.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `flash_sale.purchases{result}` - Purchase attempts by result
//! - `flash_sale.admission{outcome}` - Admission decisions by outcome
//! - `flash_sale.admission.revoked` - Admissions rolled back before an order reached the bus
//! - `flash_sale.orders.persisted` - Orders written by the consumer
//! - `flash_sale.orders.anomalies` - Admitted orders the database had no stock for
//! - `flash_sale.dlq.added` - Messages moved to the dead letter queue
//! - `flash_sale.dlq.undecodable` - Records on the order topic that were not order messages
//! - `flash_sale.dlq.resolved` / `flash_sale.dlq.discarded` - Operator actions
//!
//! ## Histograms
//! - `flash_sale.filter.warm_seconds` - Duration of a shop filter warm-up

use metrics::{describe_counter, describe_histogram};

/// Register all metric descriptions. Call once at startup.
pub fn register_metrics() {
    describe_counter!(
        "flash_sale.purchases",
        "Purchase attempts by result (ordered, unavailable, unconfirmed or a denial reason)"
    );
    describe_counter!(
        "flash_sale.admission",
        "Admission decisions by outcome (admitted, stock_exhausted, duplicate_user)"
    );
    describe_counter!(
        "flash_sale.admission.revoked",
        "Admissions rolled back before an order reached the bus"
    );

    describe_counter!(
        "flash_sale.orders.persisted",
        "Orders created by the order consumer"
    );
    describe_counter!(
        "flash_sale.orders.anomalies",
        "Admitted orders rejected by the database stock guard"
    );

    describe_counter!("flash_sale.dlq.added", "Messages moved to the dead letter queue");
    describe_counter!(
        "flash_sale.dlq.undecodable",
        "Undecodable order records kept for inspection"
    );
    describe_counter!("flash_sale.dlq.resolved", "Dead letters marked resolved");
    describe_counter!("flash_sale.dlq.discarded", "Dead letters discarded");

    describe_histogram!(
        "flash_sale.filter.warm_seconds",
        "Time taken to load every shop id into the membership filter"
    );

    tracing::info!("Flash sale metrics registered");
}

/// Record one filter warm-up.
pub fn record_filter_warm(duration_secs: f64) {
    metrics::histogram!("flash_sale.filter.warm_seconds").record(duration_secs);
}

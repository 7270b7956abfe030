//! Metrics collection for observability
//!
//! Prometheus counters over the maintenance machinery. Purely
//! observational: nothing here feeds back into consensus state.
//!
//! # Metrics
//!
//! - `chain_blocks_total` - Blocks whose housekeeping cycle completed
//! - `chain_limit_orders_cancelled_total` - Limit orders swept at expiry
//! - `chain_force_settlements_filled_total` - Forced settlement fills
//! - `chain_htlc_refunds_total` - HTLCs refunded at expiry
//! - `chain_black_swans_total` - Global settlements triggered

use prometheus::{IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Blocks whose housekeeping cycle completed
    pub blocks_total: IntCounter,

    /// Limit orders swept at expiry
    pub limit_orders_cancelled_total: IntCounter,

    /// Forced settlement fills
    pub force_settlements_filled_total: IntCounter,

    /// HTLCs refunded at expiry
    pub htlc_refunds_total: IntCounter,

    /// Global settlements triggered
    pub black_swans_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create a collector with its own registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_total = IntCounter::new(
            "chain_blocks_total",
            "Blocks whose housekeeping cycle completed",
        )?;
        registry.register(Box::new(blocks_total.clone()))?;

        let limit_orders_cancelled_total = IntCounter::new(
            "chain_limit_orders_cancelled_total",
            "Limit orders swept at expiry",
        )?;
        registry.register(Box::new(limit_orders_cancelled_total.clone()))?;

        let force_settlements_filled_total = IntCounter::new(
            "chain_force_settlements_filled_total",
            "Forced settlement fills",
        )?;
        registry.register(Box::new(force_settlements_filled_total.clone()))?;

        let htlc_refunds_total =
            IntCounter::new("chain_htlc_refunds_total", "HTLCs refunded at expiry")?;
        registry.register(Box::new(htlc_refunds_total.clone()))?;

        let black_swans_total =
            IntCounter::new("chain_black_swans_total", "Global settlements triggered")?;
        registry.register(Box::new(black_swans_total.clone()))?;

        Ok(Self {
            blocks_total,
            limit_orders_cancelled_total,
            force_settlements_filled_total,
            htlc_refunds_total,
            black_swans_total,
            registry,
        })
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("blocks_total", &self.blocks_total.get())
            .field(
                "limit_orders_cancelled_total",
                &self.limit_orders_cancelled_total.get(),
            )
            .finish_non_exhaustive()
    }
}

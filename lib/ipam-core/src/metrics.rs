//! Prometheus metrics for range, address and router operations

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector shared by the registry, allocator and router controller
#[derive(Clone)]
pub struct MetricsCollector {
    /// Range operations by operation and outcome
    pub range_operations_total: IntCounterVec,
    /// Address acquisitions by source pool kind (dedicated, global, explicit)
    pub address_acquisitions_total: IntCounterVec,
    /// Addresses returned to their pool
    pub address_releases_total: IntCounter,
    /// Router interface changes by change kind and outcome
    pub router_changes_total: IntCounterVec,
    /// Redundant routers whose link state disagrees with their role
    pub redundancy_mismatches_total: IntCounter,
    /// Free addresses per pool
    pub free_addresses: IntGaugeVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let range_operations_total = IntCounterVec::new(
            Opts::new("ipam_range_operations_total", "IP range operations"),
            &["operation", "outcome"],
        )?;

        let address_acquisitions_total = IntCounterVec::new(
            Opts::new(
                "ipam_address_acquisitions_total",
                "Public IP acquisitions by source",
            ),
            &["source"],
        )?;

        let address_releases_total = IntCounter::new(
            "ipam_address_releases_total",
            "Public IPs released back to their range",
        )?;

        let router_changes_total = IntCounterVec::new(
            Opts::new(
                "ipam_router_changes_total",
                "Virtual router interface changes",
            ),
            &["change", "outcome"],
        )?;

        let redundancy_mismatches_total = IntCounter::new(
            "ipam_redundancy_mismatches_total",
            "Redundant router link states inconsistent with role",
        )?;

        let free_addresses = IntGaugeVec::new(
            Opts::new("ipam_free_addresses", "Free addresses per IP range"),
            &["pool"],
        )?;

        registry.register(Box::new(range_operations_total.clone()))?;
        registry.register(Box::new(address_acquisitions_total.clone()))?;
        registry.register(Box::new(address_releases_total.clone()))?;
        registry.register(Box::new(router_changes_total.clone()))?;
        registry.register(Box::new(redundancy_mismatches_total.clone()))?;
        registry.register(Box::new(free_addresses.clone()))?;

        Ok(Self {
            range_operations_total,
            address_acquisitions_total,
            address_releases_total,
            router_changes_total,
            redundancy_mismatches_total,
            free_addresses,
            registry,
        })
    }

    pub fn range_operation(&self, operation: &str, ok: bool) {
        let outcome = if ok { "success" } else { "failure" };
        self.range_operations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn router_change(&self, change: &str, ok: bool) {
        let outcome = if ok { "success" } else { "failure" };
        self.router_changes_total
            .with_label_values(&[change, outcome])
            .inc();
    }

    pub fn set_free(&self, pool: &str, free: u32) {
        self.free_addresses
            .with_label_values(&[pool])
            .set(i64::from(free));
    }

    pub fn forget_pool(&self, pool: &str) {
        let _ = self.free_addresses.remove_label_values(&[pool]);
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default MetricsCollector")
    }
}

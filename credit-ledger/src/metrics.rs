use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    // Ledger metrics
    pub static ref DEPOSITS_TOTAL: IntCounter = IntCounter::new(
        "credit_ledger_deposits_total",
        "Total committed credit deposits"
    ).expect("metric can be created");

    pub static ref WITHDRAWALS_TOTAL: IntCounter = IntCounter::new(
        "credit_ledger_withdrawals_total",
        "Total committed debits"
    ).expect("metric can be created");

    pub static ref WITHDRAWAL_REJECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("credit_ledger_withdrawal_rejections_total", "Debits rejected by a business rule"),
        &["reason"]
    ).expect("metric can be created");

    pub static ref OPERATION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("credit_ledger_operation_duration_seconds", "Ledger operation duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        &["operation"]
    ).expect("metric can be created");

    // Sweeper metrics
    pub static ref GRANTS_EXPIRED_TOTAL: IntCounter = IntCounter::new(
        "credit_ledger_grants_expired_total",
        "Total grants flagged expired by the sweeper"
    ).expect("metric can be created");

    pub static ref SWEEP_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "credit_ledger_sweep_failures_total",
        "Total failed expiry sweeps"
    ).expect("metric can be created");

    // Cache metrics
    pub static ref CACHE_HITS: IntCounter = IntCounter::new(
        "credit_ledger_cache_hits_total",
        "Total activity cache hits"
    ).expect("metric can be created");

    pub static ref CACHE_MISSES: IntCounter = IntCounter::new(
        "credit_ledger_cache_misses_total",
        "Total activity cache misses"
    ).expect("metric can be created");

    pub static ref CACHE_SETS: IntCounter = IntCounter::new(
        "credit_ledger_cache_sets_total",
        "Total activity cache populates"
    ).expect("metric can be created");

    pub static ref CACHE_INVALIDATIONS: IntCounter = IntCounter::new(
        "credit_ledger_cache_invalidations_total",
        "Total per-user activity cache invalidations"
    ).expect("metric can be created");

    /// Registry exposed at `/metrics`
    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        register_metrics(&registry).expect("metrics can be registered");
        registry
    };
}

/// Register all metrics with the given registry
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    // Ledger metrics
    registry.register(Box::new(DEPOSITS_TOTAL.clone()))?;
    registry.register(Box::new(WITHDRAWALS_TOTAL.clone()))?;
    registry.register(Box::new(WITHDRAWAL_REJECTIONS.clone()))?;
    registry.register(Box::new(OPERATION_DURATION.clone()))?;

    // Sweeper metrics
    registry.register(Box::new(GRANTS_EXPIRED_TOTAL.clone()))?;
    registry.register(Box::new(SWEEP_FAILURES_TOTAL.clone()))?;

    // Cache metrics
    registry.register(Box::new(CACHE_HITS.clone()))?;
    registry.register(Box::new(CACHE_MISSES.clone()))?;
    registry.register(Box::new(CACHE_SETS.clone()))?;
    registry.register(Box::new(CACHE_INVALIDATIONS.clone()))?;

    Ok(())
}

/// Generate metrics output in Prometheus text format
pub fn metrics_handler() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let registry = Registry::new();
        assert!(register_metrics(&registry).is_ok());
    }

    #[test]
    fn test_metrics_handler() {
        DEPOSITS_TOTAL.inc();
        WITHDRAWAL_REJECTIONS
            .with_label_values(&["insufficient_credit"])
            .inc();

        let output = metrics_handler().unwrap();
        assert!(output.contains("credit_ledger_deposits_total"));
        assert!(output.contains("credit_ledger_withdrawal_rejections_total"));
    }
}

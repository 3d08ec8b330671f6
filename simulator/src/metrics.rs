use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref DELIVERIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("simulator_deliveries_total", "Readings accepted by the endpoint"),
        &["device"]
    )
    .expect("valid metric definition");
    pub static ref DELIVERY_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("simulator_delivery_failures_total", "Ticks whose reading was not delivered"),
        &["device"]
    )
    .expect("valid metric definition");
    pub static ref TICKS_SKIPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("simulator_ticks_skipped_total", "Tick boundaries passed while a delivery was in flight"),
        &["device"]
    )
    .expect("valid metric definition");
    pub static ref DELIVERY_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "simulator_delivery_latency_seconds",
            "Time from tick to endpoint acknowledgement"
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    )
    .expect("valid metric definition");
    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::with_opts(Opts::new(
        "simulator_sessions_active",
        "Device sessions currently driven by the fleet"
    ))
    .expect("valid metric definition");
    pub static ref SESSIONS_DEGRADED: IntGauge = IntGauge::with_opts(Opts::new(
        "simulator_sessions_degraded",
        "Device sessions whose last delivery failed"
    ))
    .expect("valid metric definition");
}

pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(DELIVERIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DELIVERY_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TICKS_SKIPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DELIVERY_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(SESSIONS_DEGRADED.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

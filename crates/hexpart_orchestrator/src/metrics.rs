use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Prometheus collectors of the local runner.
///
/// Wrapped in an `Arc` and shared by every unit task.
pub struct Metrics {
    pub registry: Registry,
    /// Worker processes started, retries included.
    pub unit_attempts_total: IntCounter,
    pub units_succeeded_total: IntCounter,
    /// Units that exhausted their retries within a tier.
    pub units_failed_total: IntCounter,
    pub units_running: IntGauge,
    pub tiers_started_total: IntCounter,
    pub current_tier: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("hexpart".into()), None)?;

        // Create, register and return a collector.
        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric?;
                registry.register(Box::new(collector.clone()))?;
                collector
            }};
        }

        Ok(Self {
            unit_attempts_total: reg!(IntCounter::new(
                "unit_attempts_total",
                "Worker processes started, retries included"
            )),
            units_succeeded_total: reg!(IntCounter::new(
                "units_succeeded_total",
                "Work units that completed successfully"
            )),
            units_failed_total: reg!(IntCounter::new(
                "units_failed_total",
                "Work units that exhausted their retries within a tier"
            )),
            units_running: reg!(IntGauge::new("units_running", "Worker processes currently running")),
            tiers_started_total: reg!(IntCounter::new("tiers_started_total", "Tiers started")),
            current_tier: reg!(IntGauge::new("current_tier", "Tier currently executing")),
            registry,
        })
    }

    /// Serves the registry on `/metrics`.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    match encode(&registry) {
                        Ok(body) => body.into_response(),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
                    }
                }
            }),
        )
    }

    pub fn start_tier(&self, tier: u32) {
        self.tiers_started_total.inc();
        self.current_tier.set(i64::from(tier));
    }
}

fn encode(registry: &Registry) -> Result<String, String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

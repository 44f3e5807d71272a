//! # Telemetry
//!
//! Logs always go to the console through `tracing_subscriber::fmt`, filtered
//! by `RUST_LOG` (default `info`).
//!
//! ## Feature matrix
//!
//! - `metrics`: Enables OpenTelemetry counters for sessions, offered cases,
//!   reported results and spurious reports.
//! - `stdout`: Exports those metrics to stdout every five seconds.
//!
//! Without `metrics` every recording function below is a no-op.
//!
//! ```bash
//! cargo run --bin casebook-server --features metrics,stdout -- ledger.db --plaintext
//! ```

#[cfg(all(feature = "stdout", not(feature = "metrics")))]
compile_error!("The 'stdout' feature requires the 'metrics' feature to be enabled.");

use casebook_wire::server::SessionEvents;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Meter, UpDownCounter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{Resource, metrics as sdkmetrics};
#[cfg(feature = "metrics")]
use opentelemetry_semantic_conventions as semvcns;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

pub struct TelemetryProviders {
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops the exporters.
    pub fn shutdown(self) {
        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        )
        .try_init()?;

    #[cfg(feature = "metrics")]
    {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let scope = InstrumentationScope::builder("casebook")
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        init_metric_handles(&opentelemetry::global::meter_with_scope(scope));
    }

    Ok(TelemetryProviders {
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "metrics")]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("casebook-server")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "metrics")]
static SESSIONS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CASES_OFFERED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RESULTS_REPORTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SPURIOUS_REPORTS: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = SESSIONS_INFLIGHT.set(
        meter
            .i64_up_down_counter("sessions_inflight")
            .with_description("Open engine sessions")
            .build(),
    );
    let _ = CASES_OFFERED.set(
        meter
            .u64_counter("cases_offered")
            .with_description("Case slots sent in fetch replies, including empty ones")
            .build(),
    );
    let _ = RESULTS_REPORTED.set(
        meter
            .u64_counter("results_reported")
            .with_description("Results forwarded to the ledger")
            .build(),
    );
    let _ = SPURIOUS_REPORTS.set(
        meter
            .u64_counter("spurious_reports")
            .with_description("Results that matched no live offer")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn increment_sessions_inflight() {
    if let Some(counter) = SESSIONS_INFLIGHT.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_sessions_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_sessions_inflight() {
    if let Some(counter) = SESSIONS_INFLIGHT.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_sessions_inflight() {}

#[cfg(feature = "metrics")]
pub fn increment_cases_offered(count: u64) {
    if let Some(counter) = CASES_OFFERED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_cases_offered(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_results_reported() {
    if let Some(counter) = RESULTS_REPORTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_results_reported() {}

#[cfg(feature = "metrics")]
pub fn increment_spurious_reports() {
    if let Some(counter) = SPURIOUS_REPORTS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_spurious_reports() {}

/// Feeds session activity into the counters above.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionMetrics;

impl SessionEvents for SessionMetrics {
    fn offered(&self, count: u64) {
        increment_cases_offered(count);
    }

    fn reported(&self) {
        increment_results_reported();
    }

    fn spurious(&self) {
        increment_spurious_reports();
    }
}

// Worker telemetry
// Decision: Console logs always on; spans go to an OTLP collector only when
//           OTEL_EXPORTER_OTLP_ENDPOINT is set
// Decision: Traces carry the scheduler worker id as service.instance.id so a
//           span can be matched to the owner recorded on a task row

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider, Tracer},
    Resource,
};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_SERVICE_NAME: &str = "shelfsync-worker";

/// Used when neither `RUST_LOG` nor `LOG_LEVEL` holds a usable filter
pub const DEFAULT_LOG_FILTER: &str = "shelfsync_worker=info,shelfsync_task_queue=info";

const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    /// Scheduler worker id, reported as `service.instance.id`
    pub instance_id: Option<String>,
    pub environment: Option<String>,
    /// Collector address; spans are only exported when set
    pub otlp_endpoint: Option<String>,
    pub export_timeout: Duration,
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: None,
            environment: None,
            otlp_endpoint: None,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Read the standard `OTEL_*` variables plus the worker's own settings
    ///
    /// - `OTEL_SERVICE_NAME`, `OTEL_SERVICE_VERSION`
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_EXPORTER_OTLP_TIMEOUT` (millis)
    /// - `OTEL_ENVIRONMENT`, else `ENVIRONMENT`
    /// - `TASK_QUEUE_WORKER_ID`
    /// - `RUST_LOG`, else `LOG_LEVEL`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            service_name: set("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: set("OTEL_SERVICE_VERSION").unwrap_or(defaults.service_version),
            instance_id: set("TASK_QUEUE_WORKER_ID"),
            environment: set("OTEL_ENVIRONMENT").or_else(|| set("ENVIRONMENT")),
            otlp_endpoint: set("OTEL_EXPORTER_OTLP_ENDPOINT"),
            export_timeout: set("OTEL_EXPORTER_OTLP_TIMEOUT")
                .and_then(|ms| ms.trim().parse().ok())
                .map_or(defaults.export_timeout, Duration::from_millis),
            log_filter: set("RUST_LOG").or_else(|| set("LOG_LEVEL")),
        }
    }

    /// The configured filter, or [`DEFAULT_LOG_FILTER`] when it does not parse
    pub fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_deref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new("service.name", self.service_name.clone()),
            KeyValue::new("service.version", self.service_version.clone()),
        ];
        if let Some(instance) = &self.instance_id {
            attributes.push(KeyValue::new("service.instance.id", instance.clone()));
        }
        if let Some(environment) = &self.environment {
            attributes.push(KeyValue::new("deployment.environment", environment.clone()));
        }

        Resource::builder().with_attributes(attributes).build()
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Flushes buffered spans when the worker exits
#[must_use = "spans are dropped unless the guard lives until shutdown"]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to flush worker spans: {e:?}");
            }
        }
    }
}

/// Install the global subscriber
///
/// An exporter that cannot be built is logged and skipped; the worker keeps
/// running with console logs only.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(config.env_filter());

    let exporter = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| build_otlp_tracer(endpoint, config.export_timeout, config.resource()));

    let (provider, otel_layer, export_error) = match exporter {
        Some(Ok((provider, tracer))) => (
            Some(provider),
            Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            None,
        ),
        Some(Err(e)) => (None, None, Some(e)),
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(otel_layer)
        .init();

    match (&config.otlp_endpoint, export_error) {
        (Some(endpoint), None) => tracing::info!(
            %endpoint,
            instance = config.instance_id.as_deref().unwrap_or_default(),
            "Exporting worker spans over OTLP"
        ),
        (Some(endpoint), Some(e)) => tracing::warn!(
            %endpoint,
            error = %e,
            "OTLP exporter unavailable; logging to console only"
        ),
        (None, _) => tracing::debug!("OTEL_EXPORTER_OTLP_ENDPOINT not set; span export off"),
    }

    TelemetryGuard { provider }
}

fn build_otlp_tracer(
    endpoint: &str,
    timeout: Duration,
    resource: Resource,
) -> Result<(SdkTracerProvider, Tracer), opentelemetry::trace::TraceError> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(timeout)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();
    let tracer = provider.tracer(DEFAULT_SERVICE_NAME);

    Ok((provider, tracer))
}

//! OTLP meter provider setup.

use std::collections::HashMap;

use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use tracing::{error, info};

use crate::config::{OtelConfig, OtlpProtocol};

/// Instrumentation scope of every pipeline instrument.
pub const METER_NAME: &str = "gpusight-exporter";

/// Build resource attributes from configuration.
pub fn build_resource_attributes(
    service_name: &str,
    extra_attrs: &HashMap<String, String>,
) -> Vec<KeyValue> {
    let mut attrs = Vec::with_capacity(2 + extra_attrs.len());

    attrs.push(KeyValue::new("service.name", service_name.to_string()));
    attrs.push(KeyValue::new(
        "service.version",
        env!("CARGO_PKG_VERSION").to_string(),
    ));

    for (k, v) in extra_attrs {
        attrs.push(KeyValue::new(k.clone(), v.clone()));
    }

    attrs
}

/// Create a meter provider that pushes to the configured OTLP endpoint.
///
/// Must be called from within a tokio runtime when the gRPC protocol is
/// selected.
pub fn init_meter_provider(config: &OtelConfig) -> anyhow::Result<SdkMeterProvider> {
    info!(
        endpoint = %config.endpoint,
        protocol = ?config.protocol,
        interval_ms = config.export_interval_ms,
        "Initializing OpenTelemetry meter provider"
    );

    let exporter = match config.protocol {
        OtlpProtocol::Grpc => MetricExporter::builder()
            .with_tonic()
            .with_endpoint(&config.endpoint)
            .with_timeout(config.timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create gRPC metric exporter: {}", e))?,
        OtlpProtocol::Http => MetricExporter::builder()
            .with_http()
            .with_endpoint(&config.endpoint)
            .with_timeout(config.timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP metric exporter: {}", e))?,
    };

    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.export_interval())
        .build();

    let resource = Resource::builder()
        .with_attributes(build_resource_attributes(
            &config.service_name,
            &config.resource,
        ))
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    info!("Meter provider initialized");
    Ok(provider)
}

/// Flush and stop a meter provider.
pub fn shutdown_meter_provider(provider: &SdkMeterProvider) {
    info!("Shutting down OpenTelemetry meter provider");
    if let Err(e) = provider.shutdown() {
        error!("Error shutting down meter provider: {:?}", e);
    }
}

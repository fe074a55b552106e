use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Failed to build prometheus exporter: {0}")]
    Exporter(String),
}

pub struct Metrics {
    upload_counter: Counter<u64>,
    detection_counter: Counter<u64>,
    processing_duration: Histogram<u64>,
    // Owns the Prometheus reader; dropping the last handle shuts it down.
    provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| MetricsError::Exporter(e.to_string()))?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("detection_service");

        let upload_counter = meter
            .u64_counter("uploads_total")
            .with_description("Total number of uploads by outcome")
            .build();

        let detection_counter = meter
            .u64_counter("detections_total")
            .with_description("Total number of detected objects by class")
            .build();

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));

        let processing_duration = meter
            .u64_histogram("upload_processing_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of decode, inference and annotation in milliseconds")
            .build();

        Ok(Metrics {
            upload_counter,
            detection_counter,
            processing_duration,
            provider,
            registry,
        })
    }

    /// Makes this provider the process-wide one, so the HTTP metrics layer
    /// exports into the same registry. Call once at startup.
    pub fn install_global(&self) {
        global::set_meter_provider(self.provider.clone());
    }

    pub fn record_upload(&self, outcome: &str) {
        let attributes = vec![KeyValue::new("outcome", outcome.to_string())];
        self.upload_counter.add(1, &attributes);
    }

    pub fn record_detections(&self, classes: &[String]) {
        for class in classes {
            let attributes = vec![KeyValue::new("class", class.clone())];
            self.detection_counter.add(1, &attributes);
        }
    }

    pub fn record_processing_duration(&self, duration_ms: u64) {
        self.processing_duration.record(duration_ms, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_generate_boundaries() {
        let parts = (2, 22, 26, 46, 146);
        let get = generate_boundaries(parts);
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0, 146.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_recorded_uploads_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_upload("detected");
        metrics.record_detections(&["apple".to_string()]);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let exported = String::from_utf8(buffer).unwrap();

        assert!(exported.contains("uploads_total"));
    }

    fn export(metrics: &Metrics) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_instances_export_independently() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        second.install_global();
        let third = Metrics::new().unwrap();
        third.install_global();

        first.record_upload("rejected");
        second.record_upload("detected");

        assert!(export(&first).contains("outcome=\"rejected\""));
        assert!(export(&second).contains("outcome=\"detected\""));
        assert!(!export(&first).contains("outcome=\"detected\""));
    }
}

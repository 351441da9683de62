use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_gauge!("burrow_sessions_active", "Live tunnel sessions on the relay.");
    metrics::describe_counter!(
        "burrow_http_requests_total",
        "Public HTTP requests handled by the relay, by response status."
    );
    metrics::describe_counter!(
        "burrow_tcp_connections_total",
        "Public connections accepted on TCP routes."
    );
    metrics::describe_gauge!("burrow_tcp_pipes_active", "Spliced TCP connections in flight.");
    metrics::describe_counter!(
        "burrow_bytes_ingress_total",
        "Bytes copied from public TCP clients to local targets."
    );
    metrics::describe_counter!(
        "burrow_bytes_egress_total",
        "Bytes copied from local targets back to public TCP clients."
    );
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Holds a gauge one higher for as long as it lives.
#[derive(Debug)]
pub struct GaugeGuard {
    name: &'static str,
}

impl GaugeGuard {
    pub fn new(name: &'static str) -> Self {
        metrics::gauge!(name).increment(1.0);
        Self { name }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        metrics::gauge!(self.name).decrement(1.0);
    }
}

//! Optional Prometheus exposition, mirroring the teacher's own
//! `statistics::prometheus` submodule: a lazily-initialized `Metrics`
//! registry of counters/gauges, and a `generate_metrics` helper that encodes
//! the default registry in the text exposition format for `/internal/metrics`.

use std::sync::LazyLock;

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder, register_int_counter, register_int_gauge};

pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::default_or_panic);

pub struct Metrics {
    pub requests_total: IntCounter,
    pub bytes_in_total: IntCounter,
    pub bytes_out_total: IntCounter,
    pub connected_clients: IntGauge,
}

impl Metrics {
    fn new() -> Result<Self> {
        Ok(Self {
            requests_total: register_int_counter!(
                "relay_requests_total",
                "Total ingress requests dispatched to a client"
            )?,
            bytes_in_total: register_int_counter!(
                "relay_bytes_in_total",
                "Total request body bytes received from callers"
            )?,
            bytes_out_total: register_int_counter!(
                "relay_bytes_out_total",
                "Total response body bytes sent to callers"
            )?,
            connected_clients: register_int_gauge!(
                "relay_connected_clients",
                "Number of currently registered clients"
            )?,
        })
    }

    fn default_or_panic() -> Self {
        Self::new().expect("unable to initialize prometheus metrics")
    }
}

pub fn generate_metrics(buf: &mut Vec<u8>) -> Result<()> {
    TextEncoder::new().encode(&prometheus::gather(), buf)?;
    Ok(())
}

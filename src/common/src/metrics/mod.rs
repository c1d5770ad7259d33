pub mod metric_def;

use metrics::histogram;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Once;
use tracing::{info, warn};

static DEFAULT_BUCKETS: &[f64; 26] = &[
    1e+2, 2e+2, 4e+2, 6e+2, 8e+2, 1e+3, 2e+3, 4e+3, 6e+3, 8e+3, 1e+4, 2e+4, 4e+4, 6e+4, 8e+4, 1e+5,
    2e+5, 4e+5, 6e+5, 8e+5, 1e+6, 2e+6, 4e+6, 6e+6, 8e+6, 1e+7,
];

const DEFAULT_QUANTILES: &[f64; 9] = &[0.0, 0.5, 0.7, 0.8, 0.9, 0.95, 0.99, 0.999, 1.0];

/// Install the prometheus recorder and its scrape endpoint.
///
/// Must be called from within the tokio runtime; the exporter spawns its
/// HTTP listener on the current runtime.
pub fn init_metrics_context(listen_addr: SocketAddr) {
    static START: Once = Once::new();
    START.call_once(|| init_metrics(listen_addr))
}

fn init_metrics(listen_addr: SocketAddr) {
    let install_rs = PrometheusBuilder::new()
        .set_quantiles(DEFAULT_QUANTILES)
        .expect("can't set quantiles")
        .set_buckets(DEFAULT_BUCKETS)
        .expect("can't set buckets")
        .with_http_listener(listen_addr)
        .install();
    match install_rs {
        Ok(_) => {
            metric_def::describe_gateway_metrics();
            info!("GatewaySrv prometheus exporter listening on {listen_addr}");
        }
        Err(e) => {
            warn!(
                "GatewaySrv init prometheus metrics context error.cause by {:?}",
                e.to_string()
            );
        }
    }
}

/// Millisecond stopwatch for phase latency histograms.
///
/// Observation is explicit: call [`Stopwatch::observe`] on the paths that
/// should be measured. A stopwatch that goes out of scope records nothing,
/// so error paths stay out of the histogram.
pub struct Stopwatch {
    started_at: coarsetime::Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started_at: coarsetime::Instant::now(),
        }
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.started_at.elapsed().as_millis()
    }

    pub fn observe(self, name: &'static str) {
        histogram!(name).record(self.elapsed_millis() as f64);
    }
}

#[inline]
pub fn counter_inc(name: &'static str, labels: Option<&Vec<(&'static str, String)>>) {
    let counter = if let Some(label) = labels {
        metrics::counter!(name, label)
    } else {
        metrics::counter!(name)
    };
    counter.increment(1);
}

#[inline]
pub fn gauge_inc(name: &'static str, value: f64, labels: Option<&Vec<(&'static str, String)>>) {
    let gauge = if let Some(label) = labels {
        metrics::gauge!(name, label)
    } else {
        metrics::gauge!(name)
    };
    gauge.increment(value);
}

#[inline]
pub fn gauge_dec(name: &'static str, value: f64, labels: Option<&Vec<(&'static str, String)>>) {
    let gauge = if let Some(label) = labels {
        metrics::gauge!(name, label)
    } else {
        metrics::gauge!(name)
    };
    gauge.decrement(value)
}

//! Process metrics.
//!
//! Counters and timing histograms on the default prometheus registry. The
//! scrape/export side is owned by the deployment, not by this crate.

use std::time::Instant;

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

pub static LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "hopscope_lookups_total",
        "External lookups performed, by kind (ip_to_name, name_to_ip, external_sources)",
        &["kind"]
    )
    .expect("metric registration")
});

pub static ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "hopscope_errors_total",
        "Errors, by kind (ripestat_http, ripestat_query, peeringdb_http, enrich_host)",
        &["kind"]
    )
    .expect("metric registration")
});

pub static TIMINGS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "hopscope_operation_seconds",
        "Operation timings, by operation name",
        &["operation"]
    )
    .expect("metric registration")
});

/// Times a scope, observing the histogram and emitting a debug log line on
/// drop. Used around every remote call.
pub struct Timed {
    operation: &'static str,
    descr: Option<String>,
    start: Instant,
}

impl Timed {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            descr: None,
            start: Instant::now(),
        }
    }

    pub fn with_descr(operation: &'static str, descr: impl Into<String>) -> Self {
        Self {
            operation,
            descr: Some(descr.into()),
            start: Instant::now(),
        }
    }
}

impl Drop for Timed {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();

        TIMINGS
            .with_label_values(&[self.operation])
            .observe(elapsed.as_secs_f64());

        match &self.descr {
            Some(descr) => tracing::debug!(
                "timing of {} {} - {} ms",
                self.operation,
                descr,
                elapsed.as_millis()
            ),
            None => tracing::debug!(
                "timing of {} - {} ms",
                self.operation,
                elapsed.as_millis()
            ),
        }
    }
}

#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! contains statistics for discovery, endpoint caches and retries
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum CallOutcome {
        success,
        exhausted,
        deadline,
        cancelled,
    }
    pub struct RetryOutcomeStats: IntCounter {
        "outcome" => CallOutcome
    }
}

lazy_static! {
    /// snapshots published by discovery watchers
    pub static ref DISCOVERY_UPDATES: IntCounter = register_int_counter!("discovery_updates", "discovery snapshots published").unwrap();
    /// failed discovery queries
    pub static ref DISCOVERY_ERRORS: IntCounter = register_int_counter!("discovery_errors", "discovery query failures").unwrap();
    /// queries answered with a stale or missing index
    pub static ref DISCOVERY_ANOMALIES: IntCounter = register_int_counter!("discovery_anomalies", "discovery queries with an insane index").unwrap();

    /// endpoints built by a factory
    pub static ref ENDPOINT_BUILDS: IntCounter = register_int_counter!("endpoint_builds", "endpoints built by a factory").unwrap();
    /// factory failures
    pub static ref ENDPOINT_BUILD_FAILURES: IntCounter = register_int_counter!("endpoint_build_failures", "endpoint factory failures").unwrap();
    /// endpoint resources released
    pub static ref ENDPOINT_RELEASES: IntCounter = register_int_counter!("endpoint_releases", "endpoint resources released").unwrap();

    /// attempts made by retry executors
    pub static ref RETRY_ATTEMPTS: IntCounter = register_int_counter!("retry_attempts", "attempts made by retry executors").unwrap();

    pub static ref RETRY_OUTCOME_VEC: IntCounterVec = register_int_counter_vec!(
        "retry_outcomes",
        "Retry executor outcomes",
        &["outcome"]
    )
    .unwrap();

    /// outcome of every call through a retry executor
    pub static ref RETRY_OUTCOME: RetryOutcomeStats = RetryOutcomeStats::from(&RETRY_OUTCOME_VEC);

    /// requests seen by the metrics middleware
    pub static ref ENDPOINT_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "endpoint_requests",
        "endpoint requests by operation and outcome",
        &["operation", "outcome"]
    )
    .unwrap();

    /// histogram of endpoint call durations
    pub static ref ENDPOINT_DURATION: HistogramVec = register_histogram_vec!(
        "endpoint_duration",
        "endpoint call duration (seconds)",
        &["operation"]
    )
    .unwrap();
}

//! Per-request performance instrumentation and shadow retrieval runs.
//!
//! Both emit structured `tracing` events (`patmos::perf`, `patmos::shadow`);
//! how those are collected or alerted on is left to the subscriber.

pub mod shadow;
pub mod timing;

pub use shadow::{calculate_chunk_overlap, should_run_shadow_test, ShadowRunner};
pub use timing::{build_metrics, MetricsContext, PerformanceTimings, RequestMetrics, Stage};

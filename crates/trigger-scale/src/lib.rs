//! Autoscaling signals for the sql-trigger change-tracking engine.
//!
//! Two independent decision makers consume the count of unprocessed changes:
//!
//! - [`ScaleMonitor`] votes `ScaleOut`/`ScaleIn`/`None` from a short window of samples
//! - [`TargetScaler`] computes the desired worker count from a single sample
//!
//! Both obtain samples through a [`MetricsProvider`], implemented by the
//! engine over its lease store.

pub mod metrics;
pub mod monitor;
pub mod target;

pub use metrics::{MetricsProvider, MetricsWindow, ScaleMetricSample, DEFAULT_WINDOW_CAPACITY};
pub use monitor::{
    ScaleMonitor, ScaleStatus, ScaleStatusContext, ScaleVote, MIN_SAMPLES_FOR_SCALING,
    TREND_REFERENCE_WINDOW_SECS,
};
pub use target::{ScaleError, TargetScaler, TargetScalerContext, TargetScalerResult};

/// Identifier shared by the monitor and the scaler of one trigger.
pub fn scaler_descriptor(user_function_id: &str, table_name: &str) -> String {
    format!("{user_function_id}-sql-trigger-{table_name}").to_lowercase()
}

//! Telemetry: structured logging and metric definitions.
//!
//! # Example
//!
//! ```rust,no_run
//! use petri_core::telemetry::{init_logging, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! ```

pub mod logging;
pub mod metrics;

pub use self::logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use self::metrics::describe_metrics;

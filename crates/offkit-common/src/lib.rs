//! # OffKit Common
//!
//! Shared utilities for the OffKit offline-first proxy engine.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Backoff policies for retried asset fetches

pub mod backoff;
pub mod logging;

pub use backoff::{run_with_backoff, BackoffPolicy};
pub use logging::{init_logging, LogConfig, LogFormat};

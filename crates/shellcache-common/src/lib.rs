//! # ShellCache Common
//!
//! Ambient utilities shared by the ShellCache crates.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Retry with exponential backoff
//! - Timeout helper for async operations

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig, TimedOut};

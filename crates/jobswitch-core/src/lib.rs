//! Core types shared across the JobSwitch orchestrator crates.
//!
//! This crate holds the foundational pieces every other JobSwitch crate
//! depends on: the unified error type and the tracing subscriber setup.
//!
//! # Main types
//!
//! - [`JobSwitchError`]: Unified error enum for all orchestrator subsystems.
//! - [`JobSwitchResult`]: Convenience alias for `Result<T, JobSwitchError>`.
//! - [`LogFormat`]: Output format selector for [`logging::init_tracing`].

/// Error taxonomy for the orchestrator.
pub mod error;
/// Tracing subscriber installation.
pub mod logging;

pub use error::{JobSwitchError, JobSwitchResult};
pub use logging::{init_tracing, LogFormat};

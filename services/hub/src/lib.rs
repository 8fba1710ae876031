//! Hub service library crate.
//!
//! Holds the service configuration and the startup wiring so the `herald`
//! binary and tests share one code path.
pub mod config;
pub mod observability;
pub mod runtime;

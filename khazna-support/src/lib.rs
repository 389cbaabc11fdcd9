//! # Khazna Support
//!
//! Shared utilities for the Khazna IoC framework.
//!
//! This crate provides:
//! - Text rendering for error messages and diagnostics
//! - Tracing subscriber initialisation for binaries and demos

pub mod logging;
pub mod rendering;

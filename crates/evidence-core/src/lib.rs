//! # Evidence Core
//!
//! Shared, runtime-free logic for the clinical evidence engine: data models,
//! the region table, parameter template rendering, the cascading fallback
//! policy, result aggregation, and the diagnostic types carried on every
//! [`result::SearchResult`].
//!
//! This crate contains no tokio, HTTP, or filesystem dependencies. Everything
//! that touches a network or a clock lives in the `clinical-evidence` crate.

pub mod aggregate;
pub mod models;
pub mod policy;
pub mod region;
pub mod result;
pub mod template;

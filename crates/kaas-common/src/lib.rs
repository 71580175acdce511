//! Common types for the KaaS control plane: model, errors, CRDs and utilities

pub mod crd;
pub mod error;
pub mod hierarchy;
pub mod kube_utils;
pub mod model;
pub mod naming;
pub mod plan;
pub mod retry;
pub mod telemetry;

pub use error::{Error, ErrorCategory};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

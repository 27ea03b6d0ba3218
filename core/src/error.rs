//! Error types for the request orchestrator.
//!
//! # Design
//! None of these ever escape as panics. Admission and dispatch failures
//! surface as a rejected `submit`, body failures are logged and the filter
//! chain falls back. Network failures are not errors at all: they arrive
//! through the normal completion path and fire the failure notification.

use thiserror::Error;

/// Why `WebApi::try_submit` refused a request.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Another request owned by the same orchestrator is still being sent
    /// or is in flight.
    #[error("request is processing already")]
    AlreadyProcessing,

    /// The transport refused to take the request.
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Errors a `Transport` reports when it cannot accept a request.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The target URL could not be parsed or uses an unsupported scheme.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The worker that would have performed the I/O could not be started.
    #[error("failed to start transport worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised while serializing or reinterpreting a body.
#[derive(Debug, Error)]
pub enum BodyError {
    /// The body could not be turned into a payload.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A payload could not be deserialized into the requested type.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Errors loading a `WebApiConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

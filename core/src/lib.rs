//! Asynchronous HTTP request orchestration.
//!
//! # Overview
//! A [`WebApi`] owns a template request body, runs it through a chain of
//! pre-filters, hands the result to a [`Transport`] without blocking, tracks
//! transfer progress, and on completion runs a chain of post-filters before
//! publishing the final [`ResponseBody`] and notifying listeners.
//!
//! # Design
//! - One request per `WebApi` at a time; `submit` is rejected while one is
//!   being sent or is in flight.
//! - The transport is a trait object. `UreqTransport` is provided; tests
//!   script their own.
//! - Filters are plain closures over `Arc<dyn RequestBody>` /
//!   `Arc<dyn ResponseBody>`; a filter returning `None` is logged and
//!   skipped.
//! - Notifications fan out to any number of listeners, each isolated from
//!   the others' panics.

pub mod api;
pub mod body;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod http;
pub mod request;
pub mod transport;
pub mod ureq_transport;

pub use api::{RequestState, WebApi};
pub use body::{
    JsonBody, JsonResponseBody, ParameterEncoding, RawBody, RawResponseBody, RequestBody,
    RequestBodyRef, ResponseBody, ResponseBodyRef, UrlParameterBody,
};
pub use config::WebApiConfig;
pub use error::{BodyError, ConfigError, DispatchError, SubmitError};
pub use events::Progress;
pub use filter::{Filter, FilterChain};
pub use http::{HttpMethod, HttpRequest, Payload};
pub use transport::{DispatchId, RequestCallbacks, Transport, TransportHandle, TransportResponse};
pub use ureq_transport::UreqTransport;

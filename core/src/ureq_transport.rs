//! Blocking `ureq` transport.
//!
//! Each dispatch runs on its own worker thread so the caller never blocks.
//! Progress is reported once the request has been written and then after
//! every chunk of the response body. Cancellation is cooperative: a blocking
//! call already underway runs to completion, but the worker stops before
//! reading further and never reports a result.

use std::io::Read as _;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::DispatchError;
use crate::http::{HttpRequest, Payload};
use crate::transport::{RequestCallbacks, Transport, TransportHandle, TransportResponse};

const CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Requests exceeding `timeout` complete as transport failures.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(timeout))
    }

    fn build(timeout: Option<Duration>) -> Self {
        // Status codes are classified by the orchestrator, not by ureq.
        let agent = ureq::Agent::config_builder()
            .timeout_global(timeout)
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UreqTransport {
    fn dispatch(
        &self,
        request: HttpRequest,
        callbacks: RequestCallbacks,
    ) -> Result<TransportHandle, DispatchError> {
        validate(&request.url)?;

        let handle = TransportHandle::new();
        let worker = handle.clone();
        let agent = self.agent.clone();
        thread::Builder::new()
            .name("webapi-ureq".to_string())
            .spawn(move || run(&agent, request, &callbacks, &worker))?;
        Ok(handle)
    }
}

fn validate(raw: &str) -> Result<(), DispatchError> {
    let invalid = |reason: String| DispatchError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme {other}"))),
    }
}

fn run(agent: &ureq::Agent, request: HttpRequest, callbacks: &RequestCallbacks, handle: &TransportHandle) {
    let sent = request.content.as_ref().map_or(0, |c| c.len() as u64);

    let mut builder = ureq::http::Request::builder()
        .method(request.method.as_str())
        .uri(&request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }

    let result = match request.content {
        Some(content) => builder
            .body(content.as_bytes().to_vec())
            .map_err(|e| e.to_string())
            .and_then(|req| agent.run(req).map_err(|e| e.to_string())),
        None => builder
            .body(())
            .map_err(|e| e.to_string())
            .and_then(|req| agent.run(req).map_err(|e| e.to_string())),
    };

    if handle.is_cancelled() {
        debug!(
            dispatch = %callbacks.dispatch_id(),
            handle = %handle.id(),
            "request cancelled before response"
        );
        return;
    }
    let response = match result {
        Ok(response) => response,
        Err(reason) => {
            callbacks.complete(TransportResponse::failed(0, reason));
            return;
        }
    };
    callbacks.progress(sent, 0);

    let status = response.status().as_u16();
    let mut reader = response.into_body().into_reader();
    let mut chunk = [0u8; CHUNK];
    let mut data = Vec::new();
    loop {
        if handle.is_cancelled() {
            debug!(
                dispatch = %callbacks.dispatch_id(),
                handle = %handle.id(),
                received = data.len(),
                "request cancelled while reading"
            );
            return;
        }
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                data.extend_from_slice(&chunk[..n]);
                callbacks.progress(sent, data.len() as u64);
            }
            Err(e) => {
                callbacks.complete(TransportResponse::failed(status, e.to_string()));
                return;
            }
        }
    }
    callbacks.complete(TransportResponse::ok(status, Payload::from_bytes(data)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparseable_url() {
        let err = validate("not a url").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidUrl { .. }));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let err = validate("ftp://example.com/file").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid url ftp://example.com/file: unsupported scheme ftp"
        );
    }

    #[test]
    fn accepts_http_and_https() {
        assert!(validate("http://localhost:3000/echo?a=1").is_ok());
        assert!(validate("https://example.com").is_ok());
    }
}

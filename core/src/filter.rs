//! Ordered, replayable transformation chains applied to request bodies
//! before dispatch and to response bodies after completion.
//!
//! # Design
//! A chain is a list, not a queue: `drain` replays every configured step on
//! each request and leaves the chain intact for the next one. `drain` works
//! on a snapshot taken when it starts, so a step appended while a drain is
//! running is picked up by the next drain rather than spliced into the
//! current one. The lock is never held while a step runs.
//!
//! A step that returns `None` rejects the body. The rejection is logged and
//! the chain carries on with the last valid body, so the following steps and
//! the caller always see a real body.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error};

use crate::body::{
    JsonBody, JsonResponseBody, ParameterEncoding, RequestBody, RequestBodyRef, ResponseBodyRef,
    UrlParameterBody,
};
use crate::error::BodyError;
use crate::http::{HttpMethod, Payload};

/// One transformation step. Any `Fn(T) -> Option<T>` closure is a filter.
pub trait Filter<T>: Send + Sync {
    fn apply(&self, body: T) -> Option<T>;
}

impl<T, F> Filter<T> for F
where
    F: Fn(T) -> Option<T> + Send + Sync,
{
    fn apply(&self, body: T) -> Option<T> {
        self(body)
    }
}

pub struct FilterChain<T> {
    name: &'static str,
    steps: Mutex<Vec<Arc<dyn Filter<T>>>>,
}

impl<T: Clone + 'static> FilterChain<T> {
    /// `name` only shows up in log records.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Mutex::new(Vec::new()),
        }
    }

    pub fn enqueue(&self, step: impl Filter<T> + 'static) {
        self.lock().push(Arc::new(step));
    }

    pub fn step_count(&self) -> usize {
        self.lock().len()
    }

    /// Run every step front-to-back, each one seeing the previous result.
    pub fn drain(&self, initial: T) -> T {
        let steps: Vec<_> = self.lock().clone();
        steps
            .iter()
            .enumerate()
            .fold(initial, |body, (index, step)| match step.apply(body.clone()) {
                Some(next) => next,
                None => {
                    error!(chain = self.name, step = index, "filter returned no body, keeping the previous one");
                    body
                }
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Filter<T>>>> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Ready-made filters
// ---------------------------------------------------------------------------

/// Pre-filter adding (or overriding) one header on whatever body it gets.
pub fn with_header(name: &str, value: &str) -> impl Filter<RequestBodyRef> {
    let name = name.to_string();
    let value = value.to_string();
    move |body: RequestBodyRef| {
        let overlay = HeaderOverlay::new(body, name.clone(), value.clone());
        Some(Arc::new(overlay) as RequestBodyRef)
    }
}

/// Pre-filter re-encoding a URL-parameter body as a JSON object. Any other
/// body type is rejected.
pub fn into_json() -> impl Filter<RequestBodyRef> {
    |body: RequestBodyRef| {
        let params = body.downcast_ref::<UrlParameterBody>()?;
        Some(Arc::new(JsonBody::from_parameters(params)) as RequestBodyRef)
    }
}

/// Post-filter parsing the payload as JSON. A payload that is not JSON
/// (an HTML error page, say) passes through unchanged.
pub fn parse_json() -> impl Filter<ResponseBodyRef> {
    |body: ResponseBodyRef| match JsonResponseBody::from_response(body.as_ref()) {
        Ok(json) => Some(Arc::new(json) as ResponseBodyRef),
        Err(e) => {
            debug!(status = body.status(), error = %e, "response payload is not json");
            Some(body)
        }
    }
}

/// A body with extra headers layered over another body.
#[derive(Debug)]
pub struct HeaderOverlay {
    inner: RequestBodyRef,
    headers: BTreeMap<String, String>,
}

impl HeaderOverlay {
    pub fn new(inner: RequestBodyRef, name: String, value: String) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(name, value);
        Self { inner, headers }
    }
}

impl RequestBody for HeaderOverlay {
    fn method(&self) -> HttpMethod {
        self.inner.method()
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut merged: BTreeMap<String, String> = self.inner.headers().into_iter().collect();
        merged.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.into_iter().collect()
    }

    fn encoding(&self) -> ParameterEncoding {
        self.inner.encoding()
    }

    fn serialize(&self) -> Result<Payload, BodyError> {
        self.inner.serialize()
    }

    fn parameter_count(&self) -> usize {
        self.inner.parameter_count()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{RawResponseBody, ResponseBody};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    #[test]
    fn steps_run_in_order_and_see_previous_output() {
        let chain: FilterChain<Vec<u32>> = FilterChain::new("test");
        chain.enqueue(|mut v: Vec<u32>| {
            v.push(1);
            Some(v)
        });
        chain.enqueue(|mut v: Vec<u32>| {
            assert_eq!(v, vec![0, 1]);
            v.push(2);
            Some(v)
        });
        assert_eq!(chain.drain(vec![0]), vec![0, 1, 2]);
    }

    #[test]
    fn drain_replays_every_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain: FilterChain<u32> = FilterChain::new("test");
        let counter = calls.clone();
        chain.enqueue(move |n: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(n + 1)
        });

        assert_eq!(chain.drain(0), 1);
        assert_eq!(chain.drain(10), 11);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(chain.step_count(), 1);
    }

    #[traced_test]
    #[test]
    fn rejected_body_falls_back_to_last_valid() {
        let chain: FilterChain<u32> = FilterChain::new("test");
        chain.enqueue(|n: u32| Some(n * 10));
        chain.enqueue(|_: u32| -> Option<u32> { None });
        chain.enqueue(|n: u32| Some(n + 1));

        assert_eq!(chain.drain(2), 21);
        assert!(logs_contain("filter returned no body"));
    }

    #[test]
    fn step_added_during_drain_waits_for_next_drain() {
        let chain: Arc<FilterChain<u32>> = Arc::new(FilterChain::new("test"));
        let inner = chain.clone();
        chain.enqueue(move |n: u32| {
            if inner.step_count() == 1 {
                inner.enqueue(|n: u32| Some(n * 100));
            }
            Some(n + 1)
        });

        assert_eq!(chain.drain(0), 1);
        assert_eq!(chain.drain(0), 100);
    }

    #[test]
    fn with_header_overrides_and_keeps_payload() {
        let mut params = UrlParameterBody::new(HttpMethod::Post);
        params.set_parameter("a", "1");
        params.set_header("accept", "text/plain");

        let chain: FilterChain<RequestBodyRef> = FilterChain::new("pre");
        chain.enqueue(with_header("accept", "application/json"));
        chain.enqueue(with_header("x-id", "9"));

        let body = chain.drain(Arc::new(params));
        assert_eq!(
            body.headers(),
            vec![
                ("accept".to_string(), "application/json".to_string()),
                ("x-id".to_string(), "9".to_string()),
            ]
        );
        assert_eq!(body.serialize().unwrap(), Payload::Text("a=1".into()));
        assert_eq!(body.method(), HttpMethod::Post);
    }

    #[test]
    fn into_json_rejects_non_parameter_bodies() {
        let raw: RequestBodyRef = Arc::new(crate::body::RawBody::new(
            HttpMethod::Post,
            Payload::Text("x".into()),
        ));
        assert!(into_json().apply(raw).is_none());

        let params: RequestBodyRef = Arc::new(UrlParameterBody::new(HttpMethod::Post));
        let json = into_json().apply(params).unwrap();
        assert!(json.downcast_ref::<JsonBody>().is_some());
    }

    #[traced_test]
    #[test]
    fn parse_json_passes_non_json_through() {
        let chain: FilterChain<ResponseBodyRef> = FilterChain::new("post");
        chain.enqueue(parse_json());

        let raw: ResponseBodyRef = Arc::new(RawResponseBody::new(500, Payload::Text("<html>".into())));
        let out = chain.drain(raw);
        assert!(out.downcast_ref::<RawResponseBody>().is_some());
        assert_eq!(out.status(), 500);
        assert!(logs_contain("response payload is not json"));
        assert!(!logs_contain("filter returned no body"));

        let ok: ResponseBodyRef = Arc::new(RawResponseBody::new(200, Payload::Text("[1,2]".into())));
        let out = chain.drain(ok);
        let json = out.downcast_ref::<JsonResponseBody>().unwrap();
        assert_eq!(json.value(), &serde_json::json!([1, 2]));
    }
}

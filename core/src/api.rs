//! The request orchestrator.
//!
//! # Design
//! `WebApi` is a cheap, cloneable handle around shared state. One instance
//! owns a template `UrlParameterBody`, a pre-filter and a post-filter chain,
//! and at most one request that is being sent or is in flight.
//!
//! `submit` moves the lifecycle to `Sending` under the lock before anything
//! else happens. That is the only admission control: any other `submit`,
//! including one issued from inside a filter or hook, sees `Sending` or
//! `InFlight` and is rejected. No lock is held while filters, hooks,
//! listeners or the transport run.
//!
//! Every accepted submit gets a fresh `DispatchId`. Transport callbacks carry
//! it back, and anything not matching the current id (a cancelled or
//! already-finished dispatch) is dropped.
//!
//! Callbacks only record what happened; delivery to listeners is done by one
//! thread at a time (see `Shared::deliver`). Whichever thread finds delivery
//! idle takes it over and keeps emitting until nothing new is left, so
//! progress never goes backwards and the outcome always comes last. Nothing
//! arrives before "started" has gone out.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace, warn};

use crate::body::{RawResponseBody, RequestBodyRef, ResponseBodyRef, UrlParameterBody};
use crate::config::WebApiConfig;
use crate::error::SubmitError;
use crate::events::{Events, Progress};
use crate::filter::{Filter, FilterChain};
use crate::http::HttpMethod;
use crate::request::build_request;
use crate::transport::{
    DispatchId, DispatchSink, RequestCallbacks, Transport, TransportHandle, TransportResponse,
};

/// Where a `WebApi` is in its request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    /// Admitted; filters are draining or the transport is being asked.
    Sending,
    InFlight,
    Completed,
}

type Hook = Arc<dyn Fn(&WebApi) + Send + Sync>;

#[derive(Clone)]
pub struct WebApi {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    transport: Arc<dyn Transport>,
    template: Mutex<UrlParameterBody>,
    success_codes: Mutex<BTreeSet<u16>>,
    pre_filters: FilterChain<RequestBodyRef>,
    post_filters: FilterChain<ResponseBodyRef>,
    before_submit: Mutex<Option<Hook>>,
    lifecycle: Mutex<Lifecycle>,
    events: Events,
}

struct Lifecycle {
    state: RequestState,
    current: Option<DispatchId>,
    handle: Option<TransportHandle>,
    progress: Progress,
    /// Bumped on every progress report for `current`.
    progress_seq: u64,
    /// `progress_seq` as of the last progress notification.
    emitted_seq: u64,
    /// "started" has been emitted for `current`.
    announced: bool,
    /// Some thread is running `Shared::deliver` for `current`.
    delivering: bool,
    /// A completion is being post-filtered for `current`.
    finishing: bool,
    /// Completion waiting for delivery.
    pending: Option<TransportResponse>,
    response: Option<ResponseBodyRef>,
}

/// Next thing `Shared::deliver` hands to listeners.
enum Delivery {
    Progress(Progress),
    Finish(TransportResponse),
}

impl Lifecycle {
    fn reset(&mut self, state: RequestState) {
        self.state = state;
        self.current = None;
        self.handle = None;
        self.progress = Progress::default();
        self.progress_seq = 0;
        self.emitted_seq = 0;
        self.announced = false;
        self.delivering = false;
        self.finishing = false;
        self.pending = None;
    }

    fn is_busy(&self) -> bool {
        matches!(self.state, RequestState::Sending | RequestState::InFlight)
    }

    fn accepts(&self, id: DispatchId) -> bool {
        self.current == Some(id) && self.is_busy() && !self.finishing
    }
}

impl WebApi {
    pub fn new(config: WebApiConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: config.url,
                transport,
                template: Mutex::new(UrlParameterBody::new(config.method)),
                success_codes: Mutex::new(config.success_codes),
                pre_filters: FilterChain::new("pre"),
                post_filters: FilterChain::new("post"),
                before_submit: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle {
                    state: RequestState::Idle,
                    current: None,
                    handle: None,
                    progress: Progress::default(),
                    progress_seq: 0,
                    emitted_seq: 0,
                    announced: false,
                    delivering: false,
                    finishing: false,
                    pending: None,
                    response: None,
                }),
                events: Events::default(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    // -----------------------------------------------------------------------
    // Template body
    // -----------------------------------------------------------------------

    pub fn set_parameter(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.shared.template).set_parameter(key, value);
    }

    pub fn parameter(&self, key: &str) -> Option<String> {
        lock(&self.shared.template).parameter(key).map(str::to_string)
    }

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        lock(&self.shared.template).set_header(name, value);
    }

    pub fn set_method(&self, method: HttpMethod) {
        lock(&self.shared.template).set_method(method);
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Filters are appended, never removed. One added while a drain runs
    /// applies from the next request on.
    pub fn add_pre_filter(&self, filter: impl Filter<RequestBodyRef> + 'static) {
        self.shared.pre_filters.enqueue(filter);
    }

    pub fn add_post_filter(&self, filter: impl Filter<ResponseBodyRef> + 'static) {
        self.shared.post_filters.enqueue(filter);
    }

    pub fn set_success_codes(&self, codes: impl IntoIterator<Item = u16>) {
        *lock(&self.shared.success_codes) = codes.into_iter().collect();
    }

    pub fn add_success_code(&self, code: u16) {
        lock(&self.shared.success_codes).insert(code);
    }

    pub fn success_codes(&self) -> BTreeSet<u16> {
        lock(&self.shared.success_codes).clone()
    }

    /// Runs at the start of every admitted submit, before the pre-filters.
    pub fn set_before_submit(&self, hook: impl Fn(&WebApi) + Send + Sync + 'static) {
        *lock(&self.shared.before_submit) = Some(Arc::new(hook));
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    pub fn on_started(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.shared.events.started.subscribe(move |_: &()| listener());
    }

    pub fn on_succeeded(&self, listener: impl Fn(&ResponseBodyRef) + Send + Sync + 'static) {
        self.shared.events.succeeded.subscribe(listener);
    }

    pub fn on_failed(&self, listener: impl Fn(&ResponseBodyRef) + Send + Sync + 'static) {
        self.shared.events.failed.subscribe(listener);
    }

    pub fn on_completed(&self, listener: impl Fn(&ResponseBodyRef) + Send + Sync + 'static) {
        self.shared.events.completed.subscribe(listener);
    }

    pub fn on_progress(&self, listener: impl Fn(Progress) + Send + Sync + 'static) {
        self.shared.events.progress.subscribe(move |p: &Progress| listener(*p));
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Send the template through the pre-filters and hand it to the
    /// transport. Returns `false` if a request is already being processed
    /// or the transport refused it.
    pub fn submit(&self) -> bool {
        self.try_submit().is_ok()
    }

    pub fn try_submit(&self) -> Result<DispatchId, SubmitError> {
        let shared = &self.shared;
        let id = DispatchId::new();
        {
            let mut life = shared.lifecycle();
            if life.is_busy() {
                warn!(url = %shared.url, "request is processing already");
                return Err(SubmitError::AlreadyProcessing);
            }
            life.reset(RequestState::Sending);
            life.current = Some(id);
        }

        let hook = lock(&shared.before_submit).clone();
        if let Some(hook) = hook {
            hook(self);
        }

        let template: RequestBodyRef = Arc::new(lock(&shared.template).clone());
        let body = shared.pre_filters.drain(template);
        let request = build_request(&shared.url, body.as_ref());
        drop(body);

        let sink = Arc::downgrade(&self.shared);
        let sink: Weak<dyn DispatchSink> = sink;
        let callbacks = RequestCallbacks::new(id, sink);
        debug!(%id, method = %request.method, url = %request.url, "dispatching request");

        let handle = match shared.transport.dispatch(request, callbacks) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(url = %shared.url, error = %e, "add request failed");
                let mut life = shared.lifecycle();
                if life.current == Some(id) {
                    life.reset(RequestState::Idle);
                }
                return Err(e.into());
            }
        };

        {
            let mut life = shared.lifecycle();
            if life.current != Some(id) {
                drop(life);
                shared.transport.cancel(&handle);
                return Ok(id);
            }
            life.state = RequestState::InFlight;
            life.handle = Some(handle);
        }
        shared.events.started.emit(&());

        {
            let mut life = shared.lifecycle();
            if life.current != Some(id) {
                // Cancelled from a "started" listener.
                return Ok(id);
            }
            life.announced = true;
        }
        // Flush whatever the transport reported while "started" was going out.
        shared.deliver(id);
        Ok(id)
    }

    /// Abandon the request in flight. The state returns to `Idle` at once;
    /// whatever the transport reports afterwards is ignored.
    pub fn cancel_request(&self) {
        let handle = {
            let mut life = self.shared.lifecycle();
            if life.state != RequestState::InFlight {
                return;
            }
            let handle = life.handle.take();
            life.reset(RequestState::Idle);
            handle
        };
        debug!(url = %self.shared.url, "request cancelled");
        if let Some(handle) = handle {
            self.shared.transport.cancel(&handle);
        }
    }

    pub fn state(&self) -> RequestState {
        self.shared.lifecycle().state
    }

    pub fn is_processing_request(&self) -> bool {
        self.shared.lifecycle().is_busy()
    }

    /// Bytes sent so far; 0 unless a request is in flight.
    pub fn sent_progress(&self) -> u64 {
        self.progress().sent
    }

    /// Bytes received so far; 0 unless a request is in flight.
    pub fn received_progress(&self) -> u64 {
        self.progress().received
    }

    pub fn progress(&self) -> Progress {
        let life = self.shared.lifecycle();
        if life.state == RequestState::InFlight {
            life.progress
        } else {
            Progress::default()
        }
    }

    /// Final body of the last completed request.
    pub fn response_body(&self) -> Option<ResponseBodyRef> {
        self.shared.lifecycle().response.clone()
    }
}

impl fmt::Debug for WebApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebApi")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        lock(&self.lifecycle)
    }

    /// Hand recorded progress and the pending completion of `id` to
    /// listeners. Returns at once if `id` is not announced yet or another
    /// call is already delivering; that call picks up what was recorded.
    /// No lock is held while listeners run, so they may cancel and submit.
    fn deliver(&self, id: DispatchId) {
        {
            let mut life = self.lifecycle();
            if !life.accepts(id) || !life.announced || life.delivering {
                return;
            }
            life.delivering = true;
        }
        loop {
            let next = {
                let mut life = self.lifecycle();
                if !life.accepts(id) {
                    // Cancelled (and maybe resubmitted) by a listener.
                    return;
                }
                if life.progress_seq != life.emitted_seq {
                    life.emitted_seq = life.progress_seq;
                    Delivery::Progress(life.progress)
                } else if let Some(response) = life.pending.take() {
                    life.delivering = false;
                    life.finishing = true;
                    Delivery::Finish(response)
                } else {
                    life.delivering = false;
                    return;
                }
            };
            match next {
                Delivery::Progress(progress) => self.events.progress.emit(&progress),
                Delivery::Finish(response) => {
                    self.finish(id, response);
                    return;
                }
            }
        }
    }

    /// Post-filter a completion, publish it and notify.
    fn finish(&self, id: DispatchId, response: TransportResponse) {
        let raw: ResponseBodyRef = Arc::new(RawResponseBody::new(response.status, response.payload));
        let body = self.post_filters.drain(raw);
        let succeeded = response.succeeded && lock(&self.success_codes).contains(&body.status());

        {
            let mut life = self.lifecycle();
            if life.current != Some(id) {
                trace!(%id, "dropping completion of a cancelled request");
                return;
            }
            life.reset(RequestState::Completed);
            life.response = Some(body.clone());
        }
        debug!(%id, status = body.status(), succeeded, "request completed");

        if succeeded {
            self.events.succeeded.emit(&body);
        } else {
            self.events.failed.emit(&body);
        }
        self.events.completed.emit(&body);
    }
}

impl DispatchSink for Shared {
    fn on_progress(&self, id: DispatchId, sent: u64, received: u64) {
        {
            let mut life = self.lifecycle();
            if !life.accepts(id) || life.pending.is_some() {
                trace!(%id, "dropping stale progress");
                return;
            }
            life.progress = Progress { sent, received };
            life.progress_seq += 1;
        }
        self.deliver(id);
    }

    fn on_complete(&self, id: DispatchId, response: TransportResponse) {
        {
            let mut life = self.lifecycle();
            if !life.accepts(id) || life.pending.is_some() {
                trace!(%id, "dropping stale completion");
                return;
            }
            life.pending = Some(response);
        }
        self.deliver(id);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let life = self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = life.handle.take() {
            self.transport.cancel(&handle);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpRequest, Payload};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tracing_test::traced_test;

    /// Completes every request synchronously from inside `dispatch`.
    struct Immediate {
        status: u16,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Transport for Immediate {
        fn dispatch(
            &self,
            request: HttpRequest,
            callbacks: RequestCallbacks,
        ) -> Result<TransportHandle, crate::error::DispatchError> {
            self.seen.lock().unwrap().push(request);
            callbacks.progress(3, 0);
            callbacks.complete(TransportResponse::ok(self.status, Payload::Text("done".into())));
            Ok(TransportHandle::new())
        }
    }

    fn immediate(status: u16) -> (WebApi, Arc<Immediate>) {
        let transport = Arc::new(Immediate {
            status,
            seen: Mutex::new(Vec::new()),
        });
        let api = WebApi::new(WebApiConfig::new("http://localhost:3000/x"), transport.clone());
        (api, transport)
    }

    fn record(api: &WebApi) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        api.on_started(move || l.lock().unwrap().push("started".into()));
        let l = log.clone();
        api.on_progress(move |p| l.lock().unwrap().push(format!("progress {}", p.sent)));
        let l = log.clone();
        api.on_succeeded(move |_| l.lock().unwrap().push("succeeded".into()));
        let l = log.clone();
        api.on_failed(move |_| l.lock().unwrap().push("failed".into()));
        let l = log.clone();
        api.on_completed(move |_| l.lock().unwrap().push("completed".into()));
        log
    }

    #[test]
    fn synchronous_completion_is_held_until_started() {
        let (api, _) = immediate(200);
        let log = record(&api);

        assert!(api.submit());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["started", "progress 3", "succeeded", "completed"]
        );
        assert_eq!(api.state(), RequestState::Completed);
        assert_eq!(api.sent_progress(), 0);
        assert_eq!(api.response_body().unwrap().status(), 200);
    }

    #[test]
    fn before_submit_hook_runs_before_pre_filters() {
        let (api, transport) = immediate(200);
        api.set_before_submit(|api| api.set_parameter("stamp", "42"));
        api.add_pre_filter(|body: RequestBodyRef| {
            assert_eq!(body.parameter_count(), 1);
            Some(body)
        });

        assert!(api.submit());
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].url, "http://localhost:3000/x?stamp=42");
    }

    #[traced_test]
    #[test]
    fn reentrant_submit_from_a_filter_is_rejected() {
        let (api, _) = immediate(200);
        let inner = api.clone();
        let nested = Arc::new(Mutex::new(None));
        let slot = nested.clone();
        api.add_pre_filter(move |body: RequestBodyRef| {
            *slot.lock().unwrap() = Some(inner.submit());
            Some(body)
        });

        assert!(api.submit());
        assert_eq!(*nested.lock().unwrap(), Some(false));
        assert!(logs_contain("request is processing already"));
    }

    #[test]
    fn listener_can_resubmit_from_completed() {
        let (api, transport) = immediate(500);
        let again = api.clone();
        let resubmitted = Arc::new(AtomicBool::new(false));
        let flag = resubmitted.clone();
        api.on_completed(move |_| {
            if !flag.swap(true, Ordering::SeqCst) {
                assert!(again.submit());
            }
        });

        assert!(api.submit());
        assert_eq!(transport.seen.lock().unwrap().len(), 2);
        assert!(resubmitted.load(Ordering::SeqCst));
    }
}

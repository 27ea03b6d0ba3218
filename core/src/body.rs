//! Request and response bodies.
//!
//! # Design
//! The orchestrator is polymorphic over two capability sets:
//! [`RequestBody`] (verb, headers, encoding, serialized payload) and
//! [`ResponseBody`] (a status code fixed at construction plus whatever the
//! concrete type derives from the payload). Filters replace bodies rather
//! than mutating them, so bodies travel as `Arc<dyn ...>` and typed access
//! goes through `downcast_ref`.
//!
//! Parameters and headers are kept in `BTreeMap`s so serialization is
//! deterministic for a given mapping.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::BodyError;
use crate::http::{HttpMethod, Payload};

/// Request bodies as they flow through the pre-filter chain.
pub type RequestBodyRef = Arc<dyn RequestBody>;

/// Response bodies as they flow through the post-filter chain.
pub type ResponseBodyRef = Arc<dyn ResponseBody>;

/// How a request body serializes its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterEncoding {
    /// `application/x-www-form-urlencoded` pairs; appended to the URL for
    /// GET-like verbs, sent as text content otherwise.
    UrlQuery,
    /// A text payload.
    String,
    /// A binary payload.
    Bytes,
}

pub trait RequestBody: Any + Send + Sync + fmt::Debug {
    fn method(&self) -> HttpMethod;

    fn headers(&self) -> Vec<(String, String)>;

    fn encoding(&self) -> ParameterEncoding;

    fn serialize(&self) -> Result<Payload, BodyError>;

    fn parameter_count(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}

impl dyn RequestBody {
    pub fn downcast_ref<T: RequestBody>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

pub trait ResponseBody: Any + Send + Sync + fmt::Debug {
    /// Status code reported by the transport. Fixed when the body is built.
    fn status(&self) -> u16;

    fn payload(&self) -> &Payload;

    fn as_any(&self) -> &dyn Any;
}

impl dyn ResponseBody {
    pub fn downcast_ref<T: ResponseBody>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Key/value parameters serialized as a URL-encoded form.
///
/// This is the template body every `WebApi` owns; callers fill it through
/// `WebApi::set_parameter` before each submit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParameterBody {
    method: HttpMethod,
    parameters: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
}

impl UrlParameterBody {
    pub fn new(method: HttpMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn set_method(&mut self, method: HttpMethod) {
        self.method = method;
    }

    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }
}

impl RequestBody for UrlParameterBody {
    fn method(&self) -> HttpMethod {
        self.method
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn encoding(&self) -> ParameterEncoding {
        ParameterEncoding::UrlQuery
    }

    fn serialize(&self) -> Result<Payload, BodyError> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.parameters)
            .finish();
        Ok(Payload::Text(query))
    }

    fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A JSON document sent as text content.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonBody {
    method: HttpMethod,
    value: Value,
    headers: BTreeMap<String, String>,
}

impl JsonBody {
    pub fn new(method: HttpMethod, value: Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self { method, value, headers }
    }

    /// Re-encode URL parameters as a flat JSON object of strings, keeping
    /// the verb and headers.
    pub fn from_parameters(body: &UrlParameterBody) -> Self {
        let object = body
            .parameters()
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let mut json = Self::new(body.method(), Value::Object(object));
        for (name, value) in body.headers() {
            json.headers.entry(name).or_insert(value);
        }
        json
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl RequestBody for JsonBody {
    fn method(&self) -> HttpMethod {
        self.method
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn encoding(&self) -> ParameterEncoding {
        ParameterEncoding::String
    }

    fn serialize(&self) -> Result<Payload, BodyError> {
        serde_json::to_string(&self.value)
            .map(Payload::Text)
            .map_err(|e| BodyError::Serialization(e.to_string()))
    }

    fn parameter_count(&self) -> usize {
        match &self.value {
            Value::Object(map) => map.len(),
            Value::Null => 0,
            _ => 1,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A pre-serialized payload sent as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBody {
    method: HttpMethod,
    payload: Payload,
    headers: BTreeMap<String, String>,
}

impl RawBody {
    pub fn new(method: HttpMethod, payload: Payload) -> Self {
        Self {
            method,
            payload,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl RequestBody for RawBody {
    fn method(&self) -> HttpMethod {
        self.method
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn encoding(&self) -> ParameterEncoding {
        match self.payload {
            Payload::Text(_) => ParameterEncoding::String,
            Payload::Bytes(_) => ParameterEncoding::Bytes,
        }
    }

    fn serialize(&self) -> Result<Payload, BodyError> {
        Ok(self.payload.clone())
    }

    fn parameter_count(&self) -> usize {
        usize::from(!self.payload.is_empty())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

/// The body the orchestrator builds from every transport completion, before
/// any post-filter runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponseBody {
    status: u16,
    payload: Payload,
}

impl RawResponseBody {
    pub fn new(status: u16, payload: Payload) -> Self {
        Self { status, payload }
    }
}

impl ResponseBody for RawResponseBody {
    fn status(&self) -> u16 {
        self.status
    }

    fn payload(&self) -> &Payload {
        &self.payload
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A response whose payload parsed as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonResponseBody {
    status: u16,
    payload: Payload,
    value: Value,
}

impl JsonResponseBody {
    /// Parse the payload of any response body, carrying its status forward.
    pub fn from_response(body: &dyn ResponseBody) -> Result<Self, BodyError> {
        let value = serde_json::from_slice(body.payload().as_bytes())
            .map_err(|e| BodyError::Deserialization(e.to_string()))?;
        Ok(Self {
            status: body.status(),
            payload: body.payload().clone(),
            value,
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Deserialize the document into a caller-defined type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, BodyError> {
        T::deserialize(&self.value).map_err(|e| BodyError::Deserialization(e.to_string()))
    }
}

impl ResponseBody for JsonResponseBody {
    fn status(&self) -> u16 {
        self.status
    }

    fn payload(&self) -> &Payload {
        &self.payload
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

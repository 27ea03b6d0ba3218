//! HTTP request types handed to a `Transport`.
//!
//! # Design
//! The orchestrator describes the outgoing request as plain data and never
//! touches the network itself; the transport owns the actual I/O. Fields use
//! owned types so a request can move onto whatever thread the transport
//! schedules it on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// HTTP verb for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Verbs whose parameters travel in the query string instead of the body.
    pub fn carries_query(self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Head)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized content of a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text view of the payload; invalid UTF-8 is replaced.
    pub fn to_text(&self) -> String {
        match self {
            Payload::Text(s) => s.clone(),
            Payload::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// Interpret raw bytes as text when they are valid UTF-8.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(s) => Payload::Text(s),
            Err(e) => Payload::Bytes(e.into_bytes()),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

/// An outgoing HTTP request described as plain data.
///
/// Built by [`crate::request::build_request`] from the body the pre-filter
/// chain produced. `content` is `None` for verbs that carry their
/// parameters in the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub content: Option<Payload>,
}

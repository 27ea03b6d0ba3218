//! Static configuration for one `WebApi`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::http::HttpMethod;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebApiConfig {
    /// Target URL every request is sent to.
    pub url: String,
    /// Status codes that count as success. Defaults to `{200}`.
    #[serde(default = "default_success_codes")]
    pub success_codes: BTreeSet<u16>,
    /// Verb of the template body.
    #[serde(default)]
    pub method: HttpMethod,
}

fn default_success_codes() -> BTreeSet<u16> {
    BTreeSet::from([200])
}

impl WebApiConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            success_codes: default_success_codes(),
            method: HttpMethod::default(),
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_success_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.success_codes = codes.into_iter().collect();
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }
}

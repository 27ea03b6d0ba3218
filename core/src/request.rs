//! Turning a filtered request body into an outgoing `HttpRequest`.

use tracing::warn;

use crate::body::{ParameterEncoding, RequestBody};
use crate::http::{HttpRequest, Payload};

/// Build the request the transport will send to `url`.
///
/// GET-like verbs with parameters append them as a query string. Every
/// other verb keeps `url` untouched and sends the serialized body as
/// content: text for the URL-query and string encodings, bytes for the
/// bytes encoding. Headers are copied verbatim. A body that fails to
/// serialize is logged and sent without parameters.
pub fn build_request(url: &str, body: &dyn RequestBody) -> HttpRequest {
    let method = body.method();

    let (url, content) = if method.carries_query() {
        (with_query(url, body), None)
    } else {
        (url.to_string(), content(body))
    };

    HttpRequest {
        method,
        url,
        headers: body.headers(),
        content,
    }
}

fn with_query(url: &str, body: &dyn RequestBody) -> String {
    if body.parameter_count() == 0 {
        return url.to_string();
    }
    let query = match body.serialize() {
        Ok(payload) => payload.to_text(),
        Err(e) => {
            warn!(url, error = %e, "failed to serialize query parameters");
            return url.to_string();
        }
    };
    if query.is_empty() {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{query}")
}

fn content(body: &dyn RequestBody) -> Option<Payload> {
    let payload = match body.serialize() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to serialize request body");
            return None;
        }
    };
    match body.encoding() {
        ParameterEncoding::UrlQuery | ParameterEncoding::String => {
            Some(Payload::Text(payload.to_text()))
        }
        ParameterEncoding::Bytes => Some(Payload::Bytes(payload.as_bytes().to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{JsonBody, RawBody, UrlParameterBody};
    use crate::http::HttpMethod;

    const URL: &str = "http://localhost:3000/api";

    #[test]
    fn get_with_parameters_appends_query() {
        let mut body = UrlParameterBody::new(HttpMethod::Get);
        body.set_parameter("a", "1");
        body.set_parameter("b", "2");
        let req = build_request(URL, &body);
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.url, "http://localhost:3000/api?a=1&b=2");
        assert!(req.content.is_none());
    }

    #[test]
    fn get_without_parameters_uses_bare_url() {
        let req = build_request(URL, &UrlParameterBody::new(HttpMethod::Get));
        assert_eq!(req.url, URL);
        assert!(req.content.is_none());
    }

    #[test]
    fn get_joins_existing_query_with_ampersand() {
        let mut body = UrlParameterBody::new(HttpMethod::Get);
        body.set_parameter("page", "2");
        let req = build_request("http://h/items?sort=asc", &body);
        assert_eq!(req.url, "http://h/items?sort=asc&page=2");
    }

    #[test]
    fn post_sends_serialized_string_without_query() {
        let body = JsonBody::new(HttpMethod::Post, serde_json::json!({"title": "milk"}));
        let req = build_request(URL, &body);
        assert_eq!(req.url, URL);
        assert_eq!(req.content, Some(Payload::Text(r#"{"title":"milk"}"#.into())));
        assert_eq!(
            req.headers,
            vec![("content-type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn post_with_url_parameters_sends_form_text() {
        let mut body = UrlParameterBody::new(HttpMethod::Post);
        body.set_parameter("q", "a b");
        let req = build_request(URL, &body);
        assert_eq!(req.url, URL);
        assert_eq!(req.content, Some(Payload::Text("q=a+b".into())));
    }

    #[test]
    fn bytes_encoding_sends_bytes() {
        let body = RawBody::new(HttpMethod::Put, Payload::Bytes(vec![0, 159, 146]))
            .with_header("content-type", "application/octet-stream");
        let req = build_request(URL, &body);
        assert_eq!(req.content, Some(Payload::Bytes(vec![0, 159, 146])));
        assert_eq!(req.headers.len(), 1);
    }
}

//! Network execution of materialized requests.

use crate::materializer::{MaterializedBody, MaterializedRequest};
use crate::model::{HttpMethod, HttpResponse};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::Form;
use reqwest::{Client, Method as ReqMethod, RequestBuilder};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A response together with the wall-clock time spent obtaining it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub response: HttpResponse,
    pub elapsed_ms: u64,
}

/// Sends a materialized request.
///
/// Implementations never fail: transport problems are reported as a
/// response with status 0.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn send(&self, request: &MaterializedRequest) -> ExecutionOutcome;
}

/// Executor backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: Client,
    timeout: Duration,
}

impl Default for ReqwestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestExecutor {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn convert_method(method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }

    fn build(&self, request: &MaterializedRequest) -> RequestBuilder {
        let mut builder = self
            .client
            .request(Self::convert_method(request.method), &request.url)
            .timeout(self.timeout);

        let sends_body = request.sends_body();
        let multipart = sends_body && matches!(request.body, MaterializedBody::FormData(_));

        for (name, value) in &request.headers {
            // The multipart boundary is part of the content type.
            if multipart && name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        if !sends_body {
            return builder;
        }

        if request.header(CONTENT_TYPE.as_str()).is_none() {
            if let Some(content_type) = request.content_type() {
                builder = builder.header(CONTENT_TYPE, content_type);
            }
        }

        match &request.body {
            MaterializedBody::None => builder,
            MaterializedBody::Json(value) => builder.body(value.to_string()),
            MaterializedBody::Text(text)
            | MaterializedBody::UrlEncoded(text)
            | MaterializedBody::Raw(text) => builder.body(text.clone()),
            MaterializedBody::FormData(fields) => {
                let form = fields.iter().fold(Form::new(), |form, (key, value)| {
                    form.text(key.clone(), value.clone())
                });
                builder.multipart(form)
            }
        }
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &MaterializedRequest) -> ExecutionOutcome {
        let builder = self.build(request);

        let start = Instant::now();
        let result = match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let status_text = status.canonical_reason().unwrap_or("Unknown").to_string();

                let mut headers = HashMap::new();
                for (key, value) in response.headers() {
                    headers.insert(
                        key.to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    );
                }

                response.bytes().await.map(|bytes| {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    (status.as_u16(), status_text, headers, text)
                })
            }
            Err(err) => Err(err),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let response = match result {
            Ok((status, status_text, headers, text)) => {
                debug!(status, elapsed_ms, "received response");
                let (data, body_len) = decode_body(text);
                HttpResponse {
                    status,
                    status_text,
                    size: headers_len(&headers) + body_len,
                    headers,
                    data,
                    time: elapsed_ms,
                }
            }
            Err(err) => {
                let kind = classify_error(&err);
                warn!(kind, error = %err, "request failed");
                error_response(kind, err.to_string(), elapsed_ms)
            }
        };

        ExecutionOutcome {
            response,
            elapsed_ms,
        }
    }
}

/// Synthetic response for a transport failure.
pub fn error_response(kind: &str, message: impl Into<String>, elapsed_ms: u64) -> HttpResponse {
    HttpResponse {
        status: 0,
        status_text: "Error".into(),
        headers: HashMap::new(),
        data: json!({ "message": message.into(), "name": kind }),
        time: elapsed_ms,
        size: 0,
    }
}

fn classify_error(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "TimeoutError"
    } else if err.is_connect() {
        "ConnectionError"
    } else if err.is_builder() {
        "InvalidRequestError"
    } else if err.is_body() || err.is_decode() {
        "BodyError"
    } else {
        "RequestError"
    }
}

/// Parsed JSON when the body is JSON, otherwise the text, together with
/// the length used for the size estimate.
fn decode_body(text: String) -> (Value, u64) {
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => {
            let len = value.to_string().len() as u64;
            (value, len)
        }
        Err(_) => {
            let len = text.len() as u64;
            (Value::String(text), len)
        }
    }
}

fn headers_len(headers: &HashMap<String, String>) -> u64 {
    serde_json::to_string(headers)
        .map(|s| s.len() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> MaterializedRequest {
        MaterializedRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: Vec::new(),
            body: MaterializedBody::None,
        }
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response("TimeoutError", "took too long", 42);
        assert_eq!(response.status, 0);
        assert_eq!(response.status_text, "Error");
        assert_eq!(response.time, 42);
        assert_eq!(response.size, 0);
        assert!(response.headers.is_empty());
        assert_eq!(response.data["name"], "TimeoutError");
        assert_eq!(
            response.error_message().as_deref(),
            Some("TimeoutError: took too long")
        );
    }

    #[test]
    fn test_decode_body() {
        let (value, len) = decode_body("{ \"a\": 1 }".to_string());
        assert_eq!(value, json!({"a": 1}));
        assert_eq!(len, "{\"a\":1}".len() as u64);

        let (value, len) = decode_body("plain text".to_string());
        assert_eq!(value, json!("plain text"));
        assert_eq!(len, 10);

        let (value, len) = decode_body(String::new());
        assert_eq!(value, json!(""));
        assert_eq!(len, 0);
    }

    #[test]
    fn test_headers_len_counts_serialized_map() {
        let mut headers = HashMap::new();
        headers.insert("a".to_string(), "b".to_string());
        assert_eq!(headers_len(&headers), "{\"a\":\"b\"}".len() as u64);
        assert_eq!(headers_len(&HashMap::new()), 2);
    }

    #[test]
    fn test_implied_content_type_added_only_when_missing() {
        let executor = ReqwestExecutor::new();
        let mut request = MaterializedRequest {
            method: HttpMethod::Post,
            url: "http://localhost/x".to_string(),
            headers: Vec::new(),
            body: MaterializedBody::Json(json!({"a": 1})),
        };
        let built = executor.build(&request).build().unwrap();
        assert_eq!(built.headers()[CONTENT_TYPE], "application/json");

        request.headers.push(("content-type".into(), "application/vnd+json".into()));
        let built = executor.build(&request).build().unwrap();
        let values: Vec<_> = built.headers().get_all(CONTENT_TYPE).iter().collect();
        assert_eq!(values, vec!["application/vnd+json"]);
    }

    #[test]
    fn test_get_never_sends_body() {
        let executor = ReqwestExecutor::new();
        let mut request = get("http://localhost/x");
        request.body = MaterializedBody::Raw("ignored".into());
        let built = executor.build(&request).build().unwrap();
        assert!(built.body().is_none());
        assert!(built.headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_timeout_is_applied() {
        let executor = ReqwestExecutor::new().with_timeout(Duration::from_millis(250));
        let built = executor.build(&get("http://localhost/x")).build().unwrap();
        assert_eq!(built.timeout(), Some(&Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn test_invalid_url_is_reported_not_raised() {
        let executor = ReqwestExecutor::new();
        let outcome = executor.send(&get("not a url")).await;
        assert_eq!(outcome.response.status, 0);
        assert_eq!(outcome.response.data["name"], "InvalidRequestError");
    }
}

//! Turns a declarative [`HttpRequest`] into a ready-to-send request.

use crate::model::{Environment, HttpMethod, HttpRequest, KeyValuePair, RequestBody};
use crate::variables::resolve;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::{form_urlencoded, Url};

/// Encoded body ready for the executor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "camelCase")]
pub enum MaterializedBody {
    #[default]
    None,
    Json(Value),
    /// JSON body that failed to parse, sent as-is.
    Text(String),
    FormData(Vec<(String, String)>),
    UrlEncoded(String),
    Raw(String),
}

impl MaterializedBody {
    pub fn is_none(&self) -> bool {
        matches!(self, MaterializedBody::None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedRequest {
    pub method: HttpMethod,
    pub url: String,
    /// Header names are unique case-insensitively; order is preserved.
    pub headers: Vec<(String, String)>,
    pub body: MaterializedBody,
}

impl MaterializedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Content-Type implied by the body, if any.
    ///
    /// Form-data has none: the multipart boundary is chosen on send.
    pub fn content_type(&self) -> Option<&'static str> {
        match self.body {
            MaterializedBody::Json(_) => Some("application/json"),
            MaterializedBody::UrlEncoded(_) => Some("application/x-www-form-urlencoded"),
            MaterializedBody::Text(_) | MaterializedBody::Raw(_) => Some("text/plain"),
            MaterializedBody::None | MaterializedBody::FormData(_) => None,
        }
    }

    /// GET and HEAD requests never carry a body.
    pub fn sends_body(&self) -> bool {
        !self.body.is_none() && !matches!(self.method, HttpMethod::Get | HttpMethod::Head)
    }
}

/// Resolve placeholders and encode `request` for transmission.
///
/// Never fails: malformed URLs fall back to manual query building and
/// invalid JSON bodies are sent as text.
pub fn materialize(request: &HttpRequest, env: Option<&Environment>) -> MaterializedRequest {
    MaterializedRequest {
        method: request.method,
        url: build_url(&request.url, &request.params, env),
        headers: build_headers(&request.headers, env),
        body: build_body(&request.body, env),
    }
}

fn enabled_pairs<'a>(
    pairs: &'a [KeyValuePair],
    env: Option<&'a Environment>,
) -> impl Iterator<Item = (String, String)> + 'a {
    pairs.iter().filter(|p| p.enabled).filter_map(move |p| {
        let key = resolve(&p.key, env);
        if key.trim().is_empty() {
            return None;
        }
        Some((key, resolve(&p.value, env)))
    })
}

fn encode(text: &str) -> String {
    form_urlencoded::byte_serialize(text.as_bytes()).collect()
}

fn build_url(raw: &str, params: &[KeyValuePair], env: Option<&Environment>) -> String {
    let base = resolve(raw, env);
    let params: Vec<(String, String)> = enabled_pairs(params, env).collect();
    if params.is_empty() {
        return base;
    }

    match Url::parse(&base) {
        Ok(mut url) => {
            {
                let mut query = url.query_pairs_mut();
                for (key, value) in &params {
                    query.append_pair(key, value);
                }
            }
            url.to_string()
        }
        Err(err) => {
            debug!(url = %base, error = %err, "url did not parse, appending query manually");
            let mut out = base;
            let mut sep = if out.contains('?') { '&' } else { '?' };
            for (key, value) in &params {
                out.push(sep);
                out.push_str(&encode(key));
                out.push('=');
                out.push_str(&encode(value));
                sep = '&';
            }
            out
        }
    }
}

fn build_headers(headers: &[KeyValuePair], env: Option<&Environment>) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for (key, value) in enabled_pairs(headers, env) {
        let key = key.trim().to_string();
        match out.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            Some(existing) => existing.1 = value,
            None => out.push((key, value)),
        }
    }
    out
}

fn build_body(body: &RequestBody, env: Option<&Environment>) -> MaterializedBody {
    match body {
        RequestBody::None => MaterializedBody::None,
        RequestBody::Json(text) => {
            let resolved = resolve(text, env);
            if resolved.trim().is_empty() {
                return MaterializedBody::None;
            }
            match serde_json::from_str(&resolved) {
                Ok(value) => MaterializedBody::Json(value),
                Err(err) => {
                    debug!(error = %err, "json body did not parse, sending as text");
                    MaterializedBody::Text(resolved)
                }
            }
        }
        RequestBody::FormData(pairs) => {
            MaterializedBody::FormData(enabled_pairs(pairs, env).collect())
        }
        RequestBody::UrlEncoded(pairs) => {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (key, value) in enabled_pairs(pairs, env) {
                serializer.append_pair(&key, &value);
            }
            MaterializedBody::UrlEncoded(serializer.finish())
        }
        RequestBody::Raw(text) => MaterializedBody::Raw(resolve(text, env)),
    }
}

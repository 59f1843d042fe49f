//! Renders a materialized request as a copy-pasteable `curl` command.

use crate::materializer::{MaterializedBody, MaterializedRequest};

const SEPARATOR: &str = " \\\n  ";

/// `curl` invocation equivalent to `request`, one option per line.
pub fn to_curl(request: &MaterializedRequest) -> String {
    let mut parts = vec![format!(
        "curl -X {} \"{}\"",
        request.method,
        double_quoted(&request.url)
    )];

    for (key, value) in &request.headers {
        parts.push(format!("-H \"{}: {}\"", double_quoted(key), double_quoted(value)));
    }
    if !request.sends_body() {
        return parts.join(SEPARATOR);
    }
    if request.header("content-type").is_none() {
        if let Some(content_type) = request.content_type() {
            parts.push(format!("-H \"Content-Type: {content_type}\""));
        }
    }

    match &request.body {
        MaterializedBody::None => {}
        MaterializedBody::Json(value) => parts.push(data(&value.to_string())),
        MaterializedBody::Text(text)
        | MaterializedBody::UrlEncoded(text)
        | MaterializedBody::Raw(text) => parts.push(data(text)),
        MaterializedBody::FormData(fields) => {
            for (key, value) in fields {
                parts.push(format!(
                    "-F \"{}={}\"",
                    double_quoted(key),
                    double_quoted(value)
                ));
            }
        }
    }

    parts.join(SEPARATOR)
}

fn data(body: &str) -> String {
    format!("-d '{}'", body.replace('\'', "'\\''"))
}

fn double_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

//! Plain data records exchanged between the engine and its
//! collaborators (editor, storage, results view).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// A single environment variable.
///
/// Keys are not required to be unique; lookups take the first
/// enabled match in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Variable {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            enabled: true,
        }
    }

    pub fn disabled(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            enabled: false,
            ..Self::new(key, value)
        }
    }
}

/// A named set of variables requests can reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            variables: Vec::new(),
        }
    }

    /// Append an enabled variable.
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.push(Variable::new(key, value));
        self
    }

    /// Value of the first enabled variable named `key`.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|v| v.enabled && v.key == key)
            .map(|v| v.value.as_str())
    }

    /// Overwrite the first enabled variable named `key`, or append
    /// a new enabled one.
    pub fn set(&mut self, key: &str, value: &str) {
        match self
            .variables
            .iter_mut()
            .find(|v| v.enabled && v.key == key)
        {
            Some(var) => var.value = value.to_string(),
            None => self.variables.push(Variable::new(key, value)),
        }
    }
}

/// A header, query parameter or form field row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValuePair {
    #[serde(default)]
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.into(),
            value: value.into(),
            enabled: true,
        }
    }

    pub fn disabled(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            enabled: false,
            ..Self::new(key, value)
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request body, tagged by its content type.
///
/// On the wire this is `{ "contentType": "...", "content": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "contentType", content = "content", rename_all = "kebab-case")]
pub enum RequestBody {
    #[default]
    None,
    Json(String),
    FormData(Vec<KeyValuePair>),
    #[serde(rename = "x-www-form-urlencoded")]
    UrlEncoded(Vec<KeyValuePair>),
    Raw(String),
}

/// A declarative request as authored by the user.
///
/// `url` may contain `{{placeholders}}` and may be partial while
/// the user is still editing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<KeyValuePair>,
    #[serde(default)]
    pub params: Vec<KeyValuePair>,
    #[serde(default)]
    pub body: RequestBody,
    #[serde(default)]
    pub pre_request_script: String,
    #[serde(default)]
    pub test_script: String,
}

impl HttpRequest {
    pub fn new(name: impl Into<String>, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            method,
            url: url.into(),
            headers: Vec::new(),
            params: Vec::new(),
            body: RequestBody::None,
            pre_request_script: String::new(),
            test_script: String::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(KeyValuePair::new(key, value));
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push(KeyValuePair::new(key, value));
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_pre_request_script(mut self, script: impl Into<String>) -> Self {
        self.pre_request_script = script.into();
        self
    }

    pub fn with_test_script(mut self, script: impl Into<String>) -> Self {
        self.test_script = script.into();
        self
    }
}

/// Normalized outcome of an HTTP call.
///
/// A transport failure is a response with `status == 0` whose
/// `data` carries `{ "message", "name" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub data: Value,
    /// Elapsed milliseconds.
    pub time: u64,
    /// Estimated size in bytes.
    pub size: u64,
}

impl HttpResponse {
    pub fn is_transport_error(&self) -> bool {
        self.status == 0
    }

    /// Message of a transport failure, if this response is one.
    pub fn error_message(&self) -> Option<String> {
        if !self.is_transport_error() {
            return None;
        }
        let message = self
            .data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        match self.data.get("name").and_then(Value::as_str) {
            Some(name) => Some(format!("{name}: {message}")),
            None => Some(message.to_string()),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body as text: strings verbatim, anything else serialized.
    pub fn body_text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// One named assertion outcome from a test script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestResult {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: Some(message.into()),
        }
    }
}

/// Recorded outcome of one request within a collection run.
///
/// Exactly one of `response` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub request_id: String,
    pub request_name: String,
    pub response: Option<HttpResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
    /// Pipeline duration in milliseconds.
    pub duration: u64,
}

impl RunResult {
    pub fn passed_tests(&self) -> usize {
        self.test_results.iter().filter(|t| t.passed).count()
    }

    pub fn failed_tests(&self) -> usize {
        self.test_results.iter().filter(|t| !t.passed).count()
    }

    /// Status code, or 0 when the request errored.
    pub fn status(&self) -> u16 {
        self.response.as_ref().map(|r| r.status).unwrap_or(0)
    }
}

/// Policies for a single collection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    #[serde(default)]
    pub stop_on_error: bool,
    #[serde(default)]
    pub stop_on_test_failure: bool,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_enabled")]
    pub save_responses: bool,
    /// Commit `environment.set` calls into the run's environment
    /// snapshot so later requests observe them.
    #[serde(default)]
    pub apply_environment_changes: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            stop_on_test_failure: false,
            delay_ms: 0,
            save_responses: true,
            apply_environment_changes: false,
        }
    }
}

/// Severity of a captured `console.*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
}

/// A line of console output produced by a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLog {
    pub level: LogLevel,
    pub message: String,
}

/// An uncommitted variable mutation requested by a script through
/// `environment.set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentChange {
    pub key: String,
    pub value: String,
}

//! Sandbox for user pre-request and test scripts.
//!
//! Scripts are written in a small JavaScript-flavoured language and can
//! only reach the globals installed by the interpreter. Every execution is
//! metered (steps, call depth, wall clock) and runs on its own thread so a
//! crash inside the interpreter is reported as a script error.

pub mod ast;
pub mod error;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod value;

use crate::model::{
    Environment, EnvironmentChange, HttpRequest, HttpResponse, ScriptLog, TestResult,
};
use interpreter::Interpreter;
use parser::parse_program;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, instrument, warn};
use value::Value;

/// Name of the synthetic result recorded when a test script aborts.
pub const SCRIPT_ERROR_TEST: &str = "Script execution error";

const SCRIPT_THREAD_STACK: usize = 16 * 1024 * 1024;

/// Resource limits applied to each script execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptBudget {
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
}

fn default_max_steps() -> u64 {
    100_000
}

fn default_max_call_depth() -> usize {
    64
}

fn default_time_limit_ms() -> u64 {
    1_000
}

impl Default for ScriptBudget {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_call_depth: default_max_call_depth(),
            time_limit_ms: default_time_limit_ms(),
        }
    }
}

/// Result of a pre-request script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreRequestOutcome {
    /// The request to send: modified by the script, or the original one
    /// when the script failed.
    pub request: HttpRequest,
    pub logs: Vec<ScriptLog>,
    pub environment_changes: Vec<EnvironmentChange>,
    pub error: Option<String>,
}

/// Result of a test script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub results: Vec<TestResult>,
    pub logs: Vec<ScriptLog>,
    pub environment_changes: Vec<EnvironmentChange>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptSandbox {
    budget: ScriptBudget,
}

impl ScriptSandbox {
    pub fn new(budget: ScriptBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &ScriptBudget {
        &self.budget
    }

    /// Run a pre-request script against a copy of `request`.
    ///
    /// Never fails: on any script error the original request comes back
    /// with `error` set and the environment changes dropped.
    #[instrument(skip_all, fields(request = %request.name))]
    pub fn run_pre_request(
        &self,
        script: &str,
        request: &HttpRequest,
        env: Option<&Environment>,
    ) -> PreRequestOutcome {
        if script.trim().is_empty() {
            return PreRequestOutcome {
                request: request.clone(),
                logs: Vec::new(),
                environment_changes: Vec::new(),
                error: None,
            };
        }

        let budget = &self.budget;
        let outcome = isolated(|| pre_request_script(budget, script, request, env))
            .unwrap_or_else(|err| PreRequestOutcome {
                request: request.clone(),
                logs: Vec::new(),
                environment_changes: Vec::new(),
                error: Some(err),
            });

        match &outcome.error {
            Some(err) => warn!(error = %err, "pre-request script failed, sending original request"),
            None => debug!(
                changes = outcome.environment_changes.len(),
                "pre-request script finished"
            ),
        }
        outcome
    }

    /// Run a test script against `response`.
    ///
    /// A script that aborts keeps the results it registered and gains one
    /// failing [`SCRIPT_ERROR_TEST`] entry.
    #[instrument(skip_all, fields(status = response.status))]
    pub fn run_tests(
        &self,
        script: &str,
        response: &HttpResponse,
        env: Option<&Environment>,
    ) -> TestOutcome {
        if script.trim().is_empty() {
            return TestOutcome::default();
        }

        let budget = &self.budget;
        let outcome = isolated(|| test_script(budget, script, response, env))
            .unwrap_or_else(|err| TestOutcome {
                results: vec![TestResult::fail(SCRIPT_ERROR_TEST, err)],
                ..TestOutcome::default()
            });

        let failed = outcome.results.iter().filter(|t| !t.passed).count();
        debug!(total = outcome.results.len(), failed, "test script finished");
        outcome
    }
}

/// Run `f` on a dedicated thread with a generous stack, turning a panic
/// into an error message.
fn isolated<T, F>(f: F) -> Result<T, String>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    std::thread::scope(|scope| {
        let handle = std::thread::Builder::new()
            .name("courier-script".into())
            .stack_size(SCRIPT_THREAD_STACK)
            .spawn_scoped(scope, f)
            .map_err(|e| format!("failed to start script thread: {e}"))?;
        handle
            .join()
            .map_err(|_| "script interpreter crashed".to_string())
    })
}

fn pre_request_script(
    budget: &ScriptBudget,
    script: &str,
    request: &HttpRequest,
    env: Option<&Environment>,
) -> PreRequestOutcome {
    let failed = |logs: Vec<ScriptLog>, error: String| PreRequestOutcome {
        request: request.clone(),
        logs,
        environment_changes: Vec::new(),
        error: Some(error),
    };

    let original = match serde_json::to_value(request) {
        Ok(json) => json,
        Err(e) => return failed(Vec::new(), format!("could not expose request to script: {e}")),
    };
    let program = match parse_program(script) {
        Ok(program) => program,
        Err(e) => return failed(Vec::new(), e.to_string()),
    };

    let mut interpreter = Interpreter::new(budget, env);
    interpreter.define_global("request", Value::from_json(&original));
    interpreter.install_pm();
    let result = interpreter.run(&program);
    let modified = interpreter.global("request");
    let effects = interpreter.into_effects();

    if let Err(e) = result {
        return failed(effects.logs, e.to_string());
    }

    let overlay = match modified.map(|v| v.to_json()) {
        Some(Ok(Json::Object(overlay))) => overlay,
        Some(Ok(_)) | None => {
            return failed(effects.logs, "request must remain an object".to_string())
        }
        Some(Err(e)) => return failed(effects.logs, e.to_string()),
    };
    let mut merged = original;
    if let Json::Object(base) = &mut merged {
        base.extend(overlay);
    }

    match serde_json::from_value::<HttpRequest>(merged) {
        Ok(request) => PreRequestOutcome {
            request,
            logs: effects.logs,
            environment_changes: effects.environment_changes,
            error: None,
        },
        Err(e) => failed(effects.logs, format!("script produced an invalid request: {e}")),
    }
}

fn test_script(
    budget: &ScriptBudget,
    script: &str,
    response: &HttpResponse,
    env: Option<&Environment>,
) -> TestOutcome {
    let program = match parse_program(script) {
        Ok(program) => program,
        Err(e) => {
            return TestOutcome {
                results: vec![TestResult::fail(SCRIPT_ERROR_TEST, e.to_string())],
                ..TestOutcome::default()
            }
        }
    };

    let mut interpreter = Interpreter::new(budget, env);
    interpreter.install_response(response);
    interpreter.install_pm();
    let result = interpreter.run(&program);
    let effects = interpreter.into_effects();

    let mut results = effects.tests;
    if let Err(e) = result {
        warn!(error = %e, "test script aborted");
        results.push(TestResult::fail(SCRIPT_ERROR_TEST, e.to_string()));
    }
    TestOutcome {
        results,
        logs: effects.logs,
        environment_changes: effects.environment_changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpMethod, LogLevel};
    use serde_json::json;
    use std::collections::HashMap;

    fn request() -> HttpRequest {
        HttpRequest::new("users", HttpMethod::Get, "https://api.example.com/users")
            .with_header("Accept", "application/json")
    }

    fn response(status: u16, data: serde_json::Value) -> HttpResponse {
        HttpResponse {
            status,
            status_text: "OK".into(),
            headers: HashMap::new(),
            data,
            time: 5,
            size: 10,
        }
    }

    #[test]
    fn test_blank_scripts_are_noops() {
        let sandbox = ScriptSandbox::default();
        let original = request();
        let outcome = sandbox.run_pre_request("  \n", &original, None);
        assert_eq!(outcome.request, original);
        assert!(outcome.error.is_none());

        let outcome = sandbox.run_tests("", &response(200, json!(null)), None);
        assert!(outcome.results.is_empty());
    }

    #[test]
    fn test_pre_request_modifies_copy() {
        let sandbox = ScriptSandbox::default();
        let original = request();
        let env = Environment::new("dev").with_variable("token", "abc");
        let outcome = sandbox.run_pre_request(
            r#"
            request.url = request.url + "?page=2"
            request.headers.push({ key: "Authorization", value: "Bearer " + environment.get("token") })
            pm.request.method = "POST"
            environment.set("lastRequest", request.name)
            console.info("prepared")
            "#,
            &original,
            Some(&env),
        );

        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.request.url, "https://api.example.com/users?page=2");
        assert_eq!(outcome.request.method, HttpMethod::Post);
        assert_eq!(outcome.request.headers.len(), 2);
        assert_eq!(outcome.request.headers[1].value, "Bearer abc");
        assert!(outcome.request.headers[1].enabled);
        assert_eq!(outcome.environment_changes[0].key, "lastRequest");
        assert_eq!(outcome.logs[0].level, LogLevel::Info);

        assert_eq!(original.url, "https://api.example.com/users");
        assert_eq!(env.lookup("lastRequest"), None);
    }

    #[test]
    fn test_pre_request_error_keeps_original() {
        let sandbox = ScriptSandbox::default();
        let original = request();
        let outcome = sandbox.run_pre_request(
            "environment.set('a', '1'); request.url = 'changed'; undefinedThing()",
            &original,
            None,
        );
        assert_eq!(outcome.request, original);
        assert!(outcome.environment_changes.is_empty());
        assert!(outcome.error.unwrap().contains("undefinedThing"));

        let outcome = sandbox.run_pre_request("request.method = 'BREW'", &original, None);
        assert_eq!(outcome.request, original);
        assert!(outcome.error.unwrap().contains("invalid request"));
    }

    #[test]
    fn test_runaway_pre_request_is_stopped() {
        let sandbox = ScriptSandbox::new(ScriptBudget {
            max_steps: 10_000,
            ..ScriptBudget::default()
        });
        let outcome = sandbox.run_pre_request(
            "let xs = [0]; for (const x of xs) {} const loop = (n) => loop(n + 1); loop(0)",
            &request(),
            None,
        );
        assert!(outcome.error.unwrap().contains("budget"));
    }

    #[test]
    fn test_test_script_results() {
        let sandbox = ScriptSandbox::default();
        let outcome = sandbox.run_tests(
            r#"
            test("Status is 200", () => { expect(response.status).to.equal(200) })
            pm.test("Has id", () => { pm.expect(pm.response.json()).to.have.property("id") })
            test("Array length", () => expect([1, 2, 3]).to.have.length(3))
            "#,
            &response(201, json!({"name": "x"})),
            None,
        );

        assert_eq!(outcome.results.len(), 3);
        assert!(!outcome.results[0].passed);
        let message = outcome.results[0].message.as_deref().unwrap();
        assert!(message.contains("200") && message.contains("201"), "{message}");
        assert!(!outcome.results[1].passed);
        assert!(outcome.results[2].passed);
    }

    #[test]
    fn test_aborted_test_script_keeps_earlier_results() {
        let sandbox = ScriptSandbox::default();
        let outcome = sandbox.run_tests(
            "test('first', () => {})\nnotDefined.call()\ntest('never', () => {})",
            &response(200, json!(null)),
            None,
        );
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results[0].passed);
        assert_eq!(outcome.results[1].name, SCRIPT_ERROR_TEST);
        assert!(outcome.results[1]
            .message
            .as_deref()
            .unwrap()
            .contains("ReferenceError"));
    }

    #[test]
    fn test_syntax_error_is_reported_as_test_failure() {
        let outcome = ScriptSandbox::default().run_tests(
            "test('x', () => {",
            &response(200, json!(null)),
            None,
        );
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].name, SCRIPT_ERROR_TEST);
        assert!(outcome.results[0]
            .message
            .as_deref()
            .unwrap()
            .starts_with("SyntaxError"));
    }

    #[test]
    fn test_chai_property_and_comparison_checks() {
        let outcome = ScriptSandbox::default().run_tests(
            r#"
            const body = response.json()
            test("true", () => expect(body.ok).to.be.true())
            test("true fails", () => expect(body.count).to.be.true())
            test("false", () => expect(!body.ok).to.be.false())
            test("false fails", () => expect(body.ok).to.be.false())
            test("null", () => expect(body.missing).to.be.null())
            test("null fails", () => expect(body.ok).to.be.null())
            test("undefined", () => expect(body.nothing).to.be.undefined())
            test("undefined fails", () => expect(body.missing).to.be.undefined())
            test("greaterThan", () => expect(body.count).to.be.greaterThan(2))
            test("greaterThan fails", () => expect(body.count).to.be.greaterThan(3))
            test("lessThan", () => expect(body.count).to.be.lessThan(4))
            test("lessThan fails", () => expect(body.count).to.be.lessThan(3))
            test("lengthGreaterThan", () => expect(body.items).to.have.lengthGreaterThan(1))
            test("lengthGreaterThan fails", () => expect(body.items).to.have.lengthGreaterThan(2))
            test("lengthLessThan", () => expect(body.items).to.have.lengthLessThan(3))
            test("lengthLessThan fails", () => expect(body.items).to.have.lengthLessThan(2))
            "#,
            &response(
                200,
                json!({"ok": true, "count": 3, "missing": null, "items": ["a", "b"]}),
            ),
            None,
        );

        assert_eq!(outcome.results.len(), 16);
        for result in &outcome.results {
            let should_fail = result.name.ends_with("fails");
            assert_eq!(result.passed, !should_fail, "{}: {:?}", result.name, result.message);
        }
    }

    #[test]
    fn test_cyclic_array_to_string_finishes() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = ScriptSandbox::default().run_tests(
                "const a = []; a.push(a, a)
test('x', () => { const s = '' + a; console.log(s) })",
                &response(200, json!(null)),
                None,
            );
            let _ = tx.send(outcome);
        });

        let outcome = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("script did not finish");
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results[0].passed, "{:?}", outcome.results[0].message);
        assert_eq!(outcome.logs[0].message, ",");
    }

    #[test]
    fn test_budget_error_escapes_test_callback() {
        let sandbox = ScriptSandbox::new(ScriptBudget {
            max_steps: 500,
            ..ScriptBudget::default()
        });
        let outcome = sandbox.run_tests(
            "test('ok', () => {})\ntest('spin', () => { const f = () => f(); f() })",
            &response(200, json!(null)),
            None,
        );
        let names: Vec<&str> = outcome.results.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["ok", SCRIPT_ERROR_TEST]);
    }
}

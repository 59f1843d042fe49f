//! The per-request pipeline shared by ad-hoc sends and collection runs:
//! pre-request script, materialization, network call, test script.

use crate::config::EngineConfig;
use crate::executor::{HttpExecutor, ReqwestExecutor};
use crate::materializer::{materialize, MaterializedRequest};
use crate::model::{
    Environment, EnvironmentChange, HttpRequest, HttpResponse, ScriptLog, TestResult,
};
use crate::script::{PreRequestOutcome, ScriptSandbox, TestOutcome, SCRIPT_ERROR_TEST};
use crate::variables::unresolved;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Everything one pass through the pipeline produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    /// The request as it went on the wire.
    pub request: MaterializedRequest,
    pub response: HttpResponse,
    pub test_results: Vec<TestResult>,
    pub logs: Vec<ScriptLog>,
    /// Changes requested by both scripts, in call order.
    pub environment_changes: Vec<EnvironmentChange>,
    /// Set when the pre-request script failed and the original request
    /// was sent instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_request_error: Option<String>,
    /// Transport failure message; tests are skipped when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn failed_tests(&self) -> usize {
        self.test_results.iter().filter(|t| !t.passed).count()
    }
}

/// Resolve, script, send and test a single request.
#[derive(Clone)]
pub struct RequestPipeline {
    executor: Arc<dyn HttpExecutor>,
    sandbox: ScriptSandbox,
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

impl Default for RequestPipeline {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl RequestPipeline {
    /// Pipeline over a reqwest executor configured from `config`.
    pub fn new(config: &EngineConfig) -> Self {
        let executor =
            ReqwestExecutor::new().with_timeout(Duration::from_secs(config.timeout_secs));
        Self::with_executor(Arc::new(executor), ScriptSandbox::new(config.script.clone()))
    }

    pub fn with_executor(executor: Arc<dyn HttpExecutor>, sandbox: ScriptSandbox) -> Self {
        Self { executor, sandbox }
    }

    pub fn sandbox(&self) -> &ScriptSandbox {
        &self.sandbox
    }

    /// Materialize without running scripts or touching the network.
    pub fn preview(&self, request: &HttpRequest, env: Option<&Environment>) -> MaterializedRequest {
        materialize(request, env)
    }

    /// Run the whole pipeline for `request`.
    ///
    /// Never fails: script problems surface as `pre_request_error` or
    /// failing test results, network problems as `error` with a zero
    /// status response.
    #[instrument(
        skip(self, request, env),
        fields(request = %request.name, method = %request.method)
    )]
    pub async fn send(&self, request: &HttpRequest, env: Option<&Environment>) -> SendOutcome {
        let pre = self.pre_request(request, env).await;
        let mut logs = pre.logs;
        let mut environment_changes = pre.environment_changes;

        let materialized = materialize(&pre.request, env);
        let missing = unresolved(&pre.request.url, env);
        if !missing.is_empty() {
            warn!(variables = ?missing, "unresolved placeholders in url");
        }

        debug!(url = %materialized.url, "sending request");
        let execution = self.executor.send(&materialized).await;
        let response = execution.response;

        let mut test_results = Vec::new();
        let error = response.error_message();
        match &error {
            Some(message) => {
                warn!(error = %message, "request failed, skipping test script");
            }
            None => {
                info!(
                    status = response.status,
                    elapsed_ms = execution.elapsed_ms,
                    "request completed"
                );
                let tests = self.tests(&request.test_script, &response, env).await;
                test_results = tests.results;
                logs.extend(tests.logs);
                environment_changes.extend(tests.environment_changes);
            }
        }

        SendOutcome {
            request: materialized,
            response,
            test_results,
            logs,
            environment_changes,
            pre_request_error: pre.error,
            error,
        }
    }

    async fn pre_request(
        &self,
        request: &HttpRequest,
        env: Option<&Environment>,
    ) -> PreRequestOutcome {
        if request.pre_request_script.trim().is_empty() {
            return PreRequestOutcome {
                request: request.clone(),
                logs: Vec::new(),
                environment_changes: Vec::new(),
                error: None,
            };
        }

        let sandbox = self.sandbox.clone();
        let owned = request.clone();
        let env = env.cloned();
        let task = tokio::task::spawn_blocking(move || {
            sandbox.run_pre_request(&owned.pre_request_script, &owned, env.as_ref())
        });
        match task.await {
            Ok(outcome) => outcome,
            Err(err) => PreRequestOutcome {
                request: request.clone(),
                logs: Vec::new(),
                environment_changes: Vec::new(),
                error: Some(format!("pre-request script task failed: {err}")),
            },
        }
    }

    async fn tests(
        &self,
        script: &str,
        response: &HttpResponse,
        env: Option<&Environment>,
    ) -> TestOutcome {
        if script.trim().is_empty() {
            return TestOutcome::default();
        }

        let sandbox = self.sandbox.clone();
        let script = script.to_string();
        let response = response.clone();
        let env = env.cloned();
        let task = tokio::task::spawn_blocking(move || {
            sandbox.run_tests(&script, &response, env.as_ref())
        });
        task.await.unwrap_or_else(|err| TestOutcome {
            results: vec![TestResult::fail(
                SCRIPT_ERROR_TEST,
                format!("test script task failed: {err}"),
            )],
            ..TestOutcome::default()
        })
    }
}

//! Sequential, policy-governed execution of every request in a
//! collection.

use crate::collection::Collection;
use crate::engine::{RequestPipeline, SendOutcome};
use crate::model::{Environment, EnvironmentChange, HttpRequest, RunOptions, RunResult};
use crate::report::{RunReport, RunStats};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a [`CollectionRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    /// The last run ended because it was cancelled.
    Stopped,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("a collection run is already in progress")]
    AlreadyRunning,
}

/// Shared handle to observe and cancel the current run.
#[derive(Debug, Default)]
pub struct RunControl {
    state: Mutex<RunState>,
    stop: AtomicBool,
    /// Percentage stored as `f64` bits.
    progress: AtomicU64,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a cooperative stop. The in-flight request finishes; no
    /// further request starts.
    pub fn stop(&self) {
        if self.state() == RunState::Running {
            info!("stop requested");
            self.stop.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RunState {
        self.state.lock().map(|s| *s).unwrap_or(RunState::Idle)
    }

    /// Completion of the current or last run, 0 to 100.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::SeqCst))
    }

    fn set_progress(&self, value: f64) {
        self.progress.store(value.to_bits(), Ordering::SeqCst);
    }

    fn set_state(&self, state: RunState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn begin(&self) -> Result<RunGuard<'_>, RunnerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RunnerError::AlreadyRunning)?;
        if *state == RunState::Running {
            return Err(RunnerError::AlreadyRunning);
        }
        *state = RunState::Running;
        self.stop.store(false, Ordering::SeqCst);
        self.set_progress(0.0);
        Ok(RunGuard {
            control: self,
            finished: false,
        })
    }
}

/// Puts the control back to a state that accepts new runs, even if the
/// run future is dropped half way.
struct RunGuard<'a> {
    control: &'a RunControl,
    finished: bool,
}

impl RunGuard<'_> {
    fn finish(mut self, stopped: bool) {
        self.finished = true;
        self.control.set_state(if stopped {
            RunState::Stopped
        } else {
            RunState::Idle
        });
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.control.set_state(RunState::Idle);
        }
    }
}

/// Callbacks fired while a run progresses. All methods default to no-ops.
pub trait RunListener: Send + Sync {
    fn on_request_start(&self, _index: usize, _total: usize, _request: &HttpRequest) {}

    fn on_result(&self, _index: usize, _total: usize, _result: &RunResult) {}

    fn on_progress(&self, _progress: f64) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl RunListener for NoopListener {}

/// Runs whole collections.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        collection: &Collection,
        env: Option<&Environment>,
        options: &RunOptions,
    ) -> Result<RunReport, RunnerError>;
}

/// Default runner driving a [`RequestPipeline`] once per request.
#[derive(Debug, Clone)]
pub struct CollectionRunner {
    pipeline: Arc<RequestPipeline>,
    control: Arc<RunControl>,
}

impl CollectionRunner {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        Self {
            pipeline,
            control: Arc::new(RunControl::new()),
        }
    }

    pub fn control(&self) -> Arc<RunControl> {
        Arc::clone(&self.control)
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// Run `collection`, reporting progress to `listener`.
    ///
    /// `env` is never modified; the run works on its own snapshot.
    #[instrument(skip_all, fields(collection = %collection.name))]
    pub async fn run_with_listener(
        &self,
        collection: &Collection,
        env: Option<&Environment>,
        options: &RunOptions,
        listener: &dyn RunListener,
    ) -> Result<RunReport, RunnerError> {
        let guard = self.control.begin()?;
        let start_time = Utc::now();

        let requests: Vec<HttpRequest> =
            collection.flatten_requests().into_iter().cloned().collect();
        let total = requests.len();
        let mut snapshot = env.cloned();
        let mut results: Vec<RunResult> = Vec::with_capacity(total);
        let mut stopped = false;

        info!("Starting collection run: {} ({} requests)", collection.name, total);

        for (index, request) in requests.into_iter().enumerate() {
            if index > 0 && options.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(options.delay_ms)).await;
            }
            if self.control.is_stop_requested() {
                info!("Run cancelled before request {}/{}", index + 1, total);
                stopped = true;
                break;
            }

            info!("Running request {}/{}: {}", index + 1, total, request.name);
            listener.on_request_start(index, total, &request);

            let (result, changes) = self.execute(request, snapshot.clone(), options).await;

            if options.apply_environment_changes && !changes.is_empty() {
                let target = snapshot.get_or_insert_with(|| Environment::new("Run variables"));
                for change in &changes {
                    debug!(key = %change.key, "applying environment change");
                    target.set(&change.key, &change.value);
                }
            }

            let halt = (options.stop_on_error && result.error.is_some())
                || (options.stop_on_test_failure && result.failed_tests() > 0);

            listener.on_result(index, total, &result);
            results.push(result);

            let progress = (index + 1) as f64 / total as f64 * 100.0;
            self.control.set_progress(progress);
            listener.on_progress(progress);

            if halt {
                info!("Stopping run after request {} due to run policy", index + 1);
                break;
            }
        }

        let stats = RunStats::from_results(&results, start_time, Utc::now());
        info!(
            "Collection run finished: {} ({} ms) - {} succeeded, {} failed",
            collection.name,
            stats.duration_ms(),
            stats.successful_requests,
            stats.failed_requests
        );
        guard.finish(stopped);

        Ok(RunReport {
            collection_id: collection.id.clone(),
            collection_name: collection.name.clone(),
            environment_name: env.map(|e| e.name.clone()),
            results,
            stats,
            stopped,
            environment: snapshot,
        })
    }

    /// One pipeline pass in its own task so a panic only costs this
    /// request.
    async fn execute(
        &self,
        request: HttpRequest,
        env: Option<Environment>,
        options: &RunOptions,
    ) -> (RunResult, Vec<EnvironmentChange>) {
        let request_id = request.id.clone();
        let request_name = request.name.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let started = Instant::now();

        let task = tokio::spawn(async move { pipeline.send(&request, env.as_ref()).await });
        let joined = task.await;
        let duration = started.elapsed().as_millis() as u64;

        match joined {
            Ok(outcome) => {
                let changes = outcome.environment_changes.clone();
                (
                    to_run_result(request_id, request_name, outcome, duration, options),
                    changes,
                )
            }
            Err(err) => {
                error!(request = %request_name, "request pipeline failed: {}", err);
                let result = RunResult {
                    request_id,
                    request_name,
                    response: None,
                    error: Some(format!("request pipeline failed: {err}")),
                    test_results: Vec::new(),
                    duration,
                };
                (result, Vec::new())
            }
        }
    }
}

#[async_trait]
impl Runner for CollectionRunner {
    async fn run(
        &self,
        collection: &Collection,
        env: Option<&Environment>,
        options: &RunOptions,
    ) -> Result<RunReport, RunnerError> {
        self.run_with_listener(collection, env, options, &NoopListener)
            .await
    }
}

fn to_run_result(
    request_id: String,
    request_name: String,
    outcome: SendOutcome,
    duration: u64,
    options: &RunOptions,
) -> RunResult {
    if let Some(error) = outcome.error {
        warn!(request = %request_name, "request failed: {}", error);
        return RunResult {
            request_id,
            request_name,
            response: None,
            error: Some(error),
            test_results: outcome.test_results,
            duration,
        };
    }

    let mut response = outcome.response;
    if !options.save_responses {
        response.data = Value::Null;
    }
    RunResult {
        request_id,
        request_name,
        response: Some(response),
        error: None,
        test_results: outcome.test_results,
        duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{error_response, ExecutionOutcome, HttpExecutor};
    use crate::materializer::MaterializedRequest;
    use crate::model::{HttpMethod, HttpResponse};
    use crate::script::ScriptSandbox;
    use serde_json::json;
    use std::collections::HashMap;

    /// Answers by URL path: `/down` fails at the transport level,
    /// `/status/<code>` returns that code, `/slow` sleeps first.
    struct Scripted;

    #[async_trait]
    impl HttpExecutor for Scripted {
        async fn send(&self, request: &MaterializedRequest) -> ExecutionOutcome {
            let path = request.url.trim_start_matches("http://test");
            if path == "/down" {
                return ExecutionOutcome {
                    response: error_response("ConnectionError", "refused", 0),
                    elapsed_ms: 0,
                };
            }
            if path == "/slow" {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let status = path
                .strip_prefix("/status/")
                .and_then(|code| code.parse().ok())
                .unwrap_or(200);
            ExecutionOutcome {
                response: HttpResponse {
                    status,
                    status_text: String::new(),
                    headers: HashMap::new(),
                    data: json!({"path": path, "token": request.header("x-token")}),
                    time: 1,
                    size: 1,
                },
                elapsed_ms: 1,
            }
        }
    }

    fn runner() -> CollectionRunner {
        let pipeline = RequestPipeline::with_executor(Arc::new(Scripted), ScriptSandbox::default());
        CollectionRunner::new(Arc::new(pipeline))
    }

    fn collection(paths: &[&str]) -> Collection {
        // First request at the root, the rest inside a folder after it.
        let mut collection = Collection::new("test");
        let mut folder = None;
        for (i, path) in paths.iter().enumerate() {
            let url = format!("http://test{path}");
            let request = HttpRequest::new(format!("r{i}"), HttpMethod::Get, url);
            collection.add_request(folder.as_deref(), request).unwrap();
            if folder.is_none() {
                folder = Some(collection.add_folder(None, "folder").unwrap());
            }
        }
        collection
    }

    struct StopAfterFirst(Arc<RunControl>);

    impl RunListener for StopAfterFirst {
        fn on_result(&self, _index: usize, _total: usize, _result: &RunResult) {
            self.0.stop();
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<f64>>);

    impl RunListener for Recorder {
        fn on_progress(&self, progress: f64) {
            self.0.lock().unwrap().push(progress);
        }
    }

    #[tokio::test]
    async fn test_runs_everything_and_counts() {
        let runner = runner();
        let paths = ["/a", "/status/404", "/down", "/status/301"];
        let report = runner
            .run(&collection(&paths), None, &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.results.len(), 4);
        assert_eq!(report.stats.successful_requests, 1);
        assert_eq!(report.stats.failed_requests, 2);
        assert!(report.results[2].response.is_none());
        assert_eq!(report.results[2].error.as_deref(), Some("ConnectionError: refused"));
        assert!(!report.stopped);
        assert_eq!(runner.control().state(), RunState::Idle);
        assert_eq!(runner.control().progress(), 100.0);
    }

    #[tokio::test]
    async fn test_stop_on_error() {
        let options = RunOptions {
            stop_on_error: true,
            ..RunOptions::default()
        };
        let report = runner()
            .run(&collection(&["/a", "/down", "/c"]), None, &options)
            .await
            .unwrap();
        assert_eq!(report.results.len(), 2);
        assert!(!report.stopped);
    }

    #[tokio::test]
    async fn test_stop_on_test_failure() {
        let mut collection = collection(&["/a", "/b"]);
        let first = collection.flatten_requests()[0].id.clone();
        collection.request_mut(&first).unwrap().test_script =
            "test('fails', () => expect(response.status).to.equal(500))".into();

        let options = RunOptions {
            stop_on_test_failure: true,
            ..RunOptions::default()
        };
        let report = runner().run(&collection, None, &options).await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.stats.failed_tests, 1);
    }

    #[tokio::test]
    async fn test_cancellation_reports_stopped() {
        let runner = runner();
        let listener = StopAfterFirst(runner.control());
        let options = RunOptions::default();
        let report = runner
            .run_with_listener(&collection(&["/a", "/b", "/c"]), None, &options, &listener)
            .await
            .unwrap();
        assert_eq!(report.results.len(), 1);
        assert!(report.stopped);
        assert_eq!(runner.control().state(), RunState::Stopped);

        let report = runner
            .run(&collection(&["/a"]), None, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(runner.control().state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_one_run_at_a_time() {
        let runner = runner();
        let background = runner.clone();
        let handle = tokio::spawn(async move {
            background
                .run(&collection(&["/slow"]), None, &RunOptions::default())
                .await
        });
        while runner.control().state() != RunState::Running {
            tokio::task::yield_now().await;
        }

        let err = runner
            .run(&collection(&["/a"]), None, &RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, RunnerError::AlreadyRunning);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_progress_is_published() {
        let recorder = Recorder::default();
        let options = RunOptions::default();
        runner()
            .run_with_listener(&collection(&["/a", "/b", "/c", "/d"]), None, &options, &recorder)
            .await
            .unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![25.0, 50.0, 75.0, 100.0]);
    }

    #[tokio::test]
    async fn test_unsaved_responses_drop_body() {
        let options = RunOptions {
            save_responses: false,
            ..RunOptions::default()
        };
        let report = runner().run(&collection(&["/a"]), None, &options).await.unwrap();
        let response = report.results[0].response.as_ref().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data, Value::Null);
    }

    #[tokio::test]
    async fn test_environment_changes_stay_local_unless_applied() {
        let mut collection = collection(&["/a", "/b"]);
        let ids: Vec<String> = collection.flatten_requests().iter().map(|r| r.id.clone()).collect();
        collection.request_mut(&ids[0]).unwrap().test_script =
            "environment.set('token', 'abc')".into();
        let second = collection.request_mut(&ids[1]).unwrap();
        second.headers.push(crate::model::KeyValuePair::new("X-Token", "{{token}}"));

        let env = Environment::new("dev");
        let report = runner()
            .run(&collection, Some(&env), &RunOptions::default())
            .await
            .unwrap();
        let data = &report.results[1].response.as_ref().unwrap().data;
        assert_eq!(data["token"], "{{token}}");
        assert_eq!(report.environment.as_ref().unwrap().lookup("token"), None);

        let options = RunOptions {
            apply_environment_changes: true,
            ..RunOptions::default()
        };
        let report = runner().run(&collection, Some(&env), &options).await.unwrap();
        let data = &report.results[1].response.as_ref().unwrap().data;
        assert_eq!(data["token"], "abc");
        assert_eq!(report.environment.unwrap().lookup("token"), Some("abc"));
        assert_eq!(report.environment_name.as_deref(), Some("dev"));
        assert_eq!(env.lookup("token"), None);
    }
}

use std::{fs, path::PathBuf, sync::Arc, time::Duration, time::Instant};

use axum::{
    extract::Path,
    http::{HeaderMap, Method, StatusCode},
    routing::{any, get},
    Json, Router,
};
use courier::{
    Collection, CollectionRunner, Environment, HttpMethod, HttpRequest, KeyValuePair,
    RequestBody, RequestPipeline, ReqwestExecutor, RunOptions, Runner, ScriptSandbox, Workspace,
};
use serde_json::json;
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route(
                "/users",
                get(|| async move {
                    Json(json!([
                        {"id": 1, "name": "Ada"},
                        {"id": 2, "name": "Linus"}
                    ]))
                }),
            )
            .route(
                "/users/:id",
                get(|Path(id): Path<u32>| async move {
                    let name = if id == 1 { "Ada" } else { "Linus" };
                    Json(json!({"id": id, "name": name}))
                }),
            )
            .route(
                "/echo",
                any(|method: Method, headers: HeaderMap, body: String| async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    Json(json!({
                        "method": method.as_str(),
                        "contentType": header("content-type"),
                        "requestId": header("x-request-id"),
                        "body": body,
                    }))
                }),
            )
            .route(
                "/status/:code",
                get(|Path(code): Path<u16>| async move {
                    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
                    (status, Json(json!({"code": code})))
                }),
            )
            .route(
                "/slow",
                get(|| async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    "finally"
                }),
            )
            .route("/text", get(|| async move { "Hello courier" }));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn load_workspace(path: &str, base_url: &str) -> Workspace {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let workspace_path = manifest_dir.join("tests/fixtures").join(path);
    let content = fs::read_to_string(&workspace_path)
        .unwrap_or_else(|e| panic!("failed to read {workspace_path:?}: {e}"));
    let content = content.replace("__BASE_URL__", base_url);

    Workspace::parse(&content, path.ends_with(".json"))
        .unwrap_or_else(|e| panic!("failed to parse workspace: {e:#}"))
}

fn runner() -> CollectionRunner {
    CollectionRunner::new(Arc::new(RequestPipeline::default()))
}

fn flat_collection(requests: Vec<HttpRequest>) -> Collection {
    let mut collection = Collection::new("adhoc");
    for request in requests {
        collection.add_request(None, request).unwrap();
    }
    collection
}

fn get_request(name: &str, url: String) -> HttpRequest {
    HttpRequest::new(name, HttpMethod::Get, url)
}

#[tokio::test]
async fn pipeline_runs_scripts_against_live_server() {
    let server = TestServer::spawn().await;
    let env = Environment::new("local").with_variable("base", &server.base_url);
    let request = HttpRequest::new("List", HttpMethod::Get, "{{base}}/users")
        .with_pre_request_script("request.params.push({ key: 'page', value: '1' })")
        .with_test_script(
            r#"
            test("ok", () => expect(response.status).to.equal(200))
            test("json header", () => expect(response.header("Content-Type")).to.include("json"))
            test("names", () => {
                const names = response.json().map((u) => u.name)
                expect(names).to.eql(["Ada", "Linus"])
            })
            test("timing", () => expect(response.time).to.be.a("number"))
            "#,
        );

    let outcome = RequestPipeline::default().send(&request, Some(&env)).await;

    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(outcome.request.url, server.url("/users?page=1"));
    assert_eq!(outcome.response.status, 200);
    assert_eq!(outcome.response.status_text, "OK");
    assert!(outcome.response.size > 0);
    assert_eq!(outcome.test_results.len(), 4);
    assert!(
        outcome.test_results.iter().all(|t| t.passed),
        "{:?}",
        outcome.test_results
    );

    server.shutdown().await;
}

#[tokio::test]
async fn text_responses_stay_strings() {
    let server = TestServer::spawn().await;
    let request = get_request("Text", server.url("/text"))
        .with_test_script("test('text', () => expect(response.text()).to.equal('Hello courier'))");

    let outcome = RequestPipeline::default().send(&request, None).await;
    assert_eq!(outcome.response.data, json!("Hello courier"));
    assert!(outcome.test_results[0].passed);

    server.shutdown().await;
}

#[tokio::test]
async fn workspace_collection_run_with_applied_changes() {
    let server = TestServer::spawn().await;
    let workspace = load_workspace("users_workspace.yaml", &server.base_url);
    let collection = workspace
        .find_collection("Users API")
        .unwrap()
        .to_collection()
        .unwrap();
    let env = workspace.find_environment("local").unwrap();

    let options = RunOptions {
        apply_environment_changes: true,
        ..RunOptions::default()
    };
    let report = runner().run(&collection, Some(env), &options).await.unwrap();

    let names: Vec<&str> = report.results.iter().map(|r| r.request_name.as_str()).collect();
    assert_eq!(names, vec!["List users", "Get first user", "Create user", "Missing"]);
    for result in &report.results[..3] {
        assert_eq!(result.failed_tests(), 0, "{}: {:?}", result.request_name, result.test_results);
    }
    assert_eq!(report.stats.total_requests, 4);
    assert_eq!(report.stats.successful_requests, 3);
    assert_eq!(report.stats.failed_requests, 1);
    assert_eq!(report.stats.total_tests, 6);
    assert_eq!(report.stats.passed_tests, 6);
    assert_eq!(
        report.environment.as_ref().unwrap().lookup("firstUserId"),
        Some("1")
    );
    assert_eq!(env.lookup("firstUserId"), None);

    server.shutdown().await;
}

#[tokio::test]
async fn environment_changes_are_not_committed_by_default() {
    let server = TestServer::spawn().await;
    let workspace = load_workspace("users_workspace.yaml", &server.base_url);
    let collection = workspace.collections[0].to_collection().unwrap();
    let env = workspace.find_environment("local").unwrap();

    let report = runner()
        .run(&collection, Some(env), &RunOptions::default())
        .await
        .unwrap();

    let second = &report.results[1];
    assert_eq!(second.status(), 400);
    assert_eq!(second.failed_tests(), 1);
    assert_eq!(report.stats.failed_requests, 2);

    server.shutdown().await;
}

#[tokio::test]
async fn stop_on_error_halts_after_connection_failure() {
    let server = TestServer::spawn().await;
    let collection = flat_collection(vec![
        get_request("first", server.url("/users")),
        get_request("unreachable", "http://127.0.0.1:1/".to_string()),
        get_request("third", server.url("/users")),
    ]);
    let options = RunOptions {
        stop_on_error: true,
        ..RunOptions::default()
    };

    let report = runner().run(&collection, None, &options).await.unwrap();

    assert_eq!(report.results.len(), 2);
    let failed = &report.results[1];
    assert!(failed.response.is_none());
    assert!(failed.error.as_deref().unwrap().starts_with("ConnectionError"));
    assert_eq!(report.stats.failed_requests, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn stop_on_test_failure_halts_after_first_request() {
    let server = TestServer::spawn().await;
    let collection = flat_collection(vec![
        get_request("first", server.url("/users"))
            .with_test_script("test('wrong', () => expect(response.status).to.equal(201))"),
        get_request("second", server.url("/users")),
    ]);
    let options = RunOptions {
        stop_on_test_failure: true,
        ..RunOptions::default()
    };

    let report = runner().run(&collection, None, &options).await.unwrap();

    assert_eq!(report.results.len(), 1);
    let message = report.results[0].test_results[0].message.clone().unwrap();
    assert!(message.contains("200") && message.contains("201"), "{message}");

    server.shutdown().await;
}

#[tokio::test]
async fn delay_is_applied_between_requests() {
    let server = TestServer::spawn().await;
    let collection = flat_collection(
        (0..3)
            .map(|i| get_request(&format!("r{i}"), server.url("/users")))
            .collect(),
    );
    let options = RunOptions {
        delay_ms: 500,
        ..RunOptions::default()
    };

    let started = Instant::now();
    let report = runner().run(&collection, None, &options).await.unwrap();

    assert_eq!(report.results.len(), 3);
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert!(report.stats.duration_ms() >= 1000);

    server.shutdown().await;
}

#[tokio::test]
async fn form_bodies_are_encoded() {
    let server = TestServer::spawn().await;
    let pairs = vec![
        KeyValuePair::new("name", "Ada Lovelace"),
        KeyValuePair::new("lang", "{{lang}}"),
        KeyValuePair::disabled("skip", "me"),
    ];
    let env = Environment::new("local").with_variable("lang", "en&fr");
    let pipeline = RequestPipeline::default();

    let urlencoded = HttpRequest::new("urlencoded", HttpMethod::Post, server.url("/echo"))
        .with_body(RequestBody::UrlEncoded(pairs.clone()));
    let outcome = pipeline.send(&urlencoded, Some(&env)).await;
    assert_eq!(
        outcome.response.data["contentType"],
        "application/x-www-form-urlencoded"
    );
    assert_eq!(outcome.response.data["body"], "name=Ada+Lovelace&lang=en%26fr");

    let multipart = urlencoded.with_body(RequestBody::FormData(pairs));
    let outcome = pipeline.send(&multipart, Some(&env)).await;
    let content_type = outcome.response.data["contentType"].as_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary="));
    let body = outcome.response.data["body"].as_str().unwrap();
    assert!(body.contains("name=\"lang\""));
    assert!(body.contains("en&fr"));
    assert!(!body.contains("skip"));

    server.shutdown().await;
}

#[tokio::test]
async fn raw_body_keeps_user_content_type() {
    let server = TestServer::spawn().await;
    let request = HttpRequest::new("raw", HttpMethod::Put, server.url("/echo"))
        .with_header("Content-Type", "text/csv")
        .with_body(RequestBody::Raw("a,b\n1,2".into()));

    let outcome = RequestPipeline::default().send(&request, None).await;
    assert_eq!(outcome.response.data["method"], "PUT");
    assert_eq!(outcome.response.data["contentType"], "text/csv");
    assert_eq!(outcome.response.data["body"], "a,b\n1,2");

    server.shutdown().await;
}

#[tokio::test]
async fn timeout_is_reported_as_zero_status() {
    let server = TestServer::spawn().await;
    let executor = ReqwestExecutor::new().with_timeout(Duration::from_millis(200));
    let pipeline = RequestPipeline::with_executor(Arc::new(executor), ScriptSandbox::default());
    let request = get_request("slow", server.url("/slow"))
        .with_test_script("test('never runs', () => {})");

    let outcome = pipeline.send(&request, None).await;

    assert_eq!(outcome.response.status, 0);
    assert_eq!(outcome.response.status_text, "Error");
    assert_eq!(outcome.response.data["name"], "TimeoutError");
    assert!(outcome.response.time >= 200);
    assert!(outcome.test_results.is_empty());
    assert!(outcome.error.unwrap().starts_with("TimeoutError"));

    server.shutdown().await;
}

#[tokio::test]
async fn export_document_describes_the_run() {
    let server = TestServer::spawn().await;
    let collection = flat_collection(vec![
        get_request("ok", server.url("/users"))
            .with_test_script("test('ok', () => expect(response.status).to.equal(200))"),
        get_request("down", "http://127.0.0.1:1/".to_string()),
    ]);
    let env = Environment::new("staging");

    let report = runner()
        .run(&collection, Some(&env), &RunOptions::default())
        .await
        .unwrap();
    let export = serde_json::to_value(report.export()).unwrap();

    assert_eq!(export["collection"]["name"], "adhoc");
    assert_eq!(export["collection"]["id"], collection.id.as_str());
    assert_eq!(export["environment"], "staging");
    assert!(chrono::DateTime::parse_from_rfc3339(export["timestamp"].as_str().unwrap()).is_ok());
    assert_eq!(export["summary"]["totalRequests"], 2);
    assert_eq!(export["summary"]["successfulRequests"], 1);
    assert_eq!(export["summary"]["failedRequests"], 1);
    assert_eq!(export["summary"]["passedTests"], 1);
    assert_eq!(export["results"][0]["status"], 200);
    assert_eq!(export["results"][0]["tests"][0]["name"], "ok");
    assert_eq!(export["results"][1]["status"], 0);
    assert!(export["results"][1]["error"].is_string());

    server.shutdown().await;
}

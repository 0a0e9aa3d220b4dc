use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use apiflow::{
    parse_workflow, DefaultWorkflowRunner, DocumentFormat, Environment, ExecutionHistory,
    StepStatus, Workflow, WorkflowRunner, WorkflowStatus,
};
use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

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
                "/auth/login",
                post(|body: String| async move {
                    if body.contains("<User>alice</User>") {
                        (
                            StatusCode::OK,
                            [("X-Session", "s-1"), ("Content-Type", "application/xml")],
                            "<LoginResponse><Token>tok-123</Token></LoginResponse>",
                        )
                    } else {
                        (
                            StatusCode::UNAUTHORIZED,
                            [("X-Session", "none"), ("Content-Type", "application/xml")],
                            "<Fault>unknown user</Fault>",
                        )
                    }
                }),
            )
            .route(
                "/orders",
                post(|headers: HeaderMap, body: String| async move {
                    let session = headers
                        .get("x-session")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    if body.contains("tok-123") && session == "s-1" {
                        (StatusCode::CREATED, Json(json!({"id": 42})))
                    } else {
                        (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad token"})))
                    }
                }),
            )
            .route(
                "/orders/:id",
                get(|Path(id): Path<u32>| async move {
                    Json(json!({"id": id, "status": "open"}))
                }),
            )
            .route(
                "/catalog",
                get(|| async move { Json(json!({"skus": ["a", "b"]})) }),
            )
            .route(
                "/stock/:sku",
                get(|Path(sku): Path<String>| async move {
                    let qty = if sku == "a" { "3" } else { "4" };
                    Json(json!({"sku": sku, "qty": qty}))
                }),
            )
            .route(
                "/slow",
                get(|| async move {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "done=late"
                }),
            );

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

fn load_workflow(path: &str, base_url: &str) -> Workflow {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let workflow_path = manifest_dir.join("tests/fixtures").join(path);
    let content = fs::read_to_string(&workflow_path)
        .unwrap_or_else(|e| panic!("failed to read {workflow_path:?}: {e}"));
    let content = content.replace("__BASE_URL__", base_url);

    parse_workflow(&content, DocumentFormat::Yaml)
        .unwrap_or_else(|e| panic!("failed to parse workflow yaml: {e}"))
}

fn runner_for(server: &TestServer, username: &str) -> DefaultWorkflowRunner {
    let environment = Environment::new("local")
        .with_endpoint_url(server.base_url.clone())
        .with_variable("username", username);
    DefaultWorkflowRunner::new().with_environment(Arc::new(environment))
}

#[tokio::test]
async fn token_flows_from_xml_login_into_later_requests() {
    let server = TestServer::spawn().await;
    let workflow = load_workflow("order_chain.yaml", &server.base_url);

    let result = runner_for(&server, "alice")
        .run(&workflow, &CancellationToken::new())
        .await
        .expect("workflow rejected");

    assert!(result.success(), "run should succeed: {:?}", result.error);
    assert_eq!(result.variables.get("token").map(String::as_str), Some("tok-123"));
    assert_eq!(result.variables.get("session").map(String::as_str), Some("s-1"));
    assert_eq!(result.variables.get("orderId").map(String::as_str), Some("42"));
    assert_eq!(result.variables.get("orderStatus").map(String::as_str), Some("open"));

    let create = result.records_for("create").next().unwrap();
    let request = create.request.as_ref().unwrap();
    assert_eq!(request.url, format!("{}/orders", server.base_url));
    assert_eq!(
        request.headers.get("Content-Type").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(create.response.as_ref().map(|r| r.status), Some(201));

    let fetch = result.records_for("fetch").next().unwrap();
    assert_eq!(
        fetch.request.as_ref().map(|r| r.url.clone()),
        Some(format!("{}/orders/42", server.base_url))
    );
    assert!(!workflow.variables.contains_key("token"));

    server.shutdown().await;
}

#[tokio::test]
async fn failed_login_falls_back_to_default_and_condition_skips_rest() {
    let server = TestServer::spawn().await;
    let workflow = load_workflow("order_chain.yaml", &server.base_url);

    let result = runner_for(&server, "mallory")
        .run(&workflow, &CancellationToken::new())
        .await
        .expect("workflow rejected");

    // HTTP errors are still responses: every executed step succeeded
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variables.get("token").map(String::as_str), Some("PENDING"));
    let login = result.records_for("login").next().unwrap();
    assert_eq!(login.response.as_ref().map(|r| r.status), Some(401));
    assert!(login.warnings.iter().any(|w| w.contains("PENDING")));

    let create = result.records_for("create").next().unwrap();
    assert!(create
        .request
        .as_ref()
        .and_then(|r| r.body.as_deref())
        .is_some_and(|b| b.contains("PENDING")));
    assert!(!result.variables.contains_key("orderId"));

    let fetch = result.records_for("fetch").next().unwrap();
    assert_eq!(fetch.status, StepStatus::Skipped);

    server.shutdown().await;
}

#[tokio::test]
async fn list_loop_runs_body_per_element() {
    let server = TestServer::spawn().await;
    let workflow = load_workflow("stock_loop.yaml", &server.base_url);

    let result = runner_for(&server, "alice")
        .run(&workflow, &CancellationToken::new())
        .await
        .expect("workflow rejected");

    assert!(result.success(), "run should succeed: {:?}", result.error);
    assert_eq!(result.variables.get("total").map(String::as_str), Some("7"));
    assert!(!result.variables.contains_key("sku"));

    let sums: Vec<&Vec<String>> = result.records_for("sum").map(|r| &r.logs).collect();
    assert_eq!(
        sums,
        vec![&vec!["a -> 3".to_string()], &vec!["b -> 4".to_string()]]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn timeout_fails_the_step_and_the_run_continues() {
    let server = TestServer::spawn().await;
    let workflow = load_workflow("slow.yaml", &server.base_url);

    let result = runner_for(&server, "alice")
        .run(&workflow, &CancellationToken::new())
        .await
        .expect("workflow rejected");

    assert_eq!(result.status, WorkflowStatus::Failed);
    let slow = result.records_for("wait-for-it").next().unwrap();
    assert_eq!(slow.status, StepStatus::Failed);
    assert!(slow.error.as_deref().unwrap_or_default().contains("timed out"));
    assert_eq!(result.variables.get("reached").map(String::as_str), Some("yes"));

    server.shutdown().await;
}

#[tokio::test]
async fn cancellation_interrupts_in_flight_request() {
    let server = TestServer::spawn().await;
    let mut workflow = load_workflow("slow.yaml", &server.base_url);
    workflow.config.timeout = 30;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let result = runner_for(&server, "alice")
        .run(&workflow, &cancel)
        .await
        .expect("workflow rejected");

    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert!(result.steps.iter().all(|r| r.status == StepStatus::Skipped));
    assert!(!result.variables.contains_key("reached"));

    server.shutdown().await;
}

#[tokio::test]
async fn single_step_rerun_reads_previous_responses() {
    let server = TestServer::spawn().await;
    let workflow = load_workflow("order_chain.yaml", &server.base_url);
    let runner = runner_for(&server, "alice");
    let cancel = CancellationToken::new();

    let mut history = ExecutionHistory::new();
    history.record(runner.run(&workflow, &cancel).await.expect("workflow rejected"));
    let prior = history.latest_log("order-chain").cloned().unwrap();

    let single = runner
        .run_step(&workflow, "fetch", &prior, &cancel)
        .await
        .expect("workflow rejected");

    assert_eq!(single.steps.len(), 1);
    assert_eq!(single.steps[0].status, StepStatus::Succeeded);
    assert_eq!(
        single.steps[0].request.as_ref().map(|r| r.url.clone()),
        Some(format!("{}/orders/42", server.base_url))
    );

    server.shutdown().await;
}

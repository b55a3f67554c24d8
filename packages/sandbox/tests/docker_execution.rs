// ABOUTME: End-to-end execution tests against a real Docker daemon
// ABOUTME: Ignored by default; run with `cargo test -- --ignored` where Docker is available

use runbox_sandbox::{
    ConfigResolver, ContainerEngine, DockerEngine, ErrorKind, ExecutionRequest, Executor,
};
use std::sync::Arc;
use tempfile::TempDir;

fn docker_executor(cache: &TempDir) -> Executor {
    let engine = DockerEngine::connect().expect("Failed to create Docker client");
    Executor::new(Arc::new(engine), Arc::new(ConfigResolver::new(cache.path())))
}

/// Without a daemon the client still constructs; failures surface from `ping`
#[tokio::test]
async fn test_engine_unavailable_is_reported_not_panicked() {
    let Ok(engine) = DockerEngine::connect() else {
        return;
    };

    if let Err(e) = engine.ping().await {
        let message = e.to_string();
        assert!(
            message.contains("connection") || message.contains("Docker"),
            "Error message should be informative about Docker unavailability: {}",
            message
        );
    }
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_python_hello() {
    let cache = TempDir::new().unwrap();
    let executor = docker_executor(&cache);

    let result = executor
        .run_code(ExecutionRequest::new("print('Hello from Python')", "python"))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output.as_deref(), Some("Hello from Python"));
    assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_typescript_hello() {
    let cache = TempDir::new().unwrap();
    let executor = docker_executor(&cache);

    let code = r#"console.log("Hello from Dagger!")"#;
    let result = executor
        .run_code(ExecutionRequest::new(code, "typescript"))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output.as_deref(), Some("Hello from Dagger!"));
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_sleep_past_timeout() {
    let cache = TempDir::new().unwrap();
    let executor = docker_executor(&cache);

    let result = executor
        .run_code(ExecutionRequest::new("import time\ntime.sleep(30)", "python").with_timeout(2))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(result.exit_code, Some(124));
    assert!(result.execution_time >= 2000);
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_runtime_error_exit_code() {
    let cache = TempDir::new().unwrap();
    let executor = docker_executor(&cache);

    let result = executor
        .run_code(ExecutionRequest::new("import sys\nsys.exit(3)", "python"))
        .await;

    assert_eq!(result.error_kind, Some(ErrorKind::Runtime));
    assert_eq!(result.exit_code, Some(3));
}

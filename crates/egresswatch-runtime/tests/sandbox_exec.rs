//! Sandbox lifecycle tests, using `sh` children as stand-ins for language
//! wrappers.

use std::time::Duration;

use egresswatch_runtime::sandbox::{FunctionSandbox, InvocationContext, SandboxConfig};
use serde_json::json;

fn sandbox(command: &str, script: &str, timeout: Duration) -> FunctionSandbox {
    let config = SandboxConfig::builder()
        .command(command)
        .args(["-c", script])
        .timeout(timeout)
        .build()
        .unwrap();
    FunctionSandbox::new("127.0.0.1", 18080, config)
}

#[tokio::test]
async fn timeout_kills_child_and_reports_failure() {
    let sandbox = sandbox("sh", "sleep 0.5", Duration::from_millis(100));
    let ctx = InvocationContext::new("fn-timeout");

    let started = std::time::Instant::now();
    let result = sandbox.execute(&ctx, &json!({})).await;
    let elapsed = started.elapsed();

    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("timeout after 100ms"), "error: {error}");
    assert!(result.duration_ms >= 100);
    // The child was killed, not waited out.
    assert!(elapsed < Duration::from_millis(450), "elapsed: {elapsed:?}");
    assert_eq!(result.invocation_id, ctx.invocation_id);
}

#[tokio::test]
async fn structured_stdout_is_preserved() {
    let sandbox = sandbox(
        "sh",
        r#"printf '{"statusCode":201,"headers":{"X-K":"v"},"body":{"ok":true}}'"#,
        Duration::from_secs(5),
    );
    let ctx = InvocationContext::new("fn-structured");

    let result = sandbox.execute(&ctx, &json!({})).await;
    assert!(result.success, "error: {:?}", result.error);

    let response = result.response.unwrap();
    assert_eq!(response.status_code, 201);
    assert_eq!(response.headers["X-K"], "v");
    assert_eq!(response.body, json!({"ok": true}));
}

#[tokio::test]
async fn bare_json_is_wrapped_as_200() {
    let sandbox = sandbox("sh", r#"printf '"hello"'"#, Duration::from_secs(5));
    let ctx = InvocationContext::new("fn-bare");

    let result = sandbox.execute(&ctx, &json!({})).await;
    assert!(result.success);

    let response = result.response.unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.headers["Content-Type"], "application/json");
    assert_eq!(response.body, json!("hello"));
}

#[tokio::test]
async fn request_is_delivered_on_stdin() {
    let sandbox = sandbox("sh", "cat", Duration::from_secs(5));
    let ctx = InvocationContext::new("fn-stdin");
    let request = json!({"method": "POST", "payload": {"n": 7}});

    let result = sandbox.execute(&ctx, &request).await;
    assert!(result.success, "error: {:?}", result.error);
    // `cat` echoes the request back; it arrives wrapped as a bare value.
    assert_eq!(result.response.unwrap().body, request);
}

#[tokio::test]
async fn context_reaches_child_environment() {
    let sandbox = sandbox(
        "sh",
        r#"printf '{"statusCode":200,"body":{"fn":"%s","proxy":"%s"}}' "$EGRESSWATCH_FUNCTION_ID" "$HTTP_PROXY""#,
        Duration::from_secs(5),
    );
    let ctx = InvocationContext::new("fn-env");

    let result = sandbox.execute(&ctx, &json!({})).await;
    assert!(result.success, "error: {:?}", result.error);

    let body = result.response.unwrap().body;
    assert_eq!(body["fn"], "fn-env");
    assert_eq!(body["proxy"], "http://127.0.0.1:18080");
}

#[tokio::test]
async fn nonzero_exit_surfaces_stderr() {
    let sandbox = sandbox("sh", "echo boom >&2; exit 3", Duration::from_secs(5));
    let ctx = InvocationContext::new("fn-fail");

    let result = sandbox.execute(&ctx, &json!({})).await;
    assert!(!result.success);
    assert!(result.response.is_none());
    assert!(result.error.unwrap().contains("boom"));
}

#[tokio::test]
async fn unparseable_stdout_is_invalid_response() {
    let sandbox = sandbox("sh", "echo this is not json", Duration::from_secs(5));
    let ctx = InvocationContext::new("fn-garbage");

    let result = sandbox.execute(&ctx, &json!({})).await;
    assert!(!result.success);
    assert_eq!(result.error.unwrap(), "invalid function response");
}

#[tokio::test]
async fn spawn_failure_is_captured_not_raised() {
    let config = SandboxConfig::builder()
        .command("definitely-not-a-real-binary-12345")
        .timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let sandbox = FunctionSandbox::new("127.0.0.1", 18080, config);
    let ctx = InvocationContext::new("fn-nospawn");

    let result = sandbox.execute(&ctx, &json!({})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("failed to spawn"));
}

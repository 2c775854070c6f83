//! Function sandbox: spawn user code with proxy-routed networking.
//!
//! The sandbox runs a configured command as a child process. Cooperating
//! HTTP clients self-route through the logging proxy via the standard
//! proxy environment variables; the optional loader-shim layer reinforces
//! that for clients that ignore them. The invocation context and request
//! travel to the child both as environment and on stdin; the child
//! answers with a single JSON document on stdout.
//!
//! A wall-clock timer bounds every execution. Expiry is a hard kill - no
//! graceful drain - and surfaces as a failed result naming the timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use egresswatch_core::probe::SyscallProfile;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default execution timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from sandbox configuration.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A required builder field was not set.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Optional reinforcement wiring for a sandbox.
///
/// The layers themselves are OS mechanisms outside this crate; the
/// sandbox only wires up what the capability probe reported available.
#[derive(Debug, Clone, Default)]
pub struct IsolationConfig {
    /// Path to the loader interception shim, injected via `LD_PRELOAD`.
    pub shim_path: Option<PathBuf>,
    /// Requested syscall-filter enforcement mode, recorded for the
    /// supervising layer that installs the filter.
    pub syscall_profile: Option<SyscallProfile>,
}

/// How to run one function's code.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Program to execute (interpreter or wrapper).
    pub command: String,
    /// Arguments, typically the entry point and handler name.
    pub args: Vec<String>,
    /// Extra environment for the child.
    pub env: HashMap<String, String>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Wall-clock bound on execution.
    pub timeout: Duration,
    /// Reinforcement layer wiring.
    pub isolation: IsolationConfig,
}

impl SandboxConfig {
    /// Returns a builder for constructing a `SandboxConfig`.
    #[must_use]
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }
}

/// Builder for [`SandboxConfig`].
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    command: Option<String>,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
    isolation: IsolationConfig,
}

impl SandboxConfigBuilder {
    /// Sets the program to execute.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Sets the program arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets the execution timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the reinforcement wiring.
    #[must_use]
    pub fn isolation(mut self, isolation: IsolationConfig) -> Self {
        self.isolation = isolation;
        self
    }

    /// Builds the `SandboxConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::MissingField`] when `command` is not set.
    pub fn build(self) -> Result<SandboxConfig, SandboxError> {
        Ok(SandboxConfig {
            command: self.command.ok_or(SandboxError::MissingField("command"))?,
            args: self.args,
            env: self.env,
            cwd: self.cwd,
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            isolation: self.isolation,
        })
    }
}

/// Identity of one logical execution.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// The function being executed.
    pub function_id: String,
    /// Correlates this execution's audit entries.
    pub invocation_id: String,
}

impl InvocationContext {
    /// Creates a context with a fresh invocation id.
    #[must_use]
    pub fn new(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            invocation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Creates a context with an externally generated invocation id.
    #[must_use]
    pub fn with_invocation_id(
        function_id: impl Into<String>,
        invocation_id: impl Into<String>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            invocation_id: invocation_id.into(),
        }
    }
}

/// The normalized HTTP-shaped response of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, as the function produced it.
    pub body: Value,
}

/// Outcome of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResult {
    /// Whether the function produced a usable response.
    pub success: bool,
    /// The normalized response, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<FunctionResponse>,
    /// What went wrong, on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time in milliseconds.
    pub duration_ms: u64,
    /// The invocation this result belongs to.
    pub invocation_id: String,
}

impl FunctionResult {
    fn failure(error: impl Into<String>, started: Instant, ctx: &InvocationContext) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error.into()),
            duration_ms: elapsed_ms(started),
            invocation_id: ctx.invocation_id.clone(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Executes user code in child processes routed through a logging proxy.
pub struct FunctionSandbox {
    proxy_host: String,
    proxy_port: u16,
    config: SandboxConfig,
}

impl FunctionSandbox {
    /// Creates a sandbox that routes children through the proxy at
    /// `proxy_host:proxy_port`.
    #[must_use]
    pub fn new(proxy_host: impl Into<String>, proxy_port: u16, config: SandboxConfig) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            config,
        }
    }

    /// Runs the configured command for one invocation.
    ///
    /// Never returns an error: every failure mode - spawn failure,
    /// non-zero exit, timeout, unparseable output - is captured in the
    /// returned [`FunctionResult`].
    pub async fn execute(&self, ctx: &InvocationContext, request: &Value) -> FunctionResult {
        let started = Instant::now();
        let request_json = request.to_string();

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        self.apply_network_env(&mut cmd, ctx, &request_json);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %self.config.command, error = %e, "sandbox spawn failed");
                return FunctionResult::failure(
                    format!("failed to spawn function process: {e}"),
                    started,
                    ctx,
                );
            },
        };

        // Stream the request to the child and close stdin so runtimes
        // that read-to-EOF make progress. Done off the wait path so a
        // child that never reads cannot stall the timeout.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = request_json.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!(error = %e, "writing request to child stdin failed");
                }
            });
        }

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return FunctionResult::failure(
                    format!("failed to wait for function process: {e}"),
                    started,
                    ctx,
                );
            },
            Err(_) => {
                // Hard kill; no graceful drain.
                let _ = child.kill().await;
                warn!(
                    function_id = %ctx.function_id,
                    "function killed after {}ms timeout",
                    self.config.timeout.as_millis()
                );
                return FunctionResult::failure(
                    format!("timeout after {}ms", self.config.timeout.as_millis()),
                    started,
                    ctx,
                );
            },
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let stderr_text = String::from_utf8_lossy(&stderr);
            let error = if stderr_text.trim().is_empty() {
                format!("function exited with {status}")
            } else {
                stderr_text.into_owned()
            };
            return FunctionResult::failure(error, started, ctx);
        }

        let Ok(raw) = serde_json::from_slice::<Value>(&stdout) else {
            return FunctionResult::failure("invalid function response", started, ctx);
        };

        FunctionResult {
            success: true,
            response: Some(normalize_response(raw)),
            error: None,
            duration_ms: elapsed_ms(started),
            invocation_id: ctx.invocation_id.clone(),
        }
    }

    /// Sets the proxy-routing and context environment on the child.
    fn apply_network_env(&self, cmd: &mut Command, ctx: &InvocationContext, request_json: &str) {
        let proxy_url = format!("http://{}:{}", self.proxy_host, self.proxy_port);
        // Both case variants: runtimes disagree about which they honour.
        cmd.env("HTTP_PROXY", &proxy_url)
            .env("HTTPS_PROXY", &proxy_url)
            .env("http_proxy", &proxy_url)
            .env("https_proxy", &proxy_url)
            .env("EGRESSWATCH_INVOCATION_ID", &ctx.invocation_id)
            .env("EGRESSWATCH_FUNCTION_ID", &ctx.function_id)
            .env("EGRESSWATCH_REQUEST", request_json);

        if let Some(shim) = &self.config.isolation.shim_path {
            if shim.exists() {
                cmd.env("LD_PRELOAD", shim)
                    .env("EGRESSWATCH_PROXY_HOST", &self.proxy_host)
                    .env("EGRESSWATCH_PROXY_PORT", self.proxy_port.to_string());
            }
        }
    }
}

/// Normalizes whatever the child printed into a [`FunctionResponse`].
///
/// A `{statusCode, headers?, body}` object is preserved; any other value
/// is wrapped as a 200 JSON response.
fn normalize_response(value: Value) -> FunctionResponse {
    if let Value::Object(ref obj) = value {
        if let Some(status) = obj.get("statusCode").and_then(Value::as_u64) {
            let headers = obj
                .get("headers")
                .and_then(Value::as_object)
                .map(|h| {
                    h.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            return FunctionResponse {
                status_code: u16::try_from(status).unwrap_or(200),
                headers,
                body: obj.get("body").cloned().unwrap_or(Value::Null),
            };
        }
    }

    FunctionResponse {
        status_code: 200,
        headers: HashMap::from([(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )]),
        body: value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_command() {
        let err = SandboxConfig::builder().build().unwrap_err();
        assert!(matches!(err, SandboxError::MissingField("command")));
    }

    #[test]
    fn builder_applies_defaults() {
        let config = SandboxConfig::builder().command("true").build().unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(config.args.is_empty());
        assert!(config.isolation.shim_path.is_none());
    }

    #[test]
    fn structured_responses_are_preserved() {
        let value = serde_json::json!({
            "statusCode": 404,
            "headers": {"X-Reason": "missing"},
            "body": {"error": "not found"}
        });

        let response = normalize_response(value);
        assert_eq!(response.status_code, 404);
        assert_eq!(response.headers["X-Reason"], "missing");
        assert_eq!(response.body, serde_json::json!({"error": "not found"}));
    }

    #[test]
    fn bare_values_are_wrapped_as_json_200() {
        let response = normalize_response(serde_json::json!({"greeting": "hello"}));
        assert_eq!(response.status_code, 200);
        assert_eq!(response.headers["Content-Type"], "application/json");
        assert_eq!(response.body, serde_json::json!({"greeting": "hello"}));

        let scalar = normalize_response(serde_json::json!(42));
        assert_eq!(scalar.status_code, 200);
        assert_eq!(scalar.body, serde_json::json!(42));
    }

    #[test]
    fn status_code_without_body_defaults_body_to_null() {
        let response = normalize_response(serde_json::json!({"statusCode": 204}));
        assert_eq!(response.status_code, 204);
        assert_eq!(response.body, Value::Null);
        assert!(response.headers.is_empty());
    }
}

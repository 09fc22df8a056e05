//! Request handlers.
//!
//! A handler turns the payload of one request into the payload of its
//! response. Handlers cannot fail: a failure is reported to the caller inside
//! the response payload.

use async_trait::async_trait;
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Computes the response to one request.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, payload: String) -> String;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, payload: String) -> String {
        (**self).handle(payload).await
    }
}

/// A handler backed by an async closure. See [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = String> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = String> + Send + 'static,
{
    async fn handle(&self, payload: String) -> String {
        (self.f)(payload).await
    }
}

/// Replies with the request payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, payload: String) -> String {
        payload
    }
}

/// Runs an external program per request.
///
/// The request payload is written to the program's stdin and its stdout is
/// the response. When the program cannot be started, exits unsuccessfully or
/// overruns its timeout, the response is a JSON object `{"error": "..."}`.
#[derive(Debug, Clone)]
pub struct ProgramHandler {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProgramHandler {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, payload: &str) -> Result<String, String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start {}: {}", self.program.display(), e))?;

        // stdin is fed while stdout is drained; the timeout covers both.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A program that exits without reading its input is not an error.
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    tracing::debug!("Writing request to {} failed: {}", self.program.display(), e);
                }
            }
        };
        let exchange = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                format!(
                    "{} did not finish within {:?}",
                    self.program.display(),
                    self.timeout
                )
            })?
            .map_err(|e| format!("failed to wait for {}: {}", self.program.display(), e))?;

        if !output.status.success() {
            return Err(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Handler for ProgramHandler {
    async fn handle(&self, payload: String) -> String {
        match self.run(&payload).await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!("{}", error);
                json!({ "error": error }).to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        assert_eq!(EchoHandler.handle("ping".into()).await, "ping");
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|payload: String| async move { payload.to_uppercase() });
        assert_eq!(handler.handle("ping".into()).await, "PING");

        let shared: Arc<dyn Handler> = Arc::new(handler);
        assert_eq!(shared.handle("pong".into()).await, "PONG");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_reads_stdin() {
        let handler = ProgramHandler::new("cat");
        assert_eq!(
            handler.handle("{\"method\":\"VM.start\"}".into()).await,
            "{\"method\":\"VM.start\"}"
        );

        let handler = ProgramHandler::new("sh").with_args(vec![
            "-c".into(),
            "printf 'got %s' \"$(cat)\"".into(),
        ]);
        assert_eq!(handler.handle("ping".into()).await, "got ping");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_failure_is_an_error_reply() {
        let handler = ProgramHandler::new("sh").with_args(vec![
            "-c".into(),
            "echo broken >&2; exit 3".into(),
        ]);
        let reply: serde_json::Value =
            serde_json::from_str(&handler.handle("x".into()).await).unwrap();
        let error = reply["error"].as_str().unwrap();
        assert!(error.contains("broken"));

        let handler = ProgramHandler::new("/nonexistent/msgswitch-program");
        let reply: serde_json::Value =
            serde_json::from_str(&handler.handle("x".into()).await).unwrap();
        assert!(reply["error"].as_str().unwrap().starts_with("failed to start"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_timeout() {
        let handler = ProgramHandler::new("sleep")
            .with_args(vec!["5".into()])
            .with_timeout(Duration::from_millis(50));
        let reply: serde_json::Value =
            serde_json::from_str(&handler.handle(String::new()).await).unwrap();
        assert!(reply["error"].as_str().unwrap().contains("did not finish"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_large_payload_through_pipes() {
        let payload = "x".repeat(1 << 20);
        let handler = ProgramHandler::new("cat").with_timeout(Duration::from_secs(5));
        let reply = tokio::time::timeout(Duration::from_secs(10), handler.handle(payload.clone()))
            .await
            .unwrap();
        assert_eq!(reply.len(), payload.len());
        assert_eq!(reply, payload);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_timeout_while_stdin_is_full() {
        // sleep never reads, so writing a large request blocks on a full pipe.
        let handler = ProgramHandler::new("sleep")
            .with_args(vec!["5".into()])
            .with_timeout(Duration::from_millis(100));
        let reply = tokio::time::timeout(
            Duration::from_secs(3),
            handler.handle("x".repeat(1 << 20)),
        )
        .await
        .unwrap();
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert!(reply["error"].as_str().unwrap().contains("did not finish"));
    }
}

//! Subprocess invoker for the vendor command line tools.
//!
//! Every outbound cloud call in this crate funnels through a [`CliInvoker`]:
//! it runs the vendor CLI (`aws`, `az`, `gcloud`, `docker`) with piped stdio,
//! applies a per-call deadline that kills the subprocess on expiry, and
//! classifies stderr from failed invocations into the [`ErrorKind`] taxonomy.

use crate::{
    error::{classify_stderr, CloudError, ErrorKind},
    logging::event,
    metrics::CliMetricsCollector,
    retries::{retry_request_with_policy, RetryPolicy},
};
use derivative::Derivative;
use serde::de::DeserializeOwned;
use slog::{debug, o, Logger};
use std::{
    io::{Read, Write},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the deadline loop polls the child for exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Runs one vendor CLI as subprocesses and normalizes the outcomes.
///
/// The program name is explicit (rather than hardcoded per provider) so tests
/// can substitute a stub executable.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct CliInvoker {
    provider: &'static str,
    program: String,
    default_timeout: Duration,
    retry_policy: RetryPolicy,
    #[derivative(Debug = "ignore")]
    logger: Logger,
    #[derivative(Debug = "ignore")]
    metrics: CliMetricsCollector,
}

impl CliInvoker {
    pub fn new(
        provider: &'static str,
        program: impl Into<String>,
        parent_logger: &Logger,
        metrics: &CliMetricsCollector,
    ) -> Self {
        let program = program.into();
        let logger = parent_logger.new(o!(
            event::PROVIDER => provider,
        ));
        CliInvoker {
            provider,
            program,
            default_timeout: DEFAULT_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            logger,
            metrics: metrics.clone(),
        }
    }

    pub fn aws(parent_logger: &Logger, metrics: &CliMetricsCollector) -> Self {
        Self::new("aws", "aws", parent_logger, metrics)
    }

    pub fn azure(parent_logger: &Logger, metrics: &CliMetricsCollector) -> Self {
        Self::new("azure", "az", parent_logger, metrics)
    }

    pub fn gcp(parent_logger: &Logger, metrics: &CliMetricsCollector) -> Self {
        Self::new("gcp", "gcloud", parent_logger, metrics)
    }

    pub fn docker(parent_logger: &Logger, metrics: &CliMetricsCollector) -> Self {
        Self::new("docker", "docker", parent_logger, metrics)
    }

    /// Returns a copy of this invoker whose calls are bounded by `timeout`
    /// instead of the default deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut invoker = self.clone();
        invoker.default_timeout = timeout;
        invoker
    }

    /// Returns a copy of this invoker with a different retry policy for the
    /// `*_retrying` calls.
    pub fn with_retry_policy(&self, policy: RetryPolicy) -> Self {
        let mut invoker = self.clone();
        invoker.retry_policy = policy;
        invoker
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs the CLI with the given arguments, returning its stdout on
    /// success. A non-zero exit is classified from stderr into a
    /// [`CloudError`] carrying `operation`.
    pub fn run(&self, operation: &str, args: &[&str]) -> Result<Vec<u8>, CloudError> {
        self.execute(operation, args, None, self.default_timeout)
    }

    /// Like [`run`](Self::run), but feeds `stdin_bytes` to the subprocess.
    pub fn run_with_stdin(
        &self,
        operation: &str,
        args: &[&str],
        stdin_bytes: &[u8],
    ) -> Result<Vec<u8>, CloudError> {
        self.execute(operation, args, Some(stdin_bytes), self.default_timeout)
    }

    /// Like [`run`](Self::run), with extra environment variables set for the
    /// subprocess only.
    pub fn run_with_env(
        &self,
        operation: &str,
        args: &[&str],
        envs: &[(&str, &str)],
    ) -> Result<Vec<u8>, CloudError> {
        self.execute_with_env(operation, args, None, envs, self.default_timeout)
    }

    /// Runs the CLI and decodes its stdout as JSON into `T`.
    pub fn run_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        args: &[&str],
    ) -> Result<T, CloudError> {
        let stdout = self.run(operation, args)?;
        serde_json::from_slice(&stdout).map_err(|e| {
            CloudError::new(
                self.provider,
                ErrorKind::Unknown,
                operation,
                format!("failed to decode {} output as JSON", self.program),
            )
            .with_cause(e)
        })
    }

    /// Runs the CLI under the invoker's retry policy; retryable failures are
    /// re-attempted with exponential backoff, fatal ones short-circuit. The
    /// caller decides whether the operation is idempotent enough to retry.
    pub fn run_retrying(&self, operation: &str, args: &[&str]) -> Result<Vec<u8>, CloudError> {
        let logger = self.logger.new(o!(event::ACTION => operation.to_owned()));
        let mut first_attempt = true;
        retry_request_with_policy(
            &logger,
            self.retry_policy,
            || {
                if !first_attempt {
                    self.metrics
                        .retries
                        .with_label_values(&[self.provider, operation])
                        .inc();
                }
                first_attempt = false;
                self.run(operation, args)
            },
            |e: &CloudError| e.retryable,
        )
    }

    /// Like [`run_retrying`](Self::run_retrying) but JSON-decoding stdout.
    pub fn run_json_retrying<T: DeserializeOwned>(
        &self,
        operation: &str,
        args: &[&str],
    ) -> Result<T, CloudError> {
        let stdout = self.run_retrying(operation, args)?;
        serde_json::from_slice(&stdout).map_err(|e| {
            CloudError::new(
                self.provider,
                ErrorKind::Unknown,
                operation,
                format!("failed to decode {} output as JSON", self.program),
            )
            .with_cause(e)
        })
    }

    fn execute(
        &self,
        operation: &str,
        args: &[&str],
        stdin_bytes: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Vec<u8>, CloudError> {
        self.execute_with_env(operation, args, stdin_bytes, &[], timeout)
    }

    fn execute_with_env(
        &self,
        operation: &str,
        args: &[&str],
        stdin_bytes: Option<&[u8]>,
        envs: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Vec<u8>, CloudError> {
        let logger = self.logger.new(o!(event::OPERATION => operation.to_owned()));
        debug!(logger, "invoking"; "program" => &self.program, "args" => args.join(" "));

        let mut command = Command::new(&self.program);
        command
            .args(args)
            .envs(envs.iter().map(|(key, value)| (*key, *value)))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin_bytes.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn().map_err(|e| {
            CloudError::new(
                self.provider,
                ErrorKind::InternalError,
                operation,
                format!("failed to spawn {}", self.program),
            )
            .with_cause(e)
        })?;

        if let Some(bytes) = stdin_bytes {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                CloudError::new(
                    self.provider,
                    ErrorKind::InternalError,
                    operation,
                    "subprocess stdin unavailable",
                )
            })?;
            stdin.write_all(bytes).map_err(|e| {
                let _ = child.kill();
                let _ = child.wait();
                CloudError::new(
                    self.provider,
                    ErrorKind::InternalError,
                    operation,
                    "failed to write to subprocess stdin",
                )
                .with_cause(e)
            })?;
            // Dropping the handle closes the pipe so the child sees EOF
        }

        // Drain stdout and stderr on their own threads so a chatty subprocess
        // cannot deadlock on a full pipe buffer while we wait for exit.
        let stdout_thread = reader_thread(child.stdout.take());
        let stderr_thread = reader_thread(child.stderr.take());

        let status = self.wait_with_deadline(&mut child, operation, timeout)?;

        let stdout_bytes = stdout_thread.join().unwrap_or_default();
        let stderr_bytes = stderr_thread.join().unwrap_or_default();

        if status.success() {
            self.metrics
                .invocations
                .with_label_values(&[self.provider, operation, "ok"])
                .inc();
            return Ok(stdout_bytes);
        }

        let stderr_text = String::from_utf8_lossy(&stderr_bytes);
        let kind = classify_stderr(&stderr_text);
        self.metrics
            .invocations
            .with_label_values(&[self.provider, operation, "error"])
            .inc();
        debug!(
            logger, "invocation failed";
            "exit_code" => status.code().unwrap_or(-1),
            "kind" => kind.code(),
        );

        let message = stderr_text
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("command failed with no stderr output")
            .trim()
            .to_owned();
        Err(CloudError::new(self.provider, kind, operation, message))
    }

    fn wait_with_deadline(
        &self,
        child: &mut Child,
        operation: &str,
        timeout: Duration,
    ) -> Result<ExitStatus, CloudError> {
        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        // Expiring the deadline must kill the subprocess
                        let _ = child.kill();
                        let _ = child.wait();
                        self.metrics
                            .invocations
                            .with_label_values(&[self.provider, operation, "timeout"])
                            .inc();
                        return Err(CloudError::new(
                            self.provider,
                            ErrorKind::RequestTimeout,
                            operation,
                            format!(
                                "{} did not complete within {}ms",
                                self.program,
                                timeout.as_millis()
                            ),
                        ));
                    }
                    thread::sleep(WAIT_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(CloudError::new(
                        self.provider,
                        ErrorKind::InternalError,
                        operation,
                        "failed to poll subprocess for exit",
                    )
                    .with_cause(e))
                }
            }
        }
    }
}

fn reader_thread<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = source {
            // Read errors surface via the exit status instead
            let _ = reader.read_to_end(&mut buf);
        }
        buf
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use assert_matches::assert_matches;
    use serde::Deserialize;

    fn shell_invoker(metric_name: &str) -> CliInvoker {
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        CliInvoker::new("aws", "sh", &logger, &metrics)
    }

    #[test]
    fn run_captures_stdout() {
        let invoker = shell_invoker("cli_run_captures_stdout");
        let out = invoker.run("Echo", &["-c", "printf hello"]).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn run_classifies_stderr() {
        let invoker = shell_invoker("cli_run_classifies_stderr");
        let err = invoker
            .run(
                "PutObject",
                &[
                    "-c",
                    "echo 'An error occurred (AccessDenied) when calling the PutObject operation' 1>&2; exit 254",
                ],
            )
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::AccessDenied);
        assert!(!err.retryable);
        assert_eq!(err.operation, "PutObject");
        assert!(err.message.contains("AccessDenied"));
    }

    #[test]
    fn run_times_out_and_kills() {
        let invoker = shell_invoker("cli_run_times_out").with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = invoker.run("Sleep", &["-c", "sleep 5"]).unwrap_err();
        assert_matches!(err.kind, ErrorKind::RequestTimeout);
        assert!(err.retryable);
        // The deadline must not degrade into waiting for the subprocess
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn run_with_stdin_round_trips() {
        let invoker = shell_invoker("cli_run_with_stdin");
        let out = invoker
            .run_with_stdin("Cat", &["-c", "cat"], b"registry-token")
            .unwrap();
        assert_eq!(out, b"registry-token");
    }

    #[test]
    fn run_json_decodes() {
        #[derive(Deserialize)]
        struct Out {
            #[serde(rename = "Name")]
            name: String,
        }

        let invoker = shell_invoker("cli_run_json_decodes");
        let out: Out = invoker
            .run_json("Describe", &["-c", r#"echo '{"Name":"apm"}'"#])
            .unwrap();
        assert_eq!(out.name, "apm");
    }

    #[test]
    fn run_json_rejects_garbage() {
        #[derive(Debug, Deserialize)]
        struct Out {}

        let invoker = shell_invoker("cli_run_json_rejects_garbage");
        let err = invoker
            .run_json::<Out>("Describe", &["-c", "echo not-json"])
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::Unknown);
    }

    #[test]
    fn retrying_gives_up_on_fatal_error() {
        let invoker = shell_invoker("cli_retrying_fatal").with_retry_policy(RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(1),
            max_attempts: 3,
        });
        let err = invoker
            .run_retrying("PutObject", &["-c", "echo 'AccessDenied' 1>&2; exit 1"])
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::AccessDenied);
    }

    #[test]
    fn retrying_recovers_from_transient_failure() {
        // Fails with a retryable error until the marker file exists
        let logger = setup_test_logging();
        let metrics =
            CliMetricsCollector::new_with_metric_name("cli_retrying_recovers").unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let marker = scratch.path().join("marker");
        let script = format!(
            "if [ -f {marker} ]; then printf recovered; else touch {marker}; echo 'ServiceUnavailable' 1>&2; exit 1; fi",
            marker = marker.display()
        );
        let invoker = CliInvoker::new("aws", "sh", &logger, &metrics).with_retry_policy(
            RetryPolicy {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                max_attempts: 3,
            },
        );

        let out = invoker.run_retrying("Flaky", &["-c", &script]).unwrap();
        assert_eq!(out, b"recovered");
    }
}

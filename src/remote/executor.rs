// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Runs commands inside pods through the exec subresource, retrying
//! connection-level failures with exponential backoff.

use crate::error::{DrSyncError, Result};
use crate::kubernetes::ClusterConnection;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::Api;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Failure phrases that indicate the stream broke rather than the command failing
const RETRYABLE_PHRASES: [&str; 4] = [
    "connection refused",
    "connection reset",
    "broken pipe",
    "connection aborted",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives every output line of every attempt as it arrives
pub trait OutputObserver: Send + Sync {
    fn on_line(&self, stream: OutputStream, line: &str);
}

/// Logs output lines through tracing
pub struct TracingObserver {
    pub label: String,
}

impl OutputObserver for TracingObserver {
    fn on_line(&self, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => debug!("[{}] {}", self.label, line),
            OutputStream::Stderr => info!("[{}] stderr: {}", self.label, line),
        }
    }
}

/// Buffered output of one successful attempt
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Classified failure of one attempt
#[derive(Clone, Debug, PartialEq)]
pub struct ExecFailure {
    pub retryable: bool,
    pub message: String,
}

impl ExecFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }

    /// Classify an error by walking its source chain
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let retryable = is_retryable_error(err);
        Self {
            retryable,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ExecFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Whether a failure message names a connection-level problem
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_PHRASES.iter().any(|p| lower.contains(p))
}

fn is_retryable_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        if is_retryable_message(&e.to_string()) {
            return true;
        }
        current = e.source();
    }
    false
}

/// One exec attempt against a cluster
#[async_trait]
pub trait ExecTransport: Send + Sync {
    async fn exec(
        &self,
        connection: &ClusterConnection,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: &[String],
        observer: &dyn OutputObserver,
    ) -> std::result::Result<ExecOutput, ExecFailure>;
}

/// Exec over the Kubernetes API (stdin off, stdout and stderr on, no tty)
pub struct KubeExecTransport;

#[async_trait]
impl ExecTransport for KubeExecTransport {
    async fn exec(
        &self,
        connection: &ClusterConnection,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: &[String],
        observer: &dyn OutputObserver,
    ) -> std::result::Result<ExecOutput, ExecFailure> {
        let pods: Api<Pod> = Api::namespaced(connection.client.clone(), namespace);
        let mut params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);
        if let Some(container) = container {
            params = params.container(container);
        }

        let mut attached = pods
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| ExecFailure::from_error(&e))?;

        let status = attached.take_status();
        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) = tokio::join!(
            read_lines(stdout_reader, OutputStream::Stdout, observer),
            read_lines(stderr_reader, OutputStream::Stderr, observer),
        );
        let stdout = stdout.map_err(|e| ExecFailure::from_error(&e))?;
        let stderr = stderr.map_err(|e| ExecFailure::from_error(&e))?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| ExecFailure::terminal(format!("exec stream task failed: {}", e)))?;

        if let Some(status) = status.filter(|s| s.status.as_deref() == Some("Failure")) {
            let message = format!(
                "{}: {}{}",
                status.reason.unwrap_or_default(),
                status.message.unwrap_or_default(),
                stderr
                    .lines()
                    .last()
                    .map(|l| format!(" ({})", l))
                    .unwrap_or_default()
            );
            return Err(ExecFailure {
                retryable: is_retryable_message(&message),
                message,
            });
        }

        Ok(ExecOutput { stdout, stderr })
    }
}

async fn read_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    stream: OutputStream,
    observer: &dyn OutputObserver,
) -> std::io::Result<String> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };

    let mut buffered = String::new();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        observer.on_line(stream, &line);
        buffered.push_str(&line);
        buffered.push('\n');
    }
    Ok(buffered)
}

/// Which side of a cluster mapping a command targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointRole {
    Source,
    Destination,
}

/// A command to run in a pod
#[derive(Clone, Debug)]
pub struct ExecRequest {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub command: Vec<String>,
    pub max_retries: u32,
    pub backoff: Duration,
    /// Explicit target; when None the executor infers it
    pub endpoint: Option<EndpointRole>,
}

impl ExecRequest {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: None,
            command,
            max_retries: 3,
            backoff: Duration::from_secs(1),
            endpoint: None,
        }
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    pub fn endpoint(mut self, role: EndpointRole) -> Self {
        self.endpoint = Some(role);
        self
    }
}

/// Output of a successful command with the number of attempts it took
#[derive(Clone, Debug, PartialEq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub attempts: u32,
}

/// Runs commands through an [`ExecTransport`], bound to one cluster and
/// optionally aware of both sides of a mapping
pub struct RemoteExecutor {
    transport: Arc<dyn ExecTransport>,
    bound: ClusterConnection,
    candidates: Option<(ClusterConnection, ClusterConnection)>,
}

impl RemoteExecutor {
    pub fn new(bound: ClusterConnection) -> Self {
        Self::with_transport(bound, Arc::new(KubeExecTransport))
    }

    pub fn with_transport(bound: ClusterConnection, transport: Arc<dyn ExecTransport>) -> Self {
        Self {
            transport,
            bound,
            candidates: None,
        }
    }

    /// Make source and destination endpoints available for explicit selection
    pub fn with_endpoints(mut self, source: ClusterConnection, destination: ClusterConnection) -> Self {
        self.candidates = Some((source, destination));
        self
    }

    /// Pick the cluster a request runs against.
    ///
    /// An explicit role always wins and requires both endpoints to be known.
    /// Without one, and only as a fallback, the bound client's host is matched
    /// against the candidates; if neither matches the bound client is used.
    pub fn resolve_endpoint(&self, explicit: Option<EndpointRole>) -> Result<&ClusterConnection> {
        match (explicit, &self.candidates) {
            (Some(role), Some((source, destination))) => Ok(match role {
                EndpointRole::Source => source,
                EndpointRole::Destination => destination,
            }),
            (Some(role), None) => Err(DrSyncError::Configuration(format!(
                "{:?} endpoint requested but the executor has no endpoints configured",
                role
            ))),
            (None, Some((source, destination))) => {
                if self.bound.host == source.host {
                    Ok(source)
                } else if self.bound.host == destination.host {
                    Ok(destination)
                } else {
                    warn!(
                        "Bound host {} matches neither endpoint, using bound client",
                        self.bound.host
                    );
                    Ok(&self.bound)
                }
            }
            (None, None) => Ok(&self.bound),
        }
    }

    /// Run a command, retrying connection-level failures up to
    /// `max_retries` times with `backoff × 2^n` between attempts
    #[instrument(skip(self, request, observer, cancel), fields(namespace = %request.namespace, pod = %request.pod))]
    pub async fn execute_command(
        &self,
        request: &ExecRequest,
        observer: &dyn OutputObserver,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        let connection = self.resolve_endpoint(request.endpoint)?;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(cancelled(request));
            }

            debug!("Exec attempt {} on {}", attempt, connection.name);
            let result = tokio::select! {
                result = self.transport.exec(
                    connection,
                    &request.namespace,
                    &request.pod,
                    request.container.as_deref(),
                    &request.command,
                    observer,
                ) => result,
                _ = cancel.cancelled() => return Err(cancelled(request)),
            };

            let failure = match result {
                Ok(output) => {
                    return Ok(ExecResult {
                        stdout: output.stdout,
                        stderr: output.stderr,
                        attempts: attempt,
                    })
                }
                Err(failure) => failure,
            };

            if !failure.retryable || attempt > request.max_retries {
                return Err(DrSyncError::ExecFailed {
                    attempts: attempt,
                    retryable: failure.retryable,
                    message: failure.message,
                });
            }

            let delay = request
                .backoff
                .saturating_mul(1u32 << (attempt - 1).min(16));
            warn!(
                "Exec attempt {} in {}/{} failed ({}), retrying in {:?}",
                attempt, request.namespace, request.pod, failure, delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(cancelled(request)),
            }
        }
    }
}

fn cancelled(request: &ExecRequest) -> DrSyncError {
    DrSyncError::Cancelled(format!(
        "exec in {}/{}",
        request.namespace, request.pod
    ))
}

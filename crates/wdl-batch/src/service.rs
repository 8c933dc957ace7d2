//! Serving a task execution backend to an engine running as a child process.
//!
//! Inside the workflow job the engine runs as a child of the runner (see
//! [`crate::run`]). The runner serves its [`TaskExecutionBackend`] on a Unix
//! socket whose path it passes to the engine in [`TASK_SOCKET_ENV`]; the
//! engine launches every task attempt with `sprocket-batch task`, which
//! forwards the attempt with [`run_task`] and exits with its exit code.
//!
//! Each connection carries one attempt: the client writes a [`TaskRequest`]
//! as one line of JSON and the service answers with one line holding a
//! [`TaskReply`]. A client that closes its connection before the reply
//! cancels the attempt.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backend::TaskExecutionBackend;
use crate::backend::TaskExecutionResult;
use crate::backend::TaskSpawnRequest;

/// The environment variable holding the path of the task service's socket.
pub const TASK_SOCKET_ENV: &str = "SPROCKET_BATCH__TASK_SOCKET";

/// The file name of the task service's socket.
const SOCKET_NAME: &str = "tasks.sock";

/// How long to wait before accepting again after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A task attempt requested by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// The identifier of the task within the run.
    pub id: String,
    /// The attempt number, starting at `0`.
    #[serde(default)]
    pub attempt: u64,
    /// The evaluated command of the task.
    pub command: String,
    /// The container image; the configured default is used if `None`.
    #[serde(default)]
    pub image: Option<String>,
    /// The requested number of CPUs.
    #[serde(default)]
    pub cpu: Option<f64>,
    /// The requested memory, in bytes.
    #[serde(default)]
    pub memory: Option<u64>,
    /// The environment variables of the task.
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// The maximum duration of the attempt, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl From<TaskRequest> for TaskSpawnRequest {
    fn from(request: TaskRequest) -> Self {
        TaskSpawnRequest::builder()
            .id(request.id)
            .attempt(request.attempt)
            .command(request.command)
            .maybe_image(request.image)
            .maybe_cpu(request.cpu)
            .maybe_memory(request.memory)
            .env(request.env)
            .maybe_timeout(request.timeout_secs.map(Duration::from_secs))
            .build()
    }
}

/// The answer to a [`TaskRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskReply {
    /// The attempt's job reached a terminal state.
    Finished {
        /// The id of the job that ran the attempt.
        job_id: String,
        /// The terminal state of the job.
        state: String,
        /// The exit code of the attempt; `-1` if there is none.
        exit_code: i32,
        /// Whether the attempt was stopped after exceeding its timeout.
        timed_out: bool,
        /// The scratch directory of the attempt.
        scratch: PathBuf,
        /// The log stream of the job, if it produced one.
        log_stream: Option<String>,
    },
    /// The attempt could not be run to completion.
    Failed {
        /// What went wrong.
        error: String,
    },
}

impl TaskReply {
    /// Constructs the reply for an attempt that failed with an error.
    fn failed(e: &anyhow::Error) -> Self {
        Self::Failed {
            error: format!("{e:#}"),
        }
    }
}

impl From<TaskExecutionResult> for TaskReply {
    fn from(result: TaskExecutionResult) -> Self {
        Self::Finished {
            job_id: result.job_id,
            state: result.state.to_string(),
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            scratch: result.scratch.root().to_path_buf(),
            log_stream: result.log_stream.map(|s| s.to_string()),
        }
    }
}

/// Serves a task execution backend on a Unix socket.
///
/// The socket lives in a private temporary directory that is removed when
/// the service stops.
pub struct TaskService {
    /// The backend running the attempts.
    backend: Arc<dyn TaskExecutionBackend>,
    /// The listening socket.
    listener: UnixListener,
    /// The path of the socket.
    socket: PathBuf,
    /// The directory holding the socket.
    _dir: TempDir,
}

impl TaskService {
    /// Binds a new service for the given backend.
    pub fn bind(backend: Arc<dyn TaskExecutionBackend>) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("sprocket-batch-")
            .tempdir()
            .context("failed to create the task service directory")?;

        let socket = dir.path().join(SOCKET_NAME);
        let listener = UnixListener::bind(&socket).with_context(|| {
            format!(
                "failed to bind the task service to `{path}`",
                path = socket.display()
            )
        })?;

        debug!(socket = %socket.display(), "task service bound");
        Ok(Self {
            backend,
            listener,
            socket,
            _dir: dir,
        })
    }

    /// Gets the path of the socket.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Serves attempts until the token is cancelled.
    ///
    /// Attempts still running when the token is cancelled are cancelled too;
    /// this returns once every one of them has been answered.
    pub async fn serve(self, token: CancellationToken) {
        info!(socket = %self.socket.display(), "serving task attempts");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(res) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = res {
                        error!("task connection failed: {e}");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(serve_connection(
                            self.backend.clone(),
                            stream,
                            token.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!("failed to accept a task connection: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        if !connections.is_empty() {
            info!(attempts = connections.len(), "waiting for task attempts to stop");
        }

        while let Some(res) = connections.join_next().await {
            if let Err(e) = res {
                error!("task connection failed: {e}");
            }
        }
    }
}

/// Serves the single attempt requested on a connection.
async fn serve_connection(
    backend: Arc<dyn TaskExecutionBackend>,
    stream: UnixStream,
    token: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let request = match lines.next_line().await {
        Ok(Some(line)) => serde_json::from_str::<TaskRequest>(&line),
        Ok(None) => return,
        Err(e) => {
            warn!("failed to read a task request: {e}");
            return;
        }
    };

    let reply = match request {
        Ok(request) => match execute(&*backend, request, &mut lines, token).await {
            Some(reply) => reply,
            None => return,
        },
        Err(e) => TaskReply::Failed {
            error: format!("invalid task request: {e}"),
        },
    };

    let mut line = match serde_json::to_string(&reply) {
        Ok(line) => line,
        Err(e) => {
            error!("failed to serialize a task reply: {e}");
            return;
        }
    };
    line.push('\n');

    if let Err(e) = writer.write_all(line.as_bytes()).await {
        warn!("failed to send a task reply: {e}");
    }
}

/// Runs an attempt, cancelling it if the client goes away.
///
/// Returns `None` if the client disconnected before the attempt finished.
async fn execute(
    backend: &dyn TaskExecutionBackend,
    request: TaskRequest,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    token: CancellationToken,
) -> Option<TaskReply> {
    let id = request.id.clone();
    let attempt = request.attempt;
    let mut rx = match backend.spawn(request.into(), token.clone()) {
        Ok(rx) => rx,
        Err(e) => return Some(TaskReply::failed(&e)),
    };

    let mut connected = true;
    let result = loop {
        tokio::select! {
            result = &mut rx => break result,
            line = lines.next_line(), if connected => {
                // Clients send nothing after the request until they leave
                if !matches!(line, Ok(Some(_))) {
                    info!(task_id = id, attempt, "task client disconnected; cancelling the attempt");
                    connected = false;
                    token.cancel();
                }
            }
        }
    };

    if !connected {
        return None;
    }

    Some(match result {
        Ok(Ok(result)) => result.into(),
        Ok(Err(e)) => TaskReply::failed(&e),
        Err(_) => TaskReply::Failed {
            error: format!("task `{id}` was abandoned by the execution backend"),
        },
    })
}

/// Runs a task attempt through the task service listening on `socket`.
///
/// The connection stays open until the reply arrives; dropping the returned
/// future cancels the attempt.
pub async fn run_task(socket: &Path, request: &TaskRequest) -> Result<TaskReply> {
    let stream = UnixStream::connect(socket).await.with_context(|| {
        format!(
            "failed to connect to the task service at `{path}`",
            path = socket.display()
        )
    })?;

    let (reader, mut writer) = stream.into_split();
    let mut line = serde_json::to_string(request).context("failed to serialize task request")?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .context("failed to send task request")?;

    let reply = BufReader::new(reader)
        .lines()
        .next_line()
        .await
        .context("failed to read task reply")?
        .context("the task service closed the connection without replying")?;

    // The write half is kept open until here; closing it cancels the attempt
    drop(writer);
    serde_json::from_str(&reply).context("invalid task reply")
}

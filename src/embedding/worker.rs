//! Out-of-process embedding worker for accelerator-backed models.
//!
//! The worker is a long-lived child process speaking newline-delimited JSON
//! over stdin/stdout. Every request carries an id and the matching response
//! echoes it:
//!
//! ```text
//! -> {"id":1,"op":"load","model_id":"bge-m3","files":{"model.onnx":"/cache/blobs/sha256-..."}}
//! <- {"id":1,"dims":1024}
//! -> {"id":2,"op":"embed","texts":["first","second"]}
//! <- {"id":2,"vectors":[[...],[...]]}
//! -> {"id":3,"op":"ping"}
//! <- {"id":3}
//! <- {"id":4,"error":"CUDA out of memory"}
//! ```
//!
//! Only one request is in flight per worker. Responses with older ids are
//! discarded. A caller dropped mid-request may also have left half a line
//! on the worker's stdin, so a channel whose last request never finished
//! is not reused: the backend relaunches the worker first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{validate_batch, EmbedError, EmbeddingBackend};
use crate::config::GpuWorkerConfig;
use crate::model_registry::{BackendKind, ModelDescriptor};

const DEFAULT_BATCH_SIZE: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum WorkerOp {
    Load {
        model_id: String,
        files: BTreeMap<String, PathBuf>,
    },
    Embed {
        texts: Vec<String>,
    },
    Ping,
    Shutdown,
}

#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    id: u64,
    #[serde(flatten)]
    op: &'a WorkerOp,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    #[serde(default)]
    pub vectors: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Request/response channel over a worker's byte streams.
pub struct WorkerChannel {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    next_id: u64,
    in_flight: bool,
}

impl WorkerChannel {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
            next_id: 1,
            in_flight: false,
        }
    }

    /// True when the last request was abandoned before its response was
    /// read.
    pub fn interrupted(&self) -> bool {
        self.in_flight
    }

    /// Send `op` and wait for the response carrying the same id.
    pub async fn request(&mut self, op: &WorkerOp) -> Result<WorkerResponse, EmbedError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut line = serde_json::to_vec(&WorkerRequest { id, op })
            .map_err(|e| EmbedError::Backend(e.to_string()))?;
        line.push(b'\n');
        self.in_flight = true;
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| EmbedError::WorkerCrashed(format!("write failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| EmbedError::WorkerCrashed(format!("flush failed: {}", e)))?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let n = self
                .reader
                .read_line(&mut buf)
                .await
                .map_err(|e| EmbedError::WorkerCrashed(format!("read failed: {}", e)))?;
            if n == 0 {
                return Err(EmbedError::WorkerCrashed(
                    "worker closed its output".to_string(),
                ));
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            let response: WorkerResponse = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, line = %trimmed, "ignoring malformed worker output");
                    continue;
                }
            };
            if response.id < id {
                tracing::debug!(stale = response.id, current = id, "discarding stale worker response");
                continue;
            }
            if response.id > id {
                return Err(EmbedError::WorkerCrashed(format!(
                    "worker answered unknown request {}",
                    response.id
                )));
            }
            self.in_flight = false;
            if let Some(message) = response.error {
                return Err(EmbedError::Backend(message));
            }
            return Ok(response);
        }
    }
}

/// A running worker: its channel and, for real processes, the child handle.
pub struct WorkerConnection {
    pub channel: WorkerChannel,
    pub child: Option<Child>,
}

/// Starts worker processes. Swapped out in tests for in-memory workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<WorkerConnection, EmbedError>;
}

/// Launches the configured worker command as a child process.
pub struct ProcessLauncher {
    config: GpuWorkerConfig,
}

impl ProcessLauncher {
    pub fn new(config: GpuWorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<WorkerConnection, EmbedError> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EmbedError::Unavailable(format!("spawn {}: {}", self.config.command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EmbedError::WorkerCrashed("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EmbedError::WorkerCrashed("worker stdout unavailable".to_string()))?;

        tracing::info!(command = %self.config.command, pid = ?child.id(), "embedding worker started");
        Ok(WorkerConnection {
            channel: WorkerChannel::new(stdout, stdin),
            child: Some(child),
        })
    }
}

/// Backend that forwards batches to an external worker process.
pub struct WorkerBackend {
    model_id: String,
    dims: usize,
    files: BTreeMap<String, PathBuf>,
    launcher: Box<dyn WorkerLauncher>,
    startup_timeout: Duration,
    request_timeout: Duration,
    conn: Mutex<Option<WorkerConnection>>,
}

impl WorkerBackend {
    /// Launch a worker and load `descriptor` into it.
    pub async fn start(
        descriptor: &ModelDescriptor,
        files: BTreeMap<String, PathBuf>,
        launcher: Box<dyn WorkerLauncher>,
        startup_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, EmbedError> {
        let backend = Self {
            model_id: descriptor.id.clone(),
            dims: descriptor.dims,
            files,
            launcher,
            startup_timeout,
            request_timeout,
            conn: Mutex::new(None),
        };
        let conn = backend.launch_and_load().await?;
        *backend.conn.lock().await = Some(conn);
        Ok(backend)
    }

    async fn launch_and_load(&self) -> Result<WorkerConnection, EmbedError> {
        let mut conn = self.launcher.launch().await?;
        let op = WorkerOp::Load {
            model_id: self.model_id.clone(),
            files: self.files.clone(),
        };
        let response = tokio::time::timeout(self.startup_timeout, conn.channel.request(&op))
            .await
            .map_err(|_| EmbedError::Timeout(self.startup_timeout.as_secs()))??;

        if let Some(dims) = response.dims {
            if dims != self.dims {
                return Err(EmbedError::DimensionMismatch {
                    expected: self.dims,
                    actual: dims,
                });
            }
        }
        tracing::info!(model = %self.model_id, "worker loaded model");
        Ok(conn)
    }

    /// Send one request on the live connection, relaunching first if the
    /// previous worker died. A crash or timeout drops the connection.
    async fn call(&self, op: &WorkerOp) -> Result<WorkerResponse, EmbedError> {
        let mut guard = self.conn.lock().await;
        if guard.as_ref().is_some_and(|c| c.channel.interrupted()) {
            tracing::warn!(model = %self.model_id, "previous request was abandoned, relaunching worker");
            if let Some(mut old) = guard.take() {
                kill(&mut old).await;
            }
        }
        if guard.is_none() {
            *guard = Some(self.launch_and_load().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(EmbedError::Unavailable(self.model_id.clone()));
        };

        let result = match tokio::time::timeout(self.request_timeout, conn.channel.request(op)).await
        {
            Ok(r) => r,
            Err(_) => Err(EmbedError::Timeout(self.request_timeout.as_secs())),
        };

        if matches!(
            result,
            Err(EmbedError::WorkerCrashed(_)) | Err(EmbedError::Timeout(_))
        ) {
            if let Some(mut dead) = guard.take() {
                kill(&mut dead).await;
            }
        }
        result
    }
}

async fn kill(conn: &mut WorkerConnection) {
    if let Some(child) = conn.child.as_mut() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[async_trait]
impl EmbeddingBackend for WorkerBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
    }

    fn preferred_batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .call(&WorkerOp::Embed {
                texts: texts.to_vec(),
            })
            .await?;
        let vectors = response.vectors.unwrap_or_default();
        validate_batch(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }

    async fn health_check(&self) -> Result<(), EmbedError> {
        self.call(&WorkerOp::Ping).await.map(|_| ())
    }

    async fn restart(&self) -> Result<(), EmbedError> {
        let mut guard = self.conn.lock().await;
        if let Some(mut old) = guard.take() {
            kill(&mut old).await;
        }
        tracing::warn!(model = %self.model_id, "restarting embedding worker");
        *guard = Some(self.launch_and_load().await?);
        Ok(())
    }

    async fn shutdown(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(mut conn) = guard.take() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, conn.channel.request(&WorkerOp::Shutdown))
                .await;
            kill(&mut conn).await;
            tracing::info!(model = %self.model_id, "embedding worker stopped");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory worker. Answers with constant vectors of `dims`; closes
    /// its streams after `crash_after` embed requests. With `stall_first`
    /// the first process never reads its input.
    pub(crate) struct FakeLauncher {
        pub dims: usize,
        pub crash_after: Option<usize>,
        pub stall_first: bool,
        pub launches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(&self) -> Result<WorkerConnection, EmbedError> {
            let (client, server) = tokio::io::duplex(1 << 16);
            let launch_no = self.launches.fetch_add(1, Ordering::SeqCst);
            let dims = self.dims;
            // Only the first process crashes or stalls.
            let crash_after = if launch_no == 0 { self.crash_after } else { None };
            let stall = launch_no == 0 && self.stall_first;
            tokio::spawn(async move {
                let (r, mut w) = tokio::io::split(server);
                let mut lines = BufReader::new(r).lines();
                let mut embeds = 0usize;
                while let Ok(Some(line)) = lines.next_line().await {
                    let req: Value = serde_json::from_str(&line).unwrap();
                    let id = req["id"].as_u64().unwrap();
                    let reply = match req["op"].as_str().unwrap() {
                        "load" if stall => {
                            let reply = format!("{{\"id\":{},\"dims\":{}}}\n", id, dims);
                            let _ = w.write_all(reply.as_bytes()).await;
                            // Stop reading input while keeping the pipe open.
                            let _held = (lines, w);
                            std::future::pending::<()>().await;
                            return;
                        }
                        "load" => serde_json::json!({"id": id, "dims": dims}),
                        "embed" => {
                            if Some(embeds) == crash_after {
                                return;
                            }
                            embeds += 1;
                            let n = req["texts"].as_array().unwrap().len();
                            let vectors: Vec<Vec<f32>> = (0..n).map(|i| vec![i as f32; dims]).collect();
                            serde_json::json!({"id": id, "vectors": vectors})
                        }
                        "shutdown" => {
                            let _ = w.write_all(format!("{{\"id\":{}}}\n", id).as_bytes()).await;
                            return;
                        }
                        _ => serde_json::json!({"id": id}),
                    };
                    let mut out = serde_json::to_vec(&reply).unwrap();
                    out.push(b'\n');
                    if w.write_all(&out).await.is_err() {
                        return;
                    }
                }
            });
            let (r, w) = tokio::io::split(client);
            Ok(WorkerConnection {
                channel: WorkerChannel::new(r, w),
                child: None,
            })
        }
    }

    pub(crate) fn descriptor(dims: usize) -> ModelDescriptor {
        ModelDescriptor {
            id: "gpu-test".into(),
            dims,
            backend: BackendKind::Gpu,
            languages: vec![],
            min_memory_mb: 0,
            quality: 1,
            artifacts: vec![],
        }
    }

    async fn backend(crash_after: Option<usize>) -> (WorkerBackend, Arc<AtomicUsize>) {
        launched(FakeLauncher {
            dims: 4,
            crash_after,
            stall_first: false,
            launches: Arc::new(AtomicUsize::new(0)),
        })
        .await
    }

    async fn launched(launcher: FakeLauncher) -> (WorkerBackend, Arc<AtomicUsize>) {
        let launches = launcher.launches.clone();
        let backend = WorkerBackend::start(
            &descriptor(4),
            BTreeMap::new(),
            Box::new(launcher),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (backend, launches)
    }

    #[tokio::test]
    async fn embeds_in_order() {
        let (backend, _) = backend(None).await;
        let out = backend
            .embed_batch(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2], vec![2.0; 4]);
        backend.health_check().await.unwrap();
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn crash_is_reported_and_next_call_relaunches() {
        let (backend, launches) = backend(Some(1)).await;
        backend.embed_batch(&["a".to_string()]).await.unwrap();
        let err = backend.embed_batch(&["b".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbedError::WorkerCrashed(_)));

        let out = backend.embed_batch(&["c".to_string()]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_responses_are_skipped() {
        let (client, server) = tokio::io::duplex(4096);
        let (cr, cw) = tokio::io::split(client);
        let (_sr, mut sw) = tokio::io::split(server);
        sw.write_all(b"{\"id\":0,\"vectors\":[[9.0]]}\nnot json\n{\"id\":1,\"dims\":1}\n")
            .await
            .unwrap();

        let mut channel = WorkerChannel::new(cr, cw);
        let response = channel.request(&WorkerOp::Ping).await.unwrap();
        assert_eq!(response.id, 1);
        assert_eq!(response.dims, Some(1));
    }

    #[tokio::test]
    async fn worker_errors_become_backend_errors() {
        let (client, server) = tokio::io::duplex(4096);
        let (cr, cw) = tokio::io::split(client);
        let (_sr, mut sw) = tokio::io::split(server);
        sw.write_all(b"{\"id\":1,\"error\":\"out of memory\"}\n")
            .await
            .unwrap();

        let mut channel = WorkerChannel::new(cr, cw);
        let err = channel.request(&WorkerOp::Ping).await.unwrap_err();
        assert!(matches!(err, EmbedError::Backend(ref m) if m == "out of memory"));
    }

    #[test]
    fn request_wire_format() {
        let op = WorkerOp::Embed {
            texts: vec!["x".into()],
        };
        let json = serde_json::to_string(&WorkerRequest { id: 7, op: &op }).unwrap();
        assert_eq!(json, r#"{"id":7,"op":"embed","texts":["x"]}"#);
    }

    #[tokio::test]
    async fn abandoned_request_marks_channel_interrupted() {
        let (client, server) = tokio::io::duplex(64);
        let (cr, cw) = tokio::io::split(client);
        let mut channel = WorkerChannel::new(cr, cw);

        let op = WorkerOp::Embed {
            texts: vec!["x".repeat(1024)],
        };
        let abandoned = tokio::time::timeout(Duration::from_millis(50), channel.request(&op)).await;
        assert!(abandoned.is_err());
        assert!(channel.interrupted());
        drop(server);
    }

    #[tokio::test]
    async fn worker_with_partial_request_is_relaunched() {
        let (backend, launches) = launched(FakeLauncher {
            dims: 4,
            crash_after: None,
            stall_first: true,
            launches: Arc::new(AtomicUsize::new(0)),
        })
        .await;

        // Larger than the pipe, so the write is cut off midway.
        let big = vec!["x".repeat(200_000)];
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), backend.embed_batch(&big)).await;
        assert!(abandoned.is_err());

        let out = backend.embed_batch(&["a".to_string()]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(launches.load(Ordering::SeqCst), 2);
    }
}

//! Client for the out-of-process embedding worker.
//!
//! The worker listens on a Unix socket and answers newline-delimited JSON
//! requests (see [`crate::protocol`]). Connecting is retried with
//! exponential backoff; once the retry budget is spent the client turns
//! [`ConnectionState::Degraded`] and every later call fails immediately
//! until [`WorkerClient::reset`] is called.

use crate::protocol::{Command, EmbedReply, Request, Response};
use async_trait::async_trait;
use docstore_core::query::{QueryExplanation, RelationalQuery, StorageQuery};
use docstore_core::record::{CollectionStats, DataRecord};
use docstore_core::storage::{Embedder, Embedding};
use docstore_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

/// Where the client stands with the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; sticky until `reset`
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub socket_path: PathBuf,
    /// Connection attempts after the first one
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on one request/response round trip
    pub request_timeout: Option<Duration>,
}

impl WorkerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn round_trip(&mut self, request: &Request) -> Result<Response> {
        let line = request.to_line()?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        let reply = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| Error::Worker("worker closed the connection".into()))?;
        Ok(serde_json::from_str(&reply)?)
    }
}

/// Worker RPC client. Requests are serialized over one connection.
pub struct WorkerClient {
    config: WorkerConfig,
    state: Mutex<ConnectionState>,
    connection: tokio::sync::Mutex<Option<Connection>>,
    next_id: AtomicU64,
    model: String,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            connection: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
            model: "worker".to_string(),
        }
    }

    /// Model name reported when the worker does not name one.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!("Worker connection {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Connect if not already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        self.ensure_connected(&mut slot).await
    }

    async fn ensure_connected(&self, slot: &mut Option<Connection>) -> Result<()> {
        if self.state() == ConnectionState::Degraded {
            return Err(Error::Worker(format!(
                "worker at {} is degraded; reset the client to retry",
                self.config.socket_path.display()
            )));
        }
        if slot.is_some() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let mut backoff = self.config.initial_backoff;
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_backoff);
            }
            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => {
                    let (read, writer) = stream.into_split();
                    *slot = Some(Connection {
                        lines: BufReader::new(read).lines(),
                        writer,
                    });
                    self.set_state(ConnectionState::Connected);
                    info!("Connected to worker at {}", self.config.socket_path.display());
                    return Ok(());
                }
                Err(e) => {
                    debug!("Worker connect attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        self.set_state(ConnectionState::Degraded);
        let reason = last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string());
        warn!(
            "Worker at {} unreachable after {} attempts: {}",
            self.config.socket_path.display(),
            self.config.max_retries + 1,
            reason
        );
        Err(Error::Worker(format!(
            "cannot connect to worker at {}: {}",
            self.config.socket_path.display(),
            reason
        )))
    }

    /// Drop the connection; the next request reconnects.
    pub async fn disconnect(&self) {
        self.connection.lock().await.take();
        if self.state() != ConnectionState::Degraded {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Leave the degraded state so the next request tries again.
    pub async fn reset(&self) {
        self.connection.lock().await.take();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Send one request and return the `data` of a successful reply.
    pub async fn request(&self, command: Command, payload: Value) -> Result<Option<Value>> {
        let request = Request {
            id: self.next_id.fetch_add(1, Ordering::Relaxed).to_string(),
            command,
            payload,
        };

        let mut slot = self.connection.lock().await;
        self.ensure_connected(&mut slot).await?;
        let Some(connection) = slot.as_mut() else {
            return Err(Error::Worker("no worker connection".into()));
        };

        let outcome = match self.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, connection.round_trip(&request))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Worker(format!(
                        "{:?} timed out after {}ms",
                        command,
                        limit.as_millis()
                    )))
                }),
            None => connection.round_trip(&request).await,
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                // The stream may hold a half-read reply; start over next time.
                slot.take();
                self.set_state(ConnectionState::Disconnected);
                return Err(match e {
                    Error::Worker(_) => e,
                    other => Error::Worker(format!("{:?} failed: {}", command, other)),
                });
            }
        };
        drop(slot);

        if response.id != request.id {
            return Err(Error::Worker(format!(
                "reply id {} does not match request {}",
                response.id, request.id
            )));
        }
        response.result.into_result()
    }

    async fn typed<T: DeserializeOwned>(&self, command: Command, payload: Value) -> Result<Option<T>> {
        match self.request(command, payload).await? {
            Some(Value::Null) | None => Ok(None),
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
        }
    }

    async fn required<T: DeserializeOwned>(&self, command: Command, payload: Value) -> Result<T> {
        self.typed(command, payload)
            .await?
            .ok_or_else(|| Error::Worker(format!("{:?} returned no data", command)))
    }

    /// Open a database on the worker; returns its handle.
    pub async fn open_database(&self, path: &str) -> Result<String> {
        self.required(Command::OpenDatabase, json!({ "path": path })).await
    }

    pub async fn close_database(&self, handle: &str) -> Result<()> {
        self.request(Command::CloseDatabase, json!({ "handle": handle }))
            .await
            .map(|_| ())
    }

    pub async fn create_record(&self, handle: &str, record: &DataRecord) -> Result<DataRecord> {
        self.required(
            Command::CreateRecord,
            json!({ "handle": handle, "record": record }),
        )
        .await
    }

    pub async fn read_record(
        &self,
        handle: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<DataRecord>> {
        self.typed(
            Command::ReadRecord,
            json!({ "handle": handle, "collection": collection, "id": id }),
        )
        .await
    }

    pub async fn query_records(&self, handle: &str, query: &StorageQuery) -> Result<Vec<DataRecord>> {
        Ok(self
            .typed(Command::QueryRecords, json!({ "handle": handle, "query": query }))
            .await?
            .unwrap_or_default())
    }

    pub async fn update_record(
        &self,
        handle: &str,
        collection: &str,
        id: &str,
        data: Value,
        increment_version: bool,
    ) -> Result<DataRecord> {
        self.required(
            Command::UpdateRecord,
            json!({
                "handle": handle,
                "collection": collection,
                "id": id,
                "data": data,
                "incrementVersion": increment_version,
            }),
        )
        .await
    }

    pub async fn delete_record(&self, handle: &str, collection: &str, id: &str) -> Result<bool> {
        Ok(self
            .typed(
                Command::DeleteRecord,
                json!({ "handle": handle, "collection": collection, "id": id }),
            )
            .await?
            .unwrap_or(false))
    }

    pub async fn list_collections(&self, handle: &str) -> Result<Vec<String>> {
        Ok(self
            .typed(Command::ListCollections, json!({ "handle": handle }))
            .await?
            .unwrap_or_default())
    }

    pub async fn get_stats(&self, handle: &str, collection: &str) -> Result<Option<CollectionStats>> {
        self.typed(
            Command::GetStats,
            json!({ "handle": handle, "collection": collection }),
        )
        .await
    }

    pub async fn explain_query(
        &self,
        handle: &str,
        query: &RelationalQuery,
    ) -> Result<QueryExplanation> {
        self.required(Command::ExplainQuery, json!({ "handle": handle, "query": query }))
            .await
    }

    /// Embed one text; an empty vector is an error, never a fallback.
    pub async fn embed_text(&self, text: &str) -> Result<Embedding> {
        let reply: EmbedReply = self
            .required(Command::EmbedText, json!({ "text": text }))
            .await
            .map_err(|e| Error::Embedding(e.to_string()))?;
        if reply.embedding.is_empty() {
            return Err(Error::Embedding("worker returned an empty embedding".into()));
        }
        Ok(Embedding::new(
            reply.embedding,
            reply.model.unwrap_or_else(|| self.model.clone()),
        ))
    }
}

#[async_trait]
impl Embedder for WorkerClient {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.embed_text(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    /// Serve `handler` on a fresh socket; each connection is answered line by line.
    fn fake_worker(
        dir: &TempDir,
        handler: impl Fn(Request) -> Option<Value> + Send + Sync + 'static,
    ) -> PathBuf {
        let path = dir.path().join("worker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: Request = serde_json::from_str(&line).unwrap();
                        let id = request.id.clone();
                        // `None` from the handler hangs up without replying.
                        let Some(body) = handler(request) else {
                            return;
                        };
                        let mut reply = body;
                        reply["id"] = json!(id);
                        let mut out = reply.to_string();
                        out.push('\n');
                        if write.write_all(out.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        path
    }

    fn quick_config(path: PathBuf) -> WorkerConfig {
        WorkerConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            request_timeout: Some(Duration::from_secs(5)),
            socket_path: path,
        }
    }

    #[tokio::test]
    async fn test_embed_through_worker() {
        let dir = TempDir::new().unwrap();
        let path = fake_worker(&dir, |req| {
            assert_eq!(req.command, Command::EmbedText);
            let len = req.payload["text"].as_str().unwrap().len() as f32;
            Some(json!({"success": true, "data": {"embedding": [len, 1.0], "model": "mini"}}))
        });
        let client = WorkerClient::new(quick_config(path));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let embedding = client.embed("abc").await.unwrap();
        assert_eq!(embedding.vector, vec![3.0, 1.0]);
        assert_eq!(embedding.model_id, "mini");
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_worker_failures_surface_as_errors() {
        let dir = TempDir::new().unwrap();
        let path = fake_worker(&dir, |req| match req.command {
            Command::ReadRecord => Some(json!({"success": true})),
            Command::EmbedText => Some(json!({"success": true, "data": {"embedding": []}})),
            _ => Some(json!({"success": false, "error": "unknown handle"})),
        });
        let client = WorkerClient::new(quick_config(path));

        assert!(client.read_record("h", "users", "u1").await.unwrap().is_none());
        let err = client.list_collections("h").await.unwrap_err();
        assert!(err.to_string().contains("unknown handle"));
        let err = client.embed("text").await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
    }

    #[tokio::test]
    async fn test_unreachable_worker_degrades_and_stays_degraded() {
        let dir = TempDir::new().unwrap();
        let client = WorkerClient::new(WorkerConfig {
            initial_backoff: Duration::from_millis(150),
            max_backoff: Duration::from_millis(300),
            ..quick_config(dir.path().join("missing.sock"))
        });

        let started = std::time::Instant::now();
        assert!(client.connect().await.is_err());
        assert!(started.elapsed() >= Duration::from_millis(450));
        assert_eq!(client.state(), ConnectionState::Degraded);

        let started = std::time::Instant::now();
        let err = client.embed("x").await.unwrap_err();
        assert!(err.to_string().contains("degraded"));
        assert!(started.elapsed() < Duration::from_millis(150));

        client.reset().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_after_worker_hangs_up() {
        let dir = TempDir::new().unwrap();
        let path = fake_worker(&dir, |req| {
            if req.payload["text"] == "hang up" {
                return None;
            }
            Some(json!({"success": true, "data": {"embedding": [1.0]}}))
        });
        let client = WorkerClient::new(quick_config(path)).with_model("fallback-name");

        let err = client.embed("hang up").await.unwrap_err();
        assert!(err.to_string().contains("closed"));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let embedding = client.embed("fine").await.unwrap();
        assert_eq!(embedding.model_id, "fallback-name");
        assert_eq!(client.state(), ConnectionState::Connected);
    }
}

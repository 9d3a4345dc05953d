//! Client: request dispatcher and connection lifecycle.
//!
//! Flow:
//! 1. Spawn the peer (or accept a ready-made duplex stream)
//! 2. Start the reader loop, mark the connection `Ready`
//! 3. `send` allocates an id, registers it, writes the frame under the write lock
//! 4. The reader loop settles handles as responses arrive, in any order
//! 5. `shutdown` closes stdin, waits out the peer, drains what is left

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::SinkExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Request, RequestId};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::ClientError;
use crate::pending::{PendingTable, ProgressSink, ResponseResult};
use crate::process::{PeerProcess, SpawnError};
use crate::reader::{ReaderExit, run_reader_loop};

/// Awaitable result of one request.
///
/// Resolves with the response `data`, a [`ClientError::Remote`] carrying the
/// peer's `error`, or [`ClientError::ConnectionClosed`]. Dropping an
/// unresolved handle detaches it: the request stays on the wire, but any
/// later progress or response for its id is ignored.
#[must_use = "dropping a ResponseHandle detaches the request"]
pub struct ResponseHandle {
    id: RequestId,
    rx: oneshot::Receiver<ResponseResult>,
    table: Arc<PendingTable>,
    settled: bool,
}

impl ResponseHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl Future for ResponseHandle {
    type Output = Result<Value, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let received = ready!(Pin::new(&mut this.rx).poll(cx));
        this.settled = true;
        Poll::Ready(received.unwrap_or(Err(ClientError::ConnectionClosed)))
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if !self.settled && self.table.forget(self.id) {
            tracing::debug!(request_id = %self.id, "Caller detached from request");
        }
    }
}

/// What `shutdown` observed.
#[derive(Debug)]
pub struct ShutdownReport {
    /// How the reader loop ended; `None` if it was already joined.
    pub reader: Option<ReaderExit>,
    /// Peer exit status when the client owns a process.
    pub peer_status: Option<ExitStatus>,
    /// Set when waiting for or killing the peer failed.
    pub peer_error: Option<io::Error>,
}

/// Multiplexing client over one peer connection.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Client {
    connection: Arc<Connection>,
    table: Arc<PendingTable>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    reader_task: Mutex<Option<JoinHandle<ReaderExit>>>,
    peer: Mutex<Option<PeerProcess>>,
    shutdown_grace: Duration,
}

impl Client {
    /// Launch the peer via `config.spawner` and connect to its stdio.
    pub async fn spawn(config: ClientConfig) -> Result<Self, ClientError> {
        tracing::info!(program = %config.program.display(), "Starting peer");
        let mut child = config.spawner.spawn(&config)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        let peer = PeerProcess::new(child);
        tracing::debug!(pid = ?peer.id(), "Peer started");
        Ok(Self::start(stdout, stdin, Some(peer), &config))
    }

    /// Run over an existing duplex stream pair. Must be called inside a
    /// tokio runtime.
    pub fn from_streams<R, W>(reader: R, writer: W, config: &ClientConfig) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::start(reader, writer, None, config)
    }

    fn start<R, W>(reader: R, writer: W, peer: Option<PeerProcess>, config: &ClientConfig) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let (connection, frames) = Connection::open(reader, writer, config.frame_settings());
        let connection = Arc::new(connection);
        let table = Arc::new(PendingTable::new());
        let cancel = CancellationToken::new();

        let reader_task = tokio::spawn(run_reader_loop(
            frames,
            Arc::clone(&table),
            Arc::clone(&connection),
            cancel.clone(),
        ));
        connection.mark_ready();
        tracing::debug!("Connection ready");

        Self {
            connection,
            table,
            next_id: AtomicU64::new(1),
            cancel,
            reader_task: Mutex::new(Some(reader_task)),
            peer: Mutex::new(peer),
            shutdown_grace: config.shutdown_grace,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Number of requests awaiting a terminal response.
    pub fn pending_requests(&self) -> usize {
        self.table.len()
    }

    /// Send a request whose progress updates are discarded.
    pub async fn send(
        &self,
        command: &str,
        payload: impl Serialize,
    ) -> Result<ResponseHandle, ClientError> {
        self.send_with_progress(command, payload, ProgressSink::noop())
            .await
    }

    /// Send a request, routing its progress updates to `progress`.
    pub async fn send_with_progress(
        &self,
        command: &str,
        payload: impl Serialize,
        progress: ProgressSink,
    ) -> Result<ResponseHandle, ClientError> {
        if command.is_empty() || command.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ClientError::InvalidCommand(command.to_string()));
        }
        let data = serde_json::to_value(payload).map_err(ClientError::Encode)?;

        // Id allocation, registration and the write share one critical
        // section, so wire order matches id order.
        let mut writer = self.connection.lock_writer().await;
        let Some(framed) = writer.as_mut() else {
            return Err(ClientError::ConnectionClosed);
        };
        if !self.connection.state().accepts_requests() {
            return Err(ClientError::ConnectionClosed);
        }

        let id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.table.register(id, tx, progress)?;
        // Owns the entry from here on: if this future is dropped mid-write,
        // the handle's drop forgets the id.
        let handle = ResponseHandle {
            id,
            rx,
            table: Arc::clone(&self.table),
            settled: false,
        };

        let request = Request {
            command: command.to_string(),
            id,
            data,
        };
        if let Err(e) = framed.send(request).await {
            drop(handle);
            tracing::warn!(request_id = %id, command, error = %e, "Failed to write request");
            return Err(ClientError::Transport(e));
        }
        drop(writer);

        tracing::debug!(request_id = %id, command, "Request sent");
        Ok(handle)
    }

    /// Send and wait, decoding the response data into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        command: &str,
        payload: impl Serialize,
    ) -> Result<T, ClientError> {
        self.request_with_progress(command, payload, ProgressSink::noop())
            .await
    }

    pub async fn request_with_progress<T: DeserializeOwned>(
        &self,
        command: &str,
        payload: impl Serialize,
        progress: ProgressSink,
    ) -> Result<T, ClientError> {
        let data = self
            .send_with_progress(command, payload, progress)
            .await?
            .await?;
        serde_json::from_value(data).map_err(ClientError::Decode)
    }

    /// Wait until the connection reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.connection.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Graceful shutdown.
    ///
    /// New sends fail immediately. The write side is closed so the peer sees
    /// end of input; responses it still flushes are delivered. Requests left
    /// when the peer's output ends fail with `ConnectionClosed`. Each wait is
    /// bounded by the configured grace period. Always ends in `Closed`; a
    /// failure to stop the peer is reported in [`ShutdownReport::peer_error`].
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.connection.begin_closing() {
            tracing::info!(pending = self.table.len(), "Shutting down connection");
        }
        if let Err(e) = self.connection.close_write().await {
            tracing::warn!(error = %e, "Failed to close write side");
        }

        let stopped = match self.peer.lock().await.as_mut() {
            Some(peer) => peer.stop(self.shutdown_grace).await.map(Some),
            None => Ok(None),
        };
        self.finish_shutdown(stopped).await
    }

    async fn finish_shutdown(&self, stopped: io::Result<Option<ExitStatus>>) -> ShutdownReport {
        let (peer_status, peer_error) = match stopped {
            Ok(Some(status)) => {
                tracing::info!(%status, "Peer exited");
                (Some(status), None)
            }
            Ok(None) => (None, None),
            Err(e) => {
                tracing::error!(error = %e, "Failed to stop peer");
                (None, Some(e))
            }
        };

        let task = self.reader_task.lock().await.take();
        let reader = match task {
            Some(mut task) => {
                let joined = match tokio::time::timeout(self.shutdown_grace, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!("Peer output still open after grace period, cancelling reader");
                        self.cancel.cancel();
                        task.await
                    }
                };
                match joined {
                    Ok(exit) => Some(exit),
                    Err(e) => {
                        tracing::error!(error = %e, "Reader task failed");
                        None
                    }
                }
            }
            None => None,
        };

        // Covers a reader task that died without draining.
        self.table.drain_all(|| ClientError::ConnectionClosed);
        self.connection.mark_closed();

        ShutdownReport {
            reader,
            peer_status,
            peer_error,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use crate::bridge::codec::JsonCodec;

    /// In-process stand-in for the peer: reads requests, writes raw JSON frames.
    struct FakePeer {
        requests: FramedRead<ReadHalf<DuplexStream>, JsonCodec<Request>>,
        responses: FramedWrite<WriteHalf<DuplexStream>, JsonCodec<Value>>,
    }

    impl FakePeer {
        async fn next_request(&mut self) -> Request {
            self.requests.next().await.unwrap().unwrap()
        }

        async fn reply(&mut self, message: Value) {
            self.responses.send(message).await.unwrap();
        }
    }

    fn connect() -> (Client, FakePeer) {
        connect_with_capacity(64 * 1024)
    }

    fn connect_with_capacity(capacity: usize) -> (Client, FakePeer) {
        let (ours, theirs) = tokio::io::duplex(capacity);
        let (read, write) = tokio::io::split(ours);
        let client = Client::from_streams(
            read,
            write,
            &ClientConfig::default().with_shutdown_grace(Duration::from_millis(200)),
        );
        let (peer_read, peer_write) = tokio::io::split(theirs);
        let peer = FakePeer {
            requests: FramedRead::new(peer_read, JsonCodec::default()),
            responses: FramedWrite::new(peer_write, JsonCodec::default()),
        };
        (client, peer)
    }

    #[tokio::test]
    async fn request_and_response_roundtrip() {
        let (client, mut peer) = connect();
        assert_eq!(client.state(), ConnectionState::Ready);

        let handle = client
            .send("ListModels", json!({"includeRemote": false}))
            .await
            .unwrap();
        let req = peer.next_request().await;
        assert_eq!(req.command, "ListModels");
        assert_eq!(req.id, RequestId::new(1));
        assert_eq!(req.data, json!({"includeRemote": false}));

        peer.reply(json!({"id": 1, "success": true, "data": []})).await;
        assert_eq!(handle.await.unwrap(), json!([]));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn ids_start_at_one_and_increase_in_call_order() {
        let (client, mut peer) = connect();
        let mut handles = Vec::new();
        for n in 0..5 {
            handles.push(client.send("Echo", json!({ "n": n })).await.unwrap());
        }
        let ids: Vec<u64> = handles.iter().map(|h| h.id().get()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        for n in 0..5u64 {
            let req = peer.next_request().await;
            assert_eq!(req.id.get(), n + 1);
            assert_eq!(req.data, json!({ "n": n }));
        }
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let (client, mut peer) = connect();
        let a = client.send("Translate", json!({"text": "a"})).await.unwrap();
        let b = client.send("Translate", json!({"text": "b"})).await.unwrap();
        let _ = peer.next_request().await;
        let _ = peer.next_request().await;

        peer.reply(json!({"id": b.id(), "success": true, "data": "B"})).await;
        peer.reply(json!({"id": a.id(), "success": true, "data": "A"})).await;

        assert_eq!(a.await.unwrap(), json!("A"));
        assert_eq!(b.await.unwrap(), json!("B"));
    }

    #[tokio::test]
    async fn remote_failure_is_local_to_its_request() {
        let (client, mut peer) = connect();
        let bad = client.send("Translate", json!({"trg": "xx"})).await.unwrap();
        let good = client.send("Translate", json!({"trg": "de"})).await.unwrap();

        peer.reply(json!({"id": 1, "success": false, "error": "no model"})).await;
        peer.reply(json!({"id": 2, "success": true, "data": {"ok": true}})).await;

        assert_eq!(bad.await.unwrap_err().remote_message(), Some("no model"));
        assert_eq!(good.await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn typed_request_decodes_data() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Echo {
            n: u32,
        }

        let (client, mut peer) = connect();
        let responder = tokio::spawn(async move {
            let req = peer.next_request().await;
            peer.reply(json!({"id": req.id, "success": true, "data": {"n": 7}}))
                .await;
            peer
        });

        let echo: Echo = client.request("Echo", json!({})).await.unwrap();
        assert_eq!(echo, Echo { n: 7 });
        let _peer = responder.await.unwrap();
    }

    #[tokio::test]
    async fn typed_request_reports_shape_mismatch() {
        let (client, mut peer) = connect();
        let responder = tokio::spawn(async move {
            let req = peer.next_request().await;
            peer.reply(json!({"id": req.id, "success": true, "data": "text"}))
                .await;
            peer
        });

        let err = client.request::<Vec<u32>>("Echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
        let _peer = responder.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_command_is_rejected_before_registration() {
        let (client, _peer) = connect();
        for command in ["", "List Models", "bad\ncommand"] {
            let err = client.send(command, json!({})).await.unwrap_err();
            assert!(matches!(err, ClientError::InvalidCommand(_)));
        }
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn dropped_handle_detaches_request() {
        let (client, mut peer) = connect();
        let (sink, mut updates) = ProgressSink::channel();
        let handle = client
            .send_with_progress("DownloadModel", json!({"modelID": "x"}), sink)
            .await
            .unwrap();
        assert_eq!(client.pending_requests(), 1);
        drop(handle);
        assert_eq!(client.pending_requests(), 0);

        let _ = peer.next_request().await;
        peer.reply(json!({"id": 1, "update": {"read": 1, "size": 2}})).await;
        peer.reply(json!({"id": 1, "success": true, "data": {}})).await;

        // The connection keeps working for other callers.
        let next = client.send("ListModels", json!({})).await.unwrap();
        assert_eq!(next.id(), RequestId::new(2));
        peer.reply(json!({"id": 2, "success": true, "data": []})).await;
        assert_eq!(next.await.unwrap(), json!([]));
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_eof_fails_pending_requests() {
        let (client, peer) = connect();
        let handles = vec![
            client.send("A", json!({})).await.unwrap(),
            client.send("B", json!({})).await.unwrap(),
            client.send("C", json!({})).await.unwrap(),
        ];
        drop(peer);

        for handle in handles {
            assert!(handle.await.unwrap_err().is_connection_closed());
        }
        client.closed().await;
        assert_eq!(client.state(), ConnectionState::Closed);

        let err = client.send("D", json!({})).await.unwrap_err();
        assert!(err.is_connection_closed());
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn shutdown_delivers_late_responses_then_closes() {
        let (client, mut peer) = connect();
        let handle = client.send("Translate", json!({"text": "hi"})).await.unwrap();

        let peer_task = tokio::spawn(async move {
            let req = peer.next_request().await;
            // Peer sees our end of input, then flushes its last answer.
            assert!(peer.requests.next().await.is_none());
            peer.reply(json!({"id": req.id, "success": true, "data": "late"}))
                .await;
        });

        let report = client.shutdown().await;
        assert!(matches!(report.reader, Some(ReaderExit::Eof)));
        assert!(report.peer_status.is_none());
        assert_eq!(handle.await.unwrap(), json!("late"));
        assert_eq!(client.state(), ConnectionState::Closed);
        peer_task.await.unwrap();

        let err = client.send("Translate", json!({})).await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn shutdown_cancels_reader_when_peer_stays_open() {
        let (client, _peer) = connect();
        let handle = client.send("Translate", json!({})).await.unwrap();

        let report = client.shutdown().await;
        assert!(matches!(report.reader, Some(ReaderExit::Cancelled)));
        assert!(handle.await.unwrap_err().is_connection_closed());

        let again = client.shutdown().await;
        assert!(again.reader.is_none());
    }

    #[tokio::test]
    async fn cancelled_send_leaves_no_pending_entry() {
        // The pipe holds 64 bytes and nobody reads yet, so large writes stall.
        let (client, mut peer) = connect_with_capacity(64);
        let big = "x".repeat(100 * 1024);
        for _ in 0..2 {
            let send = client.send("Translate", json!({ "text": big }));
            let timed_out = tokio::time::timeout(Duration::from_millis(50), send).await;
            assert!(timed_out.is_err());
        }
        assert_eq!(client.pending_requests(), 0);

        let drain = tokio::spawn(async move {
            let first = peer.next_request().await;
            let second = peer.next_request().await;
            (peer, vec![first.id.get(), second.id.get()])
        });
        let handle = client.send("Translate", json!({"text": "hi"})).await.unwrap();
        let (mut peer, ids) = drain.await.unwrap();
        // Id 2 stalled before encoding and never reached the wire.
        assert_eq!(ids, vec![1, 3]);

        peer.reply(json!({"id": 1, "success": true, "data": "stale"})).await;
        peer.reply(json!({"id": 3, "success": true, "data": "ok"})).await;
        assert_eq!(handle.await.unwrap(), json!("ok"));
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn progress_after_resolution_is_ignored() {
        let (client, mut peer) = connect();
        let (sink, mut updates) = ProgressSink::channel();
        let handle = client
            .send_with_progress("DownloadModel", json!({"modelID": "en-de-tiny"}), sink)
            .await
            .unwrap();
        let _ = peer.next_request().await;

        peer.reply(json!({"id": 1, "update": {"read": 1, "size": 2}})).await;
        peer.reply(json!({"id": 1, "success": true, "data": {}})).await;
        peer.reply(json!({"id": 1, "update": {"read": 2, "size": 2}})).await;
        assert_eq!(handle.await.unwrap(), json!({}));

        // A later round trip guarantees the trailing update was processed.
        let next = client.send("ListModels", json!({})).await.unwrap();
        peer.reply(json!({"id": 2, "success": true, "data": []})).await;
        next.await.unwrap();

        assert_eq!(updates.recv().await, Some(json!({"read": 1, "size": 2})));
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_sends_get_distinct_ids_in_wire_order() {
        let (client, mut peer) = connect();
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for n in 0..16u64 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                let handle = client.send("Echo", json!({ "n": n })).await.unwrap();
                (n, handle)
            }));
        }
        let mut sent = Vec::new();
        for task in tasks {
            sent.push(task.await.unwrap());
        }

        let mut ids: Vec<u64> = sent.iter().map(|(_, h)| h.id().get()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids, (1..=16).collect::<Vec<_>>());

        let mut wire = Vec::new();
        for _ in 0..16 {
            wire.push(peer.next_request().await);
        }
        assert!(wire.windows(2).all(|w| w[0].id < w[1].id));
        for (n, handle) in &sent {
            let req = wire.iter().find(|r| r.id == handle.id()).unwrap();
            assert_eq!(req.data, json!({ "n": n }));
        }
    }

    #[tokio::test]
    async fn failed_peer_stop_still_closes_the_connection() {
        let (client, _peer) = connect();
        let handle = client.send("Translate", json!({})).await.unwrap();
        client.connection.begin_closing();
        client.connection.close_write().await.unwrap();

        let report = client
            .finish_shutdown(Err(io::Error::other("wait failed")))
            .await;
        assert!(report.peer_error.is_some());
        assert!(report.peer_status.is_none());
        assert!(report.reader.is_some());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.pending_requests(), 0);
        assert!(handle.await.unwrap_err().is_connection_closed());
    }
}

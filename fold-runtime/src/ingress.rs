//! Runtime side of the worker ingress socket.
//!
//! One connection per start cycle. Calls are multiplexed over it: each call
//! gets a fresh call id, a writer task serializes outbound frames and a
//! reader task routes replies back to the waiting caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fold_manifest::Manifest;
use prost::Message;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::error::IngressError;
use crate::transport::frame::{read_frame, write_frame, Frame, FrameError, MessageType};
use crate::transport::wire::{ManifestRequest, WireError, WireManifest, WireResponse};
use crate::transport::{decode_manifest, decode_response, encode_request, Request, Response};

#[async_trait]
pub trait IngressClient: Send + Sync {
    /// Dials `addr`, retrying with backoff until `deadline`.
    async fn start(&self, addr: &Path, deadline: Instant) -> Result<(), IngressError>;

    /// Closes the connection and cancels in-flight calls. Idempotent.
    async fn stop(&self) -> Result<(), IngressError>;

    async fn restart(&self, addr: &Path, deadline: Instant) -> Result<(), IngressError> {
        self.stop().await?;
        self.start(addr, deadline).await
    }

    async fn get_manifest(&self) -> Result<Manifest, IngressError>;

    async fn do_request(&self, request: Request) -> Result<Response, IngressError>;
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Frame>>>>;

struct Connection {
    addr: PathBuf,
    outbound: mpsc::Sender<Frame>,
    pending: Pending,
    next_call: AtomicU64,
    closed: CancellationToken,
}

impl Connection {
    fn open(addr: PathBuf, stream: UnixStream) -> Arc<Self> {
        let (mut reader, mut writer) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(64);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    frame = outbound_rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                if let Err(err) = write_frame(&mut writer, &frame).await {
                    tracing::debug!(error = %err, "ingress write failed");
                    break;
                }
            }
            writer_closed.cancel();
        });

        let reader_closed = closed.clone();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = read_frame(&mut reader) => frame,
                };
                match frame {
                    Ok(frame) => {
                        let waiter = lock(&reader_pending).remove(&frame.call_id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                            None => tracing::debug!(call_id = frame.call_id, "reply for unknown call"),
                        }
                    }
                    Err(FrameError::ConnectionClosed) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "ingress read failed");
                        break;
                    }
                }
            }
            reader_closed.cancel();
            // Dropping the senders fails every outstanding call.
            lock(&reader_pending).clear();
        });

        Arc::new(Self {
            addr,
            outbound,
            pending,
            next_call: AtomicU64::new(1),
            closed,
        })
    }

    async fn call<M: Message>(&self, message_type: MessageType, msg: &M) -> Result<Frame, IngressError> {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(message_type, call_id, msg)?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(call_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            call_id,
        };

        if self.closed.is_cancelled() || self.outbound.send(frame).await.is_err() {
            return Err(IngressError::Cancelled);
        }

        let reply = tokio::select! {
            _ = self.closed.cancelled() => return Err(IngressError::Cancelled),
            reply = rx => reply.map_err(|_| IngressError::Cancelled)?,
        };
        if reply.message_type == MessageType::Error {
            let error: WireError = reply.decode()?;
            return Err(IngressError::Remote(error.message));
        }
        Ok(reply)
    }

    fn close(&self) {
        self.closed.cancel();
        lock(&self.pending).clear();
    }
}

/// Removes a call's pending slot when the caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a Pending,
    call_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.call_id);
    }
}

/// [`IngressClient`] over a Unix domain socket.
pub struct UnixIngressClient {
    backoff: BackoffPolicy,
    conn: Mutex<Option<Arc<Connection>>>,
}

impl Default for UnixIngressClient {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl UnixIngressClient {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            conn: Mutex::new(None),
        }
    }

    fn connection(&self) -> Result<Arc<Connection>, IngressError> {
        lock(&self.conn).clone().ok_or(IngressError::NotConnected)
    }

    async fn dial(&self, addr: &Path, deadline: Instant) -> Result<UnixStream, IngressError> {
        let mut attempts = 0u32;
        loop {
            let err = match tokio::time::timeout_at(deadline, UnixStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) => err,
                Err(_) => std::io::Error::new(std::io::ErrorKind::TimedOut, "dial deadline elapsed"),
            };
            attempts += 1;

            let delay = self.backoff.next(attempts - 1);
            if Instant::now() + delay >= deadline {
                return Err(IngressError::DialFailed {
                    addr: addr.to_path_buf(),
                    attempts,
                    source: err,
                });
            }
            tracing::trace!(addr = %addr.display(), attempts, delay_us = delay.as_micros() as u64, "worker socket not ready");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl IngressClient for UnixIngressClient {
    async fn start(&self, addr: &Path, deadline: Instant) -> Result<(), IngressError> {
        self.stop().await?;
        let stream = self.dial(addr, deadline).await?;
        let conn = Connection::open(addr.to_path_buf(), stream);
        tracing::debug!(addr = %addr.display(), "ingress connected");
        *lock(&self.conn) = Some(conn);
        Ok(())
    }

    async fn stop(&self) -> Result<(), IngressError> {
        let conn = lock(&self.conn).take();
        if let Some(conn) = conn {
            tracing::debug!(addr = %conn.addr.display(), "ingress disconnected");
            conn.close();
        }
        Ok(())
    }

    async fn get_manifest(&self) -> Result<Manifest, IngressError> {
        let conn = self.connection()?;
        let reply = conn.call(MessageType::GetManifest, &ManifestRequest {}).await?;
        expect_type(&reply, MessageType::Manifest)?;
        let wire: WireManifest = reply.decode()?;
        Ok(decode_manifest(wire)?)
    }

    async fn do_request(&self, request: Request) -> Result<Response, IngressError> {
        let wire = encode_request(&request)?;
        let conn = self.connection()?;
        let reply = conn.call(MessageType::DoRequest, &wire).await?;
        expect_type(&reply, MessageType::Response)?;
        let wire: WireResponse = reply.decode()?;
        Ok(decode_response(wire)?)
    }
}

fn expect_type(frame: &Frame, expected: MessageType) -> Result<(), IngressError> {
    if frame.message_type != expected {
        return Err(FrameError::UnexpectedMessageType(frame.message_type).into());
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::server::{bind, serve, IngressService};
    use fold_manifest::{HttpMethod, Route};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Sleeps for the `:ms` parameter; the manifest carries the worker name.
    struct Slow(&'static str);

    #[async_trait]
    impl IngressService for Slow {
        fn manifest(&self) -> Manifest {
            Manifest::new(self.0).with_route(Route::new(HttpMethod::Get, "wait", "/wait/:ms"))
        }

        async fn handle(&self, request: Request) -> Response {
            let ms: u64 = request
                .path_params
                .get("ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Response::new(200).with_body(ms.to_string())
        }
    }

    fn wait_request(ms: u64) -> Request {
        Request::new(HttpMethod::Get, format!("/wait/{ms}"))
            .with_route("/wait/:ms")
            .with_path_param("ms", ms.to_string())
    }

    fn spawn_worker(dir: &TempDir) -> (PathBuf, CancellationToken) {
        spawn_named(dir, "slow")
    }

    fn spawn_named(dir: &TempDir, name: &'static str) -> (PathBuf, CancellationToken) {
        let socket = dir.path().join(format!("{name}.sock"));
        let listener = bind(&socket).expect("bind");
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(Slow(name)), shutdown.clone()));
        (socket, shutdown)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[tokio::test]
    async fn calls_before_start_are_not_connected() {
        let client = UnixIngressClient::default();
        assert!(matches!(client.get_manifest().await, Err(IngressError::NotConnected)));
        assert!(matches!(
            client.do_request(wait_request(0)).await,
            Err(IngressError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn fetches_manifest_and_multiplexes_calls() {
        let dir = TempDir::new().expect("tempdir");
        let (socket, _shutdown) = spawn_worker(&dir);
        let client = Arc::new(UnixIngressClient::default());
        client.start(&socket, soon()).await.expect("start");

        let manifest = client.get_manifest().await.expect("manifest");
        assert_eq!(manifest.name, "slow");

        let slow = tokio::spawn({
            let client = client.clone();
            async move { client.do_request(wait_request(200)).await }
        });
        let fast = client.do_request(wait_request(0)).await.expect("fast");
        assert_eq!(fast.body, b"0");
        assert!(!slow.is_finished(), "slow call answered out of order");
        assert_eq!(slow.await.expect("join").expect("slow").body, b"200");
    }

    #[tokio::test]
    async fn dial_waits_for_the_socket_to_appear() {
        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("late.sock");
        let client = UnixIngressClient::default();

        let late = socket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let listener = bind(&late).expect("bind");
            serve(listener, Arc::new(Slow("slow")), CancellationToken::new()).await
        });

        client.start(&socket, soon()).await.expect("start");
        assert_eq!(client.get_manifest().await.expect("manifest").name, "slow");
    }

    #[tokio::test]
    async fn dial_fails_after_deadline() {
        let dir = TempDir::new().expect("tempdir");
        let client = UnixIngressClient::default();
        let deadline = Instant::now() + Duration::from_millis(30);
        let err = client
            .start(&dir.path().join("missing.sock"), deadline)
            .await
            .unwrap_err();
        match err {
            IngressError::DialFailed { attempts, .. } => assert!(attempts >= 1),
            other => panic!("expected DialFailed, got: {other}"),
        }
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_calls_and_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let (socket, _shutdown) = spawn_worker(&dir);
        let client = Arc::new(UnixIngressClient::default());
        client.start(&socket, soon()).await.expect("start");

        let in_flight = tokio::spawn({
            let client = client.clone();
            async move { client.do_request(wait_request(5_000)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.stop().await.expect("stop");
        client.stop().await.expect("second stop");
        let err = in_flight.await.expect("join").unwrap_err();
        assert!(matches!(err, IngressError::Cancelled), "got: {err}");
        assert!(matches!(
            client.do_request(wait_request(0)).await,
            Err(IngressError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn restart_moves_the_connection_to_a_new_socket() {
        let dir = TempDir::new().expect("tempdir");
        let (first, _first_shutdown) = spawn_named(&dir, "first");
        let (second, _second_shutdown) = spawn_named(&dir, "second");
        let client = Arc::new(UnixIngressClient::default());
        client.start(&first, soon()).await.expect("start");
        assert_eq!(client.get_manifest().await.expect("manifest").name, "first");

        let in_flight = tokio::spawn({
            let client = client.clone();
            async move { client.do_request(wait_request(5_000)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.restart(&second, soon()).await.expect("restart");
        let err = in_flight.await.expect("join").unwrap_err();
        assert!(matches!(err, IngressError::Cancelled), "got: {err}");

        assert_eq!(client.get_manifest().await.expect("manifest").name, "second");
        let answer = client.do_request(wait_request(0)).await.expect("call after restart");
        assert_eq!(answer.body, b"0");
    }

    #[tokio::test]
    async fn worker_exit_fails_pending_calls() {
        let dir = TempDir::new().expect("tempdir");
        let (socket, shutdown) = spawn_worker(&dir);
        let client = Arc::new(UnixIngressClient::default());
        client.start(&socket, soon()).await.expect("start");

        let in_flight = tokio::spawn({
            let client = client.clone();
            async move { client.do_request(wait_request(5_000)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let err = in_flight.await.expect("join").unwrap_err();
        assert!(err.is_transport_failure(), "got: {err}");
    }

    #[tokio::test]
    async fn encode_errors_are_not_transport_failures() {
        let client = UnixIngressClient::default();
        let mut request = Request::new(HttpMethod::Post, "/").with_body("abc");
        request.content_length = 99;
        let err = client.do_request(request).await.unwrap_err();
        assert!(!err.is_transport_failure(), "got: {err}");
    }
}

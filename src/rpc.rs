//! Request/response sessions over a raw byte stream.
//!
//! Each side of a stream is wrapped into an [`RpcPeer`]. Frames are protobuf
//! [`Frame`] messages with a 4-byte big-endian length prefix. Requests carry a
//! caller-chosen id; the response echoes it, so many calls can be in flight on
//! one stream. Status codes follow gRPC and are surfaced as [`tonic::Status`].
//!
//! ```no_run
//! # async fn run(peer: iroh_service_discovery::RpcPeer) -> iroh_service_discovery::Result<()> {
//! let reply = peer.call("Ping", bytes::Bytes::from_static(b"hi")).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use prost::Message;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::{Code, Status};
use tracing::{debug, trace, Instrument};

use crate::peer::PeerId;
use crate::substrate::BoxedStream;
use crate::{Error, Result};

/// Upper bound for a single encoded frame.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const OUTBOUND_CAPACITY: usize = 64;

/// Inbound requests a session serves at once. Further requests wait
/// unread on the stream until a handler finishes.
pub const MAX_IN_FLIGHT: usize = 64;

/// Wire frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Frame {
    /// Call id, echoed by the response.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Request or response.
    #[prost(enumeration = "FrameKind", tag = "2")]
    pub kind: i32,
    /// Method name; requests only.
    #[prost(string, tag = "3")]
    pub method: String,
    /// Encoded request or response message.
    #[prost(bytes = "bytes", tag = "4")]
    pub payload: Bytes,
    /// gRPC status code; responses only.
    #[prost(int32, tag = "5")]
    pub code: i32,
    /// Status message for non-OK responses.
    #[prost(string, tag = "6")]
    pub message: String,
}

/// Frame direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FrameKind {
    /// Call from the peer.
    Request = 0,
    /// Answer to an earlier request.
    Response = 1,
}

impl Frame {
    fn request(id: u64, method: &str, payload: Bytes) -> Self {
        Self {
            id,
            kind: FrameKind::Request as i32,
            method: method.to_string(),
            payload,
            code: Code::Ok as i32,
            message: String::new(),
        }
    }

    fn response(id: u64, result: std::result::Result<Bytes, Status>) -> Self {
        match result {
            Ok(payload) => Self {
                id,
                kind: FrameKind::Response as i32,
                method: String::new(),
                payload,
                code: Code::Ok as i32,
                message: String::new(),
            },
            Err(status) => Self {
                id,
                kind: FrameKind::Response as i32,
                method: String::new(),
                payload: Bytes::new(),
                code: status.code() as i32,
                message: status.message().to_string(),
            },
        }
    }

    fn into_result(self) -> std::result::Result<Bytes, Status> {
        match Code::from(self.code) {
            Code::Ok => Ok(self.payload),
            code => Err(Status::new(code, self.message)),
        }
    }
}

/// An inbound call.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Method name.
    pub method: String,
    /// Encoded request message.
    pub payload: Bytes,
    /// The calling peer.
    pub remote: PeerId,
}

impl RpcRequest {
    /// Decode the payload, mapping failures to `INVALID_ARGUMENT`.
    pub fn decode<T: Message + Default>(&self) -> std::result::Result<T, Status> {
        T::decode(self.payload.clone())
            .map_err(|e| Status::invalid_argument(format!("failed to decode {}: {e}", self.method)))
    }
}

/// Server side of a session: answers calls by method name.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle one call. Unknown methods should return `Status::unimplemented`.
    async fn call(&self, request: RpcRequest) -> std::result::Result<Bytes, Status>;
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Bytes, Status>>>>>;

struct Inner {
    remote: PeerId,
    protocol: String,
    outbound: mpsc::Sender<Frame>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
    _guard: DropGuard,
}

/// One side of a request/response session with a remote peer.
///
/// Cheap to clone. The session closes when the stream ends, when the parent
/// token is cancelled, on [`close`](Self::close), or when the last handle is
/// dropped.
#[derive(Clone)]
pub struct RpcPeer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPeer")
            .field("remote", &self.inner.remote)
            .field("protocol", &self.inner.protocol)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcPeer {
    /// Client-only session: inbound calls are answered with `UNIMPLEMENTED`.
    pub fn new(
        stream: BoxedStream,
        remote: PeerId,
        protocol: impl Into<String>,
        parent: &CancellationToken,
    ) -> Self {
        Self::spawn(stream, remote, protocol.into(), None, parent)
    }

    /// Session that answers inbound calls with `service`.
    pub fn with_service(
        stream: BoxedStream,
        remote: PeerId,
        protocol: impl Into<String>,
        service: Arc<dyn RpcService>,
        parent: &CancellationToken,
    ) -> Self {
        Self::spawn(stream, remote, protocol.into(), Some(service), parent)
    }

    fn spawn(
        stream: BoxedStream,
        remote: PeerId,
        protocol: String,
        service: Option<Arc<dyn RpcService>>,
        parent: &CancellationToken,
    ) -> Self {
        let closed = parent.child_token();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let pending: Pending = Arc::default();

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);

        let span = tracing::debug_span!(
            "rpc_session",
            remote = %remote.fmt_short(),
            protocol = %protocol
        );
        tokio::spawn(
            write_loop(writer, outbound_rx, closed.clone()).instrument(span.clone()),
        );
        tokio::spawn(
            read_loop(
                reader,
                ReadContext {
                    remote,
                    service,
                    outbound: outbound.clone(),
                    pending: Arc::clone(&pending),
                    closed: closed.clone(),
                    in_flight: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
                },
            )
            .instrument(span),
        );

        Self {
            inner: Arc::new(Inner {
                remote,
                protocol,
                outbound,
                pending,
                next_id: AtomicU64::new(1),
                _guard: closed.clone().drop_guard(),
                closed,
            }),
        }
    }

    /// The peer on the other end.
    pub fn remote(&self) -> PeerId {
        self.inner.remote
    }

    /// Protocol id the session was opened for.
    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    /// Whether the session has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Close the session. Outstanding calls fail with [`Error::SessionClosed`].
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Call `method` with an encoded payload and wait for the response.
    pub async fn call(&self, method: &str, payload: Bytes) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);

        trace!(id, method, "rpc call");
        if self
            .inner
            .outbound
            .send(Frame::request(id, method, payload))
            .await
            .is_err()
        {
            lock(&self.inner.pending).remove(&id);
            return Err(Error::SessionClosed);
        }

        tokio::select! {
            biased;
            res = rx => match res {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(status)) => Err(status.into()),
                Err(_) => Err(Error::SessionClosed),
            },
            _ = self.inner.closed.cancelled() => {
                lock(&self.inner.pending).remove(&id);
                Err(Error::SessionClosed)
            }
        }
    }

    /// Call `method` with a protobuf request and decode the protobuf response.
    pub async fn unary<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let reply = self
            .call(method, Bytes::from(request.encode_to_vec()))
            .await?;
        Ok(Resp::decode(reply)?)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Reader = FramedRead<tokio::io::ReadHalf<BoxedStream>, LengthDelimitedCodec>;
type Writer = FramedWrite<tokio::io::WriteHalf<BoxedStream>, LengthDelimitedCodec>;

struct ReadContext {
    remote: PeerId,
    service: Option<Arc<dyn RpcService>>,
    outbound: mpsc::Sender<Frame>,
    pending: Pending,
    closed: CancellationToken,
    in_flight: Arc<Semaphore>,
}

async fn write_loop(mut writer: Writer, mut rx: mpsc::Receiver<Frame>, closed: CancellationToken) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(Bytes::from(frame.encode_to_vec())).await {
                        debug!(error = %e, "rpc write failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut writer).await;
    closed.cancel();
}

async fn read_loop(mut reader: Reader, ctx: ReadContext) {
    loop {
        let next = tokio::select! {
            _ = ctx.closed.cancelled() => break,
            next = reader.next() => next,
        };
        let frame = match next {
            Some(Ok(buf)) => match Frame::decode(buf.freeze()) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "undecodable rpc frame");
                    break;
                }
            },
            Some(Err(e)) => {
                debug!(error = %e, "rpc read failed");
                break;
            }
            None => {
                trace!("rpc stream ended");
                break;
            }
        };

        match frame.kind() {
            FrameKind::Response => {
                let waiter = lock(&ctx.pending).remove(&frame.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame.into_result());
                    }
                    None => trace!(id = frame.id, "response for unknown call"),
                }
            }
            FrameKind::Request => {
                let permit = tokio::select! {
                    _ = ctx.closed.cancelled() => break,
                    permit = Arc::clone(&ctx.in_flight).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                dispatch(&ctx, frame, permit);
            }
        }
    }

    ctx.closed.cancel();
    // dropping the senders fails every outstanding call
    lock(&ctx.pending).clear();
}

fn dispatch(ctx: &ReadContext, frame: Frame, permit: OwnedSemaphorePermit) {
    let outbound = ctx.outbound.clone();
    let Some(service) = ctx.service.clone() else {
        let status = Status::unimplemented(format!("no service bound for {}", frame.method));
        tokio::spawn(async move {
            let _ = outbound.send(Frame::response(frame.id, Err(status))).await;
            drop(permit);
        });
        return;
    };

    let closed = ctx.closed.clone();
    let request = RpcRequest {
        method: frame.method,
        payload: frame.payload,
        remote: ctx.remote,
    };
    let id = frame.id;
    tokio::spawn(async move {
        tokio::select! {
            _ = closed.cancelled() => {}
            result = service.call(request) => {
                let _ = outbound.send(Frame::response(id, result)).await;
            }
        }
        drop(permit);
    });
}

//! Bidirectional RPC over one byte stream.
//!
//! Both ends of a plugin connection can issue calls: the host calls the
//! backend service, the backend calls back into the system view. Frames are
//! length-delimited [`RpcFrame`]s. One task reads, one task writes, and each
//! inbound request is handled on its own task so a slow handler never stalls
//! the connection.

use crate::codec::messages::{FrameKind, RpcError, RpcFrame};
use crate::codec::{decode_message, encode_message};
use crate::context::{CallContext, DEFAULT_CALL_TIMEOUT};
use crate::errors::{Result, WardenError};
use crate::observability::metrics::record_rpc_call;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const SERVICE_CONTROL: &str = "control";
pub const SERVICE_BACKEND: &str = "backend";
pub const SERVICE_SYSTEM_VIEW: &str = "system_view";

/// Largest frame accepted on a plugin connection
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const OUTBOUND_QUEUE: usize = 256;

/// A request delivered to a handler
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub service: String,
    pub method: String,
    pub mount_id: String,
    pub payload: Vec<u8>,
    pub context: CallContext,
}

/// Serves calls arriving from the peer
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, call: InboundCall) -> Result<Vec<u8>>;
}

/// Dispatches calls to a handler per service name
#[derive(Clone, Default)]
pub struct Router {
    services: HashMap<String, Arc<dyn RpcHandler>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("services", &self.services.keys().collect::<Vec<_>>()).finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, name: &str, handler: Arc<dyn RpcHandler>) -> Self {
        self.services.insert(name.to_string(), handler);
        self
    }
}

#[async_trait]
impl RpcHandler for Router {
    async fn handle(&self, call: InboundCall) -> Result<Vec<u8>> {
        match self.services.get(&call.service) {
            Some(handler) => handler.handle(call).await,
            None => Err(WardenError::invalid_request(format!("unknown service '{}'", call.service))),
        }
    }
}

struct Shared {
    label: String,
    outbound: mpsc::Sender<RpcFrame>,
    pending: DashMap<u64, oneshot::Sender<Result<Vec<u8>>>>,
    inflight: DashMap<u64, CancellationToken>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Shared {
    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(WardenError::transport(format!(
                    "connection to {} closed",
                    self.label
                ))));
            }
        }
        for entry in self.inflight.iter() {
            entry.value().cancel();
        }
    }
}

/// Handle to one RPC connection; cheap to clone
#[derive(Clone)]
pub struct RpcConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("label", &self.shared.label)
            .field("pending", &self.shared.pending.len())
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

impl RpcConnection {
    /// Start serving `stream` with a fixed handler
    pub fn new<S>(stream: S, label: impl Into<String>, handler: Arc<dyn RpcHandler>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_handler(stream, label, move |_| handler)
    }

    /// Start serving `stream`. `make_handler` receives the connection before
    /// any frame is read, so handlers can call back over it.
    pub fn with_handler<S, F>(stream: S, label: impl Into<String>, make_handler: F) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        F: FnOnce(RpcConnection) -> Arc<dyn RpcHandler>,
    {
        let codec = LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_BYTES).new_codec();
        let (sink, stream) = Framed::new(stream, codec).split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let connection = RpcConnection {
            shared: Arc::new(Shared {
                label: label.into(),
                outbound,
                pending: DashMap::new(),
                inflight: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: CancellationToken::new(),
            }),
        };

        let handler = make_handler(connection.clone());
        tokio::spawn(write_loop(sink, outbound_rx, connection.shared.clone()));
        tokio::spawn(read_loop(stream, handler, connection.shared.clone()));
        connection
    }

    /// Peer name used in logs and errors
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Call `service.method` on the peer
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        mount_id: &str,
        payload: Vec<u8>,
        ctx: &CallContext,
    ) -> Result<Vec<u8>> {
        let shared = &self.shared;
        if shared.closed.is_cancelled() {
            return Err(WardenError::transport(format!("connection to {} closed", shared.label)));
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, response) = oneshot::channel();
        shared.pending.insert(id, waiter);

        let frame = RpcFrame {
            id,
            kind: FrameKind::Request as i32,
            service: service.to_string(),
            method: method.to_string(),
            mount_id: mount_id.to_string(),
            payload,
            error: None,
            timeout_ms: ctx.remaining().as_millis() as u64,
        };

        let operation = format!("{}.{}", service, method);
        let started = Instant::now();

        let result = ctx
            .run(&operation, async {
                shared.outbound.send(frame).await.map_err(|_| {
                    WardenError::transport(format!("connection to {} closed", shared.label))
                })?;
                tokio::select! {
                    reply = response => reply.map_err(|_| {
                        WardenError::transport(format!("connection to {} closed", shared.label))
                    })?,
                    _ = shared.closed.cancelled() => {
                        Err(WardenError::transport(format!("connection to {} closed", shared.label)))
                    }
                }
            })
            .await;

        if shared.pending.remove(&id).is_some() && !shared.closed.is_cancelled() {
            // Caller gave up; tell the peer to stop working on it
            let cancel = RpcFrame { id, kind: FrameKind::Cancel as i32, ..Default::default() };
            let _ = shared.outbound.try_send(cancel);
        }

        record_rpc_call(service, method, result.is_ok(), started.elapsed().as_secs_f64());
        result
    }

    /// Stop both tasks and fail every outstanding call. Idempotent.
    pub fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            debug!(peer = %self.shared.label, "Closing RPC connection");
            self.shared.closed.cancel();
            self.shared.fail_pending();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection is closed by either side
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

async fn write_loop<W>(mut sink: W, mut outbound: mpsc::Receiver<RpcFrame>, shared: Arc<Shared>)
where
    W: futures::Sink<Bytes, Error = std::io::Error> + Unpin,
{
    loop {
        // Queued frames go out before a close is noticed
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            _ = shared.closed.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        let bytes = match encode_message(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %shared.label, error = %e, "Dropping unencodable frame");
                continue;
            }
        };

        if let Err(e) = sink.send(Bytes::from(bytes)).await {
            debug!(peer = %shared.label, error = %e, "Write failed, closing connection");
            break;
        }
    }

    let _ = sink.close().await;
    shared.closed.cancel();
    shared.fail_pending();
}

async fn read_loop<R>(mut stream: R, handler: Arc<dyn RpcHandler>, shared: Arc<Shared>)
where
    R: futures::Stream<Item = std::io::Result<bytes::BytesMut>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = stream.next() => next,
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                debug!(peer = %shared.label, error = %e, "Read failed, closing connection");
                break;
            }
            None => {
                debug!(peer = %shared.label, "Peer closed connection");
                break;
            }
        };

        let frame: RpcFrame = match decode_message(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %shared.label, error = %e, "Undecodable frame, closing connection");
                break;
            }
        };

        match FrameKind::try_from(frame.kind) {
            Ok(FrameKind::Request) => dispatch(frame, handler.clone(), shared.clone()),
            Ok(FrameKind::Response) => {
                if let Some((_, waiter)) = shared.pending.remove(&frame.id) {
                    let result = match frame.error {
                        Some(error) => Err(WardenError::from_wire(&error.kind, error.message)),
                        None => Ok(frame.payload),
                    };
                    let _ = waiter.send(result);
                } else {
                    trace!(peer = %shared.label, id = frame.id, "Response for abandoned call");
                }
            }
            Ok(FrameKind::Cancel) => {
                if let Some(token) = shared.inflight.get(&frame.id) {
                    token.cancel();
                }
            }
            _ => warn!(peer = %shared.label, kind = frame.kind, "Ignoring frame of unknown kind"),
        }
    }

    shared.closed.cancel();
    shared.fail_pending();
}

fn dispatch(frame: RpcFrame, handler: Arc<dyn RpcHandler>, shared: Arc<Shared>) {
    let token = shared.closed.child_token();
    shared.inflight.insert(frame.id, token.clone());

    tokio::spawn(async move {
        let timeout = if frame.timeout_ms == 0 {
            DEFAULT_CALL_TIMEOUT
        } else {
            Duration::from_millis(frame.timeout_ms)
        };
        let context = CallContext::with_parent(timeout, &token);
        let operation = format!("{}.{}", frame.service, frame.method);

        let call = InboundCall {
            service: frame.service,
            method: frame.method,
            mount_id: frame.mount_id,
            payload: frame.payload,
            context: context.clone(),
        };
        let result = context.run(&operation, handler.handle(call)).await;
        shared.inflight.remove(&frame.id);

        let response = match result {
            Ok(payload) => RpcFrame {
                id: frame.id,
                kind: FrameKind::Response as i32,
                payload,
                ..Default::default()
            },
            Err(error) => {
                debug!(peer = %shared.label, operation = %operation, error = %error, "Handler failed");
                RpcFrame {
                    id: frame.id,
                    kind: FrameKind::Response as i32,
                    error: Some(RpcError {
                        kind: error.wire_kind().to_string(),
                        message: error.wire_message(),
                    }),
                    ..Default::default()
                }
            }
        };

        if token.is_cancelled() {
            return;
        }
        let _ = shared.outbound.send(response).await;
    });
}

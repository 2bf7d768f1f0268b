//! Binary RPC endpoint: multiplexes calls over one TCP connection.
//!
//! Requests are tagged with a per-connection id; a background reader routes
//! each response frame back to the waiting call. Calls still pending when the
//! connection closes fail with `Transport`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, warn};
use vault_core::messages::{RpcRequest, RpcResponse};

use crate::service::{Operation, OperationError, OperationResponse};
use crate::transport::rpc::frame_codec;

type Pending = DashMap<u64, oneshot::Sender<RpcResponse>>;

/// Client side of the RPC transport. Clones share the connection.
#[derive(Clone)]
pub struct RpcEndpoint {
    inner: Arc<Inner>,
}

struct Inner {
    outbound: mpsc::Sender<Bytes>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    /// Cancelled by the reader once the connection is gone.
    closed: CancellationToken,
    /// Cancelled when the last endpoint clone is dropped.
    dropped: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dropped.cancel();
    }
}

impl RpcEndpoint {
    /// Connects to `addr` and starts the reader and writer tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection cannot be established.
    pub async fn connect(addr: &str, max_frame_bytes: usize) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to {addr}: {e}"))?;
        let (mut sink, mut frames) = Framed::new(stream, frame_codec(max_frame_bytes)).split();
        let (outbound, mut rx) = mpsc::channel::<Bytes>(256);

        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();
        let dropped = CancellationToken::new();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "RPC client write failed");
                    break;
                }
            }
        });

        {
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            let dropped = dropped.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = dropped.cancelled() => break,
                        frame = frames.next() => match frame {
                            Some(Ok(bytes)) => route_response(&pending, &bytes),
                            Some(Err(e)) => {
                                warn!(error = %e, "RPC client read failed");
                                break;
                            }
                            None => break,
                        },
                    }
                }
                closed.cancel();
                pending.clear();
            });
        }

        Ok(Self {
            inner: Arc::new(Inner {
                outbound,
                pending,
                next_id: AtomicU64::new(1),
                closed,
                dropped,
            }),
        })
    }

    /// Whether the connection has been lost.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

fn route_response(pending: &Pending, bytes: &[u8]) {
    match RpcResponse::from_slice(bytes) {
        Ok(response) => match pending.remove(&response.id) {
            Some((_, waiter)) => {
                let _ = waiter.send(response);
            }
            None => debug!(id = response.id, "RPC response for unknown call"),
        },
        Err(e) => warn!(error = %e, "undecodable RPC response frame"),
    }
}

/// Removes the pending entry when the call finishes or is abandoned.
struct PendingCall<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Inner {
    async fn call(&self, op: Operation) -> Result<OperationResponse, OperationError> {
        let Operation { ctx, request } = op;
        let method = request.method();
        if self.closed.is_cancelled() {
            return Err(connection_closed());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RpcRequest {
            id,
            bearer: ctx.bearer.clone(),
            timeout_ms: ctx
                .remaining()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            call: request.into(),
        }
        .to_bytes()
        .map_err(|e| OperationError::Internal(anyhow::Error::new(e)))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingCall {
            pending: &self.pending,
            id,
        };

        ctx.run(async {
            self.outbound
                .send(Bytes::from(frame))
                .await
                .map_err(|_| connection_closed())?;

            let response = tokio::select! {
                biased;
                response = rx => response.map_err(|_| connection_closed())?,
                () = self.closed.cancelled() => return Err(connection_closed()),
            };

            match (response.reply, response.error) {
                (_, Some(failure)) => Err(OperationError::from_failure(method, failure)),
                (Some(reply), None) => Ok(reply.into()),
                (None, None) => Err(OperationError::Internal(anyhow::anyhow!(
                    "RPC response {id} carries neither reply nor error"
                ))),
            }
        })
        .await
    }
}

fn connection_closed() -> OperationError {
    OperationError::Transport("RPC connection closed".to_string())
}

impl Service<Operation> for RpcEndpoint {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.call(op).await })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tower::ServiceExt;
    use vault_core::messages::{HashRequest, HashResponse, RpcReply};

    use super::*;
    use crate::service::{methods, CallContext, OperationRequest};

    /// Accepts one connection and answers with `answer(request)`, in reverse
    /// order of arrival once `batch` requests are in.
    async fn scripted_server(
        batch: usize,
        answer: fn(RpcRequest) -> RpcResponse,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Framed::new(stream, frame_codec(64 * 1024));
            let mut seen = Vec::new();
            while seen.len() < batch {
                let bytes = conn.next().await.unwrap().unwrap();
                seen.push(RpcRequest::from_slice(&bytes).unwrap());
            }
            for request in seen.into_iter().rev() {
                let bytes = answer(request).to_bytes().unwrap();
                conn.send(Bytes::from(bytes)).await.unwrap();
            }
        });
        addr
    }

    fn echo(request: RpcRequest) -> RpcResponse {
        let vault_core::messages::RpcCall::Hash(req) = request.call else {
            panic!("expected hash call");
        };
        RpcResponse::reply(request.id, RpcReply::Hash(HashResponse::ok(req.secret)))
    }

    fn hash_op(secret: &str) -> Operation {
        Operation::with_context(
            CallContext::new(methods::HASH).with_timeout(Duration::from_secs(5)),
            OperationRequest::Hash(HashRequest::new(secret)),
        )
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let addr = scripted_server(2, echo).await;
        let endpoint = RpcEndpoint::connect(&addr, 64 * 1024).await.unwrap();

        let (a, b) = tokio::join!(
            endpoint.clone().oneshot(hash_op("first")),
            endpoint.clone().oneshot(hash_op("second")),
        );
        assert_eq!(a.unwrap(), OperationResponse::Hash(HashResponse::ok("first")));
        assert_eq!(b.unwrap(), OperationResponse::Hash(HashResponse::ok("second")));
        assert!(endpoint.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn error_frame_becomes_operation_error() {
        fn reject(request: RpcRequest) -> RpcResponse {
            RpcResponse::error(
                request.id,
                vault_core::Failure::new(vault_core::FailureKind::Auth, "bad token"),
            )
        }
        let addr = scripted_server(1, reject).await;
        let endpoint = RpcEndpoint::connect(&addr, 64 * 1024).await.unwrap();

        let err = endpoint.oneshot(hash_op("s")).await.unwrap_err();
        assert!(matches!(err, OperationError::Auth(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn closed_connection_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Framed::new(stream, frame_codec(64 * 1024));
            let _ = conn.next().await;
            // Dropping the connection without answering.
        });

        let endpoint = RpcEndpoint::connect(&addr, 64 * 1024).await.unwrap();
        let err = endpoint.clone().oneshot(hash_op("s")).await.unwrap_err();
        assert!(matches!(err, OperationError::Transport(_)), "got {err:?}");
        assert!(endpoint.is_closed());
    }

    #[tokio::test]
    async fn deadline_bounds_a_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Framed::new(stream, frame_codec(64 * 1024));
            while conn.next().await.is_some() {}
        });

        let endpoint = RpcEndpoint::connect(&addr, 64 * 1024).await.unwrap();
        let op = Operation::with_context(
            CallContext::new(methods::HASH).with_timeout(Duration::from_millis(50)),
            OperationRequest::Hash(HashRequest::new("s")),
        );
        let err = endpoint.clone().oneshot(op).await.unwrap_err();
        assert!(matches!(err, OperationError::DeadlineExceeded));
        assert!(endpoint.inner.pending.is_empty());
    }
}

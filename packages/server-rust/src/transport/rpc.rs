//! Binary RPC transport: length-delimited `MsgPack` frames over TCP.
//!
//! Every inbound frame runs on its own task so calls on one connection
//! proceed concurrently; responses carry the request `id` and may arrive out
//! of order. When the peer closes the connection, its in-flight calls are
//! cancelled. On server shutdown the listener stops reading new frames and
//! lets admitted calls finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn, Instrument};
use vault_core::messages::{Failure, RpcCall, RpcReply, RpcRequest, RpcResponse};

use super::shutdown::ShutdownController;
use crate::service::{
    CallContext, Operation, OperationRequest, OperationResponse, OperationRouter, TransportConfig,
};

/// Outbound frames queued per connection before writers apply backpressure.
const OUTBOUND_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Canonical <-> wire conversions
// ---------------------------------------------------------------------------

impl From<RpcCall> for OperationRequest {
    fn from(call: RpcCall) -> Self {
        match call {
            RpcCall::Hash(req) => Self::Hash(req),
            RpcCall::Validate(req) => Self::Validate(req),
        }
    }
}

impl From<OperationRequest> for RpcCall {
    fn from(request: OperationRequest) -> Self {
        match request {
            OperationRequest::Hash(req) => Self::Hash(req),
            OperationRequest::Validate(req) => Self::Validate(req),
        }
    }
}

impl From<OperationResponse> for RpcReply {
    fn from(response: OperationResponse) -> Self {
        match response {
            OperationResponse::Hash(resp) => Self::Hash(resp),
            OperationResponse::Validate(resp) => Self::Validate(resp),
        }
    }
}

impl From<RpcReply> for OperationResponse {
    fn from(reply: RpcReply) -> Self {
        match reply {
            RpcReply::Hash(resp) => Self::Hash(resp),
            RpcReply::Validate(resp) => Self::Validate(resp),
        }
    }
}

/// Codec shared by the server and the client endpoint.
#[must_use]
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

// ---------------------------------------------------------------------------
// RpcTransport
// ---------------------------------------------------------------------------

/// TCP listener serving RPC frames with deferred startup.
pub struct RpcTransport {
    config: TransportConfig,
    vault: OperationRouter,
    shutdown: Arc<ShutdownController>,
    listener: Option<TcpListener>,
}

impl RpcTransport {
    #[must_use]
    pub fn new(
        config: TransportConfig,
        vault: OperationRouter,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            config,
            vault,
            shutdown,
            listener: None,
        }
    }

    /// Binds the listener to `config.rpc_addr` and returns the bound port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(&self.config.rpc_addr).await?;
        let port = listener.local_addr()?.port();
        info!(addr = %self.config.rpc_addr, port, "RPC listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let stop = CancellationToken::new();
        let mut connections = tokio::task::JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = Connection {
                            vault: self.vault.clone(),
                            shutdown: Arc::clone(&self.shutdown),
                            stop: stop.clone(),
                            max_frame_bytes: self.config.max_body_bytes,
                        };
                        let span = tracing::info_span!("rpc_connection", %peer);
                        connections.spawn(conn.run(stream).instrument(span));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept RPC connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        stop.cancel();
        while connections.join_next().await.is_some() {}
        info!("RPC transport stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Connection {
    vault: OperationRouter,
    shutdown: Arc<ShutdownController>,
    stop: CancellationToken,
    max_frame_bytes: usize,
}

impl Connection {
    async fn run(self, stream: TcpStream) {
        let (mut sink, mut frames) = Framed::new(stream, frame_codec(self.max_frame_bytes)).split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "RPC write failed");
                    break;
                }
            }
        });

        // Cancelled when the peer goes away; never on server shutdown.
        let peer_gone = CancellationToken::new();

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(bytes)) => {
                        let task = Call {
                            vault: self.vault.clone(),
                            cancel: peer_gone.child_token(),
                            out: tx.clone(),
                        };
                        let guard = self.shutdown.in_flight_guard();
                        tokio::spawn(async move {
                            task.handle(&bytes).await;
                            drop(guard);
                        });
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "RPC read failed, closing connection");
                        peer_gone.cancel();
                        break;
                    }
                    None => {
                        debug!("RPC peer closed connection");
                        peer_gone.cancel();
                        break;
                    }
                },
            }
        }

        // The writer exits once every in-flight call has dropped its sender.
        drop(tx);
        let _ = writer.await;
    }
}

/// One inbound frame.
struct Call {
    vault: OperationRouter,
    cancel: CancellationToken,
    out: mpsc::Sender<Bytes>,
}

impl Call {
    async fn handle(self, frame: &[u8]) {
        let response = match RpcRequest::from_slice(frame) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                debug!(error = %e, "undecodable RPC frame");
                RpcResponse::error(0, Failure::validation(e.to_string()))
            }
        };

        match response.to_bytes() {
            Ok(bytes) => {
                let _ = self.out.send(Bytes::from(bytes)).await;
            }
            Err(e) => warn!(id = response.id, error = %e, "failed to encode RPC response"),
        }
    }

    async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest {
            id,
            bearer,
            timeout_ms,
            call,
        } = request;
        let request = OperationRequest::from(call);

        let mut ctx = CallContext::new(request.method()).with_cancellation(self.cancel.clone());
        ctx.bearer = bearer;
        if let Some(ms) = timeout_ms {
            ctx = ctx.with_timeout(Duration::from_millis(ms));
        }

        match self
            .vault
            .clone()
            .oneshot(Operation::with_context(ctx, request))
            .await
        {
            Ok(response) => RpcResponse::reply(id, response.into()),
            Err(e) => RpcResponse::error(id, e.to_failure()),
        }
    }
}

//! WebSocket JSON-RPC client for aria2
//!
//! One socket carries both call/response traffic and push notifications.
//! A writer task owns the sink and a reader task owns the stream; calls are
//! matched to responses by id through oneshot channels.

use super::message::{decode, Incoming, RawStatus, RawVersion, RpcMessage, RpcRequest};
use super::{Notification, TransferOptions, TransferRpc};
use crate::error::{EngineError, Result, RpcErrorKind};
use crate::protocol::{Gid, StatusSnapshot};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// aria2 RPC client over `ws://host:port/jsonrpc`
pub struct WsRpcClient {
    secret: Option<String>,
    next_id: AtomicU64,
    pending: PendingCalls,
    outgoing: mpsc::UnboundedSender<Message>,
    call_timeout: Duration,
    closed: CancellationToken,
}

impl WsRpcClient {
    /// Open the socket and start the reader/writer tasks.
    ///
    /// Returns the client and the receiving end of the notification stream.
    pub async fn connect(
        url: &str,
        secret: Option<String>,
        call_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notification>)> {
        let (ws_stream, _) = timeout(call_timeout, connect_async(url))
            .await
            .map_err(|_| EngineError::Timeout {
                operation: "RPC connect",
                after: call_timeout,
            })?
            .map_err(|e| {
                EngineError::rpc(
                    RpcErrorKind::Connect,
                    format!("WebSocket connection to {} failed: {}", url, e),
                )
            })?;

        let (mut sink, mut stream) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outgoing_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = sink.send(msg).await {
                            tracing::debug!("RPC socket write failed: {}", e);
                            writer_closed.cancel();
                            break;
                        }
                    }
                    _ = writer_closed.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = stream.next() => frame,
                    _ = reader_closed.cancelled() => break,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        route_frame(text.as_str(), &reader_pending, &notify_tx);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("RPC socket closed by daemon");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("RPC socket read failed: {}", e);
                        break;
                    }
                }
            }
            // Mark closed before draining so late callers see it
            reader_closed.cancel();
            fail_pending(&reader_pending);
        });

        Ok((
            Self {
                secret,
                next_id: AtomicU64::new(1),
                pending,
                outgoing,
                call_timeout,
                closed,
            },
            notify_rx,
        ))
    }

    /// Whether the socket is gone
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the socket; in-flight calls fail with `ConnectionClosed`
    pub fn close(&self) {
        self.closed.cancel();
        fail_pending(&self.pending);
    }

    /// Issue one call and wait for its result
    pub async fn call(&self, method: &'static str, params: Vec<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(connection_closed());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, self.secret.as_deref(), params);
        let text = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.is_closed() || self.outgoing.send(Message::Text(text.into())).is_err() {
            self.pending.lock().remove(&id);
            return Err(connection_closed());
        }

        match timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(connection_closed()),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(EngineError::Timeout {
                    operation: method,
                    after: self.call_timeout,
                })
            }
        }
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn connection_closed() -> EngineError {
    EngineError::rpc(RpcErrorKind::ConnectionClosed, "RPC connection closed")
}

fn fail_pending(pending: &PendingCalls) {
    let drained: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(connection_closed()));
    }
}

fn route_frame(
    text: &str,
    pending: &PendingCalls,
    notifications: &mpsc::UnboundedSender<Notification>,
) {
    let message: RpcMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Ignoring malformed RPC frame: {}", e);
            return;
        }
    };

    match message.classify() {
        Incoming::Response { id, result } => {
            let waiter = pending.lock().remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => tracing::debug!("Response for unknown or expired call {}", id),
            }
        }
        Incoming::Notification(notification) => {
            let _ = notifications.send(notification);
        }
        Incoming::Ignored(reason) => tracing::trace!("Ignoring RPC frame: {}", reason),
    }
}

#[async_trait]
impl TransferRpc for WsRpcClient {
    async fn add_uri(&self, uris: &[String], options: &TransferOptions) -> Result<Gid> {
        let options = serde_json::to_value(options)?;
        let value = self.call("aria2.addUri", vec![json!(uris), options]).await?;
        decode::<String>("aria2.addUri", value).map(Gid::new)
    }

    async fn tell_status(&self, gid: &Gid) -> Result<StatusSnapshot> {
        let value = self.call("aria2.tellStatus", vec![json!(gid)]).await?;
        decode::<RawStatus>("aria2.tellStatus", value)?.try_into()
    }

    async fn get_version(&self) -> Result<String> {
        let value = self.call("aria2.getVersion", Vec::new()).await?;
        Ok(decode::<RawVersion>("aria2.getVersion", value)?.version)
    }

    async fn shutdown(&self) -> Result<String> {
        let value = self.call("aria2.shutdown", Vec::new()).await?;
        decode("aria2.shutdown", value)
    }

    async fn force_remove(&self, gid: &Gid) -> Result<()> {
        self.call("aria2.forceRemove", vec![json!(gid)]).await?;
        Ok(())
    }
}

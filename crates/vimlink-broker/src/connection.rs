use crate::{
    correlator::{PendingRequests, ReplySlot},
    error::BrokerError,
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use vimlink_core::{EditorCall, Outbound, ReplyFrame, RequestFrame};

/// Liveness of one editor connection. Leaves `Open` at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Open,
    Closed,
    Failed(String),
}

/// Broker-side handle to one connected editor.
///
/// Owns the outbound queue feeding the writer task and the pending-request
/// table for replies arriving on this connection.
pub struct EditorConnection {
    conn_id: u64,
    outbound: mpsc::Sender<Outbound>,
    status: watch::Sender<LinkStatus>,
    pending: PendingRequests,
}

impl EditorConnection {
    pub fn new(conn_id: u64, outbound: mpsc::Sender<Outbound>) -> Self {
        let (status, _) = watch::channel(LinkStatus::Open);
        Self {
            conn_id,
            outbound,
            status,
            pending: PendingRequests::new(),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.status.borrow() != LinkStatus::Open
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Moves the link out of `Open` and fails everything still waiting on it.
    /// Returns false if the link had already left `Open`.
    pub fn mark_closed(&self, status: LinkStatus) -> bool {
        if status == LinkStatus::Open {
            return false;
        }
        let reason = match &status {
            LinkStatus::Failed(reason) => reason.clone(),
            _ => "connection closed".to_string(),
        };
        let changed = self.status.send_if_modified(|current| {
            if *current != LinkStatus::Open {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            let failed = self.pending.fail_all(BrokerError::SocketError(reason));
            if failed > 0 {
                debug!(
                    event = "broker_pending_failed_on_close",
                    conn_id = self.conn_id,
                    count = failed
                );
            }
        }
        changed
    }

    pub fn close(&self) -> bool {
        self.mark_closed(LinkStatus::Closed)
    }

    /// Resolves once the link has left `Open`.
    pub async fn wait_closed(&self) -> LinkStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(|status| *status != LinkStatus::Open).await {
            Ok(status) => (*status).clone(),
            Err(_) => LinkStatus::Closed,
        };
        status
    }

    pub async fn send(&self, message: Outbound) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::SocketError("connection closed".to_string()));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| BrokerError::SocketError("writer stopped".to_string()))
    }

    /// Registers a pending request and queues it for writing.
    pub async fn dispatch(&self, call: EditorCall) -> Result<(u64, ReplySlot), BrokerError> {
        let (id, slot) = self.pending.register(call.method());
        // a close racing with registration must not leave the slot orphaned
        let guard = self.pending.guard(id);
        if self.is_closed() {
            return Err(BrokerError::SocketError("connection closed".to_string()));
        }
        self.send(Outbound::Request(RequestFrame { id, call })).await?;
        guard.disarm();
        Ok((id, slot))
    }

    pub async fn request(&self, call: EditorCall, timeout: Duration) -> Result<Value, BrokerError> {
        let method = call.method();
        let (id, slot) = self.dispatch(call).await?;
        self.pending.wait(id, slot, method, timeout).await
    }

    /// Sends a request nobody waits for; any reply is discarded on arrival.
    pub async fn send_oneway(&self, call: EditorCall) -> Result<u64, BrokerError> {
        let id = self.pending.next_id();
        self.send(Outbound::Request(RequestFrame { id, call })).await?;
        Ok(id)
    }

    pub fn deliver(&self, reply: ReplyFrame) -> bool {
        self.pending.resolve(reply)
    }
}

#[cfg(unix)]
pub(crate) async fn writer_loop(
    connection: std::sync::Arc<EditorConnection>,
    mut writer: tokio::net::unix::OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    max_frame_bytes: usize,
) {
    use tokio::io::AsyncWriteExt;
    use tracing::warn;
    use vimlink_core::encode_frame;

    let conn_id = connection.conn_id();
    loop {
        // the connection keeps a sender alive, so closure has to be watched
        let message = tokio::select! {
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = connection.wait_closed() => break,
        };
        let frame = match encode_frame(&message, max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "broker_encode_error", conn_id, error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "broker_write_error", conn_id, error = %err);
                connection.mark_closed(LinkStatus::Failed(err.to_string()));
                break;
            }
            Err(_) => {
                warn!(event = "broker_write_timeout", conn_id);
                connection.mark_closed(LinkStatus::Failed("write timeout".to_string()));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn connection() -> (Arc<EditorConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(EditorConnection::new(7, tx)), rx)
    }

    #[tokio::test]
    async fn request_is_queued_and_resolved_by_reply() {
        let (conn, mut rx) = connection();
        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request(EditorCall::get_state(), Duration::from_secs(2))
                    .await
            })
        };

        let Some(Outbound::Request(frame)) = rx.recv().await else {
            panic!("expected a request frame");
        };
        assert_eq!(frame.call, EditorCall::get_state());
        assert!(conn.deliver(ReplyFrame {
            id: frame.id,
            result: Some(json!({"windows": []})),
            error: None,
        }));

        let result = caller.await.expect("join");
        assert_eq!(result, Ok(json!({"windows": []})));
        assert!(conn.pending().is_empty());
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests_once() {
        let (conn, mut rx) = connection();
        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request(EditorCall::get_state(), Duration::from_secs(5))
                    .await
            })
        };
        let _ = rx.recv().await.expect("request queued");

        assert!(conn.mark_closed(LinkStatus::Failed("reset by peer".to_string())));
        assert!(!conn.close());
        assert_eq!(conn.status(), LinkStatus::Failed("reset by peer".to_string()));

        let result = caller.await.expect("join");
        assert_eq!(
            result,
            Err(BrokerError::SocketError("reset by peer".to_string()))
        );
        assert_eq!(
            conn.wait_closed().await,
            LinkStatus::Failed("reset by peer".to_string())
        );
    }

    #[tokio::test]
    async fn closed_link_rejects_new_requests() {
        let (conn, _rx) = connection();
        assert!(conn.close());
        assert!(conn.is_closed());

        let err = conn
            .request(EditorCall::get_state(), Duration::from_millis(50))
            .await
            .expect_err("closed");
        assert!(matches!(err, BrokerError::SocketError(_)));
        assert!(conn.pending().is_empty());
    }

    #[tokio::test]
    async fn wait_closed_wakes_on_close() {
        let (conn, _rx) = connection();
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.wait_closed().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();
        let status = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_closed timed out")
            .expect("join");
        assert_eq!(status, LinkStatus::Closed);
    }

    #[tokio::test]
    async fn cancelled_request_leaves_nothing_pending() {
        let (conn, mut rx) = connection();
        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            conn.request(EditorCall::get_state(), Duration::from_secs(5)),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(rx.recv().await.is_some());
        assert!(conn.pending().is_empty());
    }

    #[tokio::test]
    async fn oneway_requests_leave_nothing_pending() {
        let (conn, mut rx) = connection();
        let id = conn
            .send_oneway(EditorCall::execute("split"))
            .await
            .expect("send");
        let Some(Outbound::Request(frame)) = rx.recv().await else {
            panic!("expected a request frame");
        };
        assert_eq!(frame.id, id);
        assert!(conn.pending().is_empty());
        assert!(!conn.deliver(ReplyFrame {
            id,
            result: Some(json!({"success": true})),
            error: None,
        }));
    }
}

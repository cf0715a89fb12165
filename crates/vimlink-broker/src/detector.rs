//! Completion detection for commands that terminate the editor.
//!
//! A successful exit closes the connection before any reply is written, so
//! the close itself is the success signal. An explicit error reply, a failed
//! link or the deadline are failures.

use crate::{
    connection::{EditorConnection, LinkStatus},
    error::BrokerError,
    registry::InstanceRegistry,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use vimlink_core::EditorCall;

pub const EXIT_METHOD: &str = "exit";

pub async fn run_exit(
    registry: &InstanceRegistry,
    id: &str,
    connection: Arc<EditorConnection>,
    command: &str,
    timeout: Duration,
) -> Result<(), BrokerError> {
    let conn_id = connection.conn_id();
    registry.set_pending_exit(id, conn_id, true).await;

    let (request_id, mut slot) = match connection.dispatch(EditorCall::execute(command)).await {
        Ok(dispatched) => dispatched,
        Err(err) => {
            registry.set_pending_exit(id, conn_id, false).await;
            return Err(err);
        }
    };
    let _guard = connection.pending().guard(request_id);
    debug!(event = "broker_exit_sent", instance_id = %id, request_id, command);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut awaiting_reply = true;
    let outcome = loop {
        tokio::select! {
            biased;
            status = connection.wait_closed() => {
                break match status {
                    LinkStatus::Failed(reason) => Err(BrokerError::SocketError(reason)),
                    _ => Ok(()),
                };
            }
            reply = &mut slot, if awaiting_reply => {
                awaiting_reply = false;
                if let Ok(Err(BrokerError::RemoteError(message))) = reply {
                    break Err(BrokerError::RemoteError(message));
                }
                // an acknowledgment is not completion; keep watching the link
            }
            _ = &mut deadline => {
                break Err(BrokerError::Timeout {
                    method: EXIT_METHOD,
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    };

    match &outcome {
        Ok(()) => {
            if registry.drop_instance(id, conn_id).await.is_some() {
                info!(event = "broker_instance_exited", instance_id = %id, command);
            }
        }
        Err(err) => {
            registry.set_pending_exit(id, conn_id, false).await;
            warn!(event = "broker_exit_failed", instance_id = %id, command, error = %err);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tokio::sync::mpsc;
    use vimlink_core::{InstanceInfo, Outbound, RemoteFault, ReplyFrame};

    async fn registered() -> (
        Arc<InstanceRegistry>,
        Arc<EditorConnection>,
        mpsc::Receiver<Outbound>,
    ) {
        let registry = Arc::new(InstanceRegistry::new(Arc::new(MemoryStore::default())));
        let (tx, rx) = mpsc::channel(8);
        let connection = Arc::new(EditorConnection::new(1, tx));
        registry
            .register("vim-a", InstanceInfo::default(), connection.clone())
            .await;
        (registry, connection, rx)
    }

    async fn next_request_id(rx: &mut mpsc::Receiver<Outbound>) -> u64 {
        match rx.recv().await {
            Some(Outbound::Request(frame)) => {
                assert_eq!(frame.call, EditorCall::execute("qall!"));
                frame.id
            }
            other => panic!("expected exit request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_after_send_is_success() {
        let (registry, connection, mut rx) = registered().await;
        let closer = {
            let connection = connection.clone();
            tokio::spawn(async move {
                let _ = next_request_id(&mut rx).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                connection.close();
            })
        };

        run_exit(&registry, "vim-a", connection, "qall!", Duration::from_secs(2))
            .await
            .expect("exit succeeds");
        closer.await.expect("join");
        assert!(!registry.contains("vim-a").await);
        assert_eq!(registry.selected().await, None);
    }

    #[tokio::test]
    async fn success_reply_alone_does_not_complete_the_exit() {
        let (registry, connection, mut rx) = registered().await;
        let editor = {
            let connection = connection.clone();
            tokio::spawn(async move {
                let id = next_request_id(&mut rx).await;
                connection.deliver(ReplyFrame {
                    id,
                    result: Some(json!({"success": true})),
                    error: None,
                });
                tokio::time::sleep(Duration::from_millis(50)).await;
                connection.close();
            })
        };

        run_exit(&registry, "vim-a", connection, "qall!", Duration::from_secs(2))
            .await
            .expect("exit succeeds");
        editor.await.expect("join");
    }

    #[tokio::test]
    async fn silence_times_out_and_clears_pending_exit() {
        let (registry, connection, _rx) = registered().await;
        let err = run_exit(
            &registry,
            "vim-a",
            connection.clone(),
            "qall!",
            Duration::from_millis(150),
        )
        .await
        .expect_err("timeout");
        assert!(err.is_timeout());
        assert_eq!(registry.pending_exit("vim-a").await, Some(false));
        assert!(connection.pending().is_empty());
    }

    #[tokio::test]
    async fn error_reply_fails_the_exit() {
        let (registry, connection, mut rx) = registered().await;
        let editor = {
            let connection = connection.clone();
            tokio::spawn(async move {
                let id = next_request_id(&mut rx).await;
                connection.deliver(ReplyFrame {
                    id,
                    result: None,
                    error: Some(RemoteFault {
                        message: "E37: No write since last change".to_string(),
                    }),
                });
            })
        };

        let err = run_exit(&registry, "vim-a", connection, "qall!", Duration::from_secs(2))
            .await
            .expect_err("remote error");
        editor.await.expect("join");
        assert_eq!(
            err,
            BrokerError::RemoteError("E37: No write since last change".to_string())
        );
        assert_eq!(registry.pending_exit("vim-a").await, Some(false));
    }

    #[tokio::test]
    async fn failed_link_is_a_socket_error() {
        let (registry, connection, mut rx) = registered().await;
        let breaker = {
            let connection = connection.clone();
            tokio::spawn(async move {
                let _ = next_request_id(&mut rx).await;
                connection.mark_closed(LinkStatus::Failed("broken pipe".to_string()));
            })
        };

        let err = run_exit(&registry, "vim-a", connection, "qall!", Duration::from_secs(2))
            .await
            .expect_err("socket error");
        breaker.await.expect("join");
        assert_eq!(err, BrokerError::SocketError("broken pipe".to_string()));
    }
}

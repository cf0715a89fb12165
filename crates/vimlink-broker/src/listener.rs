use crate::broker::Broker;
use std::{io, sync::Arc};
use tokio::sync::watch;

#[cfg(unix)]
use crate::connection::{writer_loop, EditorConnection, LinkStatus};
#[cfg(unix)]
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
#[cfg(unix)]
use tokio::{
    io::AsyncReadExt,
    net::{UnixListener, UnixStream},
    sync::mpsc,
};
#[cfg(unix)]
use tracing::{debug, info, warn};
#[cfg(unix)]
use vimlink_core::{BrokerEvent, EditorEvent, Inbound, NdjsonFrameDecoder, Outbound};

#[cfg(unix)]
const READ_CHUNK_BYTES: usize = 8 * 1024;

#[cfg(unix)]
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[cfg(not(unix))]
pub async fn run(broker: Arc<Broker>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let _ = shutdown.changed().await;
    broker.shutdown().await;
    Ok(())
}

/// Accepts editor connections until `shutdown` flips to true.
#[cfg(unix)]
pub async fn run(broker: Arc<Broker>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let config = broker.config().clone();
    let Some(listener) =
        bind_listener(&config.socket_path, config.bind_retry_delay, &mut shutdown).await?
    else {
        broker.shutdown().await;
        return Ok(());
    };

    info!(
        event = "broker_listener_start",
        socket = %config.socket_path.display(),
        queue_capacity = config.queue_capacity
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let broker = broker.clone();
                        tokio::spawn(async move {
                            handle_connection(broker, stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "broker_accept_error", error = %err);
                    }
                }
            }
        }
    }

    broker.shutdown().await;
    let _ = fs::remove_file(&config.socket_path);
    info!(event = "broker_listener_stop", socket = %config.socket_path.display());
    Ok(())
}

/// Binds the socket, clearing a stale file first. While the path stays in
/// use the bind is retried every `retry_delay` until it succeeds or shutdown
/// is requested, in which case `None` is returned.
#[cfg(unix)]
async fn bind_listener(
    path: &Path,
    retry_delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<Option<UnixListener>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut attempt: u32 = 0;
    let listener = loop {
        if *shutdown.borrow() {
            return Ok(None);
        }
        if path.exists() {
            let _ = fs::remove_file(path);
        }
        match UnixListener::bind(path) {
            Ok(listener) => break listener,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                attempt += 1;
                warn!(
                    event = "broker_bind_retry",
                    socket = %path.display(),
                    attempt,
                    delay_ms = retry_delay.as_millis() as u64
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return Ok(None);
                        }
                    }
                }
            }
            Err(err) => return Err(err),
        }
    };

    // owner-only access is required, so a failed chmod is fatal
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        drop(listener);
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(Some(listener))
}

#[cfg(unix)]
async fn handle_connection(broker: Arc<Broker>, stream: UnixStream) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let config = broker.config();
    let (mut reader, writer_half) = stream.into_split();

    let (tx, rx) = mpsc::channel::<Outbound>(config.queue_capacity);
    let connection = Arc::new(EditorConnection::new(conn_id, tx));
    let writer_task = tokio::spawn(writer_loop(
        connection.clone(),
        writer_half,
        rx,
        config.write_timeout,
        config.max_frame_bytes,
    ));
    debug!(event = "broker_connection_accepted", conn_id);

    let mut decoder = NdjsonFrameDecoder::<Inbound>::new(config.max_frame_bytes);
    let mut instance_id: Option<String> = None;
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    let status = loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            status = connection.wait_closed() => break status,
        };
        let report = match read {
            Ok(0) => {
                let tail = decoder.finish();
                dispatch_report(&broker, &connection, &mut instance_id, tail).await;
                break LinkStatus::Closed;
            }
            Ok(n) => decoder.push_chunk(&buf[..n]),
            Err(err) => break LinkStatus::Failed(err.to_string()),
        };
        dispatch_report(&broker, &connection, &mut instance_id, report).await;
    };
    connection.mark_closed(status.clone());

    if let Some(id) = instance_id.as_deref() {
        match broker.registry().drop_instance(id, conn_id).await {
            Some(instance) if instance.pending_exit => {
                info!(event = "broker_instance_disconnected", instance_id = %id, conn_id, expected = true);
            }
            Some(_) => match &status {
                LinkStatus::Failed(reason) => warn!(
                    event = "broker_instance_lost",
                    instance_id = %id,
                    conn_id,
                    reason = %reason
                ),
                _ => warn!(
                    event = "broker_instance_disconnected",
                    instance_id = %id,
                    conn_id,
                    expected = false
                ),
            },
            None => {
                debug!(event = "broker_instance_already_dropped", instance_id = %id, conn_id);
            }
        }
    }

    let _ = writer_task.await;
}

#[cfg(unix)]
async fn dispatch_report(
    broker: &Broker,
    connection: &Arc<EditorConnection>,
    instance_id: &mut Option<String>,
    report: vimlink_core::DecodeReport<Inbound>,
) {
    let conn_id = connection.conn_id();
    for err in report.errors {
        warn!(event = "broker_decode_error", conn_id, error = %err);
    }
    for message in report.frames {
        match message {
            Inbound::Event(EditorEvent::Register {
                instance_id: id,
                info,
            }) => {
                if let Some(previous) = instance_id.as_deref().filter(|prev| *prev != id) {
                    // same connection announcing a new identity
                    broker.registry().drop_instance(previous, conn_id).await;
                }
                broker
                    .registry()
                    .register(&id, info, connection.clone())
                    .await;
                let ack = Outbound::Ack(BrokerEvent::Registered {
                    instance_id: id.clone(),
                });
                if let Err(err) = connection.send(ack).await {
                    warn!(event = "broker_ack_failed", instance_id = %id, conn_id, error = %err);
                }
                *instance_id = Some(id);
            }
            Inbound::Event(EditorEvent::StateUpdate { state }) => {
                let Some(id) = instance_id.as_deref() else {
                    debug!(event = "broker_state_before_register", conn_id);
                    continue;
                };
                debug!(event = "broker_state_pushed", instance_id = %id, conn_id);
                broker.registry().record_state(id, conn_id, state).await;
            }
            Inbound::Reply(reply) => {
                connection.deliver(reply);
            }
        }
    }
}

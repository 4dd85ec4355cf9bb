//! Serves a [`Channel`] to other local processes over a Unix socket.

use crate::channel::{Channel, ChannelError};
use eds_core::channel_ipc::{
    decode_frame, encode_frame, AckPayload, ChannelEnvelope, ChannelMsg, DeletedPayload,
    ErrorPayload, ValuePayload, WatchPayload, DEFAULT_MAX_FRAME_BYTES, ERROR_CHANNEL_UNAVAILABLE,
    ERROR_UNEXPECTED_MESSAGE, ERROR_UNSUPPORTED_VERSION, ERROR_VALUE_TOO_LARGE,
};
use std::{
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};
#[cfg(unix)]
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixListener, UnixStream,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{broadcast, mpsc, watch},
};
use tracing::{debug, info, warn};

const HOST_SENDER_ID: &str = "eds-server";

#[derive(Clone, Debug)]
pub struct ChannelHostConfig {
    pub socket_path: PathBuf,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl ChannelHostConfig {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            write_timeout: Duration::from_secs(2),
            queue_capacity: 64,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[cfg(unix)]
pub struct ChannelHost {
    config: ChannelHostConfig,
    listener: UnixListener,
    channel: Arc<dyn Channel>,
    conn_counter: Arc<AtomicU64>,
}

#[cfg(unix)]
impl ChannelHost {
    /// Binds the socket. A socket that still accepts connections belongs to
    /// a live server and is left alone; a dead one is replaced.
    pub async fn bind(config: ChannelHostConfig, channel: Arc<dyn Channel>) -> io::Result<Self> {
        if let Some(parent) = config.socket_path.parent() {
            fs::create_dir_all(parent)?;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }

        if config.socket_path.exists() {
            if UnixStream::connect(&config.socket_path).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!(
                        "another server is listening on {}",
                        config.socket_path.display()
                    ),
                ));
            }
            warn!(event = "channel_host_stale_socket", socket = %config.socket_path.display());
            let _ = fs::remove_file(&config.socket_path);
        }

        let listener = UnixListener::bind(&config.socket_path)?;
        let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600));

        info!(
            event = "channel_host_start",
            socket = %config.socket_path.display(),
            queue_capacity = config.queue_capacity
        );
        Ok(Self {
            config,
            listener,
            channel,
            conn_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.config.socket_path
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, _addr)) => {
                            let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
                            let conn = Connection {
                                conn_id: format!("channel-conn-{id}"),
                                config: self.config.clone(),
                                channel: self.channel.clone(),
                            };
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                conn.run(stream, shutdown).await;
                            });
                        }
                        Err(err) => {
                            warn!(event = "channel_host_accept_error", error = %err);
                        }
                    }
                }
            }
        }

        let _ = fs::remove_file(&self.config.socket_path);
        info!(event = "channel_host_stop", socket = %self.config.socket_path.display());
        Ok(())
    }
}

#[cfg(unix)]
struct Connection {
    conn_id: String,
    config: ChannelHostConfig,
    channel: Arc<dyn Channel>,
}

#[cfg(unix)]
impl Connection {
    async fn run(self, stream: UnixStream, mut shutdown: watch::Receiver<bool>) {
        let (reader_half, writer_half) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        let (tx, rx) = mpsc::channel::<ChannelEnvelope>(self.config.queue_capacity);
        let (overflow_tx, mut overflow_rx) = watch::channel(false);
        let conn_for_writer = self.conn_id.clone();
        let write_timeout = self.config.write_timeout;
        let max_frame_bytes = self.config.max_frame_bytes;
        let writer_task = tokio::spawn(async move {
            writer_loop(conn_for_writer, writer_half, rx, write_timeout, max_frame_bytes).await;
        });
        let mut forwarder: Option<tokio::task::JoinHandle<()>> = None;

        debug!(event = "channel_conn_open", conn_id = %self.conn_id);
        loop {
            let envelope = tokio::select! {
                frame = read_next_valid_frame(&mut reader, max_frame_bytes) => frame,
                _ = overflow_rx.changed() => {
                    warn!(event = "channel_conn_queue_full", conn_id = %self.conn_id);
                    break;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let Some(envelope) = envelope else {
                break;
            };

            let request_id = envelope.request_id.clone();
            let reply = if !envelope.version.is_supported() {
                warn!(
                    event = "channel_conn_unsupported_version",
                    conn_id = %self.conn_id,
                    version = envelope.version.0
                );
                error_msg(
                    ERROR_UNSUPPORTED_VERSION,
                    format!("protocol version {} is not supported", envelope.version.0),
                )
            } else if let ChannelMsg::Watch(payload) = envelope.msg {
                if let Some(previous) = forwarder.take() {
                    previous.abort();
                }
                let events = self.channel.subscribe();
                forwarder = Some(tokio::spawn(forward_events(
                    self.conn_id.clone(),
                    events,
                    payload,
                    tx.clone(),
                    overflow_tx.clone(),
                )));
                ChannelMsg::Ack(AckPayload { slot: None })
            } else {
                self.apply(envelope.msg)
            };

            let response = ChannelEnvelope::new(HOST_SENDER_ID, request_id, reply);
            if tx.send(response).await.is_err() {
                break;
            }
        }

        if let Some(task) = forwarder.take() {
            task.abort();
        }
        drop(tx);
        let _ = writer_task.await;
        debug!(event = "channel_conn_closed", conn_id = %self.conn_id);
    }

    fn apply(&self, msg: ChannelMsg) -> ChannelMsg {
        let result = match msg {
            ChannelMsg::Write(payload) => self
                .channel
                .write(&payload.slot, &payload.value)
                .map(|()| ChannelMsg::Ack(AckPayload {
                    slot: Some(payload.slot),
                })),
            ChannelMsg::Read(payload) => self.channel.read(&payload.slot).map(|value| {
                ChannelMsg::Value(ValuePayload {
                    slot: payload.slot,
                    value,
                })
            }),
            ChannelMsg::ReadAndClear(payload) => {
                self.channel.read_and_clear(&payload.slot).map(|value| {
                    ChannelMsg::Value(ValuePayload {
                        slot: payload.slot,
                        value,
                    })
                })
            }
            ChannelMsg::Delete(payload) => self.channel.delete(&payload.slot).map(|existed| {
                ChannelMsg::Deleted(DeletedPayload {
                    slot: payload.slot,
                    existed,
                })
            }),
            other => {
                warn!(event = "channel_conn_unexpected_message", conn_id = %self.conn_id);
                return error_msg(
                    ERROR_UNEXPECTED_MESSAGE,
                    format!("{} is not a request", msg_kind(&other)),
                );
            }
        };

        result.unwrap_or_else(|err| {
            let code = match err {
                ChannelError::Unavailable(_) => ERROR_CHANNEL_UNAVAILABLE,
                ChannelError::ValueTooLarge { .. } => ERROR_VALUE_TOO_LARGE,
            };
            warn!(event = "channel_conn_op_error", conn_id = %self.conn_id, error = %err);
            error_msg(code, err.to_string())
        })
    }
}

fn error_msg(code: &str, message: String) -> ChannelMsg {
    ChannelMsg::Error(ErrorPayload {
        code: code.to_string(),
        message,
    })
}

fn msg_kind(msg: &ChannelMsg) -> &'static str {
    match msg {
        ChannelMsg::Write(_) => "write",
        ChannelMsg::Read(_) => "read",
        ChannelMsg::ReadAndClear(_) => "read_and_clear",
        ChannelMsg::Delete(_) => "delete",
        ChannelMsg::Watch(_) => "watch",
        ChannelMsg::Ack(_) => "ack",
        ChannelMsg::Value(_) => "value",
        ChannelMsg::Deleted(_) => "deleted",
        ChannelMsg::Event(_) => "event",
        ChannelMsg::Error(_) => "error",
    }
}

#[cfg(unix)]
async fn forward_events(
    conn_id: String,
    mut events: broadcast::Receiver<eds_core::channel_ipc::SlotEvent>,
    filter: WatchPayload,
    tx: mpsc::Sender<ChannelEnvelope>,
    overflow: watch::Sender<bool>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(event = "channel_conn_events_lagged", conn_id = %conn_id, skipped);
                let _ = overflow.send(true);
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if !filter.matches(&event.slot) {
            continue;
        }
        let envelope = ChannelEnvelope::new(HOST_SENDER_ID, None, ChannelMsg::Event(event));
        match tx.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = overflow.send(true);
                return;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

#[cfg(unix)]
async fn writer_loop(
    conn_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ChannelEnvelope>,
    write_timeout: Duration,
    max_frame_bytes: usize,
) {
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_frame(&envelope, max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "channel_conn_encode_error", conn_id = %conn_id, error = %err);
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
                debug!(event = "channel_conn_write_error", conn_id = %conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "channel_conn_write_timeout", conn_id = %conn_id);
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn read_next_valid_frame(
    reader: &mut BufReader<OwnedReadHalf>,
    max_frame_bytes: usize,
) -> Option<ChannelEnvelope> {
    loop {
        let mut line = Vec::new();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "channel_conn_read_error", error = %err);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match decode_frame::<ChannelEnvelope>(&line, max_frame_bytes) {
            Ok(envelope) => return Some(envelope),
            Err(err) => {
                warn!(event = "channel_conn_decode_error", error = %err);
                continue;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use eds_core::channel_ipc::{ProtocolVersion, SlotChange, SlotPayload, WritePayload};
    use eds_core::SlotName;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn test_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("eds-channel-host-test-{name}-{nanos}"))
            .join("channel.sock")
    }

    async fn wait_for_socket(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("socket did not appear: {}", path.display());
    }

    async fn launch_host(
        name: &str,
    ) -> (
        PathBuf,
        Arc<MemoryChannel>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<io::Result<()>>,
    ) {
        let path = test_path(name);
        let channel = Arc::new(MemoryChannel::default());
        let mut config = ChannelHostConfig::new(path.clone());
        config.write_timeout = Duration::from_secs(1);
        let host = ChannelHost::bind(config, channel.clone())
            .await
            .expect("bind host");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(host.serve(rx));
        wait_for_socket(&path).await;
        (path, channel, tx, handle)
    }

    async fn connect(path: &Path) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = UnixStream::connect(path)
            .await
            .unwrap_or_else(|err| panic!("connect failed: {err}"));
        let (reader, writer) = stream.into_split();
        (BufReader::new(reader), writer)
    }

    async fn send(writer: &mut OwnedWriteHalf, request_id: &str, msg: ChannelMsg) {
        let envelope = ChannelEnvelope::new("test-client", Some(request_id.to_string()), msg);
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        writer.write_all(&frame).await.expect("write");
        writer.flush().await.expect("flush");
    }

    async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> ChannelEnvelope {
        let mut line = Vec::new();
        let read =
            tokio::time::timeout(Duration::from_secs(3), reader.read_until(b'\n', &mut line))
                .await
                .expect("read timeout")
                .expect("read error");
        assert!(read > 0, "unexpected EOF");
        decode_frame(&line, DEFAULT_MAX_FRAME_BYTES).expect("decode")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_read_and_clear_round_trip() {
        let (path, channel, shutdown, handle) = launch_host("rw").await;
        let (mut reader, mut writer) = connect(&path).await;
        let slot = SlotName::from("NEDIT_SERVER_REQUEST_box_alice_");

        send(
            &mut writer,
            "req-1",
            ChannelMsg::Write(WritePayload {
                slot: slot.clone(),
                value: b"payload".to_vec(),
            }),
        )
        .await;
        let ack = read_frame(&mut reader).await;
        assert_eq!(ack.request_id.as_deref(), Some("req-1"));
        assert!(matches!(ack.msg, ChannelMsg::Ack(_)));
        assert_eq!(channel.read(&slot).expect("read"), Some(b"payload".to_vec()));

        send(
            &mut writer,
            "req-2",
            ChannelMsg::ReadAndClear(SlotPayload { slot: slot.clone() }),
        )
        .await;
        let value = read_frame(&mut reader).await;
        match value.msg {
            ChannelMsg::Value(payload) => assert_eq!(payload.value, Some(b"payload".to_vec())),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(!channel.exists(&slot).expect("exists"));

        let _ = shutdown.send(true);
        handle.await.expect("join").expect("serve");
        assert!(!path.exists(), "socket file should be removed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watchers_receive_filtered_events_after_ack() {
        let (path, channel, shutdown, handle) = launch_host("watch").await;
        let (mut reader, mut writer) = connect(&path).await;

        send(
            &mut writer,
            "watch-1",
            ChannelMsg::Watch(WatchPayload {
                prefixes: vec!["NEDIT_FILE_".to_string()],
            }),
        )
        .await;
        let ack = read_frame(&mut reader).await;
        assert!(matches!(ack.msg, ChannelMsg::Ack(_)));

        channel
            .write(&SlotName::from("NEDIT_SERVER_REQUEST_x"), b"ignored")
            .expect("write");
        let file_slot = SlotName::from("NEDIT_FILE_x_/a_WF_OPEN");
        channel.write(&file_slot, b"True").expect("write");
        channel.delete(&file_slot).expect("delete");

        let first = read_frame(&mut reader).await;
        let second = read_frame(&mut reader).await;
        match (first.msg, second.msg) {
            (ChannelMsg::Event(a), ChannelMsg::Event(b)) => {
                assert_eq!(a.slot, file_slot);
                assert_eq!(a.change, SlotChange::NewValue);
                assert_eq!(b.change, SlotChange::Deleted);
            }
            other => panic!("unexpected messages: {other:?}"),
        }

        let _ = shutdown.send(true);
        handle.await.expect("join").expect("serve");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn newer_protocol_versions_are_rejected() {
        let (path, _channel, shutdown, handle) = launch_host("version").await;
        let (mut reader, mut writer) = connect(&path).await;

        let mut envelope = ChannelEnvelope::new(
            "test-client",
            Some("req-9".to_string()),
            ChannelMsg::Read(SlotPayload {
                slot: SlotName::from("S"),
            }),
        );
        envelope.version = ProtocolVersion(99);
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        writer.write_all(&frame).await.expect("write");

        let reply = read_frame(&mut reader).await;
        assert_eq!(reply.request_id.as_deref(), Some("req-9"));
        match reply.msg {
            ChannelMsg::Error(payload) => assert_eq!(payload.code, ERROR_UNSUPPORTED_VERSION),
            other => panic!("unexpected message: {other:?}"),
        }

        let _ = shutdown.send(true);
        handle.await.expect("join").expect("serve");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_lines_are_skipped() {
        let (path, _channel, shutdown, handle) = launch_host("malformed").await;
        let (mut reader, mut writer) = connect(&path).await;

        writer.write_all(b"{not json\n\n").await.expect("write");
        send(
            &mut writer,
            "req-3",
            ChannelMsg::Delete(SlotPayload {
                slot: SlotName::from("missing"),
            }),
        )
        .await;
        let reply = read_frame(&mut reader).await;
        match reply.msg {
            ChannelMsg::Deleted(payload) => assert!(!payload.existed),
            other => panic!("unexpected message: {other:?}"),
        }

        let _ = shutdown.send(true);
        handle.await.expect("join").expect("serve");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_socket_refuses_second_bind_and_stale_socket_is_replaced() {
        let (path, _channel, shutdown, handle) = launch_host("addr-in-use").await;
        let err = ChannelHost::bind(
            ChannelHostConfig::new(path.clone()),
            Arc::new(MemoryChannel::default()),
        )
        .await
        .err()
        .expect("second bind must fail");
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        let _ = shutdown.send(true);
        handle.await.expect("join").expect("serve");

        std::fs::write(&path, b"").expect("stale file");
        let host = ChannelHost::bind(
            ChannelHostConfig::new(path.clone()),
            Arc::new(MemoryChannel::default()),
        )
        .await
        .expect("stale socket replaced");
        drop(host);
        let _ = std::fs::remove_file(&path);
    }
}

//! Client side of the channel host socket.

use eds_core::channel_ipc::{
    decode_frame, encode_frame, new_request_id, new_sender_id, ChannelEnvelope, ChannelMsg,
    SlotEvent, SlotPayload, WatchPayload, WritePayload, DEFAULT_MAX_FRAME_BYTES,
};
use eds_core::SlotName;
use std::{io, path::Path};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("channel connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("channel frame error: {0}")]
    Frame(#[from] eds_core::channel_ipc::FrameError),
    #[error("channel closed the connection")]
    Closed,
    #[error("channel refused the request: {code}: {message}")]
    Refused { code: String, message: String },
    #[error("unexpected channel reply: {0}")]
    Unexpected(String),
}

struct FrameStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    sender_id: String,
    // Survives a cancelled read so the next call resumes mid-line.
    pending: Vec<u8>,
}

impl FrameStream {
    async fn connect(socket_path: &Path) -> Result<Self, RemoteError> {
        let stream = UnixStream::connect(socket_path).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            sender_id: new_sender_id("eds-cli"),
            pending: Vec::new(),
        })
    }

    async fn send(&mut self, msg: ChannelMsg) -> Result<String, RemoteError> {
        let request_id = new_request_id();
        let envelope = ChannelEnvelope::new(&self.sender_id, Some(request_id.clone()), msg);
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(request_id)
    }

    async fn next(&mut self) -> Result<ChannelEnvelope, RemoteError> {
        loop {
            let n = self.reader.read_until(b'\n', &mut self.pending).await?;
            if n == 0 {
                return Err(RemoteError::Closed);
            }
            let line = std::mem::take(&mut self.pending);
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            match decode_frame::<ChannelEnvelope>(&line, DEFAULT_MAX_FRAME_BYTES) {
                Ok(envelope) => return Ok(envelope),
                Err(err) => warn!(event = "remote_decode_error", error = %err),
            }
        }
    }

    /// Sends `msg` and waits for the reply carrying the same request id.
    async fn request(&mut self, msg: ChannelMsg) -> Result<ChannelMsg, RemoteError> {
        let request_id = self.send(msg).await?;
        loop {
            let envelope = self.next().await?;
            if envelope.request_id.as_deref() != Some(request_id.as_str()) {
                debug!(event = "remote_skip_frame", request_id = ?envelope.request_id);
                continue;
            }
            return match envelope.msg {
                ChannelMsg::Error(payload) => Err(RemoteError::Refused {
                    code: payload.code,
                    message: payload.message,
                }),
                other => Ok(other),
            };
        }
    }
}

/// Request/response connection to a running server's slot store.
pub struct RemoteChannel {
    stream: FrameStream,
}

impl RemoteChannel {
    pub async fn connect(socket_path: &Path) -> Result<Self, RemoteError> {
        Ok(Self {
            stream: FrameStream::connect(socket_path).await?,
        })
    }

    pub async fn write(&mut self, slot: &SlotName, value: &[u8]) -> Result<(), RemoteError> {
        let reply = self
            .stream
            .request(ChannelMsg::Write(WritePayload {
                slot: slot.clone(),
                value: value.to_vec(),
            }))
            .await?;
        match reply {
            ChannelMsg::Ack(_) => Ok(()),
            other => Err(RemoteError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn read(&mut self, slot: &SlotName) -> Result<Option<Vec<u8>>, RemoteError> {
        let reply = self
            .stream
            .request(ChannelMsg::Read(SlotPayload { slot: slot.clone() }))
            .await?;
        match reply {
            ChannelMsg::Value(payload) => Ok(payload.value),
            other => Err(RemoteError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn exists(&mut self, slot: &SlotName) -> Result<bool, RemoteError> {
        Ok(self.read(slot).await?.is_some())
    }

    pub async fn delete(&mut self, slot: &SlotName) -> Result<bool, RemoteError> {
        let reply = self
            .stream
            .request(ChannelMsg::Delete(SlotPayload { slot: slot.clone() }))
            .await?;
        match reply {
            ChannelMsg::Deleted(payload) => Ok(payload.existed),
            other => Err(RemoteError::Unexpected(format!("{other:?}"))),
        }
    }
}

/// Separate connection that only receives slot events.
pub struct SlotWatcher {
    stream: FrameStream,
}

impl SlotWatcher {
    /// Returns once the server confirmed the subscription, so every change
    /// made afterwards is delivered.
    pub async fn open(socket_path: &Path, prefixes: Vec<String>) -> Result<Self, RemoteError> {
        let mut stream = FrameStream::connect(socket_path).await?;
        match stream
            .request(ChannelMsg::Watch(WatchPayload { prefixes }))
            .await?
        {
            ChannelMsg::Ack(_) => Ok(Self { stream }),
            other => Err(RemoteError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Next slot event; `None` once the server has gone away.
    pub async fn next_event(&mut self) -> Option<SlotEvent> {
        loop {
            match self.stream.next().await {
                Ok(ChannelEnvelope {
                    msg: ChannelMsg::Event(event),
                    ..
                }) => return Some(event),
                Ok(_) => continue,
                Err(RemoteError::Closed) => return None,
                Err(err) => {
                    warn!(event = "watch_read_error", error = %err);
                    return None;
                }
            }
        }
    }
}

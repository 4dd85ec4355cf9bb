//! Hands a request to a running server and waits for its files.

use crate::items::CommandLineRequest;
use crate::remote::{RemoteChannel, RemoteError, SlotWatcher};
use eds_core::channel_ipc::SlotChange;
use eds_core::paths::path_from_bytes;
use eds_core::slots::FILE_PENDING_VALUE;
use eds_core::{encode_batch, ServerIdentity, SlotName};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub socket_path: PathBuf,
    pub identity: ServerIdentity,
    /// How long the server gets to pick up the request. Waiting for files
    /// uses three times this.
    pub timeout: Duration,
    pub wait_for_close: bool,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no server is running")]
    NoServer,
    #[error("the server did not respond to the request")]
    NoResponse,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub opened: Vec<PathBuf>,
    pub closed: Vec<PathBuf>,
    /// Files still outstanding when waiting stopped.
    pub pending: Vec<PathBuf>,
    pub server_gone: bool,
    pub timed_out: bool,
}

struct FileWait {
    path: PathBuf,
    opened_slot: SlotName,
    closed_slot: Option<SlotName>,
    opened: bool,
    closed: bool,
}

impl FileWait {
    fn new(identity: &ServerIdentity, path: &[u8], wait_for_close: bool) -> Self {
        Self {
            path: path_from_bytes(path),
            opened_slot: identity.file_opened_slot(path),
            closed_slot: wait_for_close.then(|| identity.file_closed_slot(path)),
            opened: false,
            closed: false,
        }
    }

    fn is_done(&self) -> bool {
        self.opened && (self.closed_slot.is_none() || self.closed)
    }
}

enum Deletion {
    Opened,
    Closed,
    Other,
}

fn note_deletion(waits: &mut [FileWait], outcome: &mut SubmitOutcome, slot: &SlotName) -> Deletion {
    for wait in waits.iter_mut() {
        if !wait.opened && *slot == wait.opened_slot {
            wait.opened = true;
            outcome.opened.push(wait.path.clone());
            debug!(event = "file_opened", path = %wait.path.display());
            return Deletion::Opened;
        }
        if !wait.closed && wait.closed_slot.as_ref() == Some(slot) {
            wait.closed = true;
            outcome.closed.push(wait.path.clone());
            debug!(event = "file_closed", path = %wait.path.display());
            return Deletion::Closed;
        }
    }
    Deletion::Other
}

pub async fn submit(
    request: &CommandLineRequest,
    options: &SubmitOptions,
) -> Result<SubmitOutcome, SubmitError> {
    let identity = &options.identity;
    let mut remote = match RemoteChannel::connect(&options.socket_path).await {
        Ok(remote) => remote,
        Err(err) => {
            debug!(
                event = "server_connect_failed",
                socket = %options.socket_path.display(),
                error = %err
            );
            return Err(SubmitError::NoServer);
        }
    };
    if !remote.exists(&identity.presence_slot()).await? {
        return Err(SubmitError::NoServer);
    }

    let request_slot = identity.request_slot();
    let mut watcher = SlotWatcher::open(
        &options.socket_path,
        vec![
            request_slot.to_string(),
            identity.file_slot_prefix(),
        ],
    )
    .await?;

    let mut waits = Vec::with_capacity(request.files.len());
    for path in &request.files {
        let wait = FileWait::new(identity, path, options.wait_for_close);
        remote.write(&wait.opened_slot, FILE_PENDING_VALUE).await?;
        if let Some(closed_slot) = &wait.closed_slot {
            remote.write(closed_slot, FILE_PENDING_VALUE).await?;
        }
        waits.push(wait);
    }

    remote
        .write(&request_slot, &encode_batch(&request.batch))
        .await?;
    info!(
        event = "request_sent",
        records = request.batch.len(),
        files = waits.len()
    );

    let mut outcome = SubmitOutcome::default();
    let request_deadline = Instant::now() + options.timeout;
    loop {
        match timeout_at(request_deadline, watcher.next_event()).await {
            Ok(Some(event)) if event.change == SlotChange::Deleted => {
                if event.slot == request_slot {
                    break;
                }
                note_deletion(&mut waits, &mut outcome, &event.slot);
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return Err(SubmitError::NoResponse),
        }
    }
    debug!(event = "request_taken");

    let open_timeout = options.timeout * 3;
    let mut open_deadline = Instant::now() + open_timeout;
    while !waits.iter().all(FileWait::is_done) {
        let waiting_for_open = !outcome.timed_out && waits.iter().any(|wait| !wait.opened);
        let next = if waiting_for_open {
            match timeout_at(open_deadline, watcher.next_event()).await {
                Ok(next) => next,
                Err(_) => {
                    outcome.timed_out = true;
                    warn!(
                        event = "file_open_timeout",
                        waiting = waits.iter().filter(|wait| !wait.opened).count()
                    );
                    if options.wait_for_close {
                        continue;
                    }
                    break;
                }
            }
        } else {
            watcher.next_event().await
        };

        let Some(event) = next else {
            outcome.server_gone = true;
            warn!(event = "server_gone_while_waiting");
            break;
        };
        if event.change != SlotChange::Deleted {
            continue;
        }
        if let Deletion::Opened = note_deletion(&mut waits, &mut outcome, &event.slot) {
            open_deadline = Instant::now() + open_timeout;
        }
    }

    outcome.pending = waits
        .into_iter()
        .filter(|wait| !wait.is_done())
        .map(|wait| wait.path)
        .collect();
    Ok(outcome)
}

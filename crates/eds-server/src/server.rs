use crate::channel::{Channel, MemoryChannel, DEFAULT_MAX_SLOT_BYTES};
#[cfg(unix)]
use crate::channel_host::{ChannelHost, ChannelHostConfig};
use crate::dispatcher::Dispatcher;
use crate::registry::{DesktopId, DocumentRegistry, MacroEngine};
use crate::workspace::{LoggingMacroEngine, Workspace};
use anyhow::Context;
use eds_core::channel_ipc::DEFAULT_MAX_FRAME_BYTES;
use eds_core::ServerIdentity;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{info, warn};

/// Time given to watch connections to flush the final slot deletions.
const SHUTDOWN_FLUSH_GRACE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub identity: ServerIdentity,
    pub socket_path: PathBuf,
    pub open_in_tab: bool,
    pub desktop: Option<DesktopId>,
    pub cwd: PathBuf,
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    pub max_slot_bytes: usize,
}

impl ServerConfig {
    pub fn new(identity: ServerIdentity, socket_path: PathBuf) -> Self {
        Self {
            identity,
            socket_path,
            open_in_tab: true,
            desktop: None,
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            queue_capacity: 64,
            write_timeout: Duration::from_secs(2),
            max_slot_bytes: DEFAULT_MAX_SLOT_BYTES,
        }
    }
}

/// Runs a server backed by the headless workspace until `shutdown` flips.
pub async fn run(
    config: ServerConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(Workspace, LoggingMacroEngine)> {
    let workspace = Workspace::new(config.open_in_tab, config.desktop);
    run_with(config, workspace, LoggingMacroEngine::default(), shutdown).await
}

#[cfg(unix)]
pub async fn run_with<R, M>(
    config: ServerConfig,
    registry: R,
    macros: M,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(R, M)>
where
    R: DocumentRegistry,
    M: MacroEngine,
{
    let channel: Arc<dyn Channel> = Arc::new(MemoryChannel::new(config.max_slot_bytes));
    // Subscribed before anything is advertised so no request can slip by.
    let mut events = channel.subscribe();

    let host = ChannelHost::bind(
        ChannelHostConfig {
            socket_path: config.socket_path.clone(),
            write_timeout: config.write_timeout,
            queue_capacity: config.queue_capacity,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        },
        channel.clone(),
    )
    .await
    .with_context(|| format!("binding {}", config.socket_path.display()))?;

    let mut dispatcher = Dispatcher::new(
        config.identity.clone(),
        channel.clone(),
        registry,
        macros,
        config.cwd.clone(),
    );
    dispatcher
        .start()
        .context("advertising server presence")?;

    let (host_shutdown_tx, host_shutdown_rx) = watch::channel(false);
    let host_task = tokio::spawn(host.serve(host_shutdown_rx));

    info!(
        event = "server_start",
        host = %config.identity.host,
        user = %config.identity.user,
        server_name = %config.identity.server_name,
        socket = %config.socket_path.display()
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    dispatcher.handle_event(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = "server_events_lagged", skipped);
                    dispatcher.resync();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    dispatcher.shutdown();
    tokio::time::sleep(SHUTDOWN_FLUSH_GRACE).await;
    let _ = host_shutdown_tx.send(true);
    match host_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(event = "channel_host_error", error = %err),
        Err(err) => warn!(event = "channel_host_join_error", error = %err),
    }

    info!(event = "server_stop", server_name = %config.identity.server_name);
    Ok(dispatcher.into_parts())
}

#[cfg(not(unix))]
pub async fn run_with<R, M>(
    _config: ServerConfig,
    _registry: R,
    _macros: M,
    _shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(R, M)>
where
    R: DocumentRegistry,
    M: MacroEngine,
{
    anyhow::bail!("the edit server needs Unix domain sockets")
}

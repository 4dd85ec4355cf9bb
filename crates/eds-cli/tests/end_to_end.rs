#![cfg(unix)]

use eds_cli::items::parse_items;
use eds_cli::remote::RemoteChannel;
use eds_cli::submit::{submit, SubmitError, SubmitOptions};
use eds_core::slots::PRESENCE_VALUE;
use eds_core::ServerIdentity;
use eds_server::channel_host::{ChannelHost, ChannelHostConfig};
use eds_server::{
    Channel, DocumentRegistry, LoggingMacroEngine, MemoryChannel, ServerConfig, Workspace,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn test_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir()
        .join(format!("eds-cli-test-{name}-{nanos}"))
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

fn identity() -> ServerIdentity {
    ServerIdentity::new("testbox", "tester", "e2e")
}

struct RunningServer {
    socket: PathBuf,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<(Workspace, LoggingMacroEngine)>>,
}

impl RunningServer {
    async fn start(name: &str) -> Self {
        let socket = test_path(name);
        let mut config = ServerConfig::new(identity(), socket.clone());
        config.cwd = PathBuf::from("/srv");
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(eds_server::run(config, rx));
        wait_for_socket(&socket).await;
        Self {
            socket,
            shutdown,
            handle,
        }
    }

    fn options(&self, wait_for_close: bool) -> SubmitOptions {
        SubmitOptions {
            socket_path: self.socket.clone(),
            identity: identity(),
            timeout: Duration::from_secs(2),
            wait_for_close,
        }
    }

    async fn stop(self) -> (Workspace, LoggingMacroEngine) {
        let _ = self.shutdown.send(true);
        let parts = tokio::time::timeout(Duration::from_secs(3), self.handle)
            .await
            .expect("server stop timeout")
            .expect("server join")
            .expect("server run");
        assert!(!self.socket.exists(), "socket removed on shutdown");
        parts
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn opens_files_and_raises_the_last() {
    let server = RunningServer::start("open").await;
    let parsed = parse_items(&["+3", "notes.txt", "/etc/hosts"], Path::new("/home/tester"))
        .expect("items");

    let outcome = submit(&parsed.request, &server.options(false))
        .await
        .expect("submit");
    assert_eq!(
        outcome.opened,
        vec![
            PathBuf::from("/home/tester/notes.txt"),
            PathBuf::from("/etc/hosts")
        ]
    );
    assert!(outcome.pending.is_empty());
    assert!(!outcome.timed_out);

    let (workspace, _) = server.stop().await;
    let hosts = workspace.find_by_path(Path::new("/etc/hosts")).expect("hosts open");
    assert!(workspace.find_by_path(Path::new("/home/tester/notes.txt")).is_some());
    assert_eq!(workspace.focused(), Some(hosts));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leftover_macro_runs_on_an_open_document() {
    let server = RunningServer::start("macro").await;
    let parsed = parse_items(&["a.txt", "-do", "save()"], Path::new("/work")).expect("items");

    submit(&parsed.request, &server.options(false))
        .await
        .expect("submit");

    let (workspace, macros) = server.stop().await;
    let doc = workspace.find_by_path(Path::new("/work/a.txt")).expect("a open");
    assert_eq!(macros.history().len(), 1);
    assert_eq!(macros.history()[0].doc, doc);
    assert_eq!(macros.history()[0].command, "save()");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_returns_when_the_server_closes_files() {
    let server = RunningServer::start("wait").await;
    let parsed = parse_items(&["/tmp/waited.txt"], Path::new("/")).expect("items");
    let options = server.options(true);
    let client = tokio::spawn(async move { submit(&parsed.request, &options).await });

    // Once the open slot is gone only the close is outstanding.
    let mut observer = RemoteChannel::connect(&server.socket).await.expect("observer");
    let opened_slot = identity().file_opened_slot("/tmp/waited.txt");
    let closed_slot = identity().file_closed_slot("/tmp/waited.txt");
    let mut opened = false;
    for _ in 0..100 {
        if observer.exists(&closed_slot).await.expect("read")
            && !observer.exists(&opened_slot).await.expect("read")
        {
            opened = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(opened, "file was never opened");
    assert!(!client.is_finished(), "client still waits for the close");
    drop(observer);

    server.stop().await;
    let outcome = tokio::time::timeout(Duration::from_secs(3), client)
        .await
        .expect("client timeout")
        .expect("client join")
        .expect("submit");
    assert_eq!(outcome.opened, vec![PathBuf::from("/tmp/waited.txt")]);
    assert_eq!(outcome.closed, vec![PathBuf::from("/tmp/waited.txt")]);
    assert!(outcome.pending.is_empty());
}

#[tokio::test]
async fn missing_socket_means_no_server() {
    let parsed = parse_items(&["a.txt"], Path::new("/work")).expect("items");
    let options = SubmitOptions {
        socket_path: test_path("absent"),
        identity: identity(),
        timeout: Duration::from_secs(1),
        wait_for_close: false,
    };
    let err = submit(&parsed.request, &options)
        .await
        .expect_err("no server");
    assert!(matches!(err, SubmitError::NoServer));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_request_times_out() {
    // A channel that advertises a server but never drains requests.
    let socket = test_path("silent");
    let channel = Arc::new(MemoryChannel::default());
    channel
        .write(&identity().presence_slot(), PRESENCE_VALUE)
        .expect("presence");
    let host = ChannelHost::bind(ChannelHostConfig::new(socket.clone()), channel.clone())
        .await
        .expect("bind");
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(host.serve(rx));
    wait_for_socket(&socket).await;

    let parsed = parse_items(&["a.txt"], Path::new("/work")).expect("items");
    let options = SubmitOptions {
        socket_path: socket.clone(),
        identity: identity(),
        timeout: Duration::from_secs(1),
        wait_for_close: false,
    };
    let err = submit(&parsed.request, &options)
        .await
        .expect_err("no response");
    assert!(matches!(err, SubmitError::NoResponse));
    assert!(channel
        .exists(&identity().request_slot())
        .expect("exists"));

    let _ = shutdown.send(true);
    let _ = handle.await;
}

use clap::Parser;
use eds_core::config::{env_true, resolve_log_dir, resolve_socket_path};
use eds_core::ServerIdentity;
use eds_server::{DesktopId, ServerConfig};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "eds-server", about = "Edit server: opens files on behalf of eds-cli")]
struct Args {
    /// Name distinguishing several servers of one user.
    #[arg(long)]
    server_name: Option<String>,
    #[arg(long)]
    socket: Option<String>,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    open_in_tab: bool,
    /// Desktop the headless workspace pretends to be on.
    #[arg(long)]
    desktop: Option<u32>,
    #[arg(long)]
    log_dir: Option<String>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 64)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = eds_server::channel::DEFAULT_MAX_SLOT_BYTES)]
    max_slot_bytes: usize,
}

struct Config {
    server: ServerConfig,
    debug: bool,
    log_dir: Option<PathBuf>,
}

fn load_config() -> Config {
    let args = Args::parse();
    let identity = ServerIdentity::resolve(args.server_name.as_deref());
    let socket_path = resolve_socket_path(args.socket.as_deref(), &identity);
    let mut server = ServerConfig::new(identity, socket_path);
    server.open_in_tab = args.open_in_tab;
    server.desktop = args.desktop.map(DesktopId);
    server.queue_capacity = args.queue_capacity.max(1);
    server.write_timeout = Duration::from_secs(args.write_timeout);
    server.max_slot_bytes = args.max_slot_bytes;
    Config {
        server,
        debug: args.debug || env_true("EDS_DEBUG"),
        log_dir: resolve_log_dir(args.log_dir.as_deref()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "server_signal", signal = "interrupt");
            let _ = shutdown_tx.send(true);
        }
    });

    match eds_server::run(config.server, shutdown_rx).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!(event = "server_error", error = %format!("{err:#}"));
            eprintln!("eds-server: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if let Ok(level) = std::env::var("EDS_LOG_LEVEL") {
        level
    } else if config.debug {
        "debug".to_string()
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let server_name = match config.server.identity.server_name.as_str() {
        "" => "default",
        name => name,
    };
    let writer = match open_log_file(config.log_dir.as_deref(), server_name) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("eds-server: log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Copies every log line to stdout and, when configured, the log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: Option<&Path>, server_name: &str) -> io::Result<LogGuard> {
    let Some(dir) = log_dir else {
        return Ok(LogGuard { file: None });
    };
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("eds-server-{server_name}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

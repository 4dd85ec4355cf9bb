use anyhow::{Context, Result};
use clap::Parser;
use eds_cli::items::{parse_items, ItemsError, USAGE};
use eds_cli::submit::{submit, SubmitError, SubmitOptions};
use eds_core::config::{clamp_timeout_secs, env_true, resolve_socket_path, DEFAULT_TIMEOUT_SECS};
use eds_core::ServerIdentity;
use std::{ffi::OsString, process::ExitCode, time::Duration};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "eds-cli")]
#[command(about = "Ask a running eds-server to open files", long_about = None)]
#[command(after_help = USAGE)]
struct Cli {
    #[arg(long)]
    server_name: Option<String>,
    #[arg(long)]
    socket: Option<String>,
    /// Seconds to wait for the server to take the request (1..=1000).
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,
    /// Return only after every file was closed again.
    #[arg(long, default_value_t = false)]
    wait: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Files and per-file options, in order.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    items: Vec<OsString>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug || env_true("EDS_DEBUG"));
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("eds-cli: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cwd = std::env::current_dir().context("reading the working directory")?;
    let items = restore_leading_separator(cli.items);
    let parsed = match parse_items(&items, &cwd) {
        Ok(parsed) => parsed,
        Err(err @ (ItemsError::UnknownOption(_) | ItemsError::MissingValue(_))) => {
            eprintln!("eds-cli: {err}\n{USAGE}");
            return Ok(ExitCode::from(2));
        }
        Err(err) => {
            eprintln!("eds-cli: {err}");
            return Ok(ExitCode::FAILURE);
        }
    };
    for warning in &parsed.warnings {
        eprintln!("eds-cli: {warning}");
    }

    let identity = ServerIdentity::resolve(cli.server_name.as_deref());
    let options = SubmitOptions {
        socket_path: resolve_socket_path(cli.socket.as_deref(), &identity),
        identity,
        timeout: Duration::from_secs(clamp_timeout_secs(cli.timeout)),
        wait_for_close: cli.wait,
    };

    let outcome = match submit(&parsed.request, &options).await {
        Ok(outcome) => outcome,
        Err(err @ (SubmitError::NoServer | SubmitError::NoResponse)) => {
            eprintln!("eds-cli: {err}");
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => return Err(err).context("submitting the request"),
    };

    if outcome.timed_out && !outcome.pending.is_empty() {
        eprintln!(
            "eds-cli: gave up waiting for {} file(s) to open",
            outcome.pending.len()
        );
    }
    if outcome.server_gone {
        eprintln!("eds-cli: the server went away while files were still open");
    }
    Ok(ExitCode::SUCCESS)
}

/// clap swallows a `--` in front of the first item; put it back so the
/// item parser still treats everything as file names.
fn restore_leading_separator(items: Vec<OsString>) -> Vec<OsString> {
    let given = std::env::args_os().skip(1).filter(|arg| arg == "--").count();
    let kept = items.iter().filter(|item| *item == "--").count();
    if given > kept {
        std::iter::once(OsString::from("--")).chain(items).collect()
    } else {
        items
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

use clap::Parser;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};
use vimlink_broker::{listener, Broker, BrokerConfig, FileStore};

const LOG_FILE_PREFIX: &str = "vimlink-broker";

#[derive(Parser, Debug)]
#[command(name = "vimlink-broker")]
struct Args {
    #[arg(long, default_value = "")]
    socket: String,
    #[arg(long, default_value = "")]
    state_dir: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Exit when stdin reaches EOF.
    #[arg(long, default_value_t = false)]
    watch_stdin: bool,
    #[arg(long, default_value_t = 2000)]
    request_timeout_ms: u64,
    #[arg(long, default_value_t = 3000)]
    help_timeout_ms: u64,
    #[arg(long, default_value_t = 2000)]
    exit_timeout_ms: u64,
    #[arg(long, default_value_t = 500)]
    settle_delay_ms: u64,
    #[arg(long, default_value_t = 2000)]
    write_timeout_ms: u64,
}

struct Settings {
    broker: BrokerConfig,
    debug: bool,
    log_dir: String,
    watch_stdin: bool,
}

#[tokio::main]
async fn main() {
    let settings = load_settings();
    init_logging(&settings);

    let store = Arc::new(FileStore::new(&settings.broker.state_dir));
    let broker = Arc::new(Broker::new(settings.broker.clone(), store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    info!(
        event = "broker_start",
        socket = %settings.broker.socket_path.display(),
        state_dir = %settings.broker.state_dir.display(),
        pid = std::process::id()
    );
    let mut server = tokio::spawn(listener::run(broker, shutdown_rx));

    let finished = tokio::select! {
        result = &mut server => Some(result),
        _ = shutdown_signal(settings.watch_stdin) => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            let _ = shutdown_tx.send(true);
            server.await
        }
    };
    match result {
        Ok(Ok(())) => info!(event = "broker_exit"),
        Ok(Err(err)) => {
            error!(event = "broker_error", error = %err);
            std::process::exit(1);
        }
        Err(err) => {
            error!(event = "broker_task_failed", error = %err);
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal(watch_stdin: bool) {
    let stdin_closed = async {
        if watch_stdin {
            wait_stdin_eof().await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = wait_for_signal() => {}
        _ = stdin_closed => info!(event = "broker_stdin_closed"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(term), Ok(hup)) => (term, hup),
        (Err(err), _) | (_, Err(err)) => {
            error!(event = "broker_signal_error", error = %err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!(event = "broker_signal", signal = "SIGINT"),
        _ = term.recv() => info!(event = "broker_signal", signal = "SIGTERM"),
        _ = hup.recv() => info!(event = "broker_signal", signal = "SIGHUP"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(event = "broker_signal", signal = "ctrl_c");
}

async fn wait_stdin_eof() {
    use tokio::io::AsyncReadExt;
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    while let Ok(read) = stdin.read(&mut buf).await {
        if read == 0 {
            break;
        }
    }
}

fn load_settings() -> Settings {
    let args = Args::parse();
    let debug = args.debug || env_true("VIMLINK_DEBUG");
    let broker = BrokerConfig {
        socket_path: PathBuf::from(resolve_path(
            &args.socket,
            "VIMLINK_SOCKET",
            vimlink_broker::config::DEFAULT_SOCKET_PATH,
        )),
        state_dir: PathBuf::from(resolve_path(
            &args.state_dir,
            "VIMLINK_STATE_DIR",
            vimlink_broker::config::DEFAULT_STATE_DIR,
        )),
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        help_timeout: Duration::from_millis(args.help_timeout_ms),
        exit_timeout: Duration::from_millis(args.exit_timeout_ms),
        settle_delay: Duration::from_millis(args.settle_delay_ms),
        write_timeout: Duration::from_millis(args.write_timeout_ms),
        ..BrokerConfig::default()
    };
    Settings {
        broker,
        debug,
        log_dir: resolve_path(&args.log_dir, "VIMLINK_LOG_DIR", ""),
        watch_stdin: args.watch_stdin,
    }
}

/// Stderr always, plus `<log_dir>/vimlink-broker-<socket>.log` when a log
/// directory is set. Stdout belongs to the dispatch layer.
fn init_logging(settings: &Settings) {
    let level = if settings.debug {
        "debug".to_string()
    } else {
        std::env::var("VIMLINK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer = match open_log_file(&settings.log_dir, &settings.broker.socket_path) {
        Ok(Some(file)) => BoxMakeWriter::new(io::stderr.and(Mutex::new(file))),
        Ok(None) => BoxMakeWriter::new(io::stderr),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            BoxMakeWriter::new(io::stderr)
        }
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Brokers on different sockets may share a log directory.
fn log_file_name(socket_path: &Path) -> String {
    match socket_path.file_stem().and_then(|stem| stem.to_str()) {
        Some(stem) if !stem.is_empty() => format!("{LOG_FILE_PREFIX}-{stem}.log"),
        _ => format!("{LOG_FILE_PREFIX}.log"),
    }
}

fn open_log_file(log_dir: &str, socket_path: &Path) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(log_file_name(socket_path)))
        .map(Some)
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Flag, then environment, then default.
fn resolve_path(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

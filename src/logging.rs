use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_FILE_NAME: &str = "pakmerger.log";

/// Installs the global subscriber: stderr plus an append-only log file.
///
/// `RUST_LOG` wins over `verbose`. A log file that cannot be opened only
/// costs the file layer.
pub fn init(log_dir: Option<&Path>, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = log_dir.and_then(open_log_file).map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
            .boxed()
    });

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init();
    if let Err(err) = result {
        eprintln!("logging already initialised: {err}");
    }
}

pub fn log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE_NAME)
}

fn open_log_file(log_dir: &Path) -> Option<fs::File> {
    fs::create_dir_all(log_dir).ok()?;
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(log_dir))
        .ok()
}

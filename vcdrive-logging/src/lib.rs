use std::{env, path::Path};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, registry, EnvFilter};

/// Initializes the global tracing subscriber based on environment variables.
///
/// * `LOG_LEVEL`: default level when `RUST_LOG` is unset (default `info`)
/// * `LOG_OUTPUT`: `console`, `file`, or `both` (default `console`)
/// * `LOG_FORMAT`: `human` or `json` (default `human`)
/// * `LOG_FILE_PATH`: file sink location (default `/tmp/vcdrive.log`)
///
/// Returns the worker guard for the non-blocking file writer; the caller
/// must hold it for as long as file logging should stay alive.
pub fn init_subscriber() -> Option<WorkerGuard> {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let log_output = env::var("LOG_OUTPUT").unwrap_or_else(|_| "console".to_string());
    let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "human".to_string());
    let log_file_path =
        env::var("LOG_FILE_PATH").unwrap_or_else(|_| "/tmp/vcdrive.log".to_string());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let use_console = log_output == "console" || log_output == "both";
    let use_file = log_output == "file" || log_output == "both";
    let is_json = log_format == "json";

    let mut guard: Option<WorkerGuard> = None;

    let file_writer = if use_file {
        let log_path = Path::new(&log_file_path);
        let log_dir = log_path.parent().unwrap_or_else(|| Path::new("/tmp"));
        let log_filename = log_path.file_name().unwrap_or("vcdrive.log".as_ref());
        let appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);
        Some(non_blocking)
    } else {
        None
    };

    let subscriber = registry().with(env_filter);

    match (use_console, file_writer) {
        (true, Some(writer)) => {
            if is_json {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .json();
                let console_layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stdout)
                    .json();
                subscriber.with(console_layer).with(file_layer).init();
            } else {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false);
                let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
                subscriber.with(console_layer).with(file_layer).init();
            }
        }
        (true, None) => {
            let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
            if is_json {
                subscriber.with(console_layer.json()).init();
            } else {
                subscriber.with(console_layer).init();
            }
        }
        (false, Some(writer)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            if is_json {
                subscriber.with(file_layer.json()).init();
            } else {
                subscriber.with(file_layer).init();
            }
        }
        (false, None) => {
            subscriber.init();
        }
    }

    guard
}

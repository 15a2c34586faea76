//! Logging bootstrap
//!
//! Console output always; a daily rolling file as well when a log directory
//! is configured. The returned guard flushes the file writer on drop and must
//! be held by `main`.

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_DIRECTIVE: &str = "custody_chain=info,tower_http=info";
const LOG_FILE_PREFIX: &str = "custody_chain.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

pub fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let console = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_filter(env_filter());

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(writer)
                .with_filter(env_filter());

            tracing_subscriber::registry().with(console).with(file).try_init()?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(console).try_init()?;
            Ok(None)
        }
    }
}

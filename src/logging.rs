//! Tracing setup for the ragdesk server and CLI.
//!
//! Events go to stdout through a compact formatter and to a log file. Ingestion runs on
//! background workers, so the file is the only durable record of what happened to an upload.
//! Pipeline and namespace events carry structured fields that the file keeps verbatim:
//!
//! - `job_id`: the ingestion job, stable across every stage of one upload.
//! - `collection`: the tenant-scoped collection name the job writes to.
//! - `stage`: `conversion`, `enrichment` or `indexing` on stage failures.
//! - `tenant`: the sanitized tenant segment on session-end cleanup. Raw tenant ids are never
//!   logged.
//!
//! Grepping the file for one `collection` value reconstructs a document's history.
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Overrides the log file path.
pub const LOG_FILE_ENV: &str = "RAGDESK_LOG_FILE";

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_FILE: &str = "ragdesk.log";
const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where the file layer writes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogDestination {
    /// Explicit path from [`LOG_FILE_ENV`], appended to.
    File(PathBuf),
    /// `logs/ragdesk.log` relative to the working directory.
    Default { dir: PathBuf, file: &'static str },
}

impl LogDestination {
    fn resolve(explicit: Option<String>) -> Self {
        match explicit.filter(|path| !path.trim().is_empty()) {
            Some(path) => Self::File(PathBuf::from(path)),
            None => Self::Default {
                dir: PathBuf::from(DEFAULT_LOG_DIR),
                file: DEFAULT_LOG_FILE,
            },
        }
    }
}

/// Install the stdout layer and, when the destination can be opened, the file layer.
///
/// `RUST_LOG` overrides the default filter, which keeps HTTP client chatter at `warn`.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    let destination = LogDestination::resolve(std::env::var(LOG_FILE_ENV).ok());
    match open_writer(&destination) {
        Some(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

fn open_writer(destination: &LogDestination) -> Option<NonBlocking> {
    let (non_blocking, guard) = match destination {
        LogDestination::File(path) => {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => tracing_appender::non_blocking(file),
                Err(err) => {
                    eprintln!("Failed to open log file {}: {err}", path.display());
                    return None;
                }
            }
        }
        LogDestination::Default { dir, file } => {
            if let Err(err) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create {}: {err}", dir.display());
                return None;
            }
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file))
        }
    };
    let _ = LOG_GUARD.set(guard);
    Some(non_blocking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins_over_default() {
        assert_eq!(
            LogDestination::resolve(Some("/var/log/ragdesk/server.log".into())),
            LogDestination::File(PathBuf::from("/var/log/ragdesk/server.log"))
        );
    }

    #[test]
    fn blank_override_falls_back_to_logs_dir() {
        let expected = LogDestination::Default {
            dir: PathBuf::from("logs"),
            file: "ragdesk.log",
        };
        assert_eq!(LogDestination::resolve(None), expected);
        assert_eq!(LogDestination::resolve(Some("  ".into())), expected);
    }

    #[test]
    fn explicit_file_is_created_for_appending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ragdesk-test.log");
        assert!(open_writer(&LogDestination::File(path.clone())).is_some());
        assert!(path.exists());
    }

    #[test]
    fn unopenable_file_disables_the_file_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("ragdesk.log");
        assert!(open_writer(&LogDestination::File(path)).is_none());
    }
}

use crate::definitions::{LogDefinitions, LogFileDefinitions};
use crate::env::DeploymentEnv;
use parking_lot::Mutex;
use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, util::SubscriberInitExt, Layer};

// Keep a guard for non-blocking console to avoid being dropped.
static CONSOLE_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

/// What the process-wide subscriber should look like.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub level: LevelFilter,
    pub json: bool,
    pub with_spans: bool,
    pub file: Option<LogFileDefinitions>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            json: false,
            with_spans: true,
            file: None,
        }
    }
}

impl LoggingOptions {
    /// Test deployments only show errors so test output stays readable.
    pub fn from_definitions(log: &LogDefinitions, deploy: DeploymentEnv) -> Self {
        let level = if deploy.is_test() {
            LevelFilter::ERROR
        } else {
            log.level
                .as_deref()
                .map(parse_level)
                .unwrap_or(LevelFilter::INFO)
        };

        Self {
            level,
            json: log.json,
            with_spans: true,
            file: log.file.clone(),
        }
    }
}

/// Maps a definitions level name to a filter. `internal` is the most verbose.
pub fn parse_level(s: &str) -> LevelFilter {
    match s.to_ascii_lowercase().as_str() {
        "internal" | "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" | "none" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

// ================= rotating writer for files =================

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};

#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl<'a> fmt::MakeWriter<'a> for RotWriter {
    type Writer = RotWriterHandle;
    fn make_writer(&'a self) -> Self::Writer {
        RotWriterHandle(self.0.clone())
    }
}

struct RotWriterHandle(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl Write for RotWriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

fn create_rotating_writer(file: &LogFileDefinitions) -> std::io::Result<RotWriter> {
    let log_path = Path::new(&file.path);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let max_bytes = file.max_size_mb.unwrap_or(100) as usize * 1024 * 1024;
    let limit = match file.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(1)),
    };

    let rot = FileRotate::new(
        log_path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    );

    Ok(RotWriter(Arc::new(Mutex::new(rot))))
}

// ================= public init =================

/// Installs the process-wide subscriber.
///
/// Returns `false` when a global subscriber was already installed, which is
/// the normal case for a second service in the same process (tests).
pub fn init_logging(opts: &LoggingOptions) -> bool {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

    // Bridge `log` → `tracing` *before* installing the subscriber
    let _ = tracing_log::LogTracer::init();

    // RUST_LOG acts as a global upper-bound when present.
    let env: Option<EnvFilter> = EnvFilter::try_from_default_env().ok();

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = if opts.json {
        fmt::layer()
            .json()
            .with_current_span(opts.with_spans)
            .with_writer(nb_stderr)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_filter(opts.level)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(nb_stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_filter(opts.level)
            .boxed()
    };

    let file_layer = match opts.file.as_ref().map(create_rotating_writer) {
        Some(Ok(writer)) => Some(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_writer(writer)
                .with_filter(opts.level),
        ),
        Some(Err(e)) => {
            eprintln!("Failed to initialize log file: {e}");
            None
        }
        None => None,
    };

    Registry::default()
        .with(env)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_only_shows_errors() {
        let log = LogDefinitions {
            level: Some("debug".into()),
            ..Default::default()
        };
        let opts = LoggingOptions::from_definitions(&log, DeploymentEnv::Test);
        assert_eq!(opts.level, LevelFilter::ERROR);

        let opts = LoggingOptions::from_definitions(&log, DeploymentEnv::Local);
        assert_eq!(opts.level, LevelFilter::DEBUG);
    }

    #[test]
    fn level_names() {
        assert_eq!(parse_level("internal"), LevelFilter::TRACE);
        assert_eq!(parse_level("WARN"), LevelFilter::WARN);
        assert_eq!(parse_level("bogus"), LevelFilter::INFO);
    }

    #[test]
    fn rotating_writer_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file = LogFileDefinitions {
            path: dir.path().join("logs/svc.log").to_string_lossy().into_owned(),
            max_size_mb: Some(1),
            max_backups: Some(2),
        };
        let writer = create_rotating_writer(&file).expect("writer");
        let mut handle = fmt::MakeWriter::make_writer(&writer);
        handle.write_all(b"hello\n").unwrap();
        handle.flush().unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}

pub mod config;
pub mod mcp_client;

use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Environment variable selecting the log format (`json` or `text`).
pub const LOG_FORMAT_ENV_VAR: &str = "TOOLHUB_LOG_FORMAT";

/// Environment variable redirecting logs to a file instead of stderr.
pub const LOG_FILE_ENV_VAR: &str = "TOOLHUB_LOG_FILE";

/// Initialize the tracing subscriber.
///
/// Logs go to stderr so stdout stays clean for command output, or to the
/// file named by `TOOLHUB_LOG_FILE`. `RUST_LOG` filters as usual (default
/// `toolhub=info,warn`); `TOOLHUB_LOG_FORMAT=json` switches to JSON lines.
/// Calling this twice is harmless.
pub fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolhub=info,warn"));

    let log_file = std::env::var(LOG_FILE_ENV_VAR)
        .ok()
        .filter(|p| !p.trim().is_empty());
    let (writer, ansi) = match log_file.as_deref().map(|p| open_log_file(Path::new(p))) {
        Some(Ok(file)) => (BoxMakeWriter::new(FlushingWriter::new(file)), false),
        Some(Err(e)) => {
            eprintln!("toolhub: cannot open log file, logging to stderr: {e}");
            (BoxMakeWriter::new(std::io::stderr), true)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let json = std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let installed = if json {
        fmt::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .with_current_span(true)
            .try_init()
    } else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_thread_ids(false)
            .try_init()
    };

    if installed.is_ok() {
        tracing::debug!(
            version = env!("CARGO_PKG_VERSION"),
            pid = std::process::id(),
            json,
            "tracing initialized"
        );
    }
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// A writer that wraps `std::fs::File` and flushes after every write, so a
/// crashed or killed process still leaves its last log lines on disk.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

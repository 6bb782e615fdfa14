//! Logging initialization for lx-init.
//!
//! Human-readable output goes to the zone console; a JSON copy is kept in a
//! size-capped boot log for later diagnostics.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing::{warn, Subscriber};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum boot log size (1 MB).
const MAX_LOG_BYTES: usize = 1024 * 1024;

/// Boot log writer that truncates at max size.
struct BootLogWriter {
    file: File,
    bytes_written: usize,
    max_bytes: usize,
}

impl BootLogWriter {
    fn new(path: &Path, max_bytes: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            bytes_written: 0,
            max_bytes,
        })
    }
}

impl Write for BootLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.bytes_written >= self.max_bytes {
            return Ok(buf.len());
        }

        let remaining = self.max_bytes - self.bytes_written;
        let to_write = buf.len().min(remaining);
        let written = self.file.write(&buf[..to_write])?;
        self.bytes_written += written;
        // callers never see the cap
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Writer for the console device, or stderr when it cannot be opened.
fn console_writer(console: &Path) -> BoxMakeWriter {
    match OpenOptions::new().write(true).open(console) {
        Ok(file) => BoxMakeWriter::new(Mutex::new(file)),
        Err(e) => {
            eprintln!(
                "lx-init: cannot open console {}: {}; logging to stderr",
                console.display(),
                e
            );
            BoxMakeWriter::new(io::stderr)
        }
    }
}

/// Build the subscriber; `filter` gates every layer.
fn subscriber(
    filter: EnvFilter,
    console: BoxMakeWriter,
    boot_log: Option<BootLogWriter>,
) -> impl Subscriber + Send + Sync {
    let boot_log_layer = boot_log.map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(Mutex::new(writer))
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(false)
        .with_writer(console);

    tracing_subscriber::registry()
        .with(filter)
        .with(boot_log_layer)
        .with(console_layer)
}

/// Initialize logging to the console and the boot log file.
///
/// The console always gets a writer. A boot log that cannot be created is
/// reported on the console and skipped.
pub fn init(console: &Path, boot_log: &Path) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, open_error) = match BootLogWriter::new(boot_log, MAX_LOG_BYTES) {
        Ok(writer) => (Some(writer), None),
        Err(e) => (None, Some(e)),
    };

    subscriber(filter, console_writer(console), writer).try_init()?;

    if let Some(e) = open_error {
        warn!(path = %boot_log.display(), error = %e, "boot log unavailable");
    }

    Ok(())
}

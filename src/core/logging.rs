use std::io;
use std::sync::{Arc, OnceLock, RwLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

static LOG_CALLBACK: OnceLock<RwLock<Option<LogCallback>>> = OnceLock::new();

fn callback_slot() -> &'static RwLock<Option<LogCallback>> {
    LOG_CALLBACK.get_or_init(|| RwLock::new(None))
}

/// Registers the host-supplied log callback (§6 "Log channel"). Safe to
/// call before or after `init()`; the writer always reads the slot live.
pub fn set_log_callback(cb: Option<LogCallback>) {
    *callback_slot().write().expect("log callback lock poisoned") = cb;
}

#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(json: bool) -> anyhow::Result<LoggingRuntime> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let (writer, guard) = tracing_appender::non_blocking(CallbackWriter);

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json)
        .with_target(true);

    let base_fmt = if json { base_fmt.json().boxed() } else { base_fmt.boxed() };

    tracing_subscriber::registry().with(filter).with(base_fmt).init();

    Ok(LoggingRuntime { _guard: guard })
}

/// A `Write` sink that forwards every line to stderr and, if one is
/// registered, to the host log callback. Mirrors the teacher's
/// `make_writer` dispatch over stderr/stdout/discard/file, except the
/// destination here is always "both stderr and an optional callback"
/// rather than a single selectable target.
struct CallbackWriter;

impl io::Write for CallbackWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write_all(&mut io::stderr(), buf)?;
        if let Ok(text) = std::str::from_utf8(buf) {
            if let Some(cb) = callback_slot().read().expect("log callback lock poisoned").as_ref() {
                for line in text.lines() {
                    cb(line);
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut io::stderr())
    }
}

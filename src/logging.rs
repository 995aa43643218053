//! Logging setup.
//!
//! Every event goes to the system log, tagged with the program name. In
//! foreground mode events are also printed: errors and warnings on stderr,
//! everything else on stdout. Daemon mode never writes to the console.

use std::ffi::CString;
use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use std::path::Path;
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// `openlog` keeps the ident pointer, so it must live for the process.
static IDENT: OnceLock<CString> = OnceLock::new();

/// Install the global subscriber.
pub fn init(program: &str, console: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(std::io::stdout().is_terminal())
            .with_writer(
                std::io::stderr
                    .with_max_level(Level::WARN)
                    .or_else(std::io::stdout),
            )
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(SyslogLayer::open(program))
        .with(console_layer)
        .init();
}

/// Close the system log channel.
pub fn close() {
    // SAFETY: closelog takes no arguments and tolerates a closed channel.
    unsafe { libc::closelog() };
}

/// Program name for the syslog ident: the file name of argv[0].
pub fn program_name() -> String {
    std::env::args_os()
        .next()
        .and_then(|arg0| {
            Path::new(&arg0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

/// Forwards events to `syslog(3)` on the `LOG_USER` facility
pub struct SyslogLayer {
    _private: (),
}

impl SyslogLayer {
    pub fn open(program: &str) -> Self {
        let ident = IDENT.get_or_init(|| {
            CString::new(program.replace('\0', ""))
                .unwrap_or_else(|_| CString::from(c"echolog"))
        });
        // SAFETY: ident is 'static and NUL-terminated.
        unsafe { libc::openlog(ident.as_ptr(), libc::LOG_CONS, libc::LOG_USER) };
        Self { _private: () }
    }
}

impl<S: Subscriber> Layer<S> for SyslogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut line = SyslogLine::default();
        event.record(&mut line);

        let Ok(message) = CString::new(line.finish().replace('\0', "")) else {
            return;
        };
        // SAFETY: the format string takes exactly one C string argument.
        unsafe {
            libc::syslog(
                priority(event.metadata().level()),
                c"%s".as_ptr(),
                message.as_ptr(),
            )
        };
    }
}

fn priority(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        _ => libc::LOG_DEBUG,
    }
}

/// Renders an event as `message key=value ...`
#[derive(Default)]
struct SyslogLine {
    message: String,
    fields: String,
}

impl SyslogLine {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl Visit for SyslogLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

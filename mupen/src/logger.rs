//! Bridges `tracing` events into the host's log view.
//!
//! The host registers a C callback that accepts the emulator core's message levels
//! (the same numbering the core uses for its own debug callback). If no callback is
//! provided, events are written to stderr instead.

use std::ffi::{c_char, c_int, CString};
use std::fmt::{self, Write as _};
use std::sync::OnceLock;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Registry, reload};

/// Represents a foreign method from the host side for receiving a log line.
pub type ForeignLogFn = unsafe extern "C" fn(level: c_int, message: *const c_char);

static INITIALIZED: OnceLock<()> = OnceLock::new();
static FILTER: OnceLock<reload::Handle<Targets, Registry>> = OnceLock::new();

/// Message levels understood by the host. These mirror the emulator core's
/// `m64p_msg_level` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageLevel {
    Error = 1,
    Warning = 2,
    Info = 3,
    Status = 4,
    Verbose = 5,
}

impl From<&Level> for MessageLevel {
    fn from(level: &Level) -> Self {
        match *level {
            Level::ERROR => MessageLevel::Error,
            Level::WARN => MessageLevel::Warning,
            Level::INFO => MessageLevel::Info,
            Level::DEBUG => MessageLevel::Status,
            Level::TRACE => MessageLevel::Verbose,
        }
    }
}

/// Installs the global subscriber. Safe to call more than once; only the first call
/// has any effect.
pub fn init(hook: Option<ForeignLogFn>, verbose: bool) {
    if INITIALIZED.set(()).is_err() {
        return;
    }

    let (filter, handle) = reload::Layer::new(targets(verbose));
    let _ = FILTER.set(handle);

    let result = match hook {
        Some(hook) => tracing_subscriber::registry()
            .with(HostLogLayer { hook }.with_filter(filter))
            .try_init(),

        None => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
            .try_init(),
    };

    if let Err(error) = result {
        // Someone else already owns the global dispatcher (e.g, a test harness).
        eprintln!("Unable to install krec logger: {error}");
    }
}

fn targets(verbose: bool) -> Targets {
    Targets::new().with_default(match verbose {
        true => LevelFilter::TRACE,
        false => LevelFilter::INFO,
    })
}

/// Switches between INFO and TRACE output after `init`. Does nothing before `init`.
pub fn set_verbose(verbose: bool) {
    let Some(handle) = FILTER.get() else {
        return;
    };

    if let Err(error) = handle.reload(targets(verbose)) {
        eprintln!("Unable to change krec log verbosity: {error}");
    }
}

/// A `tracing` layer that formats each event into a single line and hands it to
/// the host.
struct HostLogLayer {
    hook: ForeignLogFn,
}

impl<S: Subscriber> Layer<S> for HostLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let line = format_event(metadata.target(), event);
        let level = MessageLevel::from(metadata.level());

        // Interior NULs would truncate the line on the C side anyway.
        let Ok(line) = CString::new(line.replace('\0', " ")) else {
            return;
        };

        // The host guarantees the hook stays valid for the lifetime of the library,
        // and it only reads the string for the duration of the call.
        unsafe {
            (self.hook)(level as c_int, line.as_ptr());
        }
    }
}

/// Renders `[target] message key=value ...`.
fn format_event(target: &str, event: &Event<'_>) -> String {
    let mut message = String::new();
    let mut fields = String::new();

    event.record(&mut EventVisitor {
        message: &mut message,
        fields: &mut fields,
    });

    format!("[{target}] {message}{fields}")
}

struct EventVisitor<'a> {
    message: &'a mut String,
    fields: &'a mut String,
}

impl Visit for EventVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            name => {
                let _ = write!(self.fields, " {name}={value}");
            },
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{value:?}");
            },
            name => {
                let _ = write!(self.fields, " {name}={value:?}");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_enables_trace_output() {
        let quiet = targets(false);
        assert!(quiet.would_enable("krec_session", &Level::INFO));
        assert!(!quiet.would_enable("krec_session", &Level::DEBUG));
        assert!(!quiet.would_enable("krec_capture", &Level::TRACE));

        let verbose = targets(true);
        assert!(verbose.would_enable("krec_session", &Level::DEBUG));
        assert!(verbose.would_enable("krec_capture", &Level::TRACE));
    }

    #[test]
    fn levels_map_onto_core_message_levels() {
        assert_eq!(MessageLevel::from(&Level::ERROR) as c_int, 1);
        assert_eq!(MessageLevel::from(&Level::WARN) as c_int, 2);
        assert_eq!(MessageLevel::from(&Level::INFO) as c_int, 3);
        assert_eq!(MessageLevel::from(&Level::DEBUG) as c_int, 4);
        assert_eq!(MessageLevel::from(&Level::TRACE) as c_int, 5);
    }
}

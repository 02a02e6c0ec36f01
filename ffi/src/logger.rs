use std::ffi::{c_char, c_int};

use krec_config::KrecConfig;
use mupen_integrations::Log;

/// Receives one formatted log line at one of the core's message levels
/// (1 = error, 2 = warning, 3 = info, 4 = status, 5 = verbose).
pub type KrecLogFn = unsafe extern "C" fn(level: c_int, message: *const c_char);

/// Installs the global logger. The host should call this once, before creating a
/// session, passing the same callback it uses for the core's own debug output.
///
/// A null `log_fn` sends everything to stderr instead. Non-zero `verbose` (or
/// `KREC_VERBOSE=true`) enables trace level output. A session whose config file sets
/// `verbose = true` turns it on when created.
#[unsafe(no_mangle)]
pub extern "C" fn krec_logging_init(log_fn: Option<KrecLogFn>, verbose: c_int) {
    let verbose = verbose != 0 || env_verbose();
    mupen_integrations::logger::init(log_fn, verbose);

    tracing::info!(target: Log::Core, hooked = log_fn.is_some(), "Logging initialized");
}

fn env_verbose() -> bool {
    match KrecConfig::from_env() {
        Ok(config) => config.verbose.unwrap_or(false),

        Err(error) => {
            eprintln!("Ignoring invalid krec environment settings: {error}");
            false
        },
    }
}

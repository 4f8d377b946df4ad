//! Diagnostic output for the binary.
//!
//! Everything goes to stderr so chat output on stdout can be piped.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "SYNTRA_LOG";

/// Pick the filter directive: `SYNTRA_LOG` wins, then `--verbose`, then
/// warnings only.
pub fn filter_directive(env_value: Option<&str>, verbose: bool) -> String {
    match env_value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value.to_string(),
        None if verbose => "syntra=debug,warn".to_string(),
        None => "warn".to_string(),
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(verbose: bool) {
    let env_value = std::env::var(LOG_ENV).ok();
    let directive = filter_directive(env_value.as_deref(), verbose);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("Ignoring invalid {LOG_ENV} value {directive:?}: {err}");
        EnvFilter::new("warn")
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

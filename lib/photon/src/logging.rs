use sloggers::{Config, LoggerConfig};
use std::path::Path;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default root logger: terminal drain, debug level, stderr.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Error parsing default logging config");

    config.build_logger().expect("Error building root logger")
}

/// Builds a root logger from the TOML logging configuration at the supplied path.
pub fn init_from_file<P: AsRef<Path>>(path: P) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).expect("Error loading logging config file");

    config.build_logger().expect("Error building root logger")
}

/// A logger that throws everything away. Library types use this when the host
/// does not supply a logging handle.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

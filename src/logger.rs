//! Logger writing to stderr

use std::io::{stderr, Write};

use log::{LevelFilter, SetLoggerError};

struct StdErrLogger {
    level: LevelFilter,
}

impl log::Log for StdErrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                &mut stderr(),
                "{} [{}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = stderr().flush();
    }
}

/// Install the stderr logger. Fails if a logger has already been set.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(StdErrLogger { level }))?;
    log::set_max_level(level);

    debug!("Logging initialized at {}", level);

    Ok(())
}

/// Parse a level name ("warn", "debug"...), `None` if it's not one
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn filters_by_level() {
        let logger = StdErrLogger {
            level: LevelFilter::Warn,
        };

        let warn = log::Metadata::builder().level(log::Level::Warn).build();
        let debug = log::Metadata::builder().level(log::Level::Debug).build();

        assert!(logger.enabled(&warn));
        assert!(!logger.enabled(&debug));
    }

    #[test]
    fn level_names() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("TRACE"), Some(LevelFilter::Trace));
        assert_eq!(parse_level("loud"), None);
    }
}

use log::{LevelFilter, Metadata, Record};
use std::io::Write;

// stdout belongs to the active protocol, so everything in here targets stderr.

pub fn write_line(text: &str) {
    let stderr = ::std::io::stderr();
    let mut handle = stderr.lock();
    let _ = writeln!(handle, "{}", text);
}

pub fn flush() {
    let _ = ::std::io::stderr().flush();
}

pub struct OutputLogger {
    level: LevelFilter,
}

impl OutputLogger {
    pub fn new(level: LevelFilter) -> Self {
        Self { level }
    }
}

impl log::Log for OutputLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        write_line(&format!("[{}] {}", record.level(), record.args()));
    }

    fn flush(&self) {
        flush();
    }
}

/// Install the stderr logger. `RUST_LOG` wins over `default_level` when it
/// parses as a level filter.
pub fn init_logger(default_level: LevelFilter) {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(default_level);

    let logger = OutputLogger::new(level);
    let _ = log::set_boxed_logger(Box::new(logger));
    log::set_max_level(level);
}

#[macro_export]
macro_rules! app_eprintln {
    () => {
        $crate::output::write_line("")
    };
    ($($arg:tt)*) => {
        $crate::output::write_line(&format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Log};

    #[test]
    fn logger_respects_level_filter() {
        let logger = OutputLogger::new(LevelFilter::Warn);
        let warn = Metadata::builder().level(Level::Warn).build();
        let debug = Metadata::builder().level(Level::Debug).build();
        assert!(logger.enabled(&warn));
        assert!(!logger.enabled(&debug));
    }
}

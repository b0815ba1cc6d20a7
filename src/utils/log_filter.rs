//! Logger setup for the binaries.  The one message filtered out is the warning the
//! SOAP response flattener logs each time it clamps a leap second (`:60`) in an
//! `xs:dateTime` value to `:59`; on a full run it repeats for every affected record.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Fragment of the leap-second clamping warning logged by `soap::envelope`.
pub const LEAP_SECOND_WARNING: &str = "second must be in 0..59";

/// Wraps another logger and drops every record whose message contains one of the
/// suppressed fragments.  Everything else is forwarded untouched.
pub struct SuppressingLogger<L: Log> {
    inner: L,
    suppressed: Vec<&'static str>,
}

impl<L: Log> SuppressingLogger<L> {
    pub fn new(inner: L, suppressed: Vec<&'static str>) -> Self {
        Self { inner, suppressed }
    }

    pub fn is_suppressed(&self, message: &str) -> bool {
        self.suppressed.iter().any(|s| message.contains(s))
    }
}

impl<L: Log> Log for SuppressingLogger<L> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        if self.is_suppressed(&message) {
            return;
        }
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush()
    }
}

/// Install `env_logger` at `level` (RUST_LOG still wins), with the leap-second
/// warning filtered out.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    let logger = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .build();
    let max_level = logger.filter();
    log::set_boxed_logger(Box::new(SuppressingLogger::new(
        logger,
        vec![LEAP_SECOND_WARNING],
    )))?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<String>>>);

    impl Log for Collect {
        fn enabled(&self, _: &Metadata) -> bool {
            true
        }
        fn log(&self, record: &Record) {
            if let Ok(mut xs) = self.0.lock() {
                xs.push(record.args().to_string());
            }
        }
        fn flush(&self) {}
    }

    #[test]
    fn only_leap_second_warning_is_dropped() {
        let sink = Collect::default();
        let logger = SuppressingLogger::new(sink.clone(), vec![LEAP_SECOND_WARNING]);
        logger.log(
            &Record::builder()
                .args(format_args!("Datum: second must be in 0..59, keeping x"))
                .level(log::Level::Warn)
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("unrelated warning"))
                .level(log::Level::Warn)
                .build(),
        );
        let seen = sink.0.lock().map(|xs| xs.clone()).unwrap_or_default();
        assert_eq!(seen, vec!["unrelated warning".to_string()]);
    }
}

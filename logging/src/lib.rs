// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Ambient logging initialization shared by the `buildgrid-server` and
// `buildgrid-cli` binaries. Every service crate logs through the `log`
// facade rather than writing to stdio directly.

use log::LevelFilter;

/// The severity levels carried over the original implementation's internal
/// monitoring protocol (`buildgrid.v2.monitoring.LogRecord.Level`). Kept as
/// a plain enum here (spec_full.md §4.10/§4.11): there is no monitoring bus
/// in this design, but log call sites still tag records at one of these
/// severities for consistency with the original taxonomy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogRecordLevel {
    NotSet,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogRecordLevel> for LevelFilter {
    fn from(level: LogRecordLevel) -> Self {
        match level {
            LogRecordLevel::NotSet => LevelFilter::Off,
            LogRecordLevel::Debug => LevelFilter::Debug,
            LogRecordLevel::Info => LevelFilter::Info,
            LogRecordLevel::Warning => LevelFilter::Warn,
            // Rust's `log` has no Critical; fold it into Error.
            LogRecordLevel::Error | LogRecordLevel::Critical => LevelFilter::Error,
        }
    }
}

/// Used at call sites that tag a record with one of the original severities
/// rather than picking a `log::Level` directly.
impl From<LogRecordLevel> for log::Level {
    fn from(level: LogRecordLevel) -> Self {
        match level {
            LogRecordLevel::NotSet | LogRecordLevel::Debug => log::Level::Debug,
            LogRecordLevel::Info => log::Level::Info,
            LogRecordLevel::Warning => log::Level::Warn,
            LogRecordLevel::Error | LogRecordLevel::Critical => log::Level::Error,
        }
    }
}

/// Initializes `env_logger` with a level filter derived from a CLI
/// verbosity flag, falling back to `RUST_LOG` if set.
pub fn init(default_level: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_record_level_maps_critical_to_error() {
        assert_eq!(LevelFilter::from(LogRecordLevel::Critical), LevelFilter::Error);
    }

    #[test]
    fn log_record_level_maps_not_set_to_off() {
        assert_eq!(LevelFilter::from(LogRecordLevel::NotSet), LevelFilter::Off);
    }

    #[test]
    fn log_record_level_maps_warning_to_warn() {
        assert_eq!(log::Level::from(LogRecordLevel::Warning), log::Level::Warn);
    }
}

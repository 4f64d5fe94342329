// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// The original implementation's internal monitoring taxonomy
// (`buildgrid._enums`), carried as plain enums (spec_full.md §4.10). There
// is no monitoring bus in this design; these tag `log` call sites in the
// scheduler so severity/kind stay consistent with the original's naming.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricRecordDomain {
    Unknown,
    State,
    Build,
}

impl MetricRecordDomain {
    fn as_str(&self) -> &'static str {
        match self {
            MetricRecordDomain::Unknown => "unknown",
            MetricRecordDomain::State => "state",
            MetricRecordDomain::Build => "build",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricRecordType {
    None,
    Counter,
    Timer,
    Gauge,
}

impl MetricRecordType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricRecordType::None => "none",
            MetricRecordType::Counter => "counter",
            MetricRecordType::Timer => "timer",
            MetricRecordType::Gauge => "gauge",
        }
    }
}

/// Tags a scheduler `log` call site with the domain/kind/severity the
/// original implementation's monitoring bus would have recorded this event
/// under, e.g. `[state/counter] job queued`.
pub fn log_event(domain: MetricRecordDomain, kind: MetricRecordType, level: buildgrid_logging::LogRecordLevel, message: &str) {
    log::log!(level.into(), "[{}/{}] {}", domain.as_str(), kind.as_str(), message);
}

// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Scheduler-level error taxonomy (spec.md §4.12/§7), mapped to a
// `ComponentError` at the boundary like every other component in this
// workspace (see `buildgrid-grpc-util::ComponentError`).

use buildgrid_grpc_util::{ComponentError, ErrorKind};

#[derive(Clone, Debug)]
pub enum SchedulerError {
    JobNotFound(String),
    OperationNotFound(String),
    /// `Scheduler.update_lease` in the original raises a bare `Exception`
    /// for an unrecognized lease state; mapped here to INTERNAL rather than
    /// silently ignored (spec_full.md §9).
    InvalidLeaseState(String),
    RetryExceeded(String),
    BackendUnavailable(String),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::JobNotFound(name) => write!(f, "no job named {name}"),
            SchedulerError::OperationNotFound(name) => write!(f, "no operation named {name}"),
            SchedulerError::InvalidLeaseState(detail) => write!(f, "invalid lease state: {detail}"),
            SchedulerError::RetryExceeded(name) => write!(f, "job {name} exceeded its retry budget"),
            SchedulerError::BackendUnavailable(detail) => write!(f, "datastore unavailable: {detail}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<SchedulerError> for ComponentError {
    fn from(err: SchedulerError) -> ComponentError {
        let kind = match &err {
            SchedulerError::JobNotFound(_) | SchedulerError::OperationNotFound(_) => ErrorKind::NotFound,
            SchedulerError::InvalidLeaseState(_) => ErrorKind::Internal,
            SchedulerError::RetryExceeded(_) => ErrorKind::RetryExceeded,
            SchedulerError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
        };
        ComponentError::new(kind, err.to_string())
    }
}

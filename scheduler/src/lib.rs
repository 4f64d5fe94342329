// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Job/Operation/Lease state model, DataStore, Scheduler, and the watcher
// fan-out layer (spec.md §4.4-§4.6, §4.9).

pub mod data_store;
pub mod error;
pub mod job;
pub mod monitoring;
mod scheduler;
pub mod watcher;

pub use error::SchedulerError;
pub use job::{ExecuteStage, Job, LeaseRecord, LeaseState};
pub use scheduler::{Scheduler, MAX_RETRIES};
pub use watcher::OperationUpdate;

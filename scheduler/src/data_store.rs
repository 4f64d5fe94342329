// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Pluggable persistence for Jobs/Operations/Leases (spec.md §4.4). The
// Scheduler owns the live, in-memory `Job` objects that coordinate
// subscribers and state transitions; a `DataStore` is a secondary,
// queryable record of the same facts, written through on every transition
// so `list_jobs` can answer without locking every live Job.
//
// Field changes carry semantic names rather than storage-layout details
// (spec.md §4.4), modeled here as a `FieldChange` enum so a SQL-backed
// implementation can translate each variant into its own column update.

use async_trait::async_trait;
use buildgrid_grpc_util::ComponentError;
use buildgrid_hashing::Digest;

use crate::job::{ExecuteStage, LeaseState};

#[derive(Clone, Debug)]
pub struct JobRecord {
    pub name: String,
    pub action_digest: Digest,
    pub priority: i32,
    pub stage: ExecuteStage,
    pub do_not_cache: bool,
    pub n_tries: u32,
    pub queued_timestamp_unix_nanos: Option<i64>,
    pub cancelled: bool,
}

#[derive(Clone, Debug)]
pub enum FieldChange {
    Stage(ExecuteStage),
    Priority(i32),
    QueuedTimestamp(i64),
    NTries(u32),
    Cancelled(bool),
    DoNotCache(bool),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JobFilter {
    pub stage: Option<ExecuteStage>,
}

impl JobFilter {
    fn matches(&self, record: &JobRecord) -> bool {
        self.stage.map(|stage| stage == record.stage).unwrap_or(true)
    }
}

/// Persistence contract for Job/Operation/Lease records (spec.md §4.4).
/// Atomic read-modify-write is required only within a single job; no
/// cross-job atomicity is promised.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn create_job(&self, record: JobRecord) -> Result<(), ComponentError>;
    async fn update_job(&self, name: &str, changes: &[FieldChange]) -> Result<(), ComponentError>;
    async fn delete_job(&self, name: &str) -> Result<(), ComponentError>;

    async fn create_operation(&self, operation_name: &str, job_name: &str) -> Result<(), ComponentError>;

    async fn create_lease(&self, job_name: &str, lease_id: &str) -> Result<(), ComponentError>;
    async fn update_lease(
        &self,
        job_name: &str,
        state: LeaseState,
        status_code: Option<i32>,
    ) -> Result<(), ComponentError>;

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobRecord>, ComponentError>;
}

fn stage_to_i32(stage: ExecuteStage) -> i32 {
    match stage {
        ExecuteStage::Unknown => 0,
        ExecuteStage::CacheCheck => 1,
        ExecuteStage::Queued => 2,
        ExecuteStage::Executing => 3,
        ExecuteStage::Completed => 4,
    }
}

fn stage_from_i32(value: i32) -> ExecuteStage {
    match value {
        1 => ExecuteStage::CacheCheck,
        2 => ExecuteStage::Queued,
        3 => ExecuteStage::Executing,
        4 => ExecuteStage::Completed,
        _ => ExecuteStage::Unknown,
    }
}

fn lease_state_to_i32(state: LeaseState) -> i32 {
    match state {
        LeaseState::Unspecified => 0,
        LeaseState::Pending => 1,
        LeaseState::Active => 2,
        LeaseState::Completed => 3,
        LeaseState::Cancelled => 4,
    }
}

mod mem;
mod sql;

pub use mem::InMemoryDataStore;
pub use sql::SqlDataStore;

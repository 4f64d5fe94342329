// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// In-memory DataStore (spec.md §4.4 `mem` backend): a `parking_lot::Mutex`-
// guarded map, the teacher's convention for bounded in-process state (see
// `buildgrid-cas::LruMemoryBackend`, `action_cache::ReferenceCache`).

use std::collections::HashMap;

use async_trait::async_trait;
use buildgrid_grpc_util::ComponentError;
use parking_lot::Mutex;

use super::{FieldChange, JobFilter, JobRecord};
use crate::job::LeaseState;

#[derive(Default)]
struct State {
    jobs: HashMap<String, JobRecord>,
    operations: HashMap<String, String>,
    leases: HashMap<String, (String, LeaseState, Option<i32>)>,
}

pub struct InMemoryDataStore {
    state: Mutex<State>,
}

impl InMemoryDataStore {
    pub fn new() -> InMemoryDataStore {
        InMemoryDataStore {
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for InMemoryDataStore {
    fn default() -> InMemoryDataStore {
        InMemoryDataStore::new()
    }
}

#[async_trait]
impl super::DataStore for InMemoryDataStore {
    async fn create_job(&self, record: JobRecord) -> Result<(), ComponentError> {
        self.state.lock().jobs.insert(record.name.clone(), record);
        Ok(())
    }

    async fn update_job(&self, name: &str, changes: &[FieldChange]) -> Result<(), ComponentError> {
        let mut state = self.state.lock();
        let Some(record) = state.jobs.get_mut(name) else {
            return Ok(());
        };
        for change in changes {
            match change {
                FieldChange::Stage(stage) => record.stage = *stage,
                FieldChange::Priority(priority) => record.priority = *priority,
                FieldChange::QueuedTimestamp(nanos) => record.queued_timestamp_unix_nanos = Some(*nanos),
                FieldChange::NTries(n) => record.n_tries = *n,
                FieldChange::Cancelled(cancelled) => record.cancelled = *cancelled,
                FieldChange::DoNotCache(do_not_cache) => record.do_not_cache = *do_not_cache,
            }
        }
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<(), ComponentError> {
        let mut state = self.state.lock();
        state.jobs.remove(name);
        state.leases.remove(name);
        state.operations.retain(|_, job_name| job_name != name);
        Ok(())
    }

    async fn create_operation(&self, operation_name: &str, job_name: &str) -> Result<(), ComponentError> {
        self.state
            .lock()
            .operations
            .insert(operation_name.to_owned(), job_name.to_owned());
        Ok(())
    }

    async fn create_lease(&self, job_name: &str, lease_id: &str) -> Result<(), ComponentError> {
        self.state
            .lock()
            .leases
            .insert(job_name.to_owned(), (lease_id.to_owned(), LeaseState::Pending, None));
        Ok(())
    }

    async fn update_lease(
        &self,
        job_name: &str,
        state: LeaseState,
        status_code: Option<i32>,
    ) -> Result<(), ComponentError> {
        let mut guard = self.state.lock();
        if let Some(entry) = guard.leases.get_mut(job_name) {
            entry.1 = state;
            entry.2 = status_code;
        }
        Ok(())
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobRecord>, ComponentError> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::DataStore;
    use crate::job::ExecuteStage;
    use buildgrid_hashing::Digest;

    fn sample_record(name: &str) -> JobRecord {
        JobRecord {
            name: name.to_owned(),
            action_digest: Digest::of_bytes(b"action"),
            priority: 0,
            stage: ExecuteStage::Queued,
            do_not_cache: false,
            n_tries: 0,
            queued_timestamp_unix_nanos: None,
            cancelled: false,
        }
    }

    #[tokio::test]
    async fn list_jobs_filters_by_stage() {
        let store = InMemoryDataStore::new();
        store.create_job(sample_record("a")).await.unwrap();
        let mut executing = sample_record("b");
        executing.stage = ExecuteStage::Executing;
        store.create_job(executing).await.unwrap();

        let queued = store
            .list_jobs(JobFilter {
                stage: Some(ExecuteStage::Queued),
            })
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].name, "a");
    }

    #[tokio::test]
    async fn delete_job_removes_its_lease_and_operations() {
        let store = InMemoryDataStore::new();
        store.create_job(sample_record("a")).await.unwrap();
        store.create_operation("op-a", "a").await.unwrap();
        store.create_lease("a", "a").await.unwrap();

        store.delete_job("a").await.unwrap();

        assert!(store.state.lock().jobs.is_empty());
        assert!(store.state.lock().leases.is_empty());
        assert!(store.state.lock().operations.is_empty());
    }
}

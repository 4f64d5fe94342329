// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// The Scheduler (spec.md §4.6): matches queued Jobs to worker bot sessions,
// enforces priority/retry policy, and drives Operation/Lease transitions on
// both the client and worker side.
//
// Lock ordering (spec.md §5): the queue+index lock is always acquired
// before a Job's own lock, so the Scheduler here never holds its lock
// across a call into `Job` (whose methods take their own lock internally).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use buildgrid_grpc_util::ComponentError;
use buildgrid_hashing::Digest;
use buildgrid_proto::re::{ActionResult, ExecuteResponse};
use buildgrid_proto::rpc::Status as RpcStatus;
use parking_lot::Mutex;

use buildgrid_logging::LogRecordLevel;

use crate::data_store::{DataStore, FieldChange, JobFilter, JobRecord};
use crate::error::SchedulerError;
use crate::job::{ExecuteStage, Job, LeaseRecord, LeaseState};
use crate::monitoring::{log_event, MetricRecordDomain, MetricRecordType};

/// Default retry budget (spec.md §4.5 Retry policy).
pub const MAX_RETRIES: u32 = 5;

struct Index {
    queue: VecDeque<Arc<Job>>,
    by_name: HashMap<String, Arc<Job>>,
}

pub struct Scheduler {
    data_store: Arc<dyn DataStore>,
    index: Mutex<Index>,
}

impl Scheduler {
    pub fn new(data_store: Arc<dyn DataStore>) -> Scheduler {
        Scheduler {
            data_store,
            index: Mutex::new(Index {
                queue: VecDeque::new(),
                by_name: HashMap::new(),
            }),
        }
    }

    pub fn get_job(&self, name: &str) -> Option<Arc<Job>> {
        self.index.lock().by_name.get(name).cloned()
    }

    /// Registers a freshly-created Job and puts it at the back of its
    /// priority class in the ready queue (spec.md §4.6, §4.7 step 2).
    pub async fn queue_job(&self, job: Arc<Job>) -> Result<(), ComponentError> {
        job.set_stage(ExecuteStage::Queued);
        self.persist_new_job(&job).await?;
        let mut index = self.index.lock();
        insert_sorted(&mut index.queue, job.clone(), false);
        log_event(
            MetricRecordDomain::State,
            MetricRecordType::Counter,
            LogRecordLevel::Info,
            &format!("job {} queued at priority {}", job.name, job.priority),
        );
        index.by_name.insert(job.name.clone(), job);
        Ok(())
    }

    async fn persist_new_job(&self, job: &Job) -> Result<(), ComponentError> {
        self.data_store
            .create_job(JobRecord {
                name: job.name.clone(),
                action_digest: job.action_digest,
                priority: job.priority,
                stage: job.stage(),
                do_not_cache: job.do_not_cache(),
                n_tries: job.n_tries(),
                queued_timestamp_unix_nanos: Some(unix_nanos(SystemTime::now())),
                cancelled: false,
            })
            .await?;
        self.data_store.create_operation(&job.name, &job.name).await
    }

    /// Matching (spec.md §4.6): walk the queue in order, return the first
    /// Job whose platform requirements are satisfied by `worker_properties`.
    /// Skipped jobs keep their place; the match is removed from the queue
    /// and a PENDING Lease is attached.
    pub async fn assign_lease(
        &self,
        worker_properties: &[(String, String)],
    ) -> Result<Option<(Arc<Job>, LeaseRecord)>, ComponentError> {
        let matched = {
            let mut index = self.index.lock();
            let position = index
                .queue
                .iter()
                .position(|job| platform_satisfied(&job.platform_requirements, worker_properties));
            position.map(|pos| index.queue.remove(pos).expect("position came from this queue"))
        };
        let Some(job) = matched else {
            return Ok(None);
        };

        let lease = LeaseRecord {
            id: job.name.clone(),
            state: LeaseState::Pending,
            status: None,
            result: None,
        };
        job.attach_lease(lease.clone());
        self.data_store.create_lease(&job.name, &lease.id).await?;
        Ok(Some((job, lease)))
    }

    /// Applies a Lease state transition reported by a bot (spec.md §4.5,
    /// §4.8). Completion with a non-OK status, or any other terminal
    /// failure, is routed through the retry policy rather than surfaced to
    /// the client directly (spec.md §7: "never result in client-visible RPC
    /// errors on the Execute path").
    pub async fn update_lease(
        &self,
        job_name: &str,
        new_state: LeaseState,
        status: Option<RpcStatus>,
        result: Option<ActionResult>,
    ) -> Result<(), ComponentError> {
        let job = self
            .get_job(job_name)
            .ok_or_else(|| SchedulerError::JobNotFound(job_name.to_owned()))?;

        job.update_lease_state(new_state, status.clone(), result.clone());
        self.data_store
            .update_lease(job_name, new_state, status.as_ref().map(|s| s.code))
            .await?;

        match new_state {
            LeaseState::Active => {
                job.set_stage(ExecuteStage::Executing);
                self.data_store
                    .update_job(job_name, &[FieldChange::Stage(ExecuteStage::Executing)])
                    .await?;
            }
            LeaseState::Completed => {
                let ok = status.as_ref().map(|s| s.code == 0).unwrap_or(true);
                if ok {
                    self.complete_job(&job, status, result).await?;
                } else if job.is_cancelled() {
                    self.complete_job(&job, status, result).await?;
                } else {
                    self.retry_job(job_name).await?;
                }
            }
            LeaseState::Pending | LeaseState::Unspecified | LeaseState::Cancelled => {}
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        job: &Arc<Job>,
        status: Option<RpcStatus>,
        result: Option<ActionResult>,
    ) -> Result<(), ComponentError> {
        let response = ExecuteResponse {
            result,
            cached_result: false,
            status,
            server_logs: Default::default(),
            message: String::new(),
        };
        job.complete(response);
        log_event(
            MetricRecordDomain::Build,
            MetricRecordType::Counter,
            LogRecordLevel::Info,
            &format!("job {} completed", job.name),
        );
        self.data_store
            .update_job(&job.name, &[FieldChange::Stage(ExecuteStage::Completed)])
            .await
    }

    /// Session loss (spec.md §4.6): the bot disappeared before completing
    /// its lease. Treated identically to a failed lease completion.
    pub async fn handle_session_loss(&self, job_name: &str) -> Result<(), ComponentError> {
        if self.get_job(job_name).is_none() {
            return Ok(());
        }
        self.retry_job(job_name).await
    }

    /// Retry policy (spec.md §4.5): EXECUTING -> QUEUED until `n_tries`
    /// reaches `MAX_RETRIES`, after which the Job completes with an error.
    /// A retried Job re-enters the queue at the front of its priority class
    /// (spec.md §4.6 Fairness and tie-breaks).
    pub async fn retry_job(&self, job_name: &str) -> Result<(), ComponentError> {
        let job = self
            .get_job(job_name)
            .ok_or_else(|| SchedulerError::JobNotFound(job_name.to_owned()))?;

        if job.is_cancelled() {
            return Ok(());
        }

        if job.n_tries() + 1 > MAX_RETRIES {
            let response = ExecuteResponse {
                result: None,
                cached_result: false,
                status: Some(RpcStatus {
                    code: tonic::Code::Internal as i32,
                    message: format!("job {job_name} exceeded its retry budget"),
                    details: Vec::new(),
                }),
                server_logs: Default::default(),
                message: "retry budget exceeded".into(),
            };
            job.complete(response);
            log_event(
                MetricRecordDomain::Build,
                MetricRecordType::Counter,
                LogRecordLevel::Error,
                &format!("job {job_name} exceeded its retry budget"),
            );
            self.data_store
                .update_job(job_name, &[FieldChange::Stage(ExecuteStage::Completed)])
                .await?;
            return Err(SchedulerError::RetryExceeded(job_name.to_owned()).into());
        }

        job.retry();
        log_event(
            MetricRecordDomain::Build,
            MetricRecordType::Counter,
            LogRecordLevel::Warning,
            &format!("job {job_name} retried, attempt {}", job.n_tries()),
        );
        self.data_store
            .update_job(
                job_name,
                &[
                    FieldChange::Stage(ExecuteStage::Queued),
                    FieldChange::NTries(job.n_tries()),
                ],
            )
            .await?;

        let mut index = self.index.lock();
        insert_sorted(&mut index.queue, job, true);
        Ok(())
    }

    /// Client-initiated cancellation (spec.md §4.5). Since each Job
    /// currently projects exactly one Operation (see `Job` docs), cancelling
    /// the Operation cancels the Job outright.
    pub async fn cancel_operation(&self, operation_name: &str) -> Result<(), ComponentError> {
        let job = self
            .get_job(operation_name)
            .ok_or_else(|| SchedulerError::OperationNotFound(operation_name.to_owned()))?;
        if job.is_cancelled() {
            return Ok(());
        }
        job.cancel();
        self.index.lock().queue.retain(|queued| queued.name != job.name);
        self.data_store
            .update_job(&job.name, &[FieldChange::Cancelled(true)])
            .await
    }

    pub fn list_operations(&self, name_filter: Option<&str>) -> Vec<buildgrid_proto::longrunning::Operation> {
        self.index
            .lock()
            .by_name
            .values()
            .filter(|job| name_filter.map(|f| job.name.contains(f)).unwrap_or(true))
            .map(|job| job.operation_snapshot())
            .collect()
    }

    /// Garbage-collects a Job once it has no subscribers and no lease
    /// (spec.md §3 Lifecycle, §4.9).
    pub async fn maybe_collect(&self, job_name: &str) -> Result<(), ComponentError> {
        let should_delete = {
            let mut index = self.index.lock();
            match index.by_name.get(job_name) {
                Some(job) if job.can_be_collected() => {
                    index.by_name.remove(job_name);
                    index.queue.retain(|queued| queued.name != job_name);
                    true
                }
                _ => false,
            }
        };
        if should_delete {
            self.data_store.delete_job(job_name).await?;
            log_event(
                MetricRecordDomain::State,
                MetricRecordType::Counter,
                LogRecordLevel::Debug,
                &format!("job {job_name} collected"),
            );
        }
        Ok(())
    }

    pub async fn jobs_in_stage(&self, stage: ExecuteStage) -> Result<Vec<JobRecord>, ComponentError> {
        self.data_store.list_jobs(JobFilter { stage: Some(stage) }).await
    }
}

/// A bot satisfies a Job's platform requirements iff every required
/// `name=value` pair appears in the worker's declared property set
/// (spec.md §4.6 Matching).
fn platform_satisfied(required: &[(String, String)], declared: &[(String, String)]) -> bool {
    required
        .iter()
        .all(|requirement| declared.iter().any(|property| property == requirement))
}

/// Inserts `job` into the priority-ordered queue. `front_of_class` places
/// it ahead of same-priority jobs (retry re-entry); otherwise it goes to
/// the back, preserving FIFO order within a priority class.
fn insert_sorted(queue: &mut VecDeque<Arc<Job>>, job: Arc<Job>, front_of_class: bool) {
    let priority = job.priority;
    let position = if front_of_class {
        queue.iter().position(|queued| queued.priority >= priority)
    } else {
        queue.iter().position(|queued| queued.priority > priority)
    };
    match position {
        Some(index) => queue.insert(index, job),
        None => queue.push_back(job),
    }
}

fn unix_nanos(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::InMemoryDataStore;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(InMemoryDataStore::new()))
    }

    fn job(priority: i32, platform: Vec<(String, String)>) -> Arc<Job> {
        Arc::new(Job::new(Digest::of_bytes(priority.to_string().as_bytes()), false, priority, platform))
    }

    #[tokio::test]
    async fn matching_skips_jobs_whose_platform_is_unsatisfied() {
        let scheduler = scheduler();
        let needs_gpu = job(0, vec![("gpu".into(), "true".into())]);
        let plain = job(0, vec![]);
        scheduler.queue_job(needs_gpu.clone()).await.unwrap();
        scheduler.queue_job(plain.clone()).await.unwrap();

        let (matched, _lease) = scheduler.assign_lease(&[]).await.unwrap().unwrap();
        assert_eq!(matched.name, plain.name);

        // The unmatched job keeps its place in the queue.
        let (matched, _lease) = scheduler
            .assign_lease(&[("gpu".into(), "true".into())])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.name, needs_gpu.name);
    }

    #[tokio::test]
    async fn higher_priority_class_matches_first() {
        let scheduler = scheduler();
        let low = job(5, vec![]);
        let high = job(1, vec![]);
        scheduler.queue_job(low.clone()).await.unwrap();
        scheduler.queue_job(high.clone()).await.unwrap();

        let (matched, _) = scheduler.assign_lease(&[]).await.unwrap().unwrap();
        assert_eq!(matched.name, high.name);
    }

    #[tokio::test]
    async fn retry_reinserts_at_front_of_its_priority_class() {
        let scheduler = scheduler();
        let first = job(0, vec![]);
        scheduler.queue_job(first.clone()).await.unwrap();
        let (matched, _lease) = scheduler.assign_lease(&[]).await.unwrap().unwrap();
        matched.set_stage(ExecuteStage::Executing);

        let second = job(0, vec![]);
        scheduler.queue_job(second.clone()).await.unwrap();

        scheduler.retry_job(&matched.name).await.unwrap();

        let (reassigned, _) = scheduler.assign_lease(&[]).await.unwrap().unwrap();
        assert_eq!(reassigned.name, matched.name);
    }

    #[tokio::test]
    async fn retry_past_max_completes_with_error() {
        let scheduler = scheduler();
        let j = job(0, vec![]);
        scheduler.queue_job(j.clone()).await.unwrap();
        for _ in 0..MAX_RETRIES {
            scheduler.assign_lease(&[]).await.unwrap();
            j.set_stage(ExecuteStage::Executing);
            scheduler.retry_job(&j.name).await.unwrap();
        }
        scheduler.assign_lease(&[]).await.unwrap();
        let result = scheduler.retry_job(&j.name).await;
        assert!(result.is_err());
        assert_eq!(j.stage(), ExecuteStage::Completed);
    }

    #[tokio::test]
    async fn cancel_operation_removes_job_from_queue() {
        let scheduler = scheduler();
        let j = job(0, vec![]);
        scheduler.queue_job(j.clone()).await.unwrap();
        scheduler.cancel_operation(&j.name).await.unwrap();
        assert!(j.is_cancelled());
        assert!(scheduler.assign_lease(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_operation_is_idempotent() {
        let scheduler = scheduler();
        let j = job(0, vec![]);
        scheduler.queue_job(j.clone()).await.unwrap();
        scheduler.cancel_operation(&j.name).await.unwrap();
        scheduler.cancel_operation(&j.name).await.unwrap();
        assert!(j.is_cancelled());
    }
}

// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Job/Operation/Lease state model (spec.md §3, §4.5). A Job owns its Lease
// and its subscriber table under a single lock; the Scheduler's queue lock
// is always acquired before a Job's lock (spec.md §5 lock ordering).

use std::time::{Duration, SystemTime};

use buildgrid_hashing::Digest;
use buildgrid_proto::longrunning::Operation;
use buildgrid_proto::re::{ActionResult, ExecuteOperationMetadata, ExecuteResponse};
use buildgrid_proto::rpc::Status as RpcStatus;
use parking_lot::Mutex;
use prost::Message;
use prost_types::Any;

use crate::watcher::{OperationUpdate, SubscriberTable};

/// Operation stage (spec.md §4.5): monotonic in the happy path, with
/// EXECUTING -> QUEUED the only backward transition (retry).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecuteStage {
    Unknown,
    CacheCheck,
    Queued,
    Executing,
    Completed,
}

impl ExecuteStage {
    fn proto_value(self) -> i32 {
        use buildgrid_proto::re::execute_operation_metadata::Stage;
        match self {
            ExecuteStage::Unknown => Stage::Unknown as i32,
            ExecuteStage::CacheCheck => Stage::CacheCheck as i32,
            ExecuteStage::Queued => Stage::Queued as i32,
            ExecuteStage::Executing => Stage::Executing as i32,
            ExecuteStage::Completed => Stage::Completed as i32,
        }
    }
}

/// Lease state (spec.md §4.5): UNSPECIFIED -> PENDING -> ACTIVE ->
/// COMPLETED, with CANCELLED reachable from PENDING or ACTIVE.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaseState {
    Unspecified,
    Pending,
    Active,
    Completed,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct LeaseRecord {
    pub id: String,
    pub state: LeaseState,
    pub status: Option<RpcStatus>,
    pub result: Option<ActionResult>,
}

pub struct JobState {
    pub stage: ExecuteStage,
    pub lease: Option<LeaseRecord>,
    pub n_tries: u32,
    pub queued_timestamp: Option<SystemTime>,
    pub worker_start_timestamp: Option<SystemTime>,
    pub worker_completed_timestamp: Option<SystemTime>,
    pub queued_time_duration: Option<Duration>,
    pub cancelled: bool,
    pub execute_response: Option<ExecuteResponse>,
    pub do_not_cache: bool,
    pub subscribers: SubscriberTable,
}

/// Server-side record of an in-flight or finished action (spec.md §3).
///
/// Job and its single projected Operation share one name (grounded in the
/// original `Job.__init__`, which sets `self._operation = Operation(name=self._name)`);
/// see DESIGN.md for why this design does not pursue multiple independent
/// Operation names per Job.
pub struct Job {
    pub name: String,
    pub action_digest: Digest,
    pub priority: i32,
    pub platform_requirements: Vec<(String, String)>,
    state: Mutex<JobState>,
}

impl Job {
    pub fn new(
        action_digest: Digest,
        do_not_cache: bool,
        priority: i32,
        platform_requirements: Vec<(String, String)>,
    ) -> Job {
        Job {
            name: uuid::Uuid::new_v4().to_string(),
            action_digest,
            priority,
            platform_requirements,
            state: Mutex::new(JobState {
                stage: ExecuteStage::Unknown,
                lease: None,
                n_tries: 0,
                queued_timestamp: None,
                worker_start_timestamp: None,
                worker_completed_timestamp: None,
                queued_time_duration: None,
                cancelled: false,
                execute_response: None,
                do_not_cache,
                subscribers: SubscriberTable::new(),
            }),
        }
    }

    pub fn stage(&self) -> ExecuteStage {
        self.state.lock().stage
    }

    pub fn n_tries(&self) -> u32 {
        self.state.lock().n_tries
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn do_not_cache(&self) -> bool {
        self.state.lock().do_not_cache
    }

    pub fn lease(&self) -> Option<LeaseRecord> {
        self.state.lock().lease.clone()
    }

    /// Registers a new subscriber and immediately hands it a snapshot of the
    /// current operation state, mirroring `register_client` in the original.
    pub fn register_subscriber(&self) -> (uuid::Uuid, tokio::sync::mpsc::Receiver<OperationUpdate>) {
        let mut state = self.state.lock();
        let snapshot = build_operation(&self.name, &self.action_digest, &state);
        state.subscribers.register(snapshot)
    }

    pub fn unregister_subscriber(&self, id: uuid::Uuid) {
        self.state.lock().subscribers.unregister(id);
    }

    pub fn has_subscribers(&self) -> bool {
        !self.state.lock().subscribers.is_empty()
    }

    /// A one-off snapshot of the projected Operation, used by
    /// `ListOperations`/`GetOperation` which do not register a subscriber.
    pub fn operation_snapshot(&self) -> Operation {
        let state = self.state.lock();
        build_operation(&self.name, &self.action_digest, &state)
    }

    /// A Job may be garbage-collected only once it has no live subscribers
    /// and no worker holds a lease (spec.md §3 Lifecycle).
    pub fn can_be_collected(&self) -> bool {
        let state = self.state.lock();
        state.subscribers.is_empty() && state.lease.is_none()
    }

    pub fn set_stage(&self, stage: ExecuteStage) {
        let mut state = self.state.lock();
        self.set_stage_locked(&mut state, stage);
    }

    fn set_stage_locked(&self, state: &mut JobState, stage: ExecuteStage) {
        state.stage = stage;
        match stage {
            ExecuteStage::Queued if state.queued_timestamp.is_none() => {
                state.queued_timestamp = Some(SystemTime::now());
            }
            ExecuteStage::Executing => {
                if let Some(queued_at) = state.queued_timestamp {
                    state.queued_time_duration =
                        Some(SystemTime::now().duration_since(queued_at).unwrap_or_default());
                }
            }
            _ => {}
        }
        self.notify_locked(state);
    }

    /// Completion releases the worker's lease: a COMPLETED Job is no longer
    /// held by any worker, so `can_be_collected` must not keep waiting on it
    /// (spec.md §3 Lifecycle).
    pub fn complete(&self, execute_response: ExecuteResponse) {
        let mut state = self.state.lock();
        state.execute_response = Some(execute_response);
        state.lease = None;
        self.set_stage_locked(&mut state, ExecuteStage::Completed);
    }

    /// Retry: EXECUTING -> QUEUED, incrementing `n_tries` (spec.md §4.5).
    pub fn retry(&self) {
        let mut state = self.state.lock();
        state.n_tries += 1;
        state.lease = None;
        self.set_stage_locked(&mut state, ExecuteStage::Queued);
    }

    pub fn attach_lease(&self, lease: LeaseRecord) {
        let mut state = self.state.lock();
        state.lease = Some(lease);
        self.notify_locked(&mut state);
    }

    pub fn update_lease_state(&self, state_update: LeaseState, status: Option<RpcStatus>, result: Option<ActionResult>) {
        let mut state = self.state.lock();
        match state_update {
            LeaseState::Active => state.worker_start_timestamp = Some(SystemTime::now()),
            LeaseState::Completed => state.worker_completed_timestamp = Some(SystemTime::now()),
            LeaseState::Pending => {
                state.worker_start_timestamp = None;
                state.worker_completed_timestamp = None;
            }
            _ => {}
        }
        if let Some(lease) = state.lease.as_mut() {
            lease.state = state_update;
            lease.status = status.clone();
            lease.result = result.clone();
        }
        // A COMPLETED lease whose status is not OK forces do_not_cache (spec.md §4.5).
        if state_update == LeaseState::Completed {
            if let Some(status) = &status {
                if status.code != tonic::Code::Ok as i32 {
                    state.do_not_cache = true;
                }
            }
        }
        self.notify_locked(&mut state);
    }

    /// Marks the Job (and its sole Operation) cancelled; subscribers receive
    /// a cancellation notification (spec.md §4.5).
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.subscribers.notify_all(OperationUpdate::Cancelled);
    }

    fn notify_locked(&self, state: &mut JobState) {
        if state.cancelled {
            state.subscribers.notify_all(OperationUpdate::Cancelled);
            return;
        }
        let operation = build_operation(&self.name, &self.action_digest, state);
        state.subscribers.notify_all(OperationUpdate::Snapshot(operation));
    }
}

fn build_operation(name: &str, action_digest: &Digest, state: &JobState) -> Operation {
    let metadata = ExecuteOperationMetadata {
        stage: state.stage.proto_value(),
        action_digest: Some(action_digest.into()),
        stdout_stream_name: String::new(),
        stderr_stream_name: String::new(),
    };
    let done = state.stage == ExecuteStage::Completed;
    let response = state.execute_response.clone().map(|mut response| {
        response.cached_result = false;
        response
    });
    Operation {
        name: name.to_owned(),
        metadata: Some(pack_any(&metadata)),
        done,
        result: response.map(|response| {
            buildgrid_proto::longrunning::operation::Result::Response(pack_any(&response))
        }),
    }
}

fn pack_any<M: Message>(message: &M) -> Any {
    Any {
        type_url: String::new(),
        value: message.encode_to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::new(Digest::of_bytes(b"action"), false, 0, Vec::new())
    }

    #[test]
    fn stage_transitions_set_queued_timestamp_once() {
        let job = sample_job();
        job.set_stage(ExecuteStage::Queued);
        let first = job.state.lock().queued_timestamp;
        job.set_stage(ExecuteStage::Queued);
        let second = job.state.lock().queued_timestamp;
        assert_eq!(first, second);
    }

    #[test]
    fn retry_increments_n_tries_and_returns_to_queued() {
        let job = sample_job();
        job.set_stage(ExecuteStage::Queued);
        job.set_stage(ExecuteStage::Executing);
        job.retry();
        assert_eq!(job.stage(), ExecuteStage::Queued);
        assert_eq!(job.n_tries(), 1);
    }

    #[test]
    fn lease_completed_with_error_forces_do_not_cache() {
        let job = sample_job();
        job.attach_lease(LeaseRecord {
            id: job.name.clone(),
            state: LeaseState::Pending,
            status: None,
            result: None,
        });
        job.update_lease_state(
            LeaseState::Completed,
            Some(RpcStatus {
                code: tonic::Code::Internal as i32,
                message: "boom".into(),
                details: Vec::new(),
            }),
            None,
        );
        assert!(job.do_not_cache());
    }
}

// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Execution Instance (spec.md §4.7): `Execute`/`WaitExecution` entry
// points. Cache-check, Job creation, and subscription fan-out.

use std::pin::Pin;
use std::sync::Arc;

use buildgrid_action_cache::ActionCacheProvider;
use buildgrid_cas::CasBackend;
use buildgrid_hashing::Digest;
use buildgrid_proto::longrunning::{operation, Operation};
use buildgrid_proto::re::execution_server::Execution;
use buildgrid_proto::re::{
    Action, Digest as ProtoDigest, ExecuteOperationMetadata, ExecuteRequest, ExecuteResponse,
    WaitExecutionRequest,
};
use buildgrid_proto::rpc::Status as RpcStatus;
use buildgrid_scheduler::watcher::OperationUpdate;
use buildgrid_scheduler::{Job, Scheduler};
use futures::Stream;
use prost::Message;
use tonic::{Request, Response, Status};

pub struct ExecutionInstanceService {
    scheduler: Arc<Scheduler>,
    action_cache: Arc<dyn ActionCacheProvider>,
    cas: Arc<dyn CasBackend>,
}

impl ExecutionInstanceService {
    pub fn new(
        scheduler: Arc<Scheduler>,
        action_cache: Arc<dyn ActionCacheProvider>,
        cas: Arc<dyn CasBackend>,
    ) -> ExecutionInstanceService {
        ExecutionInstanceService {
            scheduler,
            action_cache,
            cas,
        }
    }

    async fn load_action(&self, digest: &Digest) -> Result<Action, Status> {
        let bytes = self
            .cas
            .get_blob(digest)
            .await
            .map_err(Status::from)?
            .ok_or_else(|| Status::not_found("action not present in CAS"))?;
        Action::decode(bytes).map_err(|err| Status::invalid_argument(err.to_string()))
    }

    fn cached_operation_stream(
        job_name: String,
        action_digest: ProtoDigest,
        result: buildgrid_proto::re::ActionResult,
    ) -> OperationStream {
        let metadata = ExecuteOperationMetadata {
            stage: buildgrid_proto::re::execute_operation_metadata::Stage::Completed as i32,
            action_digest: Some(action_digest),
            stdout_stream_name: String::new(),
            stderr_stream_name: String::new(),
        };
        let response = ExecuteResponse {
            result: Some(result),
            cached_result: true,
            status: Some(RpcStatus {
                code: tonic::Code::Ok as i32,
                message: String::new(),
                details: Vec::new(),
            }),
            server_logs: Default::default(),
            message: String::new(),
        };
        let operation = Operation {
            name: job_name,
            metadata: Some(pack_any(&metadata)),
            done: true,
            result: Some(operation::Result::Response(pack_any(&response))),
        };
        Box::pin(async_stream::stream! {
            yield Ok(operation);
        })
    }
}

type OperationStream = Pin<Box<dyn Stream<Item = Result<Operation, Status>> + Send + 'static>>;

fn pack_any<M: Message>(message: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: String::new(),
        value: message.encode_to_vec(),
    }
}

/// Converts a Job's subscriber channel into the stream of `Operation`
/// updates an RPC handler returns, unregistering the subscriber and
/// attempting garbage collection once the stream concludes (spec.md §4.9).
fn subscription_stream(scheduler: Arc<Scheduler>, job: Arc<Job>) -> OperationStream {
    let (id, mut rx) = job.register_subscriber();
    Box::pin(async_stream::stream! {
        let mut terminated_cleanly = false;
        while let Some(update) = rx.recv().await {
            match update {
                OperationUpdate::Snapshot(operation) => {
                    let done = operation.done;
                    yield Ok(operation);
                    if done {
                        terminated_cleanly = true;
                        break;
                    }
                }
                OperationUpdate::Cancelled => {
                    yield Ok(Operation {
                        name: job.name.clone(),
                        metadata: None,
                        done: true,
                        result: Some(operation::Result::Error(RpcStatus {
                            code: tonic::Code::Cancelled as i32,
                            message: "operation cancelled".into(),
                            details: Vec::new(),
                        })),
                    });
                    terminated_cleanly = true;
                    break;
                }
            }
        }
        job.unregister_subscriber(id);
        if !terminated_cleanly {
            // The channel closed without a terminal update: the subscriber
            // fell behind and was dropped (spec.md §9 "slow subscriber").
            yield Err(Status::resource_exhausted("fell behind on operation updates"));
        }
        let _ = scheduler.maybe_collect(&job.name).await;
    })
}

#[tonic::async_trait]
impl Execution for ExecutionInstanceService {
    type ExecuteStream = OperationStream;
    type WaitExecutionStream = OperationStream;

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let request = request.into_inner();
        let action_digest = buildgrid_proto::require_digest(request.action_digest.as_ref())
            .map_err(Status::invalid_argument)?;
        let proto_digest: ProtoDigest = action_digest.into();

        if !request.skip_cache_lookup {
            if let Some(result) = self
                .action_cache
                .get_action_result(&action_digest)
                .await
                .map_err(Status::from)?
            {
                let job_name = uuid::Uuid::new_v4().to_string();
                return Ok(Response::new(Self::cached_operation_stream(
                    job_name,
                    proto_digest,
                    result,
                )));
            }
        }

        let action = self.load_action(&action_digest).await?;
        let do_not_cache = action.do_not_cache;
        let platform = action
            .platform
            .map(|platform| {
                platform
                    .properties
                    .into_iter()
                    .map(|property| (property.name, property.value))
                    .collect()
            })
            .unwrap_or_default();
        let priority = request.execution_policy.map(|policy| policy.priority).unwrap_or(0);

        let job = Arc::new(Job::new(action_digest, do_not_cache, priority, platform));
        // Queue before registering the subscriber so the first snapshot it
        // receives already reflects QUEUED rather than the pre-queue stage.
        self.scheduler.queue_job(job.clone()).await.map_err(Status::from)?;
        let stream = subscription_stream(self.scheduler.clone(), job);
        Ok(Response::new(stream))
    }

    async fn wait_execution(
        &self,
        request: Request<WaitExecutionRequest>,
    ) -> Result<Response<Self::WaitExecutionStream>, Status> {
        let request = request.into_inner();
        let job = self
            .scheduler
            .get_job(&request.name)
            .ok_or_else(|| Status::not_found("no such operation"))?;
        Ok(Response::new(subscription_stream(self.scheduler.clone(), job)))
    }
}

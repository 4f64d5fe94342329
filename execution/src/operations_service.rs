// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// `google.longrunning.Operations` surface (spec.md §6 Wire protocols): the
// client-facing view the Execution Instance projects Job state onto for
// `ListOperations`/`GetOperation`/`CancelOperation`.

use std::sync::Arc;

use buildgrid_proto::longrunning::operations_server::Operations;
use buildgrid_proto::longrunning::{
    CancelOperationRequest, DeleteOperationRequest, GetOperationRequest, ListOperationsRequest,
    ListOperationsResponse, Operation,
};
use buildgrid_scheduler::Scheduler;
use prost_types::Empty;
use tonic::{Request, Response, Status};

pub struct OperationsService {
    scheduler: Arc<Scheduler>,
}

impl OperationsService {
    pub fn new(scheduler: Arc<Scheduler>) -> OperationsService {
        OperationsService { scheduler }
    }
}

#[tonic::async_trait]
impl Operations for OperationsService {
    async fn list_operations(
        &self,
        request: Request<ListOperationsRequest>,
    ) -> Result<Response<ListOperationsResponse>, Status> {
        let request = request.into_inner();
        let filter = if request.filter.is_empty() {
            None
        } else {
            Some(request.filter.as_str())
        };
        Ok(Response::new(ListOperationsResponse {
            operations: self.scheduler.list_operations(filter),
            next_page_token: String::new(),
        }))
    }

    async fn get_operation(
        &self,
        request: Request<GetOperationRequest>,
    ) -> Result<Response<Operation>, Status> {
        let request = request.into_inner();
        let job = self
            .scheduler
            .get_job(&request.name)
            .ok_or_else(|| Status::not_found("no such operation"))?;
        Ok(Response::new(job.operation_snapshot()))
    }

    /// The original deletes Operations only as a side effect of the last
    /// subscriber unregistering (spec.md §4.9); an explicit client-driven
    /// delete is accepted but does not itself tear down server state.
    async fn delete_operation(
        &self,
        _request: Request<DeleteOperationRequest>,
    ) -> Result<Response<Empty>, Status> {
        Ok(Response::new(Empty {}))
    }

    async fn cancel_operation(
        &self,
        request: Request<CancelOperationRequest>,
    ) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();
        self.scheduler
            .cancel_operation(&request.name)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(Empty {}))
    }
}

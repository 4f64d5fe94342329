// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Multi-instance dispatch (spec.md §6: config is a list of named
// `instances`, each exposing some subset of services, all reachable over
// every configured channel). Every REAPI/RWAPI request carries (or, for
// ByteStream, encodes in its resource name) the target `instance_name`;
// these wrappers pick the right per-instance service and delegate to it.
//
// Job/Operation names are plain UUIDs with no instance prefix (see
// `buildgrid-scheduler::Job`), so `Operations`/`Bots` dispatch by trying
// each instance's Scheduler in turn rather than parsing a prefix out of the
// name. Deployments have few instances, so this is not a hot loop.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use buildgrid_cas_service::{parse_read_resource_name, parse_write_resource_name, CasInstance};
use buildgrid_execution::{BotsInstanceService, ExecutionInstanceService, OperationsService};
use buildgrid_proto::bytestream::byte_stream_server::ByteStream;
use buildgrid_proto::bytestream::{ReadRequest, ReadResponse, WriteRequest, WriteResponse};
use buildgrid_proto::longrunning::operations_server::Operations;
use buildgrid_proto::longrunning::{
    CancelOperationRequest, DeleteOperationRequest, GetOperationRequest, ListOperationsRequest,
    ListOperationsResponse, Operation,
};
use buildgrid_proto::re::action_cache_server::ActionCache as ActionCacheTrait;
use buildgrid_proto::re::capabilities_server::Capabilities;
use buildgrid_proto::re::content_addressable_storage_server::ContentAddressableStorage;
use buildgrid_proto::re::execution_server::Execution;
use buildgrid_proto::re::{
    ActionResult, BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, ExecuteRequest, FindMissingBlobsRequest, FindMissingBlobsResponse,
    GetActionResultRequest, GetCapabilitiesRequest, GetTreeRequest, GetTreeResponse, ServerCapabilities,
    UpdateActionResultRequest, WaitExecutionRequest,
};
use buildgrid_proto::rwapi::bots_server::Bots;
use buildgrid_proto::rwapi::{BotSession, CreateBotSessionRequest, UpdateBotSessionRequest};
use futures::Stream;
use tonic::{Request, Response, Status};

fn not_found(instance_name: &str) -> Status {
    Status::not_found(format!("no such instance: {instance_name:?}"))
}

macro_rules! by_name {
    ($map:expr, $name:expr) => {
        $map.get($name).cloned().ok_or_else(|| not_found($name))?
    };
}

#[derive(Clone)]
pub struct MultiCas {
    instances: HashMap<String, Arc<CasInstance>>,
}

impl MultiCas {
    pub fn new(instances: HashMap<String, Arc<CasInstance>>) -> MultiCas {
        MultiCas { instances }
    }
}

#[tonic::async_trait]
impl ContentAddressableStorage for MultiCas {
    type GetTreeStream = Pin<Box<dyn Stream<Item = Result<GetTreeResponse, Status>> + Send + 'static>>;

    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        let instance = by_name!(self.instances, &request.get_ref().instance_name);
        instance.find_missing_blobs(request).await
    }

    async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        let instance = by_name!(self.instances, &request.get_ref().instance_name);
        instance.batch_update_blobs(request).await
    }

    async fn batch_read_blobs(
        &self,
        request: Request<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        let instance = by_name!(self.instances, &request.get_ref().instance_name);
        instance.batch_read_blobs(request).await
    }

    async fn get_tree(&self, request: Request<GetTreeRequest>) -> Result<Response<Self::GetTreeStream>, Status> {
        let instance = by_name!(self.instances, &request.get_ref().instance_name);
        instance.get_tree(request).await
    }
}

#[derive(Clone)]
pub struct MultiByteStream {
    backends: HashMap<String, Arc<buildgrid_cas_service::ByteStreamService>>,
}

impl MultiByteStream {
    pub fn new(backends: HashMap<String, Arc<buildgrid_cas_service::ByteStreamService>>) -> MultiByteStream {
        MultiByteStream { backends }
    }
}

#[tonic::async_trait]
impl ByteStream for MultiByteStream {
    type ReadStream = Pin<Box<dyn Stream<Item = Result<ReadResponse, Status>> + Send + 'static>>;

    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<Self::ReadStream>, Status> {
        let resource = parse_read_resource_name(&request.get_ref().resource_name).map_err(Status::from)?;
        let instance = by_name!(self.backends, &resource.instance_name);
        instance.read(request).await
    }

    async fn write(
        &self,
        request: Request<tonic::Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty write stream"))?;
        let resource = parse_write_resource_name(&first.resource_name).map_err(Status::from)?;
        let instance = by_name!(self.backends, &resource.instance_name);
        instance.write_from_first_message(first, stream).await
    }

    async fn query_write_status(
        &self,
        request: Request<buildgrid_proto::bytestream::QueryWriteStatusRequest>,
    ) -> Result<Response<buildgrid_proto::bytestream::QueryWriteStatusResponse>, Status> {
        let resource = parse_write_resource_name(&request.get_ref().resource_name).map_err(Status::from)?;
        let instance = by_name!(self.backends, &resource.instance_name);
        instance.query_write_status(request).await
    }
}

#[derive(Clone)]
pub struct MultiActionCache {
    instances: HashMap<String, Arc<buildgrid_action_cache::ActionCacheService>>,
}

impl MultiActionCache {
    pub fn new(instances: HashMap<String, Arc<buildgrid_action_cache::ActionCacheService>>) -> MultiActionCache {
        MultiActionCache { instances }
    }
}

#[tonic::async_trait]
impl ActionCacheTrait for MultiActionCache {
    async fn get_action_result(
        &self,
        request: Request<GetActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let instance = by_name!(self.instances, &request.get_ref().instance_name);
        instance.get_action_result(request).await
    }

    async fn update_action_result(
        &self,
        request: Request<UpdateActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let instance = by_name!(self.instances, &request.get_ref().instance_name);
        instance.update_action_result(request).await
    }
}

#[derive(Clone)]
pub struct MultiCapabilities {
    instances: HashMap<String, Arc<buildgrid_cas_service::CapabilitiesService>>,
}

impl MultiCapabilities {
    pub fn new(instances: HashMap<String, Arc<buildgrid_cas_service::CapabilitiesService>>) -> MultiCapabilities {
        MultiCapabilities { instances }
    }
}

#[tonic::async_trait]
impl Capabilities for MultiCapabilities {
    async fn get_capabilities(
        &self,
        request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        let instance = by_name!(self.instances, &request.get_ref().instance_name);
        instance.get_capabilities(request).await
    }
}

#[derive(Clone)]
pub struct MultiExecution {
    instances: HashMap<String, Arc<ExecutionInstanceService>>,
}

impl MultiExecution {
    pub fn new(instances: HashMap<String, Arc<ExecutionInstanceService>>) -> MultiExecution {
        MultiExecution { instances }
    }
}

#[tonic::async_trait]
impl Execution for MultiExecution {
    type ExecuteStream = <ExecutionInstanceService as Execution>::ExecuteStream;
    type WaitExecutionStream = <ExecutionInstanceService as Execution>::WaitExecutionStream;

    async fn execute(&self, request: Request<ExecuteRequest>) -> Result<Response<Self::ExecuteStream>, Status> {
        let instance = by_name!(self.instances, &request.get_ref().instance_name);
        instance.execute(request).await
    }

    async fn wait_execution(
        &self,
        request: Request<WaitExecutionRequest>,
    ) -> Result<Response<Self::WaitExecutionStream>, Status> {
        let name = request.get_ref().name.clone();
        for instance in self.instances.values() {
            match instance.wait_execution(Request::new(WaitExecutionRequest { name: name.clone() })).await {
                Ok(response) => return Ok(response),
                Err(status) if status.code() == tonic::Code::NotFound => continue,
                Err(status) => return Err(status),
            }
        }
        Err(Status::not_found("no such operation"))
    }
}

#[derive(Clone)]
pub struct MultiBots {
    instances: HashMap<String, Arc<BotsInstanceService>>,
}

impl MultiBots {
    pub fn new(instances: HashMap<String, Arc<BotsInstanceService>>) -> MultiBots {
        MultiBots { instances }
    }
}

#[tonic::async_trait]
impl Bots for MultiBots {
    async fn create_bot_session(
        &self,
        request: Request<CreateBotSessionRequest>,
    ) -> Result<Response<BotSession>, Status> {
        let instance = by_name!(self.instances, &request.get_ref().parent);
        instance.create_bot_session(request).await
    }

    async fn update_bot_session(
        &self,
        request: Request<UpdateBotSessionRequest>,
    ) -> Result<Response<BotSession>, Status> {
        // `name` was built by `create_bot_session` as "<parent>/<uuid>".
        let name = request.get_ref().name.clone();
        let parent = name.rsplit_once('/').map(|(parent, _)| parent).unwrap_or(&name);
        let instance = by_name!(self.instances, parent);
        instance.update_bot_session(request).await
    }
}

#[derive(Clone)]
pub struct MultiOperations {
    instances: Vec<Arc<OperationsService>>,
}

impl MultiOperations {
    pub fn new(instances: Vec<Arc<OperationsService>>) -> MultiOperations {
        MultiOperations { instances }
    }
}

#[tonic::async_trait]
impl Operations for MultiOperations {
    async fn list_operations(
        &self,
        request: Request<ListOperationsRequest>,
    ) -> Result<Response<ListOperationsResponse>, Status> {
        let inner = request.get_ref().clone();
        let mut operations = Vec::new();
        for instance in &self.instances {
            let response = instance
                .list_operations(Request::new(inner.clone()))
                .await?
                .into_inner();
            operations.extend(response.operations);
        }
        Ok(Response::new(ListOperationsResponse {
            operations,
            next_page_token: String::new(),
        }))
    }

    async fn get_operation(&self, request: Request<GetOperationRequest>) -> Result<Response<Operation>, Status> {
        let name = request.get_ref().name.clone();
        for instance in &self.instances {
            match instance.get_operation(Request::new(GetOperationRequest { name: name.clone() })).await {
                Ok(response) => return Ok(response),
                Err(status) if status.code() == tonic::Code::NotFound => continue,
                Err(status) => return Err(status),
            }
        }
        Err(Status::not_found("no such operation"))
    }

    async fn delete_operation(
        &self,
        request: Request<DeleteOperationRequest>,
    ) -> Result<Response<prost_types::Empty>, Status> {
        if let Some(instance) = self.instances.first() {
            return instance.delete_operation(request).await;
        }
        Ok(Response::new(prost_types::Empty {}))
    }

    async fn cancel_operation(
        &self,
        request: Request<CancelOperationRequest>,
    ) -> Result<Response<prost_types::Empty>, Status> {
        let name = request.get_ref().name.clone();
        for instance in &self.instances {
            match instance
                .cancel_operation(Request::new(CancelOperationRequest { name: name.clone() }))
                .await
            {
                Ok(response) => return Ok(response),
                Err(status) if status.code() == tonic::Code::NotFound => continue,
                Err(status) => return Err(status),
            }
        }
        Err(Status::not_found("no such operation"))
    }
}

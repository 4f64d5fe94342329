// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// gRPC surface for the `ActionCache` service (spec.md §4.3, §6), grounded on
// the shape of a tonic service wrapping a single backing store.

use std::sync::Arc;

use buildgrid_proto::re::{
    action_cache_server::ActionCache as ActionCacheTrait, ActionResult, GetActionResultRequest,
    UpdateActionResultRequest,
};
use tonic::{Request, Response, Status};

use crate::ActionCacheProvider;

pub struct ActionCacheService {
    provider: Arc<dyn ActionCacheProvider>,
}

impl ActionCacheService {
    pub fn new(provider: Arc<dyn ActionCacheProvider>) -> ActionCacheService {
        ActionCacheService { provider }
    }
}

#[tonic::async_trait]
impl ActionCacheTrait for ActionCacheService {
    async fn get_action_result(
        &self,
        request: Request<GetActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let request = request.into_inner();
        let digest = buildgrid_proto::require_digest(request.action_digest.as_ref())
            .map_err(Status::invalid_argument)?;
        match self
            .provider
            .get_action_result(&digest)
            .await
            .map_err(Status::from)?
        {
            Some(result) => Ok(Response::new(result)),
            None => Err(Status::not_found("no cached result for this action digest")),
        }
    }

    async fn update_action_result(
        &self,
        request: Request<UpdateActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        let request = request.into_inner();
        let digest = buildgrid_proto::require_digest(request.action_digest.as_ref())
            .map_err(Status::invalid_argument)?;
        let result = request
            .action_result
            .ok_or_else(|| Status::invalid_argument("missing action_result"))?;
        self.provider
            .update_action_result(&digest, result.clone())
            .await
            .map_err(Status::from)?;
        Ok(Response::new(result))
    }
}

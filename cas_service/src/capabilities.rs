// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Capabilities service (spec_full.md §6 EXPANDED): advertises the batch
// size ceiling and symlink strategy the CAS/Execution instances enforce.

use buildgrid_proto::re::capabilities_server::Capabilities;
use buildgrid_proto::re::{
    ActionCacheUpdateCapabilities, CacheCapabilities, DigestFunctionValue, ExecutionCapabilities,
    GetCapabilitiesRequest, ServerCapabilities, SymlinkAbsolutePathStrategy,
};
use tonic::{Request, Response, Status};

pub struct CapabilitiesService {
    max_batch_total_size_bytes: i64,
    action_cache_update_enabled: bool,
    execution_enabled: bool,
}

impl CapabilitiesService {
    pub fn new(
        max_batch_total_size_bytes: i64,
        action_cache_update_enabled: bool,
        execution_enabled: bool,
    ) -> CapabilitiesService {
        CapabilitiesService {
            max_batch_total_size_bytes,
            action_cache_update_enabled,
            execution_enabled,
        }
    }
}

#[tonic::async_trait]
impl Capabilities for CapabilitiesService {
    async fn get_capabilities(
        &self,
        _request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        Ok(Response::new(ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                digest_functions: vec![DigestFunctionValue::Sha256 as i32],
                action_cache_update_capabilities: Some(ActionCacheUpdateCapabilities {
                    update_enabled: self.action_cache_update_enabled,
                }),
                cache_priority_capabilities: None,
                max_batch_total_size_bytes: self.max_batch_total_size_bytes,
                symlink_absolute_path_strategy: SymlinkAbsolutePathStrategy::Disallowed as i32,
            }),
            execution_capabilities: Some(ExecutionCapabilities {
                digest_function: DigestFunctionValue::Sha256 as i32,
                exec_enabled: self.execution_enabled,
                execution_priority_capabilities: None,
            }),
            deprecated_api_version: None,
            low_api_version: None,
            high_api_version: None,
        }))
    }
}

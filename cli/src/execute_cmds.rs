// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// `execute dummy|status|list` (spec.md §6 CLI surface; spec_full.md's
// expansion of the original's `cmd_execute.py`).

use buildgrid_hashing::Digest;
use buildgrid_proto::longrunning::operations_client::OperationsClient;
use buildgrid_proto::longrunning::ListOperationsRequest;
use buildgrid_proto::re::content_addressable_storage_client::ContentAddressableStorageClient;
use buildgrid_proto::re::execution_client::ExecutionClient;
use buildgrid_proto::re::{Action, BatchUpdateBlobsRequest, Command, ExecuteRequest, WaitExecutionRequest};
use prost::Message;
use tonic::transport::Channel;
use tonic::Request;

use crate::client::with_auth;

/// Builds a canned no-op Action (`true`, no inputs) and uploads its blobs.
async fn upload_dummy_action(channel: Channel, instance_name: &str, auth_token: &Option<String>) -> Result<Digest, String> {
    let command = Command {
        arguments: vec!["true".to_string()],
        ..Default::default()
    };
    let command_bytes = command.encode_to_vec();
    let command_digest = Digest::of_bytes(&command_bytes);

    let action = Action {
        command_digest: Some((&command_digest).into()),
        input_root_digest: Some((&buildgrid_hashing::EMPTY_DIGEST).into()),
        do_not_cache: true,
        ..Default::default()
    };
    let action_bytes = action.encode_to_vec();
    let action_digest = Digest::of_bytes(&action_bytes);

    let mut cas = ContentAddressableStorageClient::new(channel);
    let request = with_auth(
        Request::new(BatchUpdateBlobsRequest {
            instance_name: instance_name.to_string(),
            requests: vec![
                buildgrid_proto::re::batch_update_blobs_request::Request {
                    digest: Some((&command_digest).into()),
                    data: bytes::Bytes::copy_from_slice(&command_bytes),
                },
                buildgrid_proto::re::batch_update_blobs_request::Request {
                    digest: Some((&action_digest).into()),
                    data: bytes::Bytes::copy_from_slice(&action_bytes),
                },
            ],
        }),
        auth_token,
    )?;
    cas.batch_update_blobs(request)
        .await
        .map_err(|status| format!("BatchUpdateBlobs: {status}"))?;
    Ok(action_digest)
}

pub async fn dummy(channel: Channel, instance_name: &str, auth_token: &Option<String>) -> Result<(), String> {
    let action_digest = upload_dummy_action(channel.clone(), instance_name, auth_token).await?;

    let mut execution = ExecutionClient::new(channel);
    let request = with_auth(
        Request::new(ExecuteRequest {
            instance_name: instance_name.to_string(),
            skip_cache_lookup: true,
            action_digest: Some((&action_digest).into()),
            execution_policy: None,
            results_cache_policy: None,
        }),
        auth_token,
    )?;
    let mut stream = execution.execute(request).await.map_err(|status| format!("Execute: {status}"))?.into_inner();
    while let Some(operation) = stream.message().await.map_err(|status| format!("Execute: {status}"))? {
        println!("{} done={}", operation.name, operation.done);
        if operation.done {
            break;
        }
    }
    Ok(())
}

pub async fn status(channel: Channel, name: &str, auth_token: &Option<String>) -> Result<(), String> {
    let mut execution = ExecutionClient::new(channel);
    let request = with_auth(Request::new(WaitExecutionRequest { name: name.to_string() }), auth_token)?;
    let mut stream = execution.wait_execution(request).await.map_err(|status| format!("WaitExecution: {status}"))?.into_inner();
    match stream.message().await.map_err(|status| format!("WaitExecution: {status}"))? {
        Some(operation) => println!("{} done={}", operation.name, operation.done),
        None => println!("{name}: no update"),
    }
    Ok(())
}

pub async fn list(channel: Channel, auth_token: &Option<String>) -> Result<(), String> {
    let mut operations = OperationsClient::new(channel);
    let request = with_auth(
        Request::new(ListOperationsRequest {
            name: String::new(),
            filter: String::new(),
            page_size: 0,
            page_token: String::new(),
        }),
        auth_token,
    )?;
    let response = operations.list_operations(request).await.map_err(|status| format!("ListOperations: {status}"))?.into_inner();
    for operation in response.operations {
        println!("{} done={}", operation.name, operation.done);
    }
    Ok(())
}

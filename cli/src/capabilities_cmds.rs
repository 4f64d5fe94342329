// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// `capabilities` (spec.md §6 CLI surface; mirrors the original's
// `cmd_capabilities.py`).

use buildgrid_proto::re::capabilities_client::CapabilitiesClient;
use buildgrid_proto::re::GetCapabilitiesRequest;
use tonic::transport::Channel;
use tonic::Request;

use crate::client::with_auth;

pub async fn capabilities(channel: Channel, instance_name: &str, auth_token: &Option<String>) -> Result<(), String> {
    let mut client = CapabilitiesClient::new(channel);
    let request = with_auth(
        Request::new(GetCapabilitiesRequest {
            instance_name: instance_name.to_string(),
        }),
        auth_token,
    )?;
    let response = client.get_capabilities(request).await.map_err(|status| format!("GetCapabilities: {status}"))?.into_inner();
    println!("{response:#?}");
    Ok(())
}

// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Channel setup shared by every subcommand (spec.md §6 CLI surface: global
// `--remote`/`--client-key`/`--client-cert`/`--server-cert`/`--auth-token`
// flags), grounded in the teacher's `grpc_util::create_endpoint`.

use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::Request;

use crate::Connection;

pub async fn connect(connection: &Connection) -> Result<Channel, String> {
    let uri = tonic::transport::Uri::try_from(connection.remote.as_str())
        .map_err(|err| format!("invalid --remote address {:?}: {err}", connection.remote))?;
    let mut endpoint = Endpoint::from(uri);

    if connection.client_cert.is_some() || connection.client_key.is_some() || connection.server_cert.is_some() {
        let mut tls = ClientTlsConfig::new();
        if let Some(server_cert) = &connection.server_cert {
            let pem = std::fs::read(server_cert).map_err(|err| format!("reading {server_cert:?}: {err}"))?;
            tls = tls.ca_certificate(Certificate::from_pem(pem));
        }
        if let (Some(cert), Some(key)) = (&connection.client_cert, &connection.client_key) {
            let cert = std::fs::read(cert).map_err(|err| format!("reading {cert:?}: {err}"))?;
            let key = std::fs::read(key).map_err(|err| format!("reading {key:?}: {err}"))?;
            tls = tls.identity(Identity::from_pem(cert, key));
        }
        endpoint = endpoint.tls_config(tls).map_err(|err| format!("TLS setup: {err}"))?;
    }

    endpoint.connect().await.map_err(|err| format!("connecting to {:?}: {err}", connection.remote))
}

/// Attaches the `--auth-token` flag, if given, as a bearer token.
pub fn with_auth<T>(mut request: Request<T>, auth_token: &Option<String>) -> Result<Request<T>, String> {
    if let Some(token) = auth_token {
        let value = MetadataValue::try_from(format!("Bearer {token}")).map_err(|err| format!("invalid --auth-token: {err}"))?;
        request.metadata_mut().insert("authorization", value);
    }
    Ok(request)
}

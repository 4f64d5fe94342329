// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// `buildgrid-server` (spec.md §6, spec_full.md §2): loads a YAML config,
// wires the instances it names, and serves every configured channel.
// Exposed as a library too so `buildgrid-cli`'s `server start` subcommand
// can drive the same wiring without shelling out to this crate's binary.

pub mod config;
pub mod instance;
pub mod multiplex;

use std::path::Path;

use buildgrid_proto::bytestream::byte_stream_server::ByteStreamServer;
use buildgrid_proto::longrunning::operations_server::OperationsServer;
use buildgrid_proto::re::action_cache_server::ActionCacheServer;
use buildgrid_proto::re::capabilities_server::CapabilitiesServer;
use buildgrid_proto::re::content_addressable_storage_server::ContentAddressableStorageServer;
use buildgrid_proto::re::execution_server::ExecutionServer;
use buildgrid_proto::rwapi::bots_server::BotsServer;
use config::ServerConfig;
use tonic::transport::{Identity, Server, ServerTlsConfig};

pub fn level_filter(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

async fn build_tls_config(tls: &config::TlsConfig) -> Result<ServerTlsConfig, String> {
    let cert = tokio::fs::read(&tls.server_cert)
        .await
        .map_err(|err| format!("reading {:?}: {err}", tls.server_cert))?;
    let key = tokio::fs::read(&tls.server_key)
        .await
        .map_err(|err| format!("reading {:?}: {err}", tls.server_key))?;
    let mut tls_config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
    if let Some(client_ca) = &tls.client_ca {
        let ca = tokio::fs::read(client_ca)
            .await
            .map_err(|err| format!("reading {:?}: {err}", client_ca))?;
        tls_config = tls_config.client_ca_root(tonic::transport::Certificate::from_pem(ca));
    }
    Ok(tls_config)
}

/// Reads `config_path`, wires every named instance it describes, and serves
/// all configured channels until one of them fails. Does not return on
/// success; callers that need a "server stop" story run this under a task
/// they can abort instead.
pub async fn serve(config_path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(config_path).map_err(|err| format!("reading {config_path:?}: {err}"))?;
    let config: ServerConfig = serde_yaml::from_str(&contents).map_err(|err| format!("parsing {config_path:?}: {err}"))?;

    let built = instance::build_services(&config).await?;
    let (cas, bytestream, action_cache, capabilities, execution, bots, operations) = built.into_multiplexers();

    if config.server.is_empty() {
        return Err("config declares no server channels to listen on".to_string());
    }

    let mut tasks = Vec::new();
    for channel in config.server {
        let addr = channel
            .address
            .parse()
            .map_err(|err| format!("invalid address {:?}: {err}", channel.address))?;

        let mut builder = Server::builder();
        if let Some(tls) = &channel.tls {
            let tls_config = build_tls_config(tls).await?;
            builder = builder.tls_config(tls_config).map_err(|err| err.to_string())?;
        }

        let router = builder
            .add_service(ContentAddressableStorageServer::new(cas.clone()))
            .add_service(ByteStreamServer::new(bytestream.clone()))
            .add_service(ActionCacheServer::new(action_cache.clone()))
            .add_service(CapabilitiesServer::new(capabilities.clone()))
            .add_service(ExecutionServer::new(execution.clone()))
            .add_service(BotsServer::new(bots.clone()))
            .add_service(OperationsServer::new(operations.clone()));

        log::info!("listening on {addr}");
        tasks.push(tokio::spawn(async move { router.serve(addr).await }));
    }

    for task in tasks {
        task.await
            .map_err(|err| err.to_string())?
            .map_err(|err| err.to_string())?;
    }
    Ok(())
}

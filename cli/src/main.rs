// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// `buildgrid-cli` (spec.md §6 CLI surface; spec_full.md §6 EXPANDED CLI
// surface detail): a thin REAPI/RWAPI client mirroring the original's
// `cmd_cas.py`/`cmd_execute.py`/`cmd_capabilities.py`, using `clap` derive
// macros the way the teacher's `process_executor` binary does.

mod capabilities_cmds;
mod cas_cmds;
mod client;
mod execute_cmds;
mod server_cmds;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Connection details shared by every subcommand that talks to a running
/// server (spec.md §6: `--remote`, `--instance-name`, mTLS flags, auth token).
pub struct Connection {
    pub remote: String,
    pub instance_name: String,
    pub client_key: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub server_cert: Option<PathBuf>,
    pub auth_token: Option<String>,
}

#[derive(Parser)]
#[command(about = "Thin REAPI/RWAPI client for a buildgrid-server deployment")]
struct Cli {
    /// Address of the server to connect to, e.g. "http://localhost:50051".
    #[arg(long, global = true, default_value = "http://localhost:50051")]
    remote: String,

    /// Instance name to address requests to.
    #[arg(long, global = true, default_value = "")]
    instance_name: String,

    #[arg(long, global = true)]
    client_key: Option<PathBuf>,

    #[arg(long, global = true)]
    client_cert: Option<PathBuf>,

    #[arg(long, global = true)]
    server_cert: Option<PathBuf>,

    #[arg(long, global = true)]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage a `buildgrid-server` process.
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },
    /// Content-addressable storage transfers.
    Cas {
        #[command(subcommand)]
        command: CasCommand,
    },
    /// Reports the server's advertised capabilities.
    Capabilities,
    /// Submit and inspect remote executions.
    Execute {
        #[command(subcommand)]
        command: ExecuteCommand,
    },
}

#[derive(Subcommand)]
enum ServerCommand {
    /// Runs a server in the foreground using the given YAML config.
    Start {
        config: PathBuf,
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,
    },
    /// Signals a server started with `server start` to shut down.
    Stop,
}

#[derive(Subcommand)]
enum CasCommand {
    UploadFile { path: PathBuf },
    UploadDir { path: PathBuf },
    DownloadFile { digest: String, path: PathBuf },
    DownloadDir { digest: String, path: PathBuf },
}

#[derive(Subcommand)]
enum ExecuteCommand {
    /// Submits a canned no-op Action and streams its Operation updates.
    Dummy,
    /// Polls an in-flight Operation once via `WaitExecution`.
    Status { name: String },
    /// Lists known Operations.
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let connection = Connection {
        remote: cli.remote,
        instance_name: cli.instance_name,
        client_key: cli.client_key,
        client_cert: cli.client_cert,
        server_cert: cli.server_cert,
        auth_token: cli.auth_token,
    };

    match cli.command {
        Command::Server { command } => match command {
            ServerCommand::Start { config, verbose } => server_cmds::start(&config, verbose).await,
            ServerCommand::Stop => server_cmds::stop(),
        },
        Command::Cas { command } => {
            let channel = client::connect(&connection).await?;
            match command {
                CasCommand::UploadFile { path } => cas_cmds::upload_file(channel, &connection.instance_name, &path, &connection.auth_token).await,
                CasCommand::UploadDir { path } => cas_cmds::upload_dir(channel, &connection.instance_name, &path, &connection.auth_token).await,
                CasCommand::DownloadFile { digest, path } => {
                    let digest = cas_cmds::parse_digest_arg(&digest)?;
                    cas_cmds::download_file(channel, &connection.instance_name, &digest, &path, &connection.auth_token).await
                }
                CasCommand::DownloadDir { digest, path } => {
                    let digest = cas_cmds::parse_digest_arg(&digest)?;
                    cas_cmds::download_dir(channel, &connection.instance_name, &digest, &path, &connection.auth_token).await
                }
            }
        }
        Command::Capabilities => {
            let channel = client::connect(&connection).await?;
            capabilities_cmds::capabilities(channel, &connection.instance_name, &connection.auth_token).await
        }
        Command::Execute { command } => {
            let channel = client::connect(&connection).await?;
            match command {
                ExecuteCommand::Dummy => execute_cmds::dummy(channel, &connection.instance_name, &connection.auth_token).await,
                ExecuteCommand::Status { name } => execute_cmds::status(channel, &name, &connection.auth_token).await,
                ExecuteCommand::List => execute_cmds::list(channel, &connection.auth_token).await,
            }
        }
    }
}

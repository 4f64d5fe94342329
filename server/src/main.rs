// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(about = "Serves the REAPI/RWAPI surfaces a YAML config describes")]
struct Args {
    /// Path to the server's YAML configuration file.
    config: PathBuf,

    /// Increases log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = Args::parse();
    buildgrid_logging::init(buildgrid_server::level_filter(args.verbose));
    buildgrid_server::serve(&args.config).await
}

// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use prost_build::Config;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::new();
    config.bytes(["."]);

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_with_config(
            config,
            &[
                "protos/build/bazel/remote/execution/v2/remote_execution.proto",
                "protos/build/bazel/semver/semver.proto",
                "protos/google/bytestream/bytestream.proto",
                "protos/google/rpc/code.proto",
                "protos/google/rpc/status.proto",
                "protos/google/longrunning/operations.proto",
                "protos/google/devtools/remoteworkers/v1test2/bots.proto",
                "protos/google/protobuf/any.proto",
                "protos/google/protobuf/empty.proto",
                "protos/google/protobuf/timestamp.proto",
                "protos/google/protobuf/duration.proto",
            ],
            &["protos"],
        )?;

    Ok(())
}

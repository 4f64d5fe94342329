// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(unused_must_use)]
// See https://github.com/hyperium/tonic/issues/1056
#![allow(clippy::derive_partial_eq_without_eq)]

mod conversions;
pub use conversions::{require_digest, timestamp_from_system_time};

pub mod gen {
    // Prost relies on this nested module structure because generated code
    // uses `super`-relative paths to refer to messages in other packages.
    pub mod google {
        pub mod protobuf {
            tonic::include_proto!("google.protobuf");
        }
        pub mod rpc {
            tonic::include_proto!("google.rpc");
        }
        pub mod longrunning {
            tonic::include_proto!("google.longrunning");
        }
        pub mod bytestream {
            tonic::include_proto!("google.bytestream");
        }
        pub mod devtools {
            pub mod remoteworkers {
                pub mod v1test2 {
                    tonic::include_proto!("google.devtools.remoteworkers.v1test2");
                }
            }
        }
    }
    pub mod build {
        pub mod bazel {
            pub mod remote {
                pub mod execution {
                    pub mod v2 {
                        tonic::include_proto!("build.bazel.remote.execution.v2");

                        pub fn empty_digest() -> Digest {
                            Digest {
                                hash: String::from(
                                    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                                ),
                                size_bytes: 0,
                            }
                        }
                    }
                }
            }
            pub mod semver {
                tonic::include_proto!("build.bazel.semver");
            }
        }
    }
}

pub use gen::build::bazel::remote::execution::v2 as re;
pub use gen::google::bytestream;
pub use gen::google::devtools::remoteworkers::v1test2 as rwapi;
pub use gen::google::longrunning;
pub use gen::google::rpc;

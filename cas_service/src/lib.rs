// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
mod bytestream;
mod capabilities;
mod cas;
mod resource_name;

pub use bytestream::ByteStreamService;
pub use capabilities::CapabilitiesService;
pub use cas::CasInstance;
pub use resource_name::{parse_read_resource_name, parse_write_resource_name, ReadResource, WriteResource};

/// Batch ceiling advertised via Capabilities when none is configured
/// (spec.md §5 Backpressure).
pub const DEFAULT_MAX_BATCH_TOTAL_SIZE_BYTES: i64 = 2_000_000;

// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Execution Instance and Bots Instance (spec.md §4.7-§4.8): the REAPI
// `Execution` and RWAPI `Bots` service surfaces, plus the
// `LongRunningOperations` surface the Execution Instance projects Jobs onto.

mod bots_instance;
mod execution_instance;
mod operations_service;

pub use bots_instance::BotsInstanceService;
pub use execution_instance::ExecutionInstanceService;
pub use operations_service::OperationsService;

// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Wires a parsed `ServerConfig` into the multiplexing services `main.rs`
// registers with the `tonic` router (spec.md §6). Each named instance is
// built independently; `ByteStream`/`Execution`/`Bots`/`Operations` each
// reuse state another service declared earlier in the same instance (the
// CAS backend, the Scheduler), so building proceeds in dependency order
// rather than in the order services happen to be listed in the file.

use std::collections::HashMap;
use std::sync::Arc;

use buildgrid_action_cache::{ActionCacheProvider, ActionCacheService};
use buildgrid_cas::CasBackend;
use buildgrid_cas_service::{ByteStreamService, CapabilitiesService, CasInstance, DEFAULT_MAX_BATCH_TOTAL_SIZE_BYTES};
use buildgrid_execution::{BotsInstanceService, ExecutionInstanceService, OperationsService};
use buildgrid_scheduler::Scheduler;

use crate::config::{action_cache_provider, ServerConfig, ServiceConfig};
use crate::multiplex::{MultiActionCache, MultiBots, MultiByteStream, MultiCapabilities, MultiCas, MultiExecution, MultiOperations};

#[derive(Default)]
pub struct BuiltServices {
    pub cas: HashMap<String, Arc<CasInstance>>,
    pub bytestream: HashMap<String, Arc<ByteStreamService>>,
    pub action_cache: HashMap<String, Arc<ActionCacheService>>,
    pub capabilities: HashMap<String, Arc<CapabilitiesService>>,
    pub execution: HashMap<String, Arc<ExecutionInstanceService>>,
    pub bots: HashMap<String, Arc<BotsInstanceService>>,
    pub operations: Vec<Arc<OperationsService>>,
}

impl BuiltServices {
    pub fn into_multiplexers(
        self,
    ) -> (
        MultiCas,
        MultiByteStream,
        MultiActionCache,
        MultiCapabilities,
        MultiExecution,
        MultiBots,
        MultiOperations,
    ) {
        (
            MultiCas::new(self.cas),
            MultiByteStream::new(self.bytestream),
            MultiActionCache::new(self.action_cache),
            MultiCapabilities::new(self.capabilities),
            MultiExecution::new(self.execution),
            MultiBots::new(self.bots),
            MultiOperations::new(self.operations),
        )
    }
}

pub async fn build_services(config: &ServerConfig) -> Result<BuiltServices, String> {
    let mut built = BuiltServices::default();

    for instance in &config.instances {
        let name = instance.name.clone();

        let mut cas_backend: Option<Arc<dyn CasBackend>> = None;
        for service in &instance.services {
            if let ServiceConfig::Cas {
                storage,
                max_batch_total_size_bytes,
            } = service
            {
                let backend = storage.build().await?;
                built
                    .cas
                    .insert(name.clone(), Arc::new(CasInstance::new(backend.clone(), *max_batch_total_size_bytes)));
                cas_backend = Some(backend);
            }
        }

        let mut action_cache_providers: HashMap<String, Arc<dyn ActionCacheProvider>> = HashMap::new();
        for service in &instance.services {
            if let ServiceConfig::ActionCache {
                storage,
                allow_updates,
                cache_failed_actions,
                write_once,
                max_cached_refs,
            } = service
            {
                let backend = storage.build().await?;
                let provider = action_cache_provider(backend, *max_cached_refs, *allow_updates, *cache_failed_actions, *write_once);
                action_cache_providers.insert(name.clone(), provider.clone());
                built.action_cache.insert(name.clone(), Arc::new(ActionCacheService::new(provider)));
            }
        }

        let mut scheduler: Option<Arc<Scheduler>> = None;
        for service in &instance.services {
            if let ServiceConfig::Execution { data_store } = service {
                let backend = cas_backend
                    .clone()
                    .ok_or_else(|| format!("instance {name:?} declares execution without a cas service"))?;
                let provider = action_cache_providers
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| format!("instance {name:?} declares execution without an action-cache service"))?;
                let data_store = data_store.build().await?;
                let new_scheduler = Arc::new(Scheduler::new(data_store));
                built.execution.insert(
                    name.clone(),
                    Arc::new(ExecutionInstanceService::new(new_scheduler.clone(), provider, backend)),
                );
                scheduler = Some(new_scheduler);
            }
        }

        for service in &instance.services {
            match service {
                ServiceConfig::Cas { .. } | ServiceConfig::ActionCache { .. } | ServiceConfig::Execution { .. } => {}
                ServiceConfig::ByteStream => {
                    let backend = cas_backend
                        .clone()
                        .ok_or_else(|| format!("instance {name:?} declares byte-stream without a cas service"))?;
                    built.bytestream.insert(name.clone(), Arc::new(ByteStreamService::new(backend)));
                }
                ServiceConfig::Capabilities => {
                    let max_batch_total_size_bytes = instance
                        .services
                        .iter()
                        .find_map(|s| match s {
                            ServiceConfig::Cas {
                                max_batch_total_size_bytes,
                                ..
                            } => Some(*max_batch_total_size_bytes),
                            _ => None,
                        })
                        .unwrap_or(DEFAULT_MAX_BATCH_TOTAL_SIZE_BYTES);
                    let action_cache_update_enabled = instance
                        .services
                        .iter()
                        .any(|s| matches!(s, ServiceConfig::ActionCache { allow_updates: true, .. }));
                    let execution_enabled = instance.services.iter().any(|s| matches!(s, ServiceConfig::Execution { .. }));
                    built.capabilities.insert(
                        name.clone(),
                        Arc::new(CapabilitiesService::new(
                            max_batch_total_size_bytes,
                            action_cache_update_enabled,
                            execution_enabled,
                        )),
                    );
                }
                ServiceConfig::Bots => {
                    let scheduler = scheduler
                        .clone()
                        .ok_or_else(|| format!("instance {name:?} declares bots without an execution service"))?;
                    built.bots.insert(name.clone(), Arc::new(BotsInstanceService::new(scheduler)));
                }
                ServiceConfig::Operations => {
                    let scheduler = scheduler
                        .clone()
                        .ok_or_else(|| format!("instance {name:?} declares operations without an execution service"))?;
                    built.operations.push(Arc::new(OperationsService::new(scheduler)));
                }
            }
        }
    }

    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[tokio::test]
    async fn builds_a_full_instance() {
        let yaml = r#"
server:
  - address: "0.0.0.0:50051"
instances:
  - name: ""
    services:
      - type: cas
        storage:
          type: lru
          max_size_bytes: 1048576
      - type: byte-stream
      - type: action-cache
        storage:
          type: lru
          max_size_bytes: 1048576
        allow_updates: true
      - type: execution
      - type: bots
      - type: operations
      - type: capabilities
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        let built = build_services(&config).await.unwrap();
        assert!(built.cas.contains_key(""));
        assert!(built.bytestream.contains_key(""));
        assert!(built.action_cache.contains_key(""));
        assert!(built.execution.contains_key(""));
        assert!(built.bots.contains_key(""));
        assert_eq!(built.operations.len(), 1);
        assert!(built.capabilities.contains_key(""));
    }

    #[tokio::test]
    async fn rejects_byte_stream_without_cas() {
        let yaml = r#"
server: []
instances:
  - name: ""
    services:
      - type: byte-stream
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(build_services(&config).await.is_err());
    }
}

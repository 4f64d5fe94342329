// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Server configuration (spec.md §6, spec_full.md §4.13): a YAML document
// parsed with `serde_yaml` into strongly typed structs, `deny_unknown_fields`
// everywhere so a typo in an operator's config file is a startup error
// rather than a silently-ignored field.
//
// The original uses a custom YAML `!tag` extension to pick a backend
// variant inline (`!disk-storage`, `!sql`, ...). `serde_yaml` has no first
// class support for arbitrary custom tags against a strongly typed struct,
// so this design uses an internally tagged `type:` discriminator instead
// (see DESIGN.md) — the set of backends and the fields they accept are
// otherwise unchanged.

use std::path::PathBuf;
use std::sync::Arc;

use buildgrid_action_cache::{ActionCache, ActionCacheProvider, WriteOnceActionCache};
use buildgrid_cas::{CasBackend, DiskBackend, LruMemoryBackend, ObjectStoreBackend, WithCacheBackend};
use buildgrid_scheduler::data_store::{DataStore, InMemoryDataStore, SqlDataStore};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub server: Vec<ChannelConfig>,
    pub instances: Vec<InstanceConfig>,
}

/// One network endpoint the server listens on (spec.md §6 "list of channel
/// descriptors with address and credentials").
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub address: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    #[serde(default)]
    pub client_ca: Option<PathBuf>,
}

/// A named instance exposing one or more services (spec.md §6). REAPI's
/// `instance_name` routes a request to one `InstanceConfig` by name.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    #[serde(default)]
    pub name: String,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ServiceConfig {
    Cas {
        storage: StorageConfig,
        #[serde(default = "default_max_batch_total_size_bytes")]
        max_batch_total_size_bytes: i64,
    },
    ByteStream,
    ActionCache {
        storage: StorageConfig,
        #[serde(default)]
        allow_updates: bool,
        #[serde(default)]
        cache_failed_actions: bool,
        #[serde(default)]
        write_once: bool,
        #[serde(default = "default_max_cached_refs")]
        max_cached_refs: usize,
    },
    Execution {
        #[serde(default)]
        data_store: DataStoreConfig,
    },
    Bots,
    Operations,
    Capabilities,
}

fn default_max_batch_total_size_bytes() -> i64 {
    buildgrid_cas_service::DEFAULT_MAX_BATCH_TOTAL_SIZE_BYTES
}

fn default_max_cached_refs() -> usize {
    65_536
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum StorageConfig {
    Lru {
        max_size_bytes: usize,
    },
    Disk {
        path: PathBuf,
    },
    ObjectStore {
        root: PathBuf,
    },
    WithCache {
        cache: Box<StorageConfig>,
        fallback: Box<StorageConfig>,
    },
}

impl StorageConfig {
    /// Instantiates the `CasBackend` this configuration names (spec.md
    /// §4.1). Async because `DiskBackend::new` creates its root directory.
    pub async fn build(&self) -> Result<Arc<dyn CasBackend>, String> {
        match self {
            StorageConfig::Lru { max_size_bytes } => Ok(Arc::new(LruMemoryBackend::new(*max_size_bytes))),
            StorageConfig::Disk { path } => Ok(Arc::new(
                DiskBackend::new(path.clone())
                    .await
                    .map_err(|err| err.to_string())?,
            )),
            StorageConfig::ObjectStore { root } => {
                let builder = opendal::services::Fs::default().root(
                    root.to_str().ok_or_else(|| "object-store root is not valid UTF-8".to_string())?,
                );
                let op = opendal::Operator::new(builder)
                    .map_err(|err| err.to_string())?
                    .finish();
                Ok(Arc::new(ObjectStoreBackend::new(op)))
            }
            StorageConfig::WithCache { cache, fallback } => {
                let cache = Box::pin(cache.build()).await?;
                let fallback = Box::pin(fallback.build()).await?;
                Ok(Arc::new(WithCacheBackend::new(
                    Box::new(ArcBackend(cache)),
                    Box::new(ArcBackend(fallback)),
                )))
            }
        }
    }
}

/// Adapts an already-built `Arc<dyn CasBackend>` to the owned `Box<dyn
/// CasBackend>` that `WithCacheBackend::new` takes, without cloning blobs.
struct ArcBackend(Arc<dyn CasBackend>);

#[async_trait::async_trait]
impl CasBackend for ArcBackend {
    async fn has_blob(&self, digest: &buildgrid_hashing::Digest) -> Result<bool, buildgrid_grpc_util::ComponentError> {
        self.0.has_blob(digest).await
    }

    async fn get_blob(
        &self,
        digest: &buildgrid_hashing::Digest,
    ) -> Result<Option<bytes::Bytes>, buildgrid_grpc_util::ComponentError> {
        self.0.get_blob(digest).await
    }

    async fn delete_blob(&self, digest: &buildgrid_hashing::Digest) -> Result<(), buildgrid_grpc_util::ComponentError> {
        self.0.delete_blob(digest).await
    }

    async fn begin_write(
        &self,
        digest: &buildgrid_hashing::Digest,
    ) -> Result<buildgrid_cas::WriteHandle, buildgrid_grpc_util::ComponentError> {
        self.0.begin_write(digest).await
    }

    async fn commit_write(
        &self,
        digest: &buildgrid_hashing::Digest,
        handle: buildgrid_cas::WriteHandle,
    ) -> Result<(), buildgrid_grpc_util::ComponentError> {
        self.0.commit_write(digest, handle).await
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum DataStoreConfig {
    #[default]
    Mem,
    Sql {
        connection_string: String,
    },
}

impl DataStoreConfig {
    pub async fn build(&self) -> Result<Arc<dyn DataStore>, String> {
        match self {
            DataStoreConfig::Mem => Ok(Arc::new(InMemoryDataStore::new())),
            DataStoreConfig::Sql { connection_string } => Ok(Arc::new(
                SqlDataStore::connect(connection_string)
                    .await
                    .map_err(|err| err.to_string())?,
            )),
        }
    }
}

pub fn action_cache_provider(
    cas: Arc<dyn CasBackend>,
    max_cached_refs: usize,
    allow_updates: bool,
    cache_failed_actions: bool,
    write_once: bool,
) -> Arc<dyn ActionCacheProvider> {
    let cache = ActionCache::new(cas, max_cached_refs, allow_updates, cache_failed_actions);
    if write_once {
        Arc::new(WriteOnceActionCache::new(cache))
    } else {
        Arc::new(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_top_level_field() {
        let yaml = "server: []\ninstances: []\nbogus: true\n";
        let err = serde_yaml::from_str::<ServerConfig>(yaml).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn parses_a_minimal_instance() {
        let yaml = r#"
server:
  - address: "0.0.0.0:50051"
instances:
  - name: main
    services:
      - type: cas
        storage:
          type: lru
          max_size_bytes: 1048576
      - type: byte-stream
      - type: capabilities
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.instances[0].services.len(), 3);
    }

    #[tokio::test]
    async fn lru_storage_config_builds_a_working_backend() {
        let config = StorageConfig::Lru { max_size_bytes: 1024 };
        let backend = config.build().await.unwrap();
        let digest = buildgrid_hashing::Digest::of_bytes(b"hello");
        assert!(!backend.has_blob(&digest).await.unwrap());
    }
}

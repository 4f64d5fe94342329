// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
mod reference_cache;
mod service;

pub use reference_cache::{action_key, ActionKey, ReferenceCache};
pub use service::ActionCacheService;

use std::sync::Arc;

use async_trait::async_trait;
use buildgrid_grpc_util::ComponentError;
use buildgrid_hashing::Digest;
use buildgrid_proto::re::ActionResult;

/// Shared surface between `ActionCache` and `WriteOnceActionCache` so the
/// gRPC service layer can be configured with either (spec.md §4.3).
#[async_trait]
pub trait ActionCacheProvider: Send + Sync {
    async fn get_action_result(&self, action_digest: &Digest) -> Result<Option<ActionResult>, ComponentError>;

    async fn update_action_result(
        &self,
        action_digest: &Digest,
        action_result: ActionResult,
    ) -> Result<(), ComponentError>;
}

/// Action Cache (spec.md §4.3): a Reference Cache keyed by action digest,
/// optionally dropping results for failed actions.
pub struct ActionCache {
    reference_cache: ReferenceCache,
    cache_failed_actions: bool,
}

impl ActionCache {
    pub fn new(
        cas: Arc<dyn buildgrid_cas::CasBackend>,
        max_cached_refs: usize,
        allow_updates: bool,
        cache_failed_actions: bool,
    ) -> ActionCache {
        ActionCache {
            reference_cache: ReferenceCache::new(cas, max_cached_refs, allow_updates),
            cache_failed_actions,
        }
    }
}

#[async_trait]
impl ActionCacheProvider for ActionCache {
    async fn get_action_result(&self, action_digest: &Digest) -> Result<Option<ActionResult>, ComponentError> {
        self.reference_cache.get(action_key(action_digest)).await
    }

    async fn update_action_result(
        &self,
        action_digest: &Digest,
        action_result: ActionResult,
    ) -> Result<(), ComponentError> {
        if !self.cache_failed_actions && action_result.exit_code != 0 {
            return Ok(());
        }
        self.reference_cache
            .put(action_key(action_digest), action_result)
            .await
    }
}

/// Write-Once variant (spec.md §4.3): rejects a second write for the same
/// action digest instead of overwriting.
pub struct WriteOnceActionCache {
    inner: ActionCache,
}

impl WriteOnceActionCache {
    pub fn new(inner: ActionCache) -> WriteOnceActionCache {
        WriteOnceActionCache { inner }
    }
}

#[async_trait]
impl ActionCacheProvider for WriteOnceActionCache {
    async fn get_action_result(&self, action_digest: &Digest) -> Result<Option<ActionResult>, ComponentError> {
        self.inner.get_action_result(action_digest).await
    }

    async fn update_action_result(
        &self,
        action_digest: &Digest,
        action_result: ActionResult,
    ) -> Result<(), ComponentError> {
        if self.inner.get_action_result(action_digest).await?.is_some() {
            return Err(ComponentError::new(
                buildgrid_grpc_util::ErrorKind::UpdateNotAllowed,
                "result already stored for this action digest; write-once cache does not allow updates",
            ));
        }
        self.inner.update_action_result(action_digest, action_result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cache() -> ActionCache {
        ActionCache::new(Arc::new(buildgrid_cas::LruMemoryBackend::new(1024)), 8, true, true)
    }

    #[tokio::test]
    async fn drops_failed_actions_when_configured_to() {
        let cache = ActionCache::new(Arc::new(buildgrid_cas::LruMemoryBackend::new(1024)), 8, true, false);
        let digest = Digest::of_bytes(b"action");
        let failing = ActionResult {
            exit_code: 1,
            ..Default::default()
        };
        cache.update_action_result(&digest, failing).await.unwrap();
        assert!(cache.get_action_result(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_once_rejects_second_write() {
        let write_once = WriteOnceActionCache::new(cache());
        let digest = Digest::of_bytes(b"action");
        write_once
            .update_action_result(&digest, ActionResult::default())
            .await
            .unwrap();
        let second = write_once.update_action_result(&digest, ActionResult::default()).await;
        assert!(second.is_err());
    }
}

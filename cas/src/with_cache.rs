// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// With-Cache composite backend (spec.md §4.1): composes a `cache` and a
// `fallback`; the fallback is authoritative (spec.md §9 Open Question b).

use async_trait::async_trait;
use buildgrid_grpc_util::ComponentError;
use buildgrid_hashing::Digest;
use bytes::Bytes;

use super::CasBackend;

pub struct WithCacheBackend {
    cache: Box<dyn CasBackend>,
    fallback: Box<dyn CasBackend>,
}

impl WithCacheBackend {
    pub fn new(cache: Box<dyn CasBackend>, fallback: Box<dyn CasBackend>) -> WithCacheBackend {
        WithCacheBackend { cache, fallback }
    }
}

#[async_trait]
impl CasBackend for WithCacheBackend {
    async fn has_blob(&self, digest: &Digest) -> Result<bool, ComponentError> {
        // Steady-state the cache is a subset of the fallback; ask the
        // fallback so a cold/evicted cache never under-reports.
        self.fallback.has_blob(digest).await
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Option<Bytes>, ComponentError> {
        if let Some(bytes) = self.cache.get_blob(digest).await? {
            return Ok(Some(bytes));
        }
        match self.fallback.get_blob(digest).await? {
            Some(bytes) => {
                // Populate the cache synchronously with what the fallback
                // returned (spec.md §4.1 With-Cache read semantics).
                if let Err(err) = self.cache.put_blob(digest, bytes.clone()).await {
                    log::warn!("failed to populate with-cache backend for {digest}: {err}");
                }
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<(), ComponentError> {
        self.cache.delete_blob(digest).await?;
        self.fallback.delete_blob(digest).await
    }

    async fn missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, ComponentError> {
        // Cache answer is a superset of presence in steady state but may be
        // stale after eviction; the fallback is authoritative (spec.md §4.1).
        self.fallback.missing_blobs(digests).await
    }

    async fn begin_write(&self, digest: &Digest) -> Result<super::WriteHandle, ComponentError> {
        let cache_handle = self.cache.begin_write(digest).await?;
        let fallback_handle = self.fallback.begin_write(digest).await?;
        Ok(super::WriteHandle::new(super::WriteBackendHandle::WithCache(
            Box::new(cache_handle),
            Box::new(fallback_handle),
        )))
    }

    async fn commit_write(
        &self,
        digest: &Digest,
        handle: super::WriteHandle,
    ) -> Result<(), ComponentError> {
        let (cache_handle, fallback_handle) = match handle.backend {
            super::WriteBackendHandle::WithCache(cache, fallback) => (*cache, *fallback),
            _ => return Err(ComponentError::invalid_argument("wrong writer for backend")),
        };
        // Fallback is authoritative: its commit result is what we return.
        // Only commit to the cache once the fallback has actually stored the
        // blob, otherwise the cache could hold a blob the fallback never
        // received, violating the "cache ⊆ fallback" invariant (spec.md §8).
        self.fallback.commit_write(digest, fallback_handle).await?;
        if let Err(err) = self.cache.commit_write(digest, cache_handle).await {
            log::warn!("with-cache: cache commit failed for {digest}: {err}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{test_util, LruMemoryBackend};
    use super::*;

    fn backend() -> WithCacheBackend {
        WithCacheBackend::new(
            Box::new(LruMemoryBackend::new(1024)),
            Box::new(LruMemoryBackend::new(1024)),
        )
    }

    #[tokio::test]
    async fn round_trips_a_blob() {
        let backend = backend();
        test_util::round_trip(&backend, b"layered contents").await;
    }

    #[tokio::test]
    async fn reads_through_to_fallback_on_cache_miss() {
        let fallback = LruMemoryBackend::new(1024);
        let digest = Digest::of_bytes(b"only in fallback");
        fallback
            .put_blob(&digest, Bytes::from_static(b"only in fallback"))
            .await
            .unwrap();

        let composed = WithCacheBackend::new(Box::new(LruMemoryBackend::new(1024)), Box::new(fallback));
        assert_eq!(
            composed.get_blob(&digest).await.unwrap().unwrap(),
            Bytes::from_static(b"only in fallback")
        );
    }

    #[tokio::test]
    async fn fallback_commit_failure_fails_the_write() {
        // Fallback budget too small to hold the blob; commit must fail even
        // though the cache (larger budget) would have accepted it.
        let cache = LruMemoryBackend::new(1024);
        let fallback = LruMemoryBackend::new(1);
        let composed = WithCacheBackend::new(Box::new(cache), Box::new(fallback));
        let digest = Digest::of_bytes(b"too big for fallback");
        assert!(composed.begin_write(&digest).await.is_err());
    }
}

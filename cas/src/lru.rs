// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// In-memory LRU CAS backend (spec.md §4.1): a byte-budgeted map with
// most-recently-used tracking, evicting least-recently-used entries to make
// room for new writes.

use std::collections::HashMap;

use async_trait::async_trait;
use buildgrid_grpc_util::{ComponentError, ErrorKind};
use buildgrid_hashing::Digest;
use bytes::Bytes;
use parking_lot::Mutex;

struct State {
    blobs: HashMap<Digest, Bytes>,
    // Most-recently-used at the back.
    order: Vec<Digest>,
    used_bytes: usize,
}

impl State {
    fn touch(&mut self, digest: &Digest) {
        if let Some(pos) = self.order.iter().position(|d| d == digest) {
            let digest = self.order.remove(pos);
            self.order.push(digest);
        }
    }

    fn evict_until_fits(&mut self, incoming: usize, budget: usize) {
        while self.used_bytes + incoming > budget {
            let Some(victim) = self.order.first().copied() else {
                break;
            };
            self.order.remove(0);
            if let Some(bytes) = self.blobs.remove(&victim) {
                self.used_bytes -= bytes.len();
            }
        }
    }
}

/// Serialized under a single exclusive lock, per spec.md §5: critical
/// sections (eviction, access-order updates) are short.
pub struct LruMemoryBackend {
    budget_bytes: usize,
    state: Mutex<State>,
}

impl LruMemoryBackend {
    pub fn new(budget_bytes: usize) -> LruMemoryBackend {
        LruMemoryBackend {
            budget_bytes,
            state: Mutex::new(State {
                blobs: HashMap::new(),
                order: Vec::new(),
                used_bytes: 0,
            }),
        }
    }
}

#[async_trait]
impl super::CasBackend for LruMemoryBackend {
    async fn has_blob(&self, digest: &Digest) -> Result<bool, ComponentError> {
        let mut state = self.state.lock();
        let present = state.blobs.contains_key(digest);
        if present {
            state.touch(digest);
        }
        Ok(present)
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Option<Bytes>, ComponentError> {
        let mut state = self.state.lock();
        let found = state.blobs.get(digest).cloned();
        if found.is_some() {
            state.touch(digest);
        }
        Ok(found)
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<(), ComponentError> {
        let mut state = self.state.lock();
        if let Some(bytes) = state.blobs.remove(digest) {
            state.used_bytes -= bytes.len();
            state.order.retain(|d| d != digest);
        }
        Ok(())
    }

    async fn begin_write(&self, digest: &Digest) -> Result<super::WriteHandle, ComponentError> {
        if digest.size_bytes > self.budget_bytes {
            return Err(ComponentError::new(
                ErrorKind::InvalidArgument,
                format!(
                    "blob of {} bytes exceeds LRU backend budget of {} bytes",
                    digest.size_bytes, self.budget_bytes
                ),
            ));
        }
        Ok(super::WriteHandle::new(super::WriteBackendHandle::Memory(
            Vec::with_capacity(digest.size_bytes),
        )))
    }

    async fn commit_write(
        &self,
        digest: &Digest,
        handle: super::WriteHandle,
    ) -> Result<(), ComponentError> {
        handle.verify(digest)?;
        let bytes = match handle.backend {
            super::WriteBackendHandle::Memory(buf) => Bytes::from(buf),
            _ => return Err(ComponentError::invalid_argument("wrong writer for backend")),
        };
        if buildgrid_hashing::Digest::of_bytes(&bytes).hash != digest.hash {
            return Err(ComponentError::invalid_argument("content does not match declared hash"));
        }

        let mut state = self.state.lock();
        let incoming = bytes.len();
        state.evict_until_fits(incoming, self.budget_bytes);
        state.used_bytes += incoming;
        state.blobs.insert(*digest, bytes);
        state.order.push(*digest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{test_util, CasBackend};
    use super::*;

    #[tokio::test]
    async fn round_trips_a_blob() {
        let backend = LruMemoryBackend::new(1024);
        test_util::round_trip(&backend, b"hello world").await;
    }

    #[tokio::test]
    async fn rejects_oversized_write() {
        let backend = LruMemoryBackend::new(4);
        let digest = Digest::of_bytes(b"too big");
        assert!(backend.begin_write(&digest).await.is_err());
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let backend = LruMemoryBackend::new(12);
        let a = Digest::of_bytes(b"aaaa");
        let b = Digest::of_bytes(b"bbbb");
        let c = Digest::of_bytes(b"cccc");

        backend.put_blob(&a, Bytes::from_static(b"aaaa")).await.unwrap();
        backend.put_blob(&b, Bytes::from_static(b"bbbb")).await.unwrap();
        // Touch `a` so `b` becomes the least-recently-used entry.
        assert!(backend.has_blob(&a).await.unwrap());
        backend.put_blob(&c, Bytes::from_static(b"cccc")).await.unwrap();

        assert!(backend.has_blob(&a).await.unwrap());
        assert!(!backend.has_blob(&b).await.unwrap());
        assert!(backend.has_blob(&c).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_hash_mismatch() {
        let backend = LruMemoryBackend::new(1024);
        let bogus_digest = Digest::of_bytes(b"something else");
        let mut handle = backend.begin_write(&bogus_digest).await.unwrap();
        handle.write_chunk(b"actual content").await.unwrap();
        assert!(backend.commit_write(&bogus_digest, handle).await.is_err());
    }
}

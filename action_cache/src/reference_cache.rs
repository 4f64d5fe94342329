// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Reference Cache (spec.md §4.3): a bounded key→ActionResult mapping with
// LRU eviction, validated against a CAS backend on every lookup. Scoped to
// `ActionResult` as its value type since Action Cache is the only
// reference-cache user in this system.

use std::collections::HashMap;
use std::sync::Arc;

use buildgrid_cas::CasBackend;
use buildgrid_grpc_util::{ComponentError, ErrorKind};
use buildgrid_hashing::{Digest, Fingerprint};
use buildgrid_proto::re::{ActionResult, Tree};
use parking_lot::Mutex;
use prost::Message;

pub type ActionKey = (Fingerprint, usize);

pub fn action_key(digest: &Digest) -> ActionKey {
    (digest.hash, digest.size_bytes)
}

struct State {
    entries: HashMap<ActionKey, ActionResult>,
    // Most-recently-used at the back.
    order: Vec<ActionKey>,
}

pub struct ReferenceCache {
    cas: Arc<dyn CasBackend>,
    max_size: usize,
    allow_updates: bool,
    state: Mutex<State>,
}

impl ReferenceCache {
    pub fn new(cas: Arc<dyn CasBackend>, max_size: usize, allow_updates: bool) -> ReferenceCache {
        ReferenceCache {
            cas,
            max_size,
            allow_updates,
            state: Mutex::new(State {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub async fn get(&self, key: ActionKey) -> Result<Option<ActionResult>, ComponentError> {
        let candidate = {
            let state = self.state.lock();
            state.entries.get(&key).cloned()
        };
        let Some(result) = candidate else {
            return Ok(None);
        };

        if self.validate_against_cas(&result).await? {
            let mut state = self.state.lock();
            if let Some(pos) = state.order.iter().position(|k| k == &key) {
                let key = state.order.remove(pos);
                state.order.push(key);
            }
            Ok(Some(result))
        } else {
            let mut state = self.state.lock();
            state.entries.remove(&key);
            state.order.retain(|k| k != &key);
            Ok(None)
        }
    }

    pub async fn put(&self, key: ActionKey, value: ActionResult) -> Result<(), ComponentError> {
        if !self.allow_updates {
            return Err(ComponentError::new(
                ErrorKind::UpdateNotAllowed,
                "this cache does not accept updates",
            ));
        }
        if self.max_size == 0 {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.entries.insert(key, value).is_none() {
            state.order.push(key);
        } else {
            state.order.retain(|k| k != &key);
            state.order.push(key);
        }
        while state.order.len() > self.max_size {
            let victim = state.order.remove(0);
            state.entries.remove(&victim);
        }
        Ok(())
    }

    /// Any digest field reachable from `result` must be present in the CAS,
    /// directly or (for directories) via a Tree's children (spec.md §4.3).
    async fn validate_against_cas(&self, result: &ActionResult) -> Result<bool, ComponentError> {
        let mut referenced = Vec::new();
        if let Some(digest) = &result.stdout_digest {
            referenced.push(digest.clone());
        }
        if let Some(digest) = &result.stderr_digest {
            referenced.push(digest.clone());
        }
        for file in &result.output_files {
            if let Some(digest) = &file.digest {
                referenced.push(digest.clone());
            }
        }
        for dir in &result.output_directories {
            if let Some(digest) = &dir.tree_digest {
                referenced.push(digest.clone());
            }
        }

        for proto_digest in &referenced {
            if !self.has_blob_checked(proto_digest).await? {
                return Ok(false);
            }
        }

        for dir in &result.output_directories {
            let Some(tree_digest) = &dir.tree_digest else {
                continue;
            };
            if !self.tree_children_present(tree_digest).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn has_blob_checked(&self, proto_digest: &buildgrid_proto::re::Digest) -> Result<bool, ComponentError> {
        let digest = match Digest::try_from(proto_digest) {
            Ok(digest) => digest,
            Err(_) => return Ok(false),
        };
        if digest.size_bytes == 0 && digest.hash == buildgrid_hashing::EMPTY_FINGERPRINT {
            return Ok(true);
        }
        self.cas.has_blob(&digest).await
    }

    /// Fetches and decodes the `Tree` blob itself, then checks every
    /// `FileNode`/`DirectoryNode` digest reachable from its `root` and
    /// `children` directories (spec.md §4.3, §8).
    async fn tree_children_present(&self, tree_digest: &buildgrid_proto::re::Digest) -> Result<bool, ComponentError> {
        let digest = match Digest::try_from(tree_digest) {
            Ok(digest) => digest,
            Err(_) => return Ok(false),
        };
        let Some(bytes) = self.cas.get_blob(&digest).await? else {
            return Ok(false);
        };
        let tree = match Tree::decode(bytes) {
            Ok(tree) => tree,
            Err(_) => return Ok(false),
        };

        let directories = tree.root.iter().chain(tree.children.iter());
        for directory in directories {
            for file in &directory.files {
                if let Some(file_digest) = &file.digest {
                    if !self.has_blob_checked(file_digest).await? {
                        return Ok(false);
                    }
                }
            }
            for child in &directory.directories {
                if let Some(child_digest) = &child.digest {
                    if !self.has_blob_checked(child_digest).await? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn digest_proto(digest: &Digest) -> buildgrid_proto::re::Digest {
        digest.into()
    }

    #[tokio::test]
    async fn null_cache_never_hits() {
        let cas: Arc<dyn CasBackend> = Arc::new(buildgrid_cas::LruMemoryBackend::new(1024));
        let cache = ReferenceCache::new(cas, 0, true);
        let digest = Digest::new(buildgrid_hashing::EMPTY_FINGERPRINT, 0);
        cache.put(action_key(&digest), ActionResult::default()).await.unwrap();
        assert!(cache.get(action_key(&digest)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lru_eviction_at_capacity_two() {
        let cas: Arc<dyn CasBackend> = Arc::new(buildgrid_cas::LruMemoryBackend::new(1024));
        let cache = ReferenceCache::new(cas, 2, true);
        let a = action_key(&Digest::of_bytes(b"a"));
        let b = action_key(&Digest::of_bytes(b"b"));
        let c = action_key(&Digest::of_bytes(b"c"));

        cache.put(a, ActionResult::default()).await.unwrap();
        cache.put(b, ActionResult::default()).await.unwrap();
        assert!(cache.get(a).await.unwrap().is_some());
        cache.put(c, ActionResult::default()).await.unwrap();

        assert!(cache.get(a).await.unwrap().is_some());
        assert!(cache.get(b).await.unwrap().is_none());
        assert!(cache.get(c).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn entries_referencing_missing_blobs_are_invalidated() {
        let cas_backend = buildgrid_cas::LruMemoryBackend::new(1024);
        let sample = Digest::of_bytes(b"sample");
        cas_backend
            .put_blob(&sample, Bytes::from_static(b"sample"))
            .await
            .unwrap();
        let tree_proto = Tree {
            root: Some(buildgrid_proto::re::Directory::default()),
            children: Vec::new(),
        };
        let tree_bytes = Bytes::from(tree_proto.encode_to_vec());
        let tree = Digest::of_bytes(&tree_bytes);
        cas_backend.put_blob(&tree, tree_bytes).await.unwrap();
        let cas: Arc<dyn CasBackend> = Arc::new(cas_backend);
        let cache = ReferenceCache::new(cas, 8, true);

        let r1_key = action_key(&Digest::of_bytes(b"action-1"));
        let r1 = ActionResult {
            stdout_digest: Some(digest_proto(&sample)),
            output_directories: vec![buildgrid_proto::re::OutputDirectory {
                path: "out".into(),
                tree_digest: Some(digest_proto(&tree)),
            }],
            ..Default::default()
        };

        let r2_key = action_key(&Digest::of_bytes(b"action-2"));
        let r2 = ActionResult {
            output_directories: vec![buildgrid_proto::re::OutputDirectory {
                path: "out".into(),
                tree_digest: Some(buildgrid_proto::re::Digest {
                    hash: "nonexistent".into(),
                    size_bytes: 8,
                }),
            }],
            ..Default::default()
        };

        let r3_key = action_key(&Digest::of_bytes(b"action-3"));
        let r3 = ActionResult {
            stdout_digest: Some(buildgrid_proto::re::Digest {
                hash: "nonexistent".into(),
                size_bytes: 1,
            }),
            ..Default::default()
        };

        cache.put(r1_key, r1).await.unwrap();
        cache.put(r2_key, r2).await.unwrap();
        cache.put(r3_key, r3).await.unwrap();

        assert!(cache.get(r1_key).await.unwrap().is_some());
        assert!(cache.get(r2_key).await.unwrap().is_none());
        assert!(cache.get(r3_key).await.unwrap().is_none());
    }
}

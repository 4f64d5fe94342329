// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// On-disk CAS backend (spec.md §4.1, §6): one file per blob, named by hash,
// under a configured directory. Commits use atomic rename from a temp file
// so concurrent writers of the same digest are safe (content = identity).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use buildgrid_grpc_util::{ComponentError, ErrorKind};
use buildgrid_hashing::Digest;
use bytes::Bytes;
use tokio::fs::File;

pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    pub async fn new(root: impl Into<PathBuf>) -> Result<DiskBackend, ComponentError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(io_err)?;
        Ok(DiskBackend { root })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.hash.to_hex())
    }

    fn tmp_path(&self) -> PathBuf {
        self.root.join(format!(".tmp-{}", uuid::Uuid::new_v4()))
    }
}

fn io_err(err: std::io::Error) -> ComponentError {
    ComponentError::new(ErrorKind::BackendUnavailable, err.to_string())
}

#[async_trait]
impl super::CasBackend for DiskBackend {
    async fn has_blob(&self, digest: &Digest) -> Result<bool, ComponentError> {
        Ok(tokio::fs::try_exists(self.blob_path(digest))
            .await
            .map_err(io_err)?)
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Option<Bytes>, ComponentError> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(err)),
        }
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<(), ComponentError> {
        match tokio::fs::remove_file(self.blob_path(digest)).await {
            Ok(()) | Err(_) => Ok(()), // idempotent (spec.md §4.1)
        }
    }

    async fn begin_write(&self, digest: &Digest) -> Result<super::WriteHandle, ComponentError> {
        let tmp_path = self.tmp_path();
        let file = File::create(&tmp_path).await.map_err(io_err)?;
        Ok(super::WriteHandle::new(super::WriteBackendHandle::Disk {
            tmp_path,
            file,
        }))
    }

    async fn commit_write(
        &self,
        digest: &Digest,
        handle: super::WriteHandle,
    ) -> Result<(), ComponentError> {
        handle.verify(digest)?;
        let (tmp_path, mut file) = match handle.backend {
            super::WriteBackendHandle::Disk { tmp_path, file } => (tmp_path, file),
            _ => return Err(ComponentError::invalid_argument("wrong writer for backend")),
        };
        use tokio::io::AsyncWriteExt;
        file.flush().await.map_err(io_err)?;
        drop(file);

        let bytes = tokio::fs::read(&tmp_path).await.map_err(io_err)?;
        if Digest::of_bytes(&bytes).hash != digest.hash {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ComponentError::invalid_argument("content does not match declared hash"));
        }

        let final_path = self.blob_path(digest);
        rename_atomic(&tmp_path, &final_path).await
    }
}

async fn rename_atomic(from: &Path, to: &Path) -> Result<(), ComponentError> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = tokio::fs::remove_file(from).await;
            Err(io_err(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{test_util, CasBackend};
    use super::*;

    #[tokio::test]
    async fn round_trips_a_blob() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).await.unwrap();
        test_util::round_trip(&backend, b"on disk contents").await;
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).await.unwrap();
        let digest = Digest::of_bytes(b"whatever");
        backend.delete_blob(&digest).await.unwrap();
        backend.delete_blob(&digest).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_hash_mismatch_and_leaves_cas_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).await.unwrap();
        let digest = Digest::new(buildgrid_hashing::Digest::of_bytes(b"incorrect").hash, 9);
        let mut handle = backend.begin_write(&digest).await.unwrap();
        handle.write_chunk(b"some data").await.unwrap();
        assert!(backend.commit_write(&digest, handle).await.is_err());
        assert!(!backend.has_blob(&digest).await.unwrap());
    }
}

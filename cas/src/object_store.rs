// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Object-store CAS backend (spec.md §4.1, §6): maps a digest to an object
// key `<hash>_<size_bytes>` in a configurable bucket, backed by `opendal` so
// any of its supported services can be swapped in via configuration.

use async_trait::async_trait;
use buildgrid_grpc_util::{ComponentError, ErrorKind};
use buildgrid_hashing::Digest;
use bytes::Bytes;
use opendal::Operator;

pub struct ObjectStoreBackend {
    op: Operator,
}

impl ObjectStoreBackend {
    pub fn new(op: Operator) -> ObjectStoreBackend {
        ObjectStoreBackend { op }
    }

    fn object_key(digest: &Digest) -> String {
        format!("{}_{}", digest.hash, digest.size_bytes)
    }
}

fn opendal_err(err: opendal::Error) -> ComponentError {
    ComponentError::new(ErrorKind::BackendUnavailable, err.to_string())
}

#[async_trait]
impl super::CasBackend for ObjectStoreBackend {
    async fn has_blob(&self, digest: &Digest) -> Result<bool, ComponentError> {
        match self.op.is_exist(&Self::object_key(digest)).await {
            Ok(exists) => Ok(exists),
            Err(err) if err.kind() == opendal::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(opendal_err(err)),
        }
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Option<Bytes>, ComponentError> {
        match self.op.read(&Self::object_key(digest)).await {
            Ok(buffer) => Ok(Some(buffer.to_bytes())),
            Err(err) if err.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(opendal_err(err)),
        }
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<(), ComponentError> {
        match self.op.delete(&Self::object_key(digest)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(opendal_err(err)),
        }
    }

    async fn begin_write(&self, digest: &Digest) -> Result<super::WriteHandle, ComponentError> {
        Ok(super::WriteHandle::new(super::WriteBackendHandle::ObjectStore(
            Vec::with_capacity(digest.size_bytes),
        )))
    }

    async fn commit_write(
        &self,
        digest: &Digest,
        handle: super::WriteHandle,
    ) -> Result<(), ComponentError> {
        handle.verify(digest)?;
        let buffer = match handle.backend {
            super::WriteBackendHandle::ObjectStore(buf) => buf,
            _ => return Err(ComponentError::invalid_argument("wrong writer for backend")),
        };
        if Digest::of_bytes(&buffer).hash != digest.hash {
            return Err(ComponentError::invalid_argument("content does not match declared hash"));
        }
        self.op
            .write(&Self::object_key(digest), buffer)
            .await
            .map_err(opendal_err)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{test_util, CasBackend};
    use super::*;
    use opendal::services::Memory;

    fn memory_backend() -> ObjectStoreBackend {
        let op = Operator::new(Memory::default()).unwrap().finish();
        ObjectStoreBackend::new(op)
    }

    #[tokio::test]
    async fn round_trips_a_blob() {
        let backend = memory_backend();
        test_util::round_trip(&backend, b"object store contents").await;
    }

    #[tokio::test]
    async fn object_key_layout_is_hash_underscore_size() {
        let digest = Digest::of_bytes(b"x");
        assert_eq!(
            ObjectStoreBackend::object_key(&digest),
            format!("{}_{}", digest.hash, digest.size_bytes)
        );
    }
}

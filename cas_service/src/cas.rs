// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// CAS Instance (spec.md §4.1, §4.2): the REAPI `ContentAddressableStorage`
// service surface over a `CasBackend`.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use buildgrid_cas::CasBackend;
use buildgrid_hashing::Digest;
use buildgrid_proto::re::{
    content_addressable_storage_server::ContentAddressableStorage, batch_read_blobs_response,
    batch_update_blobs_request, batch_update_blobs_response, BatchReadBlobsRequest,
    BatchReadBlobsResponse, BatchUpdateBlobsRequest, BatchUpdateBlobsResponse, Directory,
    FindMissingBlobsRequest, FindMissingBlobsResponse, GetTreeRequest, GetTreeResponse,
};
use buildgrid_proto::rpc::Status as RpcStatus;
use futures::Stream;
use prost::Message;
use tonic::{Request, Response, Status};

pub struct CasInstance {
    backend: Arc<dyn CasBackend>,
    max_batch_total_size_bytes: i64,
}

impl CasInstance {
    pub fn new(backend: Arc<dyn CasBackend>, max_batch_total_size_bytes: i64) -> CasInstance {
        CasInstance {
            backend,
            max_batch_total_size_bytes,
        }
    }

    pub fn max_batch_total_size_bytes(&self) -> i64 {
        self.max_batch_total_size_bytes
    }
}

fn ok_status() -> RpcStatus {
    RpcStatus {
        code: tonic::Code::Ok as i32,
        message: String::new(),
        details: Vec::new(),
    }
}

fn status_for(kind: buildgrid_grpc_util::ErrorKind, message: String) -> RpcStatus {
    RpcStatus {
        code: kind.code() as i32,
        message,
        details: Vec::new(),
    }
}

#[tonic::async_trait]
impl ContentAddressableStorage for CasInstance {
    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        let request = request.into_inner();
        let mut digests = Vec::with_capacity(request.blob_digests.len());
        for proto_digest in &request.blob_digests {
            digests.push(
                Digest::try_from(proto_digest).map_err(Status::invalid_argument)?,
            );
        }
        let missing = self
            .backend
            .missing_blobs(&digests)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests: missing.into_iter().map(Into::into).collect(),
        }))
    }

    async fn batch_update_blobs(
        &self,
        request: Request<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        let request = request.into_inner();
        let total: i64 = request.requests.iter().map(|item| item.data.len() as i64).sum();
        if total > self.max_batch_total_size_bytes {
            return Err(Status::resource_exhausted(format!(
                "batch update of {total} bytes exceeds the {} byte ceiling",
                self.max_batch_total_size_bytes
            )));
        }
        let mut responses = Vec::with_capacity(request.requests.len());
        for item in request.requests {
            let response = self.update_one(item).await;
            responses.push(response);
        }
        Ok(Response::new(BatchUpdateBlobsResponse { responses }))
    }

    async fn batch_read_blobs(
        &self,
        request: Request<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        let request = request.into_inner();
        let total: i64 = request.digests.iter().map(|digest| digest.size_bytes).sum();
        if total > self.max_batch_total_size_bytes {
            return Err(Status::resource_exhausted(format!(
                "batch read of {total} bytes exceeds the {} byte ceiling",
                self.max_batch_total_size_bytes
            )));
        }
        let mut responses = Vec::with_capacity(request.digests.len());
        for proto_digest in request.digests {
            let response = self.read_one(proto_digest).await;
            responses.push(response);
        }
        Ok(Response::new(BatchReadBlobsResponse { responses }))
    }

    type GetTreeStream =
        Pin<Box<dyn Stream<Item = Result<GetTreeResponse, Status>> + Send + 'static>>;

    async fn get_tree(
        &self,
        request: Request<GetTreeRequest>,
    ) -> Result<Response<Self::GetTreeStream>, Status> {
        let request = request.into_inner();
        let root_digest = buildgrid_proto::require_digest(request.root_digest.as_ref())
            .map_err(Status::invalid_argument)?;
        let page_size = if request.page_size > 0 {
            request.page_size as usize
        } else {
            usize::MAX
        };

        let directories = self.collect_tree(root_digest).await?;
        let stream = async_stream::try_stream! {
            for chunk in directories.chunks(page_size.max(1)) {
                yield GetTreeResponse {
                    directories: chunk.to_vec(),
                    next_page_token: String::new(),
                };
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }
}

impl CasInstance {
    async fn update_one(
        &self,
        item: batch_update_blobs_request::Request,
    ) -> batch_update_blobs_response::Response {
        let Some(proto_digest) = item.digest.clone() else {
            return batch_update_blobs_response::Response {
                digest: None,
                status: Some(status_for(
                    buildgrid_grpc_util::ErrorKind::InvalidArgument,
                    "missing digest".into(),
                )),
            };
        };
        let digest = match Digest::try_from(&proto_digest) {
            Ok(d) => d,
            Err(err) => {
                return batch_update_blobs_response::Response {
                    digest: Some(proto_digest),
                    status: Some(status_for(buildgrid_grpc_util::ErrorKind::InvalidArgument, err)),
                }
            }
        };
        match self.backend.put_blob(&digest, item.data.into()).await {
            Ok(()) => batch_update_blobs_response::Response {
                digest: Some(proto_digest),
                status: Some(ok_status()),
            },
            Err(err) => batch_update_blobs_response::Response {
                digest: Some(proto_digest),
                status: Some(status_for(err.kind, err.message)),
            },
        }
    }

    async fn read_one(&self, proto_digest: buildgrid_proto::re::Digest) -> batch_read_blobs_response::Response {
        let digest = match Digest::try_from(&proto_digest) {
            Ok(d) => d,
            Err(err) => {
                return batch_read_blobs_response::Response {
                    digest: Some(proto_digest),
                    data: Vec::new(),
                    status: Some(status_for(buildgrid_grpc_util::ErrorKind::InvalidArgument, err)),
                }
            }
        };
        match self.backend.get_blob(&digest).await {
            Ok(Some(bytes)) => batch_read_blobs_response::Response {
                digest: Some(proto_digest),
                data: bytes.to_vec(),
                status: Some(ok_status()),
            },
            Ok(None) => batch_read_blobs_response::Response {
                digest: Some(proto_digest),
                data: Vec::new(),
                status: Some(status_for(buildgrid_grpc_util::ErrorKind::NotFound, "blob not found".into())),
            },
            Err(err) => batch_read_blobs_response::Response {
                digest: Some(proto_digest),
                data: Vec::new(),
                status: Some(status_for(err.kind, err.message)),
            },
        }
    }

    async fn collect_tree(&self, root_digest: Digest) -> Result<Vec<Directory>, Status> {
        let mut directories = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(root_digest);

        while let Some(digest) = queue.pop_front() {
            let bytes = self
                .backend
                .get_blob(&digest)
                .await
                .map_err(Status::from)?
                .ok_or_else(|| Status::not_found(format!("directory {digest} not found")))?;
            let directory =
                Directory::decode(bytes).map_err(|err| Status::invalid_argument(err.to_string()))?;
            for child in &directory.directories {
                if let Some(child_digest) = &child.digest {
                    queue.push_back(
                        Digest::try_from(child_digest).map_err(Status::invalid_argument)?,
                    );
                }
            }
            directories.push(directory);
        }
        Ok(directories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildgrid_proto::re::batch_update_blobs_request;

    fn instance(ceiling: i64) -> CasInstance {
        let backend: Arc<dyn CasBackend> = Arc::new(buildgrid_cas::LruMemoryBackend::new(1024));
        CasInstance::new(backend, ceiling)
    }

    #[tokio::test]
    async fn batch_update_over_ceiling_is_rejected() {
        let cas = instance(4);
        let digest = Digest::of_bytes(b"hello");
        let request = Request::new(BatchUpdateBlobsRequest {
            instance_name: String::new(),
            requests: vec![batch_update_blobs_request::Request {
                digest: Some((&digest).into()),
                data: b"hello".to_vec(),
            }],
        });
        let status = cas.batch_update_blobs(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn batch_update_within_ceiling_is_accepted() {
        let cas = instance(1024);
        let digest = Digest::of_bytes(b"hello");
        let request = Request::new(BatchUpdateBlobsRequest {
            instance_name: String::new(),
            requests: vec![batch_update_blobs_request::Request {
                digest: Some((&digest).into()),
                data: b"hello".to_vec(),
            }],
        });
        let response = cas.batch_update_blobs(request).await.unwrap().into_inner();
        assert_eq!(response.responses.len(), 1);
    }

    #[tokio::test]
    async fn batch_read_over_ceiling_is_rejected() {
        let cas = instance(4);
        let request = Request::new(BatchReadBlobsRequest {
            instance_name: String::new(),
            digests: vec![buildgrid_proto::re::Digest {
                hash: "a".repeat(64),
                size_bytes: 100,
            }],
        });
        let status = cas.batch_read_blobs(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
    }
}

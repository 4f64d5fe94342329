// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// ByteStream read/write adapter (spec.md §4.2): parses resource names and
// streams fixed-size chunks, validating integrity on write completion.

use std::pin::Pin;
use std::sync::Arc;

use buildgrid_cas::CasBackend;
use buildgrid_proto::bytestream::byte_stream_server::ByteStream;
use buildgrid_proto::bytestream::{
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse,
};
use futures::Stream;
use tonic::{Request, Response, Status, Streaming};

use crate::resource_name::{parse_read_resource_name, parse_write_resource_name};

const BLOCK_SIZE: usize = 1024 * 1024;

pub struct ByteStreamService {
    backend: Arc<dyn CasBackend>,
}

impl ByteStreamService {
    pub fn new(backend: Arc<dyn CasBackend>) -> ByteStreamService {
        ByteStreamService { backend }
    }

    /// The body of `write`, split out so a multiplexing front-end that must
    /// peek at the first message to learn the target instance can hand it
    /// back in rather than re-reading it from the stream.
    pub async fn write_from_first_message(
        &self,
        first: WriteRequest,
        mut stream: Streaming<WriteRequest>,
    ) -> Result<Response<WriteResponse>, Status> {
        let parsed = parse_write_resource_name(&first.resource_name).map_err(Status::from)?;
        let digest = parsed.digest;

        let mut handle = self.backend.begin_write(&digest).await.map_err(Status::from)?;
        handle
            .write_chunk(&first.data)
            .await
            .map_err(Status::from)?;
        let mut finished = first.finish_write;

        while !finished {
            let Some(next) = stream.message().await? else {
                break;
            };
            handle.write_chunk(&next.data).await.map_err(Status::from)?;
            finished = next.finish_write;
        }

        if !finished {
            return Err(Status::invalid_argument("stream ended before finish_write"));
        }

        self.backend
            .commit_write(&digest, handle)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(WriteResponse {
            committed_size: digest.size_bytes as i64,
        }))
    }
}

#[tonic::async_trait]
impl ByteStream for ByteStreamService {
    type ReadStream = Pin<Box<dyn Stream<Item = Result<ReadResponse, Status>> + Send + 'static>>;

    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<Self::ReadStream>, Status> {
        let request = request.into_inner();
        let parsed = parse_read_resource_name(&request.resource_name).map_err(Status::from)?;
        let digest = parsed.digest;

        if request.read_offset < 0 || request.read_offset as usize > digest.size_bytes {
            return Err(Status::out_of_range("read offset out of range"));
        }
        if request.read_limit < 0 {
            return Err(Status::invalid_argument("negative read_limit is invalid"));
        }

        let bytes = self
            .backend
            .get_blob(&digest)
            .await
            .map_err(Status::from)?
            .ok_or_else(|| Status::not_found("blob not found"))?;

        let offset = request.read_offset as usize;
        let remaining = if request.read_limit == 0 {
            digest.size_bytes - offset
        } else {
            (request.read_limit as usize).min(digest.size_bytes.saturating_sub(offset))
        };
        let slice = bytes.slice(offset..offset + remaining);

        let stream = async_stream::try_stream! {
            let mut sent = 0usize;
            while sent < slice.len() {
                let end = (sent + BLOCK_SIZE).min(slice.len());
                yield ReadResponse { data: slice.slice(sent..end) };
                sent = end;
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty write stream"))?;
        self.write_from_first_message(first, stream).await
    }

    async fn query_write_status(
        &self,
        request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        let request = request.into_inner();
        let parsed = parse_write_resource_name(&request.resource_name).map_err(Status::from)?;
        let complete = self
            .backend
            .has_blob(&parsed.digest)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(QueryWriteStatusResponse {
            committed_size: if complete {
                parsed.digest.size_bytes as i64
            } else {
                0
            },
            complete,
        }))
    }
}

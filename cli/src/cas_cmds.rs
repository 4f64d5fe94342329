// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// `cas upload-file|upload-dir|download-file|download-dir` (spec.md §6 CLI
// surface; spec_full.md's expansion of the original's `cmd_cas.py`).

use std::fs;
use std::path::Path;

use buildgrid_hashing::Digest;
use buildgrid_proto::bytestream::byte_stream_client::ByteStreamClient;
use buildgrid_proto::bytestream::{ReadRequest, WriteRequest};
use buildgrid_proto::re::content_addressable_storage_client::ContentAddressableStorageClient;
use buildgrid_proto::re::{
    BatchUpdateBlobsRequest, Directory, DirectoryNode, FileNode, FindMissingBlobsRequest, GetTreeRequest,
};
use prost::Message;
use tonic::transport::Channel;
use tonic::Request;
use uuid::Uuid;

use crate::client::with_auth;
use crate::Connection;

const INLINE_THRESHOLD: usize = 2 * 1024 * 1024;

fn read_resource_name(instance_name: &str, digest: &Digest) -> String {
    if instance_name.is_empty() {
        format!("blobs/{}/{}", digest.hash, digest.size_bytes)
    } else {
        format!("{instance_name}/blobs/{}/{}", digest.hash, digest.size_bytes)
    }
}

fn write_resource_name(instance_name: &str, digest: &Digest) -> String {
    let uuid = Uuid::new_v4();
    if instance_name.is_empty() {
        format!("uploads/{uuid}/blobs/{}/{}", digest.hash, digest.size_bytes)
    } else {
        format!("{instance_name}/uploads/{uuid}/blobs/{}/{}", digest.hash, digest.size_bytes)
    }
}

pub fn parse_digest_arg(arg: &str) -> Result<Digest, String> {
    let (hash, size) = arg
        .rsplit_once('/')
        .ok_or_else(|| format!("expected digest in <hash>/<size> form, got {arg:?}"))?;
    let fingerprint = buildgrid_hashing::Fingerprint::from_hex_string(hash)?;
    let size_bytes: usize = size.parse().map_err(|_| format!("invalid size in digest {arg:?}"))?;
    Ok(Digest::new(fingerprint, size_bytes))
}

async fn upload_blob_via_bytestream(
    client: &mut ByteStreamClient<Channel>,
    instance_name: &str,
    digest: &Digest,
    bytes: &[u8],
    auth_token: &Option<String>,
) -> Result<(), String> {
    let resource_name = write_resource_name(instance_name, digest);
    let chunks = bytes.chunks(INLINE_THRESHOLD).collect::<Vec<_>>();
    let requests: Vec<WriteRequest> = if chunks.is_empty() {
        vec![WriteRequest {
            resource_name,
            write_offset: 0,
            finish_write: true,
            data: bytes::Bytes::new(),
        }]
    } else {
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| WriteRequest {
                resource_name: if i == 0 { resource_name.clone() } else { String::new() },
                write_offset: (i * INLINE_THRESHOLD) as i64,
                finish_write: i == chunks.len() - 1,
                data: bytes::Bytes::copy_from_slice(chunk),
            })
            .collect()
    };
    let request = with_auth(Request::new(futures::stream::iter(requests)), auth_token)?;
    client.write(request).await.map_err(|status| format!("ByteStream.Write: {status}"))?;
    Ok(())
}

async fn upload_blobs_batched(
    cas: &mut ContentAddressableStorageClient<Channel>,
    bytestream: &mut ByteStreamClient<Channel>,
    instance_name: &str,
    blobs: Vec<(Digest, Vec<u8>)>,
    auth_token: &Option<String>,
) -> Result<(), String> {
    let (small, large): (Vec<_>, Vec<_>) = blobs.into_iter().partition(|(digest, _)| digest.size_bytes <= INLINE_THRESHOLD);

    if !small.is_empty() {
        let missing_request = with_auth(
            Request::new(FindMissingBlobsRequest {
                instance_name: instance_name.to_string(),
                blob_digests: small.iter().map(|(d, _)| d.into()).collect(),
            }),
            auth_token,
        )?;
        let missing = cas
            .find_missing_blobs(missing_request)
            .await
            .map_err(|status| format!("FindMissingBlobs: {status}"))?
            .into_inner()
            .missing_blob_digests;
        let missing: std::collections::HashSet<String> = missing.iter().map(|d| format!("{}/{}", d.hash, d.size_bytes)).collect();

        let requests: Vec<_> = small
            .iter()
            .filter(|(digest, _)| missing.contains(&format!("{}/{}", digest.hash, digest.size_bytes)))
            .map(|(digest, data)| buildgrid_proto::re::batch_update_blobs_request::Request {
                digest: Some(digest.into()),
                data: bytes::Bytes::copy_from_slice(data),
            })
            .collect();
        if !requests.is_empty() {
            let update_request = with_auth(
                Request::new(BatchUpdateBlobsRequest {
                    instance_name: instance_name.to_string(),
                    requests,
                }),
                auth_token,
            )?;
            cas.batch_update_blobs(update_request)
                .await
                .map_err(|status| format!("BatchUpdateBlobs: {status}"))?;
        }
    }

    for (digest, data) in large {
        upload_blob_via_bytestream(bytestream, instance_name, &digest, &data, auth_token).await?;
    }
    Ok(())
}

/// Recursively builds the `Directory` tree for `path`, returning `(root_digest, blobs)` where
/// `blobs` holds every file and `Directory` proto that needs to land in CAS.
fn build_tree(path: &Path) -> Result<(Digest, Vec<(Digest, Vec<u8>)>), String> {
    let mut entries: Vec<_> = fs::read_dir(path)
        .map_err(|err| format!("reading dir {path:?}: {err}"))?
        .collect::<Result<_, _>>()
        .map_err(|err| format!("reading dir {path:?}: {err}"))?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut directory = Directory::default();
    let mut blobs = Vec::new();

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type().map_err(|err| format!("stat {:?}: {err}", entry.path()))?;
        if file_type.is_dir() {
            let (digest, mut child_blobs) = build_tree(&entry.path())?;
            blobs.append(&mut child_blobs);
            directory.directories.push(DirectoryNode {
                name,
                digest: Some((&digest).into()),
            });
        } else if file_type.is_file() {
            let data = fs::read(entry.path()).map_err(|err| format!("reading {:?}: {err}", entry.path()))?;
            let digest = Digest::of_bytes(&data);
            directory.files.push(FileNode {
                name,
                digest: Some((&digest).into()),
                is_executable: false,
            });
            blobs.push((digest, data));
        }
    }

    let encoded = directory.encode_to_vec();
    let digest = Digest::of_bytes(&encoded);
    blobs.push((digest, encoded));
    Ok((digest, blobs))
}

pub async fn upload_file(channel: Channel, instance_name: &str, path: &Path, auth_token: &Option<String>) -> Result<(), String> {
    let data = fs::read(path).map_err(|err| format!("reading {path:?}: {err}"))?;
    let digest = Digest::of_bytes(&data);
    let mut cas = ContentAddressableStorageClient::new(channel.clone());
    let mut bytestream = ByteStreamClient::new(channel);
    upload_blobs_batched(&mut cas, &mut bytestream, instance_name, vec![(digest, data)], auth_token).await?;
    println!("{}/{}", digest.hash, digest.size_bytes);
    Ok(())
}

pub async fn upload_dir(channel: Channel, instance_name: &str, path: &Path, auth_token: &Option<String>) -> Result<(), String> {
    let (root_digest, blobs) = build_tree(path)?;
    let mut cas = ContentAddressableStorageClient::new(channel.clone());
    let mut bytestream = ByteStreamClient::new(channel);
    upload_blobs_batched(&mut cas, &mut bytestream, instance_name, blobs, auth_token).await?;
    println!("{}/{}", root_digest.hash, root_digest.size_bytes);
    Ok(())
}

async fn fetch_blob(
    channel: &Channel,
    instance_name: &str,
    digest: &Digest,
    auth_token: &Option<String>,
) -> Result<Vec<u8>, String> {
    let mut bytestream = ByteStreamClient::new(channel.clone());
    let request = with_auth(
        Request::new(ReadRequest {
            resource_name: read_resource_name(instance_name, digest),
            read_offset: 0,
            read_limit: 0,
        }),
        auth_token,
    )?;
    let mut stream = bytestream
        .read(request)
        .await
        .map_err(|status| format!("ByteStream.Read: {status}"))?
        .into_inner();
    let mut data = Vec::with_capacity(digest.size_bytes);
    while let Some(chunk) = stream.message().await.map_err(|status| format!("ByteStream.Read: {status}"))? {
        data.extend_from_slice(&chunk.data);
    }
    Ok(data)
}

pub async fn download_file(channel: Channel, instance_name: &str, digest: &Digest, dest: &Path, auth_token: &Option<String>) -> Result<(), String> {
    let data = fetch_blob(&channel, instance_name, digest, auth_token).await?;
    fs::write(dest, data).map_err(|err| format!("writing {dest:?}: {err}"))
}

async fn download_directory(
    channel: &Channel,
    instance_name: &str,
    directory: &Directory,
    dest: &Path,
    auth_token: &Option<String>,
) -> Result<(), String> {
    fs::create_dir_all(dest).map_err(|err| format!("creating {dest:?}: {err}"))?;
    for file in &directory.files {
        let digest: Digest = file
            .digest
            .as_ref()
            .ok_or_else(|| "directory entry missing digest".to_string())?
            .try_into()?;
        let data = fetch_blob(channel, instance_name, &digest, auth_token).await?;
        fs::write(dest.join(&file.name), data).map_err(|err| format!("writing {:?}: {err}", dest.join(&file.name)))?;
    }
    for child in &directory.directories {
        let digest: Digest = child
            .digest
            .as_ref()
            .ok_or_else(|| "directory entry missing digest".to_string())?
            .try_into()?;
        let bytes = fetch_blob(channel, instance_name, &digest, auth_token).await?;
        let child_directory = Directory::decode(bytes.as_slice()).map_err(|err| format!("decoding directory: {err}"))?;
        Box::pin(download_directory(channel, instance_name, &child_directory, &dest.join(&child.name), auth_token)).await?;
    }
    Ok(())
}

pub async fn download_dir(channel: Channel, instance_name: &str, root_digest: &Digest, dest: &Path, auth_token: &Option<String>) -> Result<(), String> {
    let mut cas = ContentAddressableStorageClient::new(channel.clone());
    let request = with_auth(
        Request::new(GetTreeRequest {
            instance_name: instance_name.to_string(),
            root_digest: Some(root_digest.into()),
            page_size: 0,
            page_token: String::new(),
        }),
        auth_token,
    )?;
    let mut stream = cas.get_tree(request).await.map_err(|status| format!("GetTree: {status}"))?.into_inner();

    let mut directories = Vec::new();
    while let Some(page) = stream.message().await.map_err(|status| format!("GetTree: {status}"))? {
        directories.extend(page.directories);
    }
    let root = directories
        .first()
        .ok_or_else(|| "GetTree returned no directories".to_string())?
        .clone();
    download_directory(&channel, instance_name, &root, dest, auth_token).await
}

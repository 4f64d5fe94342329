// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// ByteStream resource-name grammar (spec.md §4.2, §6):
//   read:  [<instance>/]blobs/<hash>/<size>
//   write: [<instance>/]uploads/<uuid>/blobs/<hash>/<size>[/<extra>]

use buildgrid_grpc_util::ComponentError;
use buildgrid_hashing::{Digest, Fingerprint};

pub struct ReadResource {
    pub instance_name: String,
    pub digest: Digest,
}

pub struct WriteResource {
    pub instance_name: String,
    pub uuid: String,
    pub digest: Digest,
}

fn parse_digest(hash: &str, size: &str) -> Result<Digest, ComponentError> {
    let fingerprint = Fingerprint::from_hex_string(hash)
        .map_err(|err| ComponentError::invalid_argument(format!("invalid hash in resource name: {err}")))?;
    let size_bytes: i64 = size
        .parse()
        .map_err(|_| ComponentError::invalid_argument(format!("invalid size in resource name: {size}")))?;
    if size_bytes < 0 {
        return Err(ComponentError::invalid_argument("negative size in resource name"));
    }
    Ok(Digest::new(fingerprint, size_bytes as usize))
}

pub fn parse_read_resource_name(name: &str) -> Result<ReadResource, ComponentError> {
    let segments: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 3 {
        return Err(ComponentError::invalid_argument(format!(
            "resource name too short to be a blob read: {name}"
        )));
    }
    let tail = &segments[segments.len() - 3..];
    if tail[0] != "blobs" {
        return Err(ComponentError::invalid_argument(format!(
            "expected 'blobs' marker in read resource name: {name}"
        )));
    }
    let digest = parse_digest(tail[1], tail[2])?;
    let instance_name = segments[..segments.len() - 3].join("/");
    Ok(ReadResource {
        instance_name,
        digest,
    })
}

pub fn parse_write_resource_name(name: &str) -> Result<WriteResource, ComponentError> {
    let segments: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();
    let Some(uploads_pos) = segments.iter().position(|s| *s == "uploads") else {
        return Err(ComponentError::invalid_argument(format!(
            "missing 'uploads' marker in write resource name: {name}"
        )));
    };
    if segments.len() < uploads_pos + 5 {
        return Err(ComponentError::invalid_argument(format!(
            "write resource name missing required components: {name}"
        )));
    }
    let uuid = segments[uploads_pos + 1].to_owned();
    if segments[uploads_pos + 2] != "blobs" {
        return Err(ComponentError::invalid_argument(format!(
            "expected 'blobs' marker after upload uuid in write resource name: {name}"
        )));
    }
    let digest = parse_digest(segments[uploads_pos + 3], segments[uploads_pos + 4])?;
    let instance_name = segments[..uploads_pos].join("/");
    // Anything past the size component is accepted and ignored (spec.md §9).
    Ok(WriteResource {
        instance_name,
        uuid,
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_read_without_instance() {
        let digest = Digest::of_bytes(b"abc");
        let name = format!("blobs/{}/{}", digest.hash, digest.size_bytes);
        let parsed = parse_read_resource_name(&name).unwrap();
        assert_eq!(parsed.instance_name, "");
        assert_eq!(parsed.digest, digest);
    }

    #[test]
    fn parses_read_with_instance() {
        let digest = Digest::of_bytes(b"abc");
        let name = format!("main/blobs/{}/{}", digest.hash, digest.size_bytes);
        let parsed = parse_read_resource_name(&name).unwrap();
        assert_eq!(parsed.instance_name, "main");
    }

    #[test]
    fn rejects_empty_resource_name() {
        assert!(parse_read_resource_name("").is_err());
    }

    #[test]
    fn rejects_missing_blobs_marker() {
        assert!(parse_read_resource_name("main/nope/abc/3").is_err());
    }

    #[test]
    fn rejects_negative_size() {
        let digest = Digest::of_bytes(b"abc");
        let name = format!("blobs/{}/-1", digest.hash);
        assert!(parse_read_resource_name(&name).is_err());
    }

    #[test]
    fn parses_write_with_uuid_and_instance() {
        let digest = Digest::of_bytes(b"abcdef");
        let name = format!("main/uploads/U/blobs/{}/{}", digest.hash, digest.size_bytes);
        let parsed = parse_write_resource_name(&name).unwrap();
        assert_eq!(parsed.instance_name, "main");
        assert_eq!(parsed.uuid, "U");
        assert_eq!(parsed.digest, digest);
    }

    #[test]
    fn accepts_trailing_extra_components() {
        let digest = Digest::of_bytes(b"abcdef");
        let name = format!("uploads/U/blobs/{}/{}/extra/path", digest.hash, digest.size_bytes);
        let parsed = parse_write_resource_name(&name).unwrap();
        assert_eq!(parsed.digest, digest);
    }

    #[test]
    fn rejects_write_missing_uploads_marker() {
        let digest = Digest::of_bytes(b"abcdef");
        let name = format!("blobs/{}/{}", digest.hash, digest.size_bytes);
        assert!(parse_write_resource_name(&name).is_err());
    }
}

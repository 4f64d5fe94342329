// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::SystemTime;

use crate::gen::google::protobuf::Timestamp;

impl<'a> From<&'a buildgrid_hashing::Digest> for crate::re::Digest {
    fn from(d: &'a buildgrid_hashing::Digest) -> Self {
        Self {
            hash: d.hash.to_hex(),
            size_bytes: d.size_bytes as i64,
        }
    }
}

impl From<buildgrid_hashing::Digest> for crate::re::Digest {
    fn from(d: buildgrid_hashing::Digest) -> Self {
        Self {
            hash: d.hash.to_hex(),
            size_bytes: d.size_bytes as i64,
        }
    }
}

impl<'a> TryFrom<&'a crate::re::Digest> for buildgrid_hashing::Digest {
    type Error = String;

    fn try_from(d: &crate::re::Digest) -> Result<Self, Self::Error> {
        buildgrid_hashing::Fingerprint::from_hex_string(&d.hash)
            .map_err(|err| format!("Bad fingerprint in Digest {:?}: {:?}", &d.hash, err))
            .map(|fingerprint| buildgrid_hashing::Digest::new(fingerprint, d.size_bytes as usize))
    }
}

impl TryFrom<crate::re::Digest> for buildgrid_hashing::Digest {
    type Error = String;

    fn try_from(d: crate::re::Digest) -> Result<Self, Self::Error> {
        buildgrid_hashing::Digest::try_from(&d)
    }
}

/// Requires that an `Option<Digest>` field actually carries a Digest,
/// mirroring a common Protocol-violation check at REAPI boundaries.
pub fn require_digest<'a, D: Into<Option<&'a crate::re::Digest>>>(
    digest_opt: D,
) -> Result<buildgrid_hashing::Digest, String> {
    match digest_opt.into() {
        Some(digest) => buildgrid_hashing::Digest::try_from(digest),
        None => {
            Err("Protocol violation: Digest missing from a Remote Execution API protobuf.".into())
        }
    }
}

pub fn timestamp_from_system_time(time: SystemTime) -> Timestamp {
    let duration = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_round_trips_through_proto() {
        let digest = buildgrid_hashing::Digest::of_bytes(b"hello");
        let proto: crate::re::Digest = digest.into();
        let back = buildgrid_hashing::Digest::try_from(proto).unwrap();
        assert_eq!(digest, back);
    }

    #[test]
    fn require_digest_rejects_missing() {
        assert!(require_digest(None).is_err());
    }
}

// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(unused_must_use)]

mod retry;
pub use retry::retry_call;

use std::collections::BTreeMap;

use http::HeaderMap;
use tonic::Status;

pub type LayeredService = tower::util::BoxCloneService<
    http::Request<tonic::body::BoxBody>,
    http::Response<tonic::body::BoxBody>,
    tonic::transport::Error,
>;

/// Turns a user-supplied `key: value` header map into an `http::HeaderMap`,
/// skipping entries whose key or value cannot be encoded as an HTTP header.
pub fn headers_to_http_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, String> {
    let mut header_map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let header_name = http::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|err| format!("invalid header name {key}: {err}"))?;
        let header_value = http::header::HeaderValue::from_str(value)
            .map_err(|err| format!("invalid header value for {key}: {err}"))?;
        header_map.insert(header_name, header_value);
    }
    Ok(header_map)
}

pub fn status_to_str(status: Status) -> String {
    if status.code() == tonic::Code::Unknown {
        format!("{status}")
    } else {
        format!("{:?}: {}", status.code(), status.message())
    }
}

/// The error taxonomy at every component boundary (spec.md §7). Library
/// code returns these; only the outermost RPC layer converts them to a
/// `tonic::Status`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    OutOfRange,
    UpdateNotAllowed,
    Cancelled,
    RetryExceeded,
    BackendUnavailable,
    /// A server-side bookkeeping violation rather than a client-correctable
    /// precondition (spec.md §9 Open Question, `InvalidLeaseState`).
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> tonic::Code {
        match self {
            ErrorKind::InvalidArgument => tonic::Code::InvalidArgument,
            ErrorKind::NotFound => tonic::Code::NotFound,
            ErrorKind::OutOfRange => tonic::Code::OutOfRange,
            ErrorKind::UpdateNotAllowed => tonic::Code::FailedPrecondition,
            ErrorKind::Cancelled => tonic::Code::Cancelled,
            ErrorKind::RetryExceeded => tonic::Code::Internal,
            ErrorKind::BackendUnavailable => tonic::Code::Unavailable,
            ErrorKind::Internal => tonic::Code::Internal,
        }
    }
}

/// A typed error carrying an `ErrorKind`; every component-level error type
/// in this workspace implements `Into<ComponentError>` so the gRPC service
/// layer has one place to do the conversion (spec.md §4.12/§7).
#[derive(Clone, Debug)]
pub struct ComponentError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ComponentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> ComponentError {
        ComponentError {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> ComponentError {
        ComponentError::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> ComponentError {
        ComponentError::new(ErrorKind::NotFound, message)
    }
}

impl std::fmt::Display for ComponentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ComponentError {}

impl From<ComponentError> for Status {
    fn from(err: ComponentError) -> Status {
        Status::new(err.kind.code(), err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_to_http_header_map_rejects_bad_name() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_owned(), "value".to_owned());
        assert!(headers_to_http_header_map(&headers).is_err());
    }

    #[test]
    fn headers_to_http_header_map_accepts_valid_entries() {
        let mut headers = BTreeMap::new();
        headers.insert("x-buildgrid-instance".to_owned(), "main".to_owned());
        let map = headers_to_http_header_map(&headers).unwrap();
        assert_eq!(map.get("x-buildgrid-instance").unwrap(), "main");
    }

    #[test]
    fn component_error_maps_to_expected_status_code() {
        let err = ComponentError::not_found("blob missing");
        let status: Status = err.into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}

//! Cross-boundary encoding of classified errors.
//!
//! The sender embeds the public JSON rendering of an [`Error`] in the
//! transport status message. The receiver reads it back; malformed payloads
//! and unexpected status codes always become `Internal` errors.

use thiserror::Error as ThisError;

use crate::error::Error;
use crate::kind::Kind;

pub const INTERNAL_MESSAGE: &str = "got an internal error";

#[derive(Debug, ThisError)]
pub enum DecodeError {
    #[error("malformed error payload")]
    Malformed(#[source] serde_json::Error),
}

/// Payload placed in the transport status message.
pub fn encode(err: &Error) -> String {
    err.to_string()
}

/// Strict decoding: fails when the payload is not a classified error.
pub fn try_decode(payload: &str) -> Result<Error, DecodeError> {
    serde_json::from_str::<Error>(payload).map_err(DecodeError::Malformed)
}

/// Lenient decoding used on the receiving side of a call.
///
/// `from` is the local service and `to` the remote one. `known_status` tells
/// whether the transport status code matched the convention used for
/// classified errors.
pub fn decode(payload: &str, known_status: bool, from: &str, to: &str) -> Error {
    let mut err = match try_decode(payload) {
        Ok(err) => err,
        Err(_) => return coerced(payload, from, to),
    };

    if !known_status {
        err.kind = Kind::Internal;
        err.details = Some(payload.to_string()).filter(|s| !s.is_empty());
    }

    err
}

fn coerced(payload: &str, from: &str, to: &str) -> Error {
    Error::new(Kind::Internal)
        .with_code(0)
        .with_service_name(from)
        .with_destination(to)
        .with_message(INTERNAL_MESSAGE)
        .with_details(payload)
}

#[cfg(feature = "tonic")]
mod grpc {
    use super::*;
    use tonic::{Code, Status};

    /// Classified errors travel with `Code::Unknown`.
    pub const CLASSIFIED_CODE: Code = Code::Unknown;

    impl From<Error> for Status {
        fn from(err: Error) -> Self {
            Status::new(CLASSIFIED_CODE, encode(&err))
        }
    }

    impl From<&Error> for Status {
        fn from(err: &Error) -> Self {
            Status::new(CLASSIFIED_CODE, encode(err))
        }
    }

    impl From<Status> for Error {
        fn from(status: Status) -> Self {
            from_status(&status, "", "")
        }
    }

    /// Decodes a status returned by a call from service `from` to `to`.
    pub fn from_status(status: &Status, from: &str, to: &str) -> Error {
        decode(status.message(), status.code() == CLASSIFIED_CODE, from, to)
    }
}

#[cfg(feature = "tonic")]
pub use grpc::{from_status, CLASSIFIED_CODE};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_survives_the_hop() {
        for kind in Kind::ALL {
            let sent = Error::new(kind)
                .with_service_name("orders")
                .with_message("boom");
            let got = decode(&encode(&sent), true, "billing", "orders");
            assert_eq!(got.kind, kind);
            assert_eq!(got.code, kind.code());
            assert_eq!(got.message.as_deref(), Some("boom"));
        }
    }

    #[test]
    fn malformed_payload_becomes_internal() {
        let got = decode("upstream connect error", true, "billing", "orders");
        assert_eq!(got.kind, Kind::Internal);
        assert_eq!(got.details.as_deref(), Some("upstream connect error"));
        assert_eq!(got.service_name.as_deref(), Some("billing"));
        assert_eq!(got.destination.as_deref(), Some("orders"));
    }

    #[test]
    fn json_that_is_not_an_error_becomes_internal() {
        let got = decode(r#"{"kind":"Bogus"}"#, true, "a", "b");
        assert_eq!(got.kind, Kind::Internal);
        assert!(try_decode(r#"{"code":3}"#).is_err());
    }

    #[test]
    fn unexpected_status_forces_internal() {
        let sent = Error::new(Kind::NotFound).with_message("not found");
        let payload = encode(&sent);
        let got = decode(&payload, false, "a", "b");
        assert_eq!(got.kind, Kind::Internal);
        assert_eq!(got.details.as_deref(), Some(payload.as_str()));
    }

    #[cfg(feature = "tonic")]
    #[test]
    fn status_conversion_round_trip() {
        let sent = Error::new(Kind::Precondition).with_message("failed precondition");
        let status: tonic::Status = sent.clone().into();
        assert_eq!(status.code(), tonic::Code::Unknown);
        let got: Error = status.into();
        assert_eq!(got.kind, Kind::Precondition);

        let foreign = tonic::Status::unavailable(encode(&sent));
        assert_eq!(from_status(&foreign, "a", "b").kind, Kind::Internal);
    }
}

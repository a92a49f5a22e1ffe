//! Classified service errors.
//!
//! Every error a handler reports belongs to a closed set of [`Kind`]s and
//! travels between services as a small JSON document embedded in the
//! transport status message. Decoding never yields an unclassified value:
//! anything that cannot be read back is coerced into an `Internal` error.

pub mod attribute;
pub mod error;
pub mod kind;
pub mod wire;

#[cfg(feature = "axum")]
pub mod response;

pub use attribute::Attribute;
pub use error::Error;
pub use kind::{codes, Kind};
pub use wire::DecodeError;

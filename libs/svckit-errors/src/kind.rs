use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric codes carried by the wire payload.
///
/// They only tell the receiver that a known error happened; classification
/// always comes from [`Kind`].
pub mod codes {
    pub const INTERNAL: i32 = 1;
    pub const NOT_FOUND: i32 = 2;
    pub const INVALID_ARGUMENT: i32 = 3;
    pub const PRECONDITION_FAILED: i32 = 4;
    pub const NO_PERMISSION: i32 = 5;
    pub const RPC: i32 = 6;
}

/// Closed classification of a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "InternalError")]
    Internal,
    #[serde(rename = "NotFoundError")]
    NotFound,
    #[serde(rename = "ConditionError")]
    Precondition,
    #[serde(rename = "PermissionError")]
    Permission,
    #[serde(rename = "RPCError")]
    Rpc,
    #[serde(rename = "CustomError")]
    Custom,
}

impl Kind {
    pub const ALL: [Kind; 7] = [
        Kind::Validation,
        Kind::Internal,
        Kind::NotFound,
        Kind::Precondition,
        Kind::Permission,
        Kind::Rpc,
        Kind::Custom,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Validation => "ValidationError",
            Kind::Internal => "InternalError",
            Kind::NotFound => "NotFoundError",
            Kind::Precondition => "ConditionError",
            Kind::Permission => "PermissionError",
            Kind::Rpc => "RPCError",
            Kind::Custom => "CustomError",
        }
    }

    /// Default numeric code. Custom errors carry none (0) unless one is set.
    pub fn code(&self) -> i32 {
        match self {
            Kind::Validation => codes::INVALID_ARGUMENT,
            Kind::Internal => codes::INTERNAL,
            Kind::NotFound => codes::NOT_FOUND,
            Kind::Precondition => codes::PRECONDITION_FAILED,
            Kind::Permission => codes::NO_PERMISSION,
            Kind::Rpc => codes::RPC,
            Kind::Custom => 0,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

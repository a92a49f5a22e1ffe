use serde::{Deserialize, Serialize};
use std::fmt;

use crate::kind::Kind;

/// A classified service error.
///
/// Instances are produced by the runtime's error factory and become immutable
/// once submitted. `Display` yields the public JSON rendering, which drops
/// `destination`, `details` and `service_name` when details are hidden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    #[serde(default)]
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip)]
    hide_details: bool,
}

impl Error {
    /// A bare error of the given kind carrying the kind's default code.
    pub fn new(kind: Kind) -> Self {
        Self {
            code: kind.code(),
            service_name: None,
            message: None,
            destination: None,
            kind,
            details: None,
            hide_details: false,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn hiding_details(mut self, hide: bool) -> Self {
        self.hide_details = hide;
        self
    }

    pub fn hides_details(&self) -> bool {
        self.hide_details
    }

    pub fn is(&self, kind: Kind) -> bool {
        self.kind == kind
    }

    /// The value rendered publicly: internals stripped when hidden.
    pub fn public_view(&self) -> Error {
        let mut out = Error {
            code: self.code,
            service_name: None,
            message: self.message.clone(),
            destination: None,
            kind: self.kind,
            details: None,
            hide_details: self.hide_details,
        };

        if !self.hide_details {
            out.service_name = self.service_name.clone();
            out.destination = self.destination.clone();
            out.details = self.details.clone();
        }

        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string(&self.public_view()).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

impl std::error::Error for Error {}

/// Finds a classified error anywhere in a source chain.
pub fn find_in_chain<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a Error> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<Error>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn sample() -> Error {
        Error::new(Kind::Rpc)
            .with_service_name("orders")
            .with_message("service RPC error")
            .with_destination("payments")
            .with_details("connection refused")
    }

    #[test]
    fn display_keeps_internals_by_default() {
        let v: Value = serde_json::from_str(&sample().to_string()).unwrap();
        assert_eq!(v["kind"], "RPCError");
        assert_eq!(v["code"], 6);
        assert_eq!(v["service_name"], "orders");
        assert_eq!(v["destination"], "payments");
        assert_eq!(v["details"], "connection refused");
    }

    #[test]
    fn hidden_details_never_leak_for_any_kind() {
        for kind in Kind::ALL {
            let err = Error::new(kind)
                .with_service_name("svc-secret")
                .with_message("msg")
                .with_destination("dest-secret")
                .with_details("details-secret")
                .hiding_details(true);
            let out = err.to_string();
            assert!(!out.contains("secret"), "{kind}: {out}");
            assert!(!out.contains("destination"));
            assert!(!out.contains("service_name"));
            assert!(!out.contains("details"));
            // the full value stays intact for logging
            assert_eq!(err.details.as_deref(), Some("details-secret"));
        }
    }

    #[test]
    fn empty_strings_are_omitted() {
        let err = Error::new(Kind::NotFound).with_destination("");
        assert!(err.destination.is_none());
        assert!(!err.to_string().contains("destination"));
    }

    #[test]
    fn chain_lookup_finds_wrapped_error() {
        #[derive(Debug)]
        struct Outer(Error);
        impl fmt::Display for Outer {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("outer")
            }
        }
        impl std::error::Error for Outer {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let outer = Outer(Error::new(Kind::Permission));
        let found = find_in_chain(&outer).unwrap();
        assert!(found.is(Kind::Permission));
    }
}

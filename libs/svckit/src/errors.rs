//! Error factory handed to features, servers and handlers.
//!
//! Building an error never logs. Logging happens once, when the builder is
//! submitted, at a severity fixed by the error kind.

use std::fmt;
use svckit_errors::{wire, Attribute, Error, Kind};

use crate::context::Context;
use crate::logger::{Logger, Severity};

#[derive(Clone, Debug)]
pub struct ErrorFactory {
    service_name: String,
    hide_details: bool,
    logger: Logger,
}

impl ErrorFactory {
    pub fn new(service_name: impl Into<String>, hide_details: bool, logger: Logger) -> Self {
        Self {
            service_name: service_name.into(),
            hide_details,
            logger,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn hides_details(&self) -> bool {
        self.hide_details
    }

    pub fn invalid_argument(&self, err: impl fmt::Display) -> ErrorBuilder {
        self.build(Kind::Validation, "request validation failed")
            .details(err.to_string())
    }

    pub fn not_found(&self) -> ErrorBuilder {
        self.build(Kind::NotFound, "not found")
    }

    pub fn failed_precondition(&self, msg: impl Into<String>) -> ErrorBuilder {
        self.build(Kind::Precondition, "failed precondition")
            .details(msg.into())
    }

    pub fn permission_denied(&self) -> ErrorBuilder {
        let msg = format!("no permission to access {}", self.service_name);
        self.build(Kind::Permission, msg)
    }

    pub fn internal(&self, err: impl fmt::Display) -> ErrorBuilder {
        self.build(Kind::Internal, wire::INTERNAL_MESSAGE)
            .details(err.to_string())
    }

    pub fn rpc(&self, err: impl fmt::Display, destination: impl Into<String>) -> ErrorBuilder {
        let mut b = self
            .build(Kind::Rpc, "service RPC error")
            .details(err.to_string());
        b.err = b.err.with_destination(destination);
        b
    }

    pub fn custom(&self, msg: impl Into<String>) -> ErrorBuilder {
        self.build(Kind::Custom, msg.into())
    }

    /// Decodes a status returned by a call to `destination`.
    pub fn from_status(&self, status: &tonic::Status, destination: &str) -> Error {
        wire::from_status(status, &self.service_name, destination).hiding_details(self.hide_details)
    }

    fn build(&self, kind: Kind, message: impl Into<String>) -> ErrorBuilder {
        ErrorBuilder {
            err: Error::new(kind)
                .with_service_name(&self.service_name)
                .with_message(message)
                .hiding_details(self.hide_details),
            attributes: Vec::new(),
            logger: self.logger.clone(),
        }
    }
}

/// An error being built. Call [`ErrorBuilder::submit`] to log it and obtain
/// the value to return.
#[must_use = "an error is only reported once submitted"]
pub struct ErrorBuilder {
    err: Error,
    attributes: Vec<Attribute>,
    logger: Logger,
}

impl ErrorBuilder {
    pub fn with_attributes(mut self, attrs: impl IntoIterator<Item = Attribute>) -> Self {
        self.attributes.extend(attrs);
        self
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.err = self.err.with_code(code);
        self
    }

    pub fn kind(&self) -> Kind {
        self.err.kind
    }

    fn details(mut self, details: String) -> Self {
        self.err = self.err.with_details(details);
        self
    }

    /// Writes exactly one log record and yields the final error.
    pub fn submit(self, ctx: &Context) -> Error {
        let mut attrs = vec![Attribute::string("error.kind", self.err.kind.as_str())];
        if let Some(details) = &self.err.details {
            attrs.push(Attribute::string("error.message", details.clone()));
        }
        attrs.extend(self.attributes);

        let message = self.err.message.as_deref().unwrap_or_default();
        self.logger.log(severity_for(self.err.kind), ctx, message, &attrs);

        self.err
    }
}

pub fn severity_for(kind: Kind) -> Severity {
    match kind {
        Kind::Rpc | Kind::Validation | Kind::Precondition => Severity::Warn,
        Kind::Internal => Severity::Error,
        Kind::NotFound | Kind::Permission | Kind::Custom => Severity::Info,
    }
}

use thiserror::Error;

use crate::context::Context;
use crate::logger::Logger;
use svckit_errors::Attribute;

/// Unrecoverable startup or runtime failure. Never crosses a network
/// boundary; its only destination is the service's [`FatalSink`].
#[derive(Debug, Error)]
#[error("{message}: {source:#}")]
pub struct AbortError {
    pub message: String,
    #[source]
    pub source: anyhow::Error,
}

impl AbortError {
    pub fn new(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self {
            message: message.into(),
            source: source.into(),
        }
    }
}

/// Where a service sends its fatal error.
pub trait FatalSink: Send + Sync {
    fn fatal(&self, logger: &Logger, err: &AbortError);
}

/// Logs at the highest severity and terminates the process with status 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitProcess;

impl FatalSink for ExitProcess {
    fn fatal(&self, logger: &Logger, err: &AbortError) {
        logger.fatal(
            &Context::new(),
            &err.message,
            &[Attribute::string("error.message", format!("{:#}", err.source))],
        );
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_message_and_cause_chain() {
        let inner = anyhow::anyhow!("port already in use").context("bind 0.0.0.0:8080");
        let err = AbortError::new("could not initialize internal services", inner);
        let s = err.to_string();
        assert!(s.starts_with("could not initialize internal services: "));
        assert!(s.contains("bind 0.0.0.0:8080"));
        assert!(s.contains("port already in use"));
    }
}

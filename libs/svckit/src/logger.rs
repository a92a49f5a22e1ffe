//! Service logger.
//!
//! Thin layer over `tracing` that merges attributes from an installed
//! [`LogContextExtractor`] into every record. The extractor is shared by every
//! clone, so installing it once affects all loggers handed out before. The
//! same goes for the error stacktrace switch.

use parking_lot::RwLock;
use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use svckit_errors::{attribute, Attribute};

use crate::context::Context;

/// Produces attributes from the active request context.
pub trait LogContextExtractor: Send + Sync {
    fn extract(&self, ctx: &Context) -> Vec<Attribute>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Clone, Default)]
pub struct Logger {
    extractor: Arc<RwLock<Option<Arc<dyn LogContextExtractor>>>>,
    error_stacktrace: Arc<AtomicBool>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("has_extractor", &self.extractor.read().is_some())
            .field("error_stacktrace", &self.error_stacktrace.load(Ordering::Relaxed))
            .finish()
    }
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_context_extractor(&self, extractor: Arc<dyn LogContextExtractor>) {
        *self.extractor.write() = Some(extractor);
    }

    /// When enabled, error and fatal records carry the current stacktrace
    /// under `error.stacktrace`.
    pub fn set_error_stacktrace(&self, enabled: bool) {
        self.error_stacktrace.store(enabled, Ordering::Relaxed);
    }

    pub fn debug(&self, ctx: &Context, msg: &str, attrs: &[Attribute]) {
        self.log(Severity::Debug, ctx, msg, attrs);
    }

    pub fn info(&self, ctx: &Context, msg: &str, attrs: &[Attribute]) {
        self.log(Severity::Info, ctx, msg, attrs);
    }

    pub fn warn(&self, ctx: &Context, msg: &str, attrs: &[Attribute]) {
        self.log(Severity::Warn, ctx, msg, attrs);
    }

    pub fn error(&self, ctx: &Context, msg: &str, attrs: &[Attribute]) {
        self.log(Severity::Error, ctx, msg, attrs);
    }

    /// Highest severity. Does not terminate the process.
    pub fn fatal(&self, ctx: &Context, msg: &str, attrs: &[Attribute]) {
        self.log(Severity::Fatal, ctx, msg, attrs);
    }

    pub fn log(&self, severity: Severity, ctx: &Context, msg: &str, attrs: &[Attribute]) {
        let mut all = match self.extractor.read().as_ref() {
            Some(e) => e.extract(ctx),
            None => Vec::new(),
        };
        all.extend_from_slice(attrs);
        if severity >= Severity::Error && self.error_stacktrace.load(Ordering::Relaxed) {
            all.push(Attribute::string(
                "error.stacktrace",
                Backtrace::force_capture().to_string(),
            ));
        }

        let rendered = (!all.is_empty()).then(|| attribute::render(&all));
        let attributes = rendered.as_deref();

        match severity {
            Severity::Debug => tracing::debug!(attributes, "{msg}"),
            Severity::Info => tracing::info!(attributes, "{msg}"),
            Severity::Warn => tracing::warn!(attributes, "{msg}"),
            Severity::Error => tracing::error!(attributes, "{msg}"),
            Severity::Fatal => tracing::error!(fatal = true, attributes, "{msg}"),
        }
    }
}

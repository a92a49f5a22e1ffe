//! Cross-cutting capabilities a feature may expose to the runtime.
//!
//! Servers and the orchestrator look them up by well-known name in the
//! feature set. A missing capability is never an error; the corresponding
//! behavior is simply not applied.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::context::Context;
use crate::logger::LogContextExtractor;

/// Well-known feature names.
pub mod names {
    pub const FEATURE_NAME_PREFIX: &str = "svckit-";

    pub const HTTP: &str = "svckit-http";
    pub const HTTP_CORS: &str = "svckit-http_cors";
    pub const HTTP_AUTH: &str = "svckit-http_auth";
    pub const PANIC_RECOVERY: &str = "svckit-panic_recovery";
    pub const TRACING: &str = "svckit-tracing";
    pub const TRACKER: &str = "svckit-tracker";
    pub const LOGGER_EXTRACTOR: &str = "svckit-logger_extractor";
}

/// Correlation id generation and propagation.
pub trait Tracker: Send + Sync {
    fn generate(&self) -> String;
    fn add(&self, ctx: &mut Context, id: String);
    fn retrieve(&self, ctx: &Context) -> Option<String>;
}

pub trait HttpCors: Send + Sync {
    fn cors(&self) -> CorsLayer;
}

#[async_trait]
pub trait HttpAuth: Send + Sync {
    /// Rejects a request by returning a classified error.
    async fn authenticate(
        &self,
        ctx: &Context,
        parts: &http::request::Parts,
    ) -> Result<(), svckit_errors::Error>;
}

/// Turns a handler panic into the error sent back to the caller.
pub trait PanicRecovery: Send + Sync {
    fn recover(&self, ctx: &Context, detail: &str) -> svckit_errors::Error;
}

/// Per-request measurements.
pub trait RequestTracing: Send + Sync {
    fn start_measurements(
        &self,
        ctx: &Context,
        service_type: &str,
    ) -> anyhow::Result<Box<dyn Any + Send>>;

    fn compute_metrics(
        &self,
        ctx: &Context,
        service_type: &str,
        data: Box<dyn Any + Send>,
    ) -> anyhow::Result<()>;
}

/// What a feature exposes to the runtime itself.
#[derive(Clone)]
pub enum FrameworkApi {
    Tracker(Arc<dyn Tracker>),
    LogExtractor(Arc<dyn LogContextExtractor>),
    HttpCors(Arc<dyn HttpCors>),
    HttpAuth(Arc<dyn HttpAuth>),
    PanicRecovery(Arc<dyn PanicRecovery>),
    Tracing(Arc<dyn RequestTracing>),
}

impl std::fmt::Debug for FrameworkApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameworkApi::Tracker(_) => "Tracker",
            FrameworkApi::LogExtractor(_) => "LogExtractor",
            FrameworkApi::HttpCors(_) => "HttpCors",
            FrameworkApi::HttpAuth(_) => "HttpAuth",
            FrameworkApi::PanicRecovery(_) => "PanicRecovery",
            FrameworkApi::Tracing(_) => "Tracing",
        };
        f.write_str(name)
    }
}

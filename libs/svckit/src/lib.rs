//! # Svckit - service lifecycle runtime
//!
//! Svckit turns a handler object plus a definitions file into a running
//! process: it validates the definitions, starts the configured features,
//! binds the handler, initializes one server per declared transport (gRPC,
//! HTTP, native or script), couples outgoing gRPC clients and then runs until
//! a shutdown signal or the first server failure.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use svckit::{ServiceBuilder, ServiceHandle, ServiceHandler, Slot};
//! use svckit::server::http::HttpServiceOptions;
//!
//! #[derive(Default)]
//! struct Greeter {
//!     service: Slot<ServiceHandle>,
//! }
//!
//! impl ServiceHandler for Greeter {
//!     fn service_slot(&self) -> &Slot<ServiceHandle> {
//!         &self.service
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = ServiceBuilder::from_file("service.toml")?
//!         .with_service(HttpServiceOptions::new(|_: Arc<Greeter>| axum::Router::new()))
//!         .with_features(svckit::features::tracker::features())
//!         .build()?;
//!     service.start(Arc::new(Greeter::default())).await;
//!     Ok(())
//! }
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod abort;
pub mod context;
pub mod contracts;
pub mod coupling;
pub mod errors;
pub mod feature;
pub mod features;
pub mod handler;
pub mod logger;
pub mod runtime;
pub mod server;
pub mod testing;

pub use abort::{AbortError, ExitProcess, FatalSink};
pub use context::{Context, ServiceContext, TrackerId};
pub use coupling::{CompressedClient, Declarations, GrpcClient, Slot};
pub use errors::ErrorFactory;
pub use feature::{DependencyOrder, Feature, FeatureEntry, FeatureSet};
pub use handler::ServiceHandler;
pub use logger::Logger;
pub use runtime::{LifecycleState, Service, ServiceBuilder, ServiceHandle, ShutdownOptions};
pub use server::{ServerSet, ServiceServer};
pub use testing::{ServiceTesting, TestOptions};

pub use svckit_bootstrap::{Definitions, DeploymentEnv, RuntimeEnv, ServiceType};
pub use svckit_errors as error;

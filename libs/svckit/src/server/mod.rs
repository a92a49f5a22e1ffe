//! Service servers: one per declared transport type.
//!
//! The orchestrator drives every server through the same contract:
//! `initialize` binds resources, `run` blocks until a fatal transport error or
//! a graceful stop, and `stop` unblocks `run`. `stop` must also be safe when
//! `run` was never called.

pub mod grpc;
pub mod http;
pub mod native;
pub mod script;

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use svckit_bootstrap::{Definitions, RuntimeEnv, ServiceType};
use svckit_errors::Attribute;

use crate::context::{Context, ServiceContext};
use crate::errors::ErrorFactory;
use crate::feature::{FeatureSet, SettingsLoader, Tags};
use crate::logger::Logger;

/// The application's service handler, type-erased.
pub type HostObject = Arc<dyn Any + Send + Sync>;

#[async_trait]
pub trait ServiceServer: Send + Sync {
    fn name(&self) -> ServiceType;

    /// Informative fields logged at startup.
    fn info(&self) -> Vec<Attribute>;

    async fn initialize(&self, ctx: &Context, opts: ServiceOptions) -> anyhow::Result<()>;

    async fn run(&self, ctx: &Context, host: HostObject) -> anyhow::Result<()>;

    async fn stop(&self, ctx: &Context) -> anyhow::Result<()>;

    fn settings(&self) -> Option<&dyn SettingsLoader> {
        None
    }
}

/// Per transport options supplied by the application.
pub trait ServerOptions: Any + Send + Sync {
    fn kind(&self) -> ServiceType;
    fn as_any(&self) -> &dyn Any;
}

/// Everything a server receives at initialization.
#[derive(Clone)]
pub struct ServiceOptions {
    /// Explicit port, or the transport default when none was declared.
    pub port: u16,
    pub service_type: ServiceType,
    pub name: String,
    pub product: String,
    pub logger: Logger,
    pub errors: ErrorFactory,
    pub service_context: Arc<ServiceContext>,
    pub tags: Arc<Tags>,
    pub service: Arc<dyn ServerOptions>,
    pub definitions: Arc<Definitions>,
    pub features: Arc<FeatureSet>,
    pub host: HostObject,
    pub env: Arc<RuntimeEnv>,
    /// Child of the service root token.
    pub cancel: CancellationToken,
}

impl ServiceOptions {
    /// The transport options downcast to the concrete type.
    pub fn service_options<T: ServerOptions>(&self) -> anyhow::Result<&T> {
        self.service.as_any().downcast_ref::<T>().ok_or_else(|| {
            anyhow::anyhow!(
                "unsupported options received for service type '{}'",
                self.service_type
            )
        })
    }
}

pub(crate) fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Server implementations by transport type. The first registration of a
/// type wins.
#[derive(Default, Clone)]
pub struct ServerSet {
    servers: HashMap<ServiceType, Arc<dyn ServiceServer>>,
}

impl std::fmt::Debug for ServerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.servers.keys().map(|t| t.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("ServerSet").field("servers", &names).finish()
    }
}

impl ServerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in transports.
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(grpc::GrpcServer::new()));
        set.register(Arc::new(http::HttpServer::new()));
        set.register(Arc::new(native::NativeServer::new()));
        set.register(Arc::new(script::ScriptServer::new()));
        set
    }

    pub fn register(&mut self, server: Arc<dyn ServiceServer>) {
        let name = server.name();
        if name.as_str().is_empty() {
            return;
        }
        self.servers.entry(name).or_insert(server);
    }

    pub fn append(&mut self, other: ServerSet) {
        for (name, server) in other.servers {
            self.servers.entry(name).or_insert(server);
        }
    }

    pub fn get(&self, t: &ServiceType) -> Option<Arc<dyn ServiceServer>> {
        self.servers.get(t).cloned()
    }

    pub fn types(&self) -> impl Iterator<Item = &ServiceType> {
        self.servers.keys()
    }

    pub fn servers(&self) -> impl Iterator<Item = &Arc<dyn ServiceServer>> {
        self.servers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_set_has_every_transport() {
        let set = ServerSet::builtin();
        for t in ServiceType::builtin() {
            assert_eq!(set.get(&t).map(|s| s.name()), Some(t));
        }
    }

    #[test]
    fn first_registration_wins() {
        let mut set = ServerSet::new();
        let first: Arc<dyn ServiceServer> = Arc::new(native::NativeServer::new());
        set.register(first.clone());

        let mut other = ServerSet::new();
        other.register(Arc::new(native::NativeServer::new()));
        other.register(Arc::new(script::ScriptServer::new()));
        set.append(other);

        let kept = set.get(&ServiceType::NATIVE).unwrap();
        assert!(Arc::ptr_eq(&kept, &first));
        assert!(set.get(&ServiceType::SCRIPT).is_some());
    }
}

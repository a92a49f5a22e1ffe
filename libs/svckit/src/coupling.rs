//! Dependencies a service handler declares and the runtime resolves once at
//! startup: gRPC clients of other services, public feature APIs and required
//! fields.
//!
//! The handler owns [`Slot`]s and registers them in
//! [`ServiceHandler::declare`](crate::ServiceHandler::declare); the runtime
//! fills them before the servers run.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use tonic::metadata::{Ascii, MetadataKey, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};

pub use tonic::codec::CompressionEncoding;

use svckit_bootstrap::{ClientDefinitions, DeploymentEnv, RuntimeEnv};

use crate::context::{Context, ServiceContext};
use crate::contracts::Tracker;
use crate::feature::FeatureSet;

/// A write-once cell shared between a handler and the runtime.
pub struct Slot<T> {
    cell: Arc<OnceLock<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            cell: Arc::new(OnceLock::new()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.get() {
            Some(v) => f.debug_tuple("Slot").field(v).finish(),
            None => f.write_str("Slot(<unset>)"),
        }
    }
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with the value when the slot was already filled.
    pub fn set(&self, value: T) -> Result<(), T> {
        self.cell.set(value)
    }

    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}

/// The channel every coupled client sends its calls through.
pub type CoupledService = InterceptedService<Channel, CouplingInterceptor>;

/// Encoding applied to every outgoing call and accepted on every response.
pub const CLIENT_COMPRESSION: CompressionEncoding = CompressionEncoding::Gzip;

/// Connection handed to a client constructor.
pub struct ClientConnection {
    service: CoupledService,
    address: String,
}

impl ClientConnection {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn into_service(self) -> CoupledService {
        self.service
    }
}

/// A gRPC client whose calls can be compressed. Coupling enables
/// [`CLIENT_COMPRESSION`] in both directions on every client it builds.
///
/// Generated tonic clients get it through [`compressed_client!`](crate::compressed_client).
pub trait CompressedClient: Sized {
    fn send_compressed(self, encoding: CompressionEncoding) -> Self;
    fn accept_compressed(self, encoding: CompressionEncoding) -> Self;
}

impl<T> CompressedClient for tonic::client::Grpc<T> {
    fn send_compressed(self, encoding: CompressionEncoding) -> Self {
        tonic::client::Grpc::send_compressed(self, encoding)
    }

    fn accept_compressed(self, encoding: CompressionEncoding) -> Self {
        tonic::client::Grpc::accept_compressed(self, encoding)
    }
}

/// Implements [`CompressedClient`] for generated tonic clients over the
/// coupled channel, e.g. `compressed_client!(OrdersClient);`.
#[macro_export]
macro_rules! compressed_client {
    ($($client:ident),+ $(,)?) => {
        $(
            impl $crate::coupling::CompressedClient for $client<$crate::coupling::CoupledService> {
                fn send_compressed(self, encoding: $crate::coupling::CompressionEncoding) -> Self {
                    $client::<$crate::coupling::CoupledService>::send_compressed(self, encoding)
                }

                fn accept_compressed(self, encoding: $crate::coupling::CompressionEncoding) -> Self {
                    $client::<$crate::coupling::CoupledService>::accept_compressed(self, encoding)
                }
            }
        )+
    };
}

type NewClient = Arc<dyn Fn(ClientConnection) -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// A gRPC client of another service.
#[derive(Clone)]
pub struct GrpcClient {
    service_name: String,
    new_client: Option<NewClient>,
}

impl fmt::Debug for GrpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcClient")
            .field("service_name", &self.service_name)
            .field("has_constructor", &self.new_client.is_some())
            .finish()
    }
}

impl GrpcClient {
    /// `new_client` builds the generated client from the connection, e.g.
    /// `|conn| GreeterClient::new(conn.into_service())`. Gzip is enabled on
    /// the returned client before it is handed to the service.
    pub fn new<C, F>(service_name: impl Into<String>, new_client: F) -> Self
    where
        C: CompressedClient + Any + Send + Sync,
        F: Fn(ClientConnection) -> C + Send + Sync + 'static,
    {
        Self {
            service_name: service_name.into(),
            new_client: Some(Arc::new(
                move |conn: ClientConnection| -> Box<dyn Any + Send + Sync> {
                    Box::new(
                        new_client(conn)
                            .send_compressed(CLIENT_COMPRESSION)
                            .accept_compressed(CLIENT_COMPRESSION),
                    )
                },
            )),
        }
    }

    /// A client declared without a constructor. It fails validation.
    pub fn unbound(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            new_client: None,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.new_client.is_none() {
            anyhow::bail!(
                "client '{}' does not have its API initialized",
                self.service_name
            );
        }
        Ok(())
    }
}

/// Host and port of a coupled service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub namespace: String,
    pub port: u16,
}

/// An explicit host from the client definitions wins over the
/// `<service>.<namespace>:<port>` default.
pub fn resolve_address(
    service_name: &str,
    default: &ConnectionOptions,
    alternative: Option<&ConnectionOptions>,
) -> String {
    let c = alternative.unwrap_or(default);
    if !c.host.is_empty() {
        format!("{}:{}", c.host, c.port)
    } else {
        format!("{}.{}:{}", service_name, c.namespace, c.port)
    }
}

/// Forwards the tracking id and the service context on every outgoing call.
#[derive(Clone)]
pub struct CouplingInterceptor {
    service_context: Arc<ServiceContext>,
    tracker: Option<Arc<dyn Tracker>>,
    header: MetadataKey<Ascii>,
}

impl CouplingInterceptor {
    pub fn new(
        service_context: Arc<ServiceContext>,
        tracker: Option<Arc<dyn Tracker>>,
        header_name: &str,
    ) -> anyhow::Result<Self> {
        let header = MetadataKey::from_bytes(header_name.to_ascii_lowercase().as_bytes())
            .context("invalid tracker header name")?;
        Ok(Self {
            service_context,
            tracker,
            header,
        })
    }
}

impl Interceptor for CouplingInterceptor {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        if let Some(tracker) = &self.tracker {
            let ctx = Context::current();
            let id = tracker
                .retrieve(&ctx)
                .unwrap_or_else(|| tracker.generate());
            if let Ok(value) = MetadataValue::try_from(id.as_str()) {
                req.metadata_mut().insert(self.header.clone(), value);
            }
        }
        self.service_context.append_to(req.metadata_mut());
        Ok(req)
    }
}

type BindAny = Box<dyn FnOnce(Box<dyn Any + Send + Sync>) -> bool + Send>;
type BindApi = Box<dyn FnOnce(&FeatureSet) -> bool + Send>;

struct ClientBinding {
    field: String,
    client: String,
    optional: bool,
    bind: BindAny,
}

struct FeatureBinding {
    field: String,
    bind: BindApi,
}

struct RequiredField {
    field: String,
    is_set: Box<dyn Fn() -> bool + Send + Sync>,
}

/// What a handler needs from the runtime.
#[derive(Default)]
pub struct Declarations {
    clients: Vec<ClientBinding>,
    features: Vec<FeatureBinding>,
    required: Vec<RequiredField>,
}

impl fmt::Debug for Declarations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declarations")
            .field(
                "clients",
                &self.clients.iter().map(|c| &c.client).collect::<Vec<_>>(),
            )
            .field(
                "features",
                &self.features.iter().map(|b| &b.field).collect::<Vec<_>>(),
            )
            .field(
                "required",
                &self.required.iter().map(|r| &r.field).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// A required gRPC client, coupled under `client` and stored in `slot`.
    /// The field is also required to be set once coupling is done.
    pub fn client<C: Any + Send + Sync>(&mut self, field: &str, client: &str, slot: &Slot<C>) {
        self.push_client(field, client, slot, false);
        self.required(field, slot);
    }

    /// A client coupled only when present in the client map.
    pub fn optional_client<C: Any + Send + Sync>(
        &mut self,
        field: &str,
        client: &str,
        slot: &Slot<C>,
    ) {
        self.push_client(field, client, slot, true);
    }

    /// The public API of the first registered feature exposing an `A`.
    pub fn feature<A: Any + Send + Sync>(&mut self, field: &str, slot: &Slot<Arc<A>>) {
        let target = slot.clone();
        self.features.push(FeatureBinding {
            field: field.to_string(),
            bind: Box::new(move |features: &FeatureSet| match public_api::<A>(features) {
                Some(api) => {
                    let _ = target.set(api);
                    true
                }
                None => false,
            }),
        });
    }

    /// A field that must hold a value once startup completes.
    pub fn required<T: Send + Sync + 'static>(&mut self, field: &str, slot: &Slot<T>) {
        let slot = slot.clone();
        self.required.push(RequiredField {
            field: field.to_string(),
            is_set: Box::new(move || slot.is_set()),
        });
    }

    fn push_client<C: Any + Send + Sync>(
        &mut self,
        field: &str,
        client: &str,
        slot: &Slot<C>,
        optional: bool,
    ) {
        let target = slot.clone();
        self.clients.push(ClientBinding {
            field: field.to_string(),
            client: client.to_string(),
            optional,
            bind: Box::new(move |value: Box<dyn Any + Send + Sync>| {
                match value.downcast::<C>() {
                    Ok(c) => {
                        let _ = target.set(*c);
                        true
                    }
                    Err(_) => false,
                }
            }),
        });
    }

    /// Names of every client declared by the handler.
    pub fn client_names(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(|c| c.client.as_str())
    }

    /// Names of the clients that are not optional.
    pub fn required_client_names(&self) -> impl Iterator<Item = &str> {
        self.clients
            .iter()
            .filter(|c| !c.optional)
            .map(|c| c.client.as_str())
    }
}

/// First registered feature whose public API is an `A`.
pub(crate) fn public_api<A: Any + Send + Sync>(features: &FeatureSet) -> Option<Arc<A>> {
    features
        .registered()
        .iter()
        .filter_map(|r| r.public_api())
        .find_map(|api| api.clone().downcast::<A>().ok())
}

/// API of the first registered feature exposing an `A`. Under test
/// deployment a feature's test API replaces its public one.
pub(crate) fn service_api<A: Any + Send + Sync>(
    features: &FeatureSet,
    deploy: DeploymentEnv,
) -> Option<Arc<A>> {
    features.registered().iter().find_map(|r| {
        let api = match r.tester().and_then(|t| t.test_api()) {
            Some(mock) if deploy.is_test() => mock,
            _ => r.public_api()?.clone(),
        };
        api.downcast::<A>().ok()
    })
}

/// Everything coupling needs besides the declarations.
pub struct CouplingOptions<'a> {
    pub clients: &'a HashMap<String, GrpcClient>,
    pub client_definitions: &'a HashMap<String, ClientDefinitions>,
    pub env: &'a RuntimeEnv,
    pub service_context: Arc<ServiceContext>,
    pub tracker: Option<Arc<dyn Tracker>>,
    pub features: &'a FeatureSet,
}

/// Connects every declared client and binds feature APIs.
pub fn couple(decl: &mut Declarations, opts: &CouplingOptions<'_>) -> anyhow::Result<()> {
    let interceptor = CouplingInterceptor::new(
        opts.service_context.clone(),
        opts.tracker.clone(),
        &opts.env.tracker_header_name,
    )?;
    let default = ConnectionOptions {
        host: String::new(),
        namespace: opts.env.coupled_namespace.clone(),
        port: opts.env.coupled_port,
    };

    for binding in std::mem::take(&mut decl.clients) {
        let client = match opts.clients.get(&binding.client) {
            Some(c) => c,
            None if binding.optional => continue,
            None => anyhow::bail!(
                "could not find gRPC client '{}' inside service options",
                binding.client
            ),
        };
        client.validate()?;
        let Some(new_client) = &client.new_client else {
            continue;
        };

        let alternative = opts
            .client_definitions
            .get(client.service_name())
            .map(|c| ConnectionOptions {
                host: c.host.clone(),
                namespace: String::new(),
                port: c.port,
            });
        let address = resolve_address(client.service_name(), &default, alternative.as_ref());
        let channel = Endpoint::from_shared(format!("http://{address}"))
            .with_context(|| format!("invalid address '{address}' for client '{}'", binding.client))?
            .connect_lazy();

        let conn = ClientConnection {
            service: InterceptedService::new(channel, interceptor.clone()),
            address,
        };
        if !(binding.bind)(new_client(conn)) {
            anyhow::bail!(
                "client '{}' does not match the type of field '{}'",
                binding.client,
                binding.field
            );
        }
        tracing::debug!(client = %binding.client, field = %binding.field, "client coupled");
    }

    for binding in std::mem::take(&mut decl.features) {
        if !(binding.bind)(opts.features) {
            anyhow::bail!(
                "could not find feature that supports the API of field '{}'",
                binding.field
            );
        }
    }
    Ok(())
}

/// Fails naming the first required field left empty.
pub fn ensure_initialized(decl: &Declarations, handler: &str) -> anyhow::Result<()> {
    if let Some(missing) = decl.required.iter().find(|r| !(r.is_set)()) {
        anyhow::bail!(
            "could not initiate {handler}, value from field '{}' is missing",
            missing.field
        );
    }
    Ok(())
}

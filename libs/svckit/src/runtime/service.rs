use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use svckit_bootstrap::{init_logging, Definitions, LoggingOptions, RuntimeEnv, ServiceType};
use svckit_errors::Attribute;

use super::handle::ServiceHandle;
use super::shutdown::ShutdownOptions;
use super::state::{LifecycleState, StateCell};
use crate::abort::{AbortError, ExitProcess, FatalSink};
use crate::context::{Context, ServiceContext};
use crate::contracts::names;
use crate::coupling::{self, CouplingOptions, Declarations, GrpcClient};
use crate::errors::ErrorFactory;
use crate::feature::{DependencyOrder, FeatureSet, InitializeOptions, RuntimeFeatures, Tags};
use crate::features::http::HttpFeature;
use crate::handler::ServiceHandler;
use crate::logger::Logger;
use crate::server::{HostObject, ServerOptions, ServerSet, ServiceOptions, ServiceServer};

/// Collects everything a service is made of before it runs.
pub struct ServiceBuilder {
    definitions: Definitions,
    env: Option<RuntimeEnv>,
    service_options: HashMap<ServiceType, Arc<dyn ServerOptions>>,
    clients: HashMap<String, GrpcClient>,
    runtime_features: RuntimeFeatures,
    features: FeatureSet,
    servers: ServerSet,
    fatal: Arc<dyn FatalSink>,
    init_logging: bool,
}

impl ServiceBuilder {
    pub fn new(definitions: Definitions) -> Self {
        let mut features = FeatureSet::new();
        features.register(names::HTTP, Arc::new(HttpFeature::new()), &[]);

        Self {
            definitions,
            env: None,
            service_options: HashMap::new(),
            clients: HashMap::new(),
            runtime_features: RuntimeFeatures::new(),
            features,
            servers: ServerSet::builtin(),
            fatal: Arc::new(ExitProcess),
            init_logging: true,
        }
    }

    /// Loads the definitions file (TOML or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let definitions = Definitions::load(path)
            .with_context(|| format!("could not load '{}'", path.display()))?;
        Ok(Self::new(definitions))
    }

    /// Runtime environment to use instead of the `SVCKIT_*` variables.
    pub fn with_env(mut self, env: RuntimeEnv) -> Self {
        self.env = Some(env);
        self
    }

    /// Options of one transport. The last options given for a type win.
    pub fn with_service(mut self, options: impl ServerOptions) -> Self {
        self.service_options.insert(options.kind(), Arc::new(options));
        self
    }

    pub fn with_grpc_client(mut self, name: impl Into<String>, client: GrpcClient) -> Self {
        self.clients.insert(name.into(), client);
        self
    }

    /// A value every feature can read at initialization.
    pub fn with_runtime_feature<T: std::any::Any + Send + Sync>(
        mut self,
        name: impl Into<String>,
        value: T,
    ) -> Self {
        self.runtime_features.insert(name.into(), Arc::new(value));
        self
    }

    /// Adds external features. Names already registered keep their first
    /// registration.
    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features.append(features);
        self
    }

    /// Adds external transports and makes their types valid in the
    /// definitions.
    pub fn with_servers(mut self, servers: ServerSet) -> Self {
        for t in servers.types() {
            self.definitions.add_supported_service_type(t.clone());
        }
        self.servers.append(servers);
        self
    }

    pub fn with_dependency_order(mut self, order: DependencyOrder) -> Self {
        self.features.set_dependency_order(order);
        self
    }

    pub fn with_fatal_sink(mut self, sink: Arc<dyn FatalSink>) -> Self {
        self.fatal = sink;
        self
    }

    /// Whether `build` installs the process-wide log subscriber.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.init_logging = enabled;
        self
    }

    pub fn build(self) -> anyhow::Result<Service> {
        let mut env = match self.env {
            Some(env) => env,
            None => RuntimeEnv::load()?,
        };
        env.load_defined(&self.definitions.name, &self.definitions.envs)?;

        if self.init_logging {
            init_logging(&LoggingOptions::from_definitions(
                &self.definitions.log,
                env.service_deploy,
            ));
        }

        let logger = Logger::new();
        logger.set_error_stacktrace(self.definitions.log.error_stacktrace);
        let hide_details = self.definitions.is_service_type(&ServiceType::HTTP)
            && self.definitions.http.hide_error_details;
        let errors = ErrorFactory::new(self.definitions.name.clone(), hide_details, logger.clone());
        let service_context = ServiceContext::new(&self.definitions.name);

        Ok(Service {
            definitions: self.definitions,
            env,
            service_options: self.service_options,
            clients: self.clients,
            runtime_features: Arc::new(self.runtime_features),
            features: self.features,
            servers: self.servers,
            fatal: self.fatal,
            logger,
            errors,
            service_context: Arc::new(service_context),
            state: StateCell::new(),
            cancel: CancellationToken::new(),
        })
    }
}

/// A service ready to run.
pub struct Service {
    definitions: Definitions,
    env: RuntimeEnv,
    service_options: HashMap<ServiceType, Arc<dyn ServerOptions>>,
    clients: HashMap<String, GrpcClient>,
    runtime_features: Arc<RuntimeFeatures>,
    features: FeatureSet,
    servers: ServerSet,
    fatal: Arc<dyn FatalSink>,
    logger: Logger,
    errors: ErrorFactory,
    service_context: Arc<ServiceContext>,
    state: StateCell,
    /// Parent of every server token.
    cancel: CancellationToken,
}

/// Startup results the run phase works with.
struct Started {
    ctx: Context,
    definitions: Arc<Definitions>,
    features: Arc<FeatureSet>,
    servers: Vec<Arc<dyn ServiceServer>>,
    host: HostObject,
}

impl Service {
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn errors(&self) -> &ErrorFactory {
        &self.errors
    }

    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.state.current()
    }

    /// Runs until SIGINT or SIGTERM. Any fatal error goes to the fatal sink.
    pub async fn start<H: ServiceHandler>(self, handler: Arc<H>) {
        let fatal = self.fatal.clone();
        let logger = self.logger.clone();
        if let Err(err) = self.run(handler, ShutdownOptions::Signals).await {
            fatal.fatal(&logger, &err);
        }
    }

    /// Starts the service, runs its servers until `shutdown` fires or one of
    /// them fails, then stops everything.
    ///
    /// Under test deployment it returns once startup completes, without
    /// running the servers.
    pub async fn run<H: ServiceHandler>(
        mut self,
        handler: Arc<H>,
        shutdown: ShutdownOptions,
    ) -> Result<(), AbortError> {
        let span = tracing::info_span!(
            "service",
            "service.name" = %self.definitions.name,
            "service.type" = %self.definitions.service_types_as_string(),
            "service.version" = %self.definitions.version,
            "service.env" = %self.env.service_deploy,
            "service.product" = %self.definitions.product,
        );

        async move {
            let started = self.startup(handler.clone()).await?;
            if self.env.service_deploy.is_test() {
                return Ok(());
            }
            self.serve(started, handler, shutdown).await
        }
        .instrument(span)
        .await
    }

    async fn startup<H: ServiceHandler>(&mut self, handler: Arc<H>) -> Result<Started, AbortError> {
        let ctx = Context::new();
        let host: HostObject = handler.clone();
        self.logger.info(&ctx, "starting service", &[]);

        self.validate_definitions()
            .map_err(|e| AbortError::new("service definitions error", e))?;
        self.state.advance(LifecycleState::DefinitionsValidated);

        let definitions = Arc::new(self.definitions.clone());
        let env = Arc::new(self.env.clone());
        let features = Arc::new(std::mem::take(&mut self.features));

        self.logger.info(&ctx, "starting dependent services", &[]);
        self.start_features(&ctx, &features, &definitions, &env, host.clone())
            .await
            .map_err(|e| AbortError::new("could not initialize features", e))?;
        self.state.advance(LifecycleState::FeaturesStarted);

        let tracker = features.tracker();
        if let Some(extractor) = features.log_extractor() {
            self.logger.set_context_extractor(extractor);
        }

        let handle = ServiceHandle::new(
            self.logger.clone(),
            self.errors.clone(),
            definitions.clone(),
            env.clone(),
            features.clone(),
            self.fatal.clone(),
        );
        if handler.service_slot().set(handle).is_err() {
            return Err(AbortError::new(
                "invalid service server object",
                anyhow::anyhow!("the service handle is already bound"),
            ));
        }
        let mut decl = Declarations::new();
        handler.declare(&mut decl);
        if !env.service_deploy.is_test() {
            self.check_clients(&decl)
                .map_err(|e| AbortError::new("could not establish connection with clients", e))?;
        }
        self.state.advance(LifecycleState::HandlerBound);

        let servers = self
            .initialize_servers(&ctx, &definitions, &env, &features, host.clone())
            .await
            .map_err(|e| AbortError::new("could not initialize internal services", e))?;
        self.state.advance(LifecycleState::ServersInitialized);

        if !env.service_deploy.is_test() {
            handler
                .on_start(&ctx)
                .await
                .map_err(|e| AbortError::new("failed while running lifecycle on_start", e))?;

            coupling::couple(
                &mut decl,
                &CouplingOptions {
                    clients: &self.clients,
                    client_definitions: &definitions.clients,
                    env: &env,
                    service_context: self.service_context.clone(),
                    tracker,
                    features: &features,
                },
            )
            .map_err(|e| AbortError::new("could not establish connection with clients", e))?;

            coupling::ensure_initialized(&decl, std::any::type_name::<H>()).map_err(|e| {
                AbortError::new("service server object is not properly initialized", e)
            })?;
        }

        let fields: Vec<Attribute> = features.iter().flat_map(|f| f.fields()).collect();
        self.logger.info(&ctx, "service resources", &fields);

        Ok(Started {
            ctx,
            definitions,
            features,
            servers,
            host,
        })
    }

    /// Merges the settings of every feature and server into the definitions
    /// and validates the result.
    fn validate_definitions(&mut self) -> anyhow::Result<()> {
        let mut feature_defs = Vec::new();
        for registered in self.features.registered() {
            if let Some(loader) = registered.settings() {
                if let Some(defs) = loader.load_definitions(&self.definitions)? {
                    feature_defs.push((registered.name().to_string(), defs));
                }
            }
        }
        for (name, defs) in feature_defs {
            self.definitions.add_external_feature_definitions(name, defs);
        }

        let mut service_defs = Vec::new();
        for server in self.servers.servers() {
            if let Some(loader) = server.settings() {
                if let Some(defs) = loader.load_definitions(&self.definitions)? {
                    service_defs.push((server.name().to_string(), defs));
                }
            }
        }
        for (name, defs) in service_defs {
            self.definitions.add_external_service_definitions(name, defs);
        }

        self.definitions.validate_all()?;
        Ok(())
    }

    async fn start_features(
        &self,
        ctx: &Context,
        features: &FeatureSet,
        definitions: &Arc<Definitions>,
        env: &Arc<RuntimeEnv>,
        host: HostObject,
    ) -> anyhow::Result<()> {
        let opts = InitializeOptions {
            logger: self.logger.clone(),
            errors: self.errors.clone(),
            definitions: definitions.clone(),
            tags: Arc::new(self.tags()),
            service_context: self.service_context.clone(),
            dependencies: HashMap::new(),
            runtime_features: self.runtime_features.clone(),
            env: env.clone(),
        };
        features.initialize_all(ctx, &opts).await?;
        features.start_all(ctx, host).await?;
        Ok(())
    }

    /// Every required client the handler declares must be known.
    fn check_clients(&self, decl: &Declarations) -> anyhow::Result<()> {
        for name in decl.required_client_names() {
            if !self.clients.contains_key(name) {
                anyhow::bail!("could not find gRPC client '{name}' inside service options");
            }
        }
        Ok(())
    }

    async fn initialize_servers(
        &self,
        ctx: &Context,
        definitions: &Arc<Definitions>,
        env: &Arc<RuntimeEnv>,
        features: &Arc<FeatureSet>,
        host: HostObject,
    ) -> anyhow::Result<Vec<Arc<dyn ServiceServer>>> {
        let tags = Arc::new(self.tags());
        let mut initialized = Vec::new();

        for (service_type, port) in definitions.service_types() {
            let server = self.servers.get(&service_type).with_context(|| {
                format!("could not find service implementation for '{service_type}'")
            })?;
            let options = self.service_options.get(&service_type).with_context(|| {
                format!("could not find service type '{service_type}' options in initialization")
            })?;

            let port = port.unwrap_or_else(|| default_port(&service_type, env));
            server
                .initialize(
                    ctx,
                    ServiceOptions {
                        port,
                        service_type: service_type.clone(),
                        name: definitions.name.clone(),
                        product: definitions.product.clone(),
                        logger: self.logger.clone(),
                        errors: self.errors.clone(),
                        service_context: self.service_context.clone(),
                        tags: tags.clone(),
                        service: options.clone(),
                        definitions: definitions.clone(),
                        features: features.clone(),
                        host: host.clone(),
                        env: env.clone(),
                        cancel: self.cancel.child_token(),
                    },
                )
                .await
                .with_context(|| format!("{service_type} server initialization failed"))?;

            initialized.push(server);
        }

        Ok(initialized)
    }

    async fn serve<H: ServiceHandler>(
        &self,
        started: Started,
        handler: Arc<H>,
        shutdown: ShutdownOptions,
    ) -> Result<(), AbortError> {
        let Started {
            ctx,
            definitions,
            features,
            servers,
            host,
        } = started;
        let one_shot = definitions.service_types().len() == 1
            && definitions.is_service_type(&ServiceType::SCRIPT);
        let trigger = (!one_shot).then(|| shutdown.arm());
        self.state.advance(LifecycleState::Running);

        let mut workers = Vec::new();
        let failure = match trigger {
            None => match servers.first() {
                Some(server) => {
                    self.logger.info(&ctx, "service is running", &server.info());
                    server.run(&ctx, host).await.err()
                }
                None => None,
            },
            Some(trigger) => {
                let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(servers.len().max(1));

                for server in &servers {
                    let server = server.clone();
                    let host = host.clone();
                    let ctx = ctx.clone();
                    let logger = self.logger.clone();
                    let err_tx = err_tx.clone();
                    workers.push(tokio::spawn(
                        async move {
                            logger.info(&ctx, "service is running", &server.info());
                            if let Err(e) = server.run(&ctx, host).await {
                                let _ = err_tx.send(e).await;
                            }
                        }
                        .in_current_span(),
                    ));
                }
                drop(err_tx);

                tokio::select! {
                    Some(err) = err_rx.recv() => Some(err),
                    _ = trigger.cancelled() => None,
                }
            }
        };

        self.stop(&ctx, &features, &servers, handler.as_ref()).await;
        for worker in workers {
            let _ = worker.await;
        }

        match failure {
            Some(err) => Err(AbortError::new("fatal error", err)),
            None => Ok(()),
        }
    }

    /// Cleans features up, then stops every initialized server in order.
    /// Failures are logged and never interrupt the sequence.
    async fn stop<H: ServiceHandler>(
        &self,
        ctx: &Context,
        features: &FeatureSet,
        servers: &[Arc<dyn ServiceServer>],
        handler: &H,
    ) {
        self.state.advance(LifecycleState::Stopping);
        self.logger.info(ctx, "stopping service", &[]);

        self.logger.info(ctx, "stopping dependent services", &[]);
        if let Err(e) = features.cleanup_all(ctx).await {
            self.logger.error(
                ctx,
                "could not stop other running services",
                &[Attribute::string("error.message", format!("{e:#}"))],
            );
        }

        for server in servers {
            if let Err(e) = server.stop(ctx).await {
                let mut attrs = vec![Attribute::string("error.message", format!("{e:#}"))];
                attrs.extend(server.info());
                self.logger.error(ctx, "could not stop service server", &attrs);
            }
        }
        self.cancel.cancel();

        if !self.env.service_deploy.is_test() {
            handler.on_finish(ctx).await;
        }

        self.logger.info(ctx, "service stopped", &[]);
        self.state.advance(LifecycleState::Stopped);
    }

    fn tags(&self) -> Tags {
        let mut service_type = self.definitions.service_types_as_string();
        if service_type.contains(',') {
            service_type = "hybrid".to_string();
        }
        Tags::from([
            ("service.name".to_string(), self.definitions.name.clone()),
            ("service.type".to_string(), service_type),
            ("service.version".to_string(), self.definitions.version.clone()),
            ("service.product".to_string(), self.definitions.product.clone()),
        ])
    }
}

fn default_port(service_type: &ServiceType, env: &RuntimeEnv) -> u16 {
    if *service_type == ServiceType::GRPC {
        env.grpc_port
    } else if *service_type == ServiceType::HTTP {
        env.http_port
    } else {
        0
    }
}

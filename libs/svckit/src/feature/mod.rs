//! Features: named, optional capabilities plugged into a service.
//!
//! A feature implements [`Feature`] and may additionally fulfill any of the
//! optional roles ([`Controller`], [`SettingsLoader`], [`FeatureTester`],
//! framework or public API). Roles are resolved once, when the feature is
//! registered into a [`FeatureSet`].

mod set;

pub use set::{DependencyOrder, FeatureSet, FeatureSetError, FeatureSetIter, RegisteredFeature};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use svckit_bootstrap::{Definitions, DeploymentEnv, ExternalDefinitions, RuntimeEnv};
use svckit_errors::Attribute;

use crate::context::{Context, ServiceContext};
use crate::contracts::FrameworkApi;
use crate::errors::ErrorFactory;
use crate::logger::Logger;
use crate::server::HostObject;
use crate::testing::TestOptions;

/// Service tags (`service.name`, `service.type`, ...).
pub type Tags = HashMap<String, String>;

/// Values supplied by the application when building the service, readable
/// by every feature at initialization.
pub type RuntimeFeatures = HashMap<String, Arc<dyn Any + Send + Sync>>;

#[async_trait]
pub trait Feature: Send + Sync + 'static {
    fn entry(&self) -> &FeatureEntry;

    /// Whether the feature may be used by the current service.
    fn can_be_initialized(&self, opts: &CanBeInitializedOptions<'_>) -> bool;

    async fn initialize(&self, ctx: &Context, opts: InitializeOptions) -> anyhow::Result<()>;

    /// Informative fields logged once the service is up.
    fn fields(&self) -> Vec<Attribute> {
        Vec::new()
    }

    fn controller(self: Arc<Self>) -> Option<Arc<dyn Controller>> {
        None
    }

    fn settings(self: Arc<Self>) -> Option<Arc<dyn SettingsLoader>> {
        None
    }

    fn tester(self: Arc<Self>) -> Option<Arc<dyn FeatureTester>> {
        None
    }

    fn framework_api(self: Arc<Self>) -> Option<FrameworkApi> {
        None
    }

    /// API exposed to service handlers.
    fn public_api(self: Arc<Self>) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

/// Start/cleanup hooks. Called on every feature that implements them, in no
/// particular order, so a controller should check
/// [`FeatureEntry::is_enabled`] itself.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn start(&self, ctx: &Context, host: HostObject) -> anyhow::Result<()>;
    async fn cleanup(&self, ctx: &Context) -> anyhow::Result<()>;
}

/// Loads the feature's own settings so they are validated together with the
/// service definitions.
pub trait SettingsLoader: Send + Sync {
    fn load_definitions(
        &self,
        defs: &Definitions,
    ) -> anyhow::Result<Option<Arc<dyn ExternalDefinitions>>>;
}

#[async_trait]
pub trait FeatureTester: Send + Sync {
    /// Handed to service handlers instead of the public API when the
    /// deployment is `test`, usually a mock.
    fn test_api(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    async fn setup(&self, ctx: &Context, opts: &TestOptions);
    async fn teardown(&self, ctx: &Context, opts: &TestOptions);
    async fn do_test(
        &self,
        ctx: &Context,
        opts: &TestOptions,
        service_name: &str,
    ) -> anyhow::Result<()>;
}

pub struct CanBeInitializedOptions<'a> {
    pub deployment_env: DeploymentEnv,
    pub definitions: &'a Definitions,
}

#[derive(Clone)]
pub struct InitializeOptions {
    pub logger: Logger,
    pub errors: ErrorFactory,
    pub definitions: Arc<Definitions>,
    pub tags: Arc<Tags>,
    pub service_context: Arc<ServiceContext>,
    /// Declared dependencies visible to the feature, by name.
    pub dependencies: HashMap<String, Arc<dyn Feature>>,
    pub runtime_features: Arc<RuntimeFeatures>,
    pub env: Arc<RuntimeEnv>,
}

#[derive(Default)]
struct EntryInfo {
    name: String,
    enabled: bool,
    logger: Option<Logger>,
    errors: Option<ErrorFactory>,
}

/// Runtime-maintained state every feature embeds.
#[derive(Default)]
pub struct FeatureEntry {
    info: RwLock<EntryInfo>,
}

impl std::fmt::Debug for FeatureEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info.read();
        f.debug_struct("FeatureEntry")
            .field("name", &info.name)
            .field("enabled", &info.enabled)
            .finish()
    }
}

impl FeatureEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_name(&self, name: &str) {
        self.info.write().name = name.to_string();
    }

    pub(crate) fn update_info(&self, enabled: bool, logger: Logger, errors: ErrorFactory) {
        let mut info = self.info.write();
        info.enabled = enabled;
        info.logger = Some(logger);
        info.errors = Some(errors);
    }

    pub fn is_enabled(&self) -> bool {
        self.info.read().enabled
    }

    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    pub fn logger(&self) -> Logger {
        self.info.read().logger.clone().unwrap_or_default()
    }

    pub fn errors(&self) -> ErrorFactory {
        let info = self.info.read();
        match &info.errors {
            Some(errors) => errors.clone(),
            None => ErrorFactory::new(info.name.clone(), false, Logger::default()),
        }
    }

    /// Plain error prefixed with the feature name.
    pub fn error(&self, msg: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("{}: {msg}", self.name())
    }

    /// Classified `Internal` error for a failing public feature API.
    pub fn wrap_error(&self, ctx: &Context, err: impl std::fmt::Display) -> svckit_errors::Error {
        self.errors()
            .internal(err)
            .with_attributes([Attribute::string("feature.name", self.name())])
            .submit(ctx)
    }
}

/// Optional roles a registered feature fulfills.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Roles(u8);

impl Roles {
    pub const CONTROLLER: Roles = Roles(1);
    pub const SETTINGS: Roles = Roles(1 << 1);
    pub const TESTER: Roles = Roles(1 << 2);
    pub const FRAMEWORK_API: Roles = Roles(1 << 3);
    pub const PUBLIC_API: Roles = Roles(1 << 4);

    pub fn contains(self, other: Roles) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Roles) {
        self.0 |= other.0;
    }
}

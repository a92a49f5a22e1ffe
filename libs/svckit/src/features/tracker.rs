//! Request tracking ids.
//!
//! Enabled through the service definitions:
//!
//! ```toml
//! [features.tracker]
//! enabled = true
//! prefix = "greeter"   # optional
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::any::Any;
use std::sync::Arc;

use svckit_bootstrap::{Definitions, ExternalDefinitions};
use svckit_errors::Attribute;

use crate::context::{Context, TrackerId};
use crate::contracts::{names, FrameworkApi, Tracker};
use crate::feature::{
    CanBeInitializedOptions, Feature, FeatureEntry, FeatureSet, InitializeOptions, SettingsLoader,
};
use crate::logger::LogContextExtractor;

/// Key of the settings block under `features`.
pub const SETTINGS_KEY: &str = "tracker";

/// Both tracking features, ready to append to a service.
pub fn features() -> FeatureSet {
    let mut set = FeatureSet::new();
    set.register(names::TRACKER, Arc::new(RequestTracker::new()), &[]);
    set.register(
        names::LOGGER_EXTRACTOR,
        Arc::new(TrackerLogFields::default()),
        &[names::TRACKER],
    );
    set
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackerDefinitions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub prefix: Option<String>,
}

impl ExternalDefinitions for TrackerDefinitions {
    fn validate(&self) -> anyhow::Result<()> {
        if let Some(prefix) = &self.prefix {
            anyhow::ensure!(
                !prefix.is_empty()
                    && prefix.len() <= 32
                    && prefix
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
                "tracker prefix '{prefix}' must be 1-32 ascii alphanumeric characters"
            );
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Generates UUID v4 tracking ids, optionally prefixed.
#[derive(Debug, Default)]
pub struct RequestTracker {
    entry: FeatureEntry,
    always: bool,
    prefix: RwLock<Option<String>>,
}

impl RequestTracker {
    /// Enabled by `features.tracker.enabled`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enabled regardless of the definitions.
    pub fn always_enabled() -> Self {
        Self {
            always: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Feature for RequestTracker {
    fn entry(&self) -> &FeatureEntry {
        &self.entry
    }

    fn can_be_initialized(&self, opts: &CanBeInitializedOptions<'_>) -> bool {
        self.always || opts.definitions.is_feature_enabled(SETTINGS_KEY)
    }

    async fn initialize(&self, _ctx: &Context, opts: InitializeOptions) -> anyhow::Result<()> {
        let defs = opts
            .definitions
            .feature_settings::<TrackerDefinitions>(SETTINGS_KEY)?
            .unwrap_or_default();
        *self.prefix.write() = defs.prefix;
        Ok(())
    }

    fn fields(&self) -> Vec<Attribute> {
        match self.prefix.read().as_deref() {
            Some(prefix) => vec![Attribute::string("tracker.prefix", prefix)],
            None => Vec::new(),
        }
    }

    fn settings(self: Arc<Self>) -> Option<Arc<dyn SettingsLoader>> {
        Some(self)
    }

    fn framework_api(self: Arc<Self>) -> Option<FrameworkApi> {
        Some(FrameworkApi::Tracker(self))
    }
}

impl SettingsLoader for RequestTracker {
    fn load_definitions(
        &self,
        defs: &Definitions,
    ) -> anyhow::Result<Option<Arc<dyn ExternalDefinitions>>> {
        let loaded = defs.feature_settings::<TrackerDefinitions>(SETTINGS_KEY)?;
        Ok(loaded.map(|d| Arc::new(d) as Arc<dyn ExternalDefinitions>))
    }
}

impl Tracker for RequestTracker {
    fn generate(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        match self.prefix.read().as_deref() {
            Some(prefix) => format!("{prefix}-{id}"),
            None => id,
        }
    }

    fn add(&self, ctx: &mut Context, id: String) {
        ctx.insert(TrackerId(id));
    }

    fn retrieve(&self, ctx: &Context) -> Option<String> {
        ctx.tracker_id().map(str::to_string)
    }
}

/// Adds `request.id` to every log record emitted while serving a request.
#[derive(Debug, Default)]
pub struct TrackerLogFields {
    entry: FeatureEntry,
}

#[async_trait]
impl Feature for TrackerLogFields {
    fn entry(&self) -> &FeatureEntry {
        &self.entry
    }

    fn can_be_initialized(&self, _opts: &CanBeInitializedOptions<'_>) -> bool {
        true
    }

    async fn initialize(&self, _ctx: &Context, opts: InitializeOptions) -> anyhow::Result<()> {
        if !opts.dependencies.contains_key(names::TRACKER) {
            opts.logger.debug(
                &Context::new(),
                "request ids are not logged without a registered tracker",
                &[],
            );
        }
        Ok(())
    }

    fn framework_api(self: Arc<Self>) -> Option<FrameworkApi> {
        Some(FrameworkApi::LogExtractor(self))
    }
}

impl LogContextExtractor for TrackerLogFields {
    fn extract(&self, ctx: &Context) -> Vec<Attribute> {
        ctx.tracker_id()
            .map(|id| vec![Attribute::string("request.id", id)])
            .unwrap_or_default()
    }
}

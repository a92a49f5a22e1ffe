use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use svckit_bootstrap::ServiceType;
use svckit_errors::Attribute;

use crate::context::Context;
use crate::feature::{CanBeInitializedOptions, Feature, FeatureEntry, InitializeOptions};

/// Internal feature describing the HTTP transport of the service. Enabled
/// only when the service declares an `http` type.
#[derive(Debug, Default)]
pub struct HttpFeature {
    entry: FeatureEntry,
    authenticated: AtomicBool,
}

/// Read-only view handed to service handlers.
#[derive(Debug, Clone)]
pub struct HttpFeatureApi {
    feature: Arc<HttpFeature>,
}

impl HttpFeatureApi {
    /// Whether requests go through the auth capability, when one exists.
    pub fn is_authenticated(&self) -> bool {
        self.feature.entry.is_enabled() && self.feature.authenticated.load(Ordering::Relaxed)
    }
}

impl HttpFeature {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Feature for HttpFeature {
    fn entry(&self) -> &FeatureEntry {
        &self.entry
    }

    fn can_be_initialized(&self, opts: &CanBeInitializedOptions<'_>) -> bool {
        opts.definitions.is_service_type(&ServiceType::HTTP)
    }

    async fn initialize(&self, _ctx: &Context, opts: InitializeOptions) -> anyhow::Result<()> {
        self.authenticated
            .store(!opts.definitions.http.disable_auth, Ordering::Relaxed);
        Ok(())
    }

    fn fields(&self) -> Vec<Attribute> {
        vec![Attribute::string(
            "svc.http.auth",
            self.authenticated.load(Ordering::Relaxed).to_string(),
        )]
    }

    fn public_api(self: Arc<Self>) -> Option<Arc<dyn Any + Send + Sync>> {
        Some(Arc::new(HttpFeatureApi { feature: self }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::names;
    use crate::feature::FeatureSet;
    use crate::testing::initialized;
    use svckit_bootstrap::Definitions;

    #[test]
    fn enabled_only_with_http_transport() {
        let feature = HttpFeature::new();
        let mut defs = Definitions::default();
        defs.types.push("grpc".into());
        let allow = |defs: &Definitions| {
            feature.can_be_initialized(&CanBeInitializedOptions {
                deployment_env: Default::default(),
                definitions: defs,
            })
        };
        assert!(!allow(&defs));
        defs.types.push("http:8081".into());
        assert!(allow(&defs));
    }

    #[tokio::test]
    async fn disabled_feature_reports_unauthenticated() {
        let feature = Arc::new(HttpFeature::new());
        let mut set = FeatureSet::new();
        set.register(names::HTTP, feature.clone(), &[]);
        let set = initialized(set).await;

        assert!(!feature.entry().is_enabled());
        let api = set.registered()[0]
            .public_api()
            .and_then(|api| api.clone().downcast::<HttpFeatureApi>().ok())
            .unwrap();
        assert!(!api.is_authenticated());
        assert_eq!(feature.fields()[0].key, "svc.http.auth");
    }
}

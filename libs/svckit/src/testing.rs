//! Feature-aware unit testing for services.
//!
//! Under test deployment a service hands out a [`ServiceTesting`] that drives
//! the [`FeatureTester`](crate::feature::FeatureTester) role of every
//! registered feature. Outside of test deployment it does nothing.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;
use crate::feature::FeatureSet;

/// Values a test passes to the features it exercises, by feature name.
#[derive(Clone, Default)]
pub struct TestOptions {
    feature_options: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for TestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.feature_options.keys().collect();
        names.sort();
        f.debug_struct("TestOptions")
            .field("feature_options", &names)
            .finish()
    }
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feature_option<T: Any + Send + Sync>(
        mut self,
        feature: impl Into<String>,
        value: T,
    ) -> Self {
        self.feature_options.insert(feature.into(), Arc::new(value));
        self
    }

    pub fn feature_option<T: Any + Send + Sync>(&self, feature: &str) -> Option<&T> {
        self.feature_options.get(feature)?.downcast_ref::<T>()
    }
}

pub struct ServiceTesting {
    features: Option<Arc<FeatureSet>>,
    service_name: String,
    options: TestOptions,
    cicd: bool,
}

impl ServiceTesting {
    /// Runs `setup` on every feature tester, in registration order.
    pub(crate) async fn setup(
        ctx: &Context,
        features: Arc<FeatureSet>,
        service_name: &str,
        options: TestOptions,
        cicd: bool,
    ) -> Self {
        for registered in features.registered() {
            if let Some(tester) = registered.tester() {
                tester.setup(ctx, &options).await;
            }
        }
        Self {
            features: Some(features),
            service_name: service_name.to_string(),
            options,
            cicd,
        }
    }

    /// A handle that runs nothing.
    pub(crate) fn inert() -> Self {
        Self {
            features: None,
            service_name: String::new(),
            options: TestOptions::default(),
            cicd: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.features.is_some()
    }

    pub fn options(&self) -> &TestOptions {
        &self.options
    }

    /// Whether a test needing real external resources should return early.
    /// True when `SVCKIT_CICD_TEST` is set for an active test deployment.
    pub fn skip_in_cicd(&self) -> bool {
        self.is_active() && self.cicd
    }

    pub async fn teardown(&self, ctx: &Context) {
        let Some(features) = &self.features else {
            return;
        };
        for registered in features.registered() {
            if let Some(tester) = registered.tester() {
                tester.teardown(ctx, &self.options).await;
            }
        }
    }

    /// Runs the tests of every feature, stopping at the first failure.
    pub async fn do_tests(&self, ctx: &Context) -> anyhow::Result<()> {
        let Some(features) = &self.features else {
            return Ok(());
        };
        for registered in features.registered() {
            if let Some(tester) = registered.tester() {
                tester
                    .do_test(ctx, &self.options, &self.service_name)
                    .await
                    .map_err(|e| e.context(format!("feature '{}' test failed", registered.name())))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) use helpers::{capture_events, initialized, test_service_options};

#[cfg(test)]
mod helpers {
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
    use tracing_subscriber::Layer;

    use svckit_bootstrap::{Definitions, RuntimeEnv, ServiceType};

    use crate::context::{Context, ServiceContext};
    use crate::errors::ErrorFactory;
    use crate::feature::{FeatureSet, InitializeOptions};
    use crate::logger::Logger;
    use crate::server::{HostObject, ServerOptions, ServiceOptions};

    pub(crate) fn test_service_options(
        service_type: ServiceType,
        service: Arc<dyn ServerOptions>,
        host: HostObject,
    ) -> ServiceOptions {
        let logger = Logger::new();
        ServiceOptions {
            port: 0,
            service_type,
            name: "unit".to_string(),
            product: String::new(),
            errors: ErrorFactory::new("unit", false, logger.clone()),
            logger,
            service_context: Arc::new(ServiceContext::new("unit")),
            tags: Arc::default(),
            service,
            definitions: Arc::new(Definitions::default()),
            features: Arc::new(FeatureSet::new()),
            host,
            env: Arc::new(RuntimeEnv::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// A `tracing` event seen while capturing.
    #[derive(Debug, Clone)]
    pub(crate) struct Captured {
        pub level: tracing::Level,
        pub message: String,
        /// The rendered `attributes` field, parsed back.
        pub attributes: Option<serde_json::Value>,
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<Captured>>>);

    #[derive(Default)]
    struct Fields {
        message: String,
        attributes: Option<String>,
    }

    impl Visit for Fields {
        fn record_str(&mut self, field: &Field, value: &str) {
            match field.name() {
                "message" => self.message = value.to_string(),
                "attributes" => self.attributes = Some(value.to_string()),
                _ => {}
            }
        }

        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.message = format!("{value:?}");
            }
        }
    }

    impl<S: Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
            let mut fields = Fields::default();
            event.record(&mut fields);
            self.0.lock().push(Captured {
                level: *event.metadata().level(),
                message: fields.message,
                attributes: fields
                    .attributes
                    .and_then(|a| serde_json::from_str(&a).ok()),
            });
        }
    }

    /// Every event emitted by `f` on the current thread.
    pub(crate) fn capture_events(f: impl FnOnce()) -> Vec<Captured> {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        tracing::subscriber::with_default(subscriber, f);
        let events = capture.0.lock().clone();
        events
    }

    /// Runs `initialize_all` with empty options.
    pub(crate) async fn initialized(features: FeatureSet) -> Arc<FeatureSet> {
        let logger = Logger::new();
        let opts = InitializeOptions {
            errors: ErrorFactory::new("unit", false, logger.clone()),
            logger,
            definitions: Arc::new(Definitions::default()),
            tags: Arc::default(),
            service_context: Arc::default(),
            dependencies: HashMap::new(),
            runtime_features: Arc::default(),
            env: Arc::new(RuntimeEnv::default()),
        };
        features
            .initialize_all(&Context::new(), &opts)
            .await
            .expect("features initialize");
        Arc::new(features)
    }
}

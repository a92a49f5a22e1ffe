use std::any::Any;
use std::sync::Arc;

use svckit_bootstrap::{Definitions, DeploymentEnv, RuntimeEnv};

use crate::abort::{AbortError, FatalSink};
use crate::context::Context;
use crate::coupling::service_api;
use crate::errors::ErrorFactory;
use crate::feature::FeatureSet;
use crate::logger::Logger;
use crate::testing::{ServiceTesting, TestOptions};

/// The runtime as seen from a service handler.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    logger: Logger,
    errors: ErrorFactory,
    definitions: Arc<Definitions>,
    env: Arc<RuntimeEnv>,
    features: Arc<FeatureSet>,
    fatal: Arc<dyn FatalSink>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service", &self.inner.definitions.name)
            .field("env", &self.inner.env.service_deploy)
            .finish()
    }
}

impl ServiceHandle {
    pub(crate) fn new(
        logger: Logger,
        errors: ErrorFactory,
        definitions: Arc<Definitions>,
        env: Arc<RuntimeEnv>,
        features: Arc<FeatureSet>,
        fatal: Arc<dyn FatalSink>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                logger,
                errors,
                definitions,
                env,
                features,
                fatal,
            }),
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    pub fn errors(&self) -> &ErrorFactory {
        &self.inner.errors
    }

    pub fn service_name(&self) -> &str {
        &self.inner.definitions.name
    }

    pub fn deployment_env(&self) -> DeploymentEnv {
        self.inner.env.service_deploy
    }

    /// Whether the process runs under a CI/CD pipeline (`SVCKIT_CICD_TEST`).
    pub fn is_cicd(&self) -> bool {
        self.inner.env.cicd_test
    }

    pub fn definitions(&self) -> &Definitions {
        &self.inner.definitions
    }

    /// Value of a variable listed under `envs`. Every listed variable was
    /// loaded at startup.
    pub fn env(&self, name: &str) -> Option<&str> {
        self.inner.env.defined(name)
    }

    /// Everything under `[service]` in the definitions.
    pub fn custom_definitions(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.inner.definitions.service
    }

    /// Public API of the first feature exposing an `A`. Under test
    /// deployment, feature testers may substitute their own.
    pub fn feature_api<A: Any + Send + Sync>(
        &self,
        ctx: &Context,
    ) -> Result<Arc<A>, svckit_errors::Error> {
        service_api::<A>(&self.inner.features, self.deployment_env()).ok_or_else(|| {
            self.inner
                .errors
                .internal("could not find feature that supports this requested API")
                .submit(ctx)
        })
    }

    /// Ends the process through the service's fatal sink.
    pub fn abort(&self, message: &str, err: impl Into<anyhow::Error>) {
        let err = AbortError::new(message, err);
        self.inner.fatal.fatal(&self.inner.logger, &err);
    }

    /// Sets up every feature tester. Outside of test deployment the returned
    /// value does nothing.
    pub async fn setup_test(&self, ctx: &Context, options: TestOptions) -> ServiceTesting {
        if !self.deployment_env().is_test() {
            return ServiceTesting::inert();
        }
        ServiceTesting::setup(
            ctx,
            self.inner.features.clone(),
            self.service_name(),
            options,
            self.is_cicd(),
        )
        .await
    }
}

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use svckit::error::{Attribute, Error, Kind};
use svckit::features::http::HttpFeatureApi;
use svckit::server::native::NativeService;
use svckit::{Context, Declarations, ServiceHandle, ServiceHandler, Slot};

const MAX_NAME_LEN: usize = 64;
const DEFAULT_GREETING: &str = "Hello";
const DEFAULT_REPORT_INTERVAL: u64 = 30;

#[derive(Debug, Serialize)]
pub struct Greeting {
    pub message: String,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
}

#[derive(Default)]
pub struct Greeter {
    service: Slot<ServiceHandle>,
    http: Slot<Arc<HttpFeatureApi>>,
    greeted: AtomicU64,
}

impl Greeter {
    fn setting<'a>(&'a self, key: &str) -> Option<&'a serde_json::Value> {
        self.service.get()?.custom_definitions().get(key)
    }

    pub fn greet(&self, ctx: &Context, name: &str) -> Result<Greeting, Error> {
        let Some(svc) = self.service.get() else {
            return Err(Error::new(Kind::Internal).with_message("service is not started"));
        };

        let name = name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(svc
                .errors()
                .invalid_argument(format!("name must have 1 to {MAX_NAME_LEN} characters"))
                .with_attributes([Attribute::string("greet.name", name)])
                .submit(ctx));
        }

        let salutation = self
            .setting("greeting")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_GREETING);
        self.greeted.fetch_add(1, Ordering::Relaxed);

        Ok(Greeting {
            message: format!("{salutation}, {name}!"),
            authenticated: self.http.get().is_some_and(|h| h.is_authenticated()),
            tracking_id: ctx.tracker_id().map(str::to_string),
        })
    }

    pub fn greeted(&self) -> u64 {
        self.greeted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ServiceHandler for Greeter {
    fn service_slot(&self) -> &Slot<ServiceHandle> {
        &self.service
    }

    fn declare(&self, decl: &mut Declarations) {
        decl.feature("http", &self.http);
    }

    async fn on_start(&self, ctx: &Context) -> anyhow::Result<()> {
        if let Some(svc) = self.service.get() {
            svc.logger().info(ctx, "greeter ready", &[]);
        }
        Ok(())
    }
}

/// Reports the number of greetings at a fixed interval.
#[async_trait]
impl NativeService for Greeter {
    async fn run(&self, ctx: &Context, cancel: CancellationToken) -> anyhow::Result<()> {
        let secs = self
            .setting("report_interval_secs")
            .and_then(|v| v.as_u64())
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_REPORT_INTERVAL);
        let mut ticker = tokio::time::interval(Duration::from_secs(secs));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Some(svc) = self.service.get() {
                        svc.logger().info(
                            ctx,
                            "greetings so far",
                            &[Attribute::string("greet.count", self.greeted().to_string())],
                        );
                    }
                }
            }
        }
    }

    async fn stop(&self, ctx: &Context) -> anyhow::Result<()> {
        tracing::debug!(tracking_id = ?ctx.tracker_id(), "reporter stopped");
        Ok(())
    }
}

async fn greet(
    State(greeter): State<Arc<Greeter>>,
    Path(name): Path<String>,
) -> Result<Json<Greeting>, Error> {
    greeter.greet(&Context::current(), &name).map(Json)
}

pub fn routes(greeter: Arc<Greeter>) -> Router {
    Router::new()
        .route("/greet/{name}", get(greet))
        .with_state(greeter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use svckit::{Definitions, DeploymentEnv, RuntimeEnv, ServiceBuilder, ShutdownOptions, TrackerId};
    use svckit::server::http::HttpServiceOptions;
    use svckit::server::native::NativeServiceOptions;

    async fn started() -> Arc<Greeter> {
        let mut defs = Definitions::default();
        defs.name = "greeter".into();
        defs.product = "svckit-samples".into();
        defs.version = "v0.1.0".into();
        defs.types = vec!["http".into(), "native".into()];
        defs.service
            .insert("greeting".into(), serde_json::json!("Hi"));

        let mut env = RuntimeEnv::default();
        env.service_deploy = DeploymentEnv::Test;
        env.http_port = 0;

        let greeter = Arc::new(Greeter::default());
        ServiceBuilder::new(defs)
            .with_env(env)
            .with_logging(false)
            .with_service(HttpServiceOptions::new(routes))
            .with_service(NativeServiceOptions::new::<Greeter>())
            .build()
            .unwrap()
            .run(greeter.clone(), ShutdownOptions::Token(CancellationToken::new()))
            .await
            .unwrap();
        greeter
    }

    #[tokio::test]
    async fn greets_with_configured_salutation() {
        let greeter = started().await;
        let ctx = Context::new().with(TrackerId("req-1".into()));

        let greeting = greeter.greet(&ctx, " Ada ").unwrap();
        assert_eq!(greeting.message, "Hi, Ada!");
        assert_eq!(greeting.tracking_id.as_deref(), Some("req-1"));
        assert!(!greeting.authenticated);
        assert_eq!(greeter.greeted(), 1);
    }

    #[tokio::test]
    async fn rejects_overlong_names() {
        let greeter = started().await;
        let err = greeter
            .greet(&Context::new(), &"x".repeat(MAX_NAME_LEN + 1))
            .unwrap_err();
        assert_eq!(err.kind, Kind::Validation);
        assert_eq!(greeter.greeted(), 0);
    }

    #[test]
    fn unstarted_greeter_fails() {
        let err = Greeter::default().greet(&Context::new(), "Ada").unwrap_err();
        assert_eq!(err.kind, Kind::Internal);
    }
}

use anyhow::Context as _;
use async_trait::async_trait;
use axum::extract::Request;
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;

use svckit_bootstrap::ServiceType;
use svckit_errors::Attribute;

use super::{panic_detail, HostObject, ServerOptions, ServiceOptions, ServiceServer};
use crate::context::Context;
use crate::contracts::{HttpAuth, RequestTracing, Tracker};
use crate::logger::Logger;

type BuildRouter = Box<dyn Fn(HostObject) -> Option<Router> + Send + Sync>;

/// Routes of an HTTP service, built from the service handler.
pub struct HttpServiceOptions {
    router: BuildRouter,
}

impl HttpServiceOptions {
    pub fn new<H, F>(routes: F) -> Self
    where
        H: Any + Send + Sync,
        F: Fn(Arc<H>) -> Router + Send + Sync + 'static,
    {
        Self {
            router: Box::new(move |host: HostObject| host.downcast::<H>().ok().map(&routes)),
        }
    }
}

impl ServerOptions for HttpServiceOptions {
    fn kind(&self) -> ServiceType {
        ServiceType::HTTP
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Prepared {
    listener: TcpListener,
    router: Router,
}

#[derive(Default)]
struct State {
    port: u16,
    cancel: Option<CancellationToken>,
    prepared: Option<Prepared>,
}

#[derive(Default)]
pub struct HttpServer {
    state: Mutex<State>,
}

impl HttpServer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceServer for HttpServer {
    fn name(&self) -> ServiceType {
        ServiceType::HTTP
    }

    fn info(&self) -> Vec<Attribute> {
        let port = self.state.lock().port;
        vec![
            Attribute::string("service.address", format!(":{port}")),
            Attribute::string("service.mode", ServiceType::HTTP.as_str()),
        ]
    }

    async fn initialize(&self, ctx: &Context, opts: ServiceOptions) -> anyhow::Result<()> {
        let svc = opts.service_options::<HttpServiceOptions>()?;
        let routes = (svc.router)(opts.host.clone()).ok_or_else(|| {
            anyhow::anyhow!("server object does not match the HTTP service options")
        })?;
        let router = build_router(ctx, &opts, routes)?;

        let listener = TcpListener::bind(("0.0.0.0", opts.port))
            .await
            .context("could not listen to service port")?;

        let mut state = self.state.lock();
        state.port = opts.port;
        state.cancel = Some(opts.cancel.child_token());
        state.prepared = Some(Prepared { listener, router });
        Ok(())
    }

    async fn run(&self, _ctx: &Context, _host: HostObject) -> anyhow::Result<()> {
        let (prepared, cancel) = {
            let mut state = self.state.lock();
            let prepared = state
                .prepared
                .take()
                .ok_or_else(|| anyhow::anyhow!("HTTP server was not initialized"))?;
            (prepared, state.cancel.clone().unwrap_or_default())
        };

        if let Ok(addr) = prepared.listener.local_addr() {
            tracing::info!("HTTP server bound on {}", addr);
        }

        let shutdown = async move {
            cancel.cancelled().await;
            tracing::debug!("HTTP server shutting down gracefully (cancellation)");
        };

        axum::serve(prepared.listener, prepared.router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server failed")
    }

    async fn stop(&self, _ctx: &Context) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
        // closes the listener when run was never reached
        state.prepared = None;
        Ok(())
    }
}

/// Wraps the service routes with the runtime middleware stack.
///
/// From the inside out: auth (service routes only), panic recovery, request
/// scope (tracking id, `/health`, measurements), CORS.
pub(crate) fn build_router(
    ctx: &Context,
    opts: &ServiceOptions,
    routes: Router,
) -> anyhow::Result<Router> {
    let features = &opts.features;
    let mut router = routes;

    let deploy = opts.env.service_deploy;
    if !deploy.is_test() && !opts.definitions.http.disable_auth {
        if let Some(auth) = features.auth() {
            opts.logger
                .info(ctx, "using authenticated HTTP endpoints", &[]);
            router = router.layer(from_fn(move |req: Request, next: Next| {
                let auth = auth.clone();
                async move { authenticate(auth, req, next).await }
            }));
        }
    }

    if !opts.definitions.http.disable_panic_recovery {
        let recovery = features.panic_recovery();
        let errors = opts.errors.clone();
        router = router.layer(CatchPanicLayer::custom(
            move |payload: Box<dyn Any + Send + 'static>| {
                let detail = panic_detail(payload.as_ref());
                let ctx = Context::current();
                let err = match &recovery {
                    Some(r) => r.recover(&ctx, &detail),
                    None => errors.internal(detail).submit(&ctx),
                };
                err.into_response()
            },
        ));
    }

    let header = HeaderName::from_bytes(opts.env.tracker_header_name.as_bytes())
        .context("invalid tracker header name")?;
    let scope = RequestScope {
        tracker: features.tracker(),
        tracing: features.tracing(),
        header,
        logger: opts.logger.clone(),
    };
    router = router.layer(from_fn(move |req: Request, next: Next| {
        let scope = scope.clone();
        async move { scope.handle(req, next).await }
    }));

    if let Some(cors) = features.cors() {
        router = router.layer(cors.cors());
    }

    Ok(router)
}

async fn authenticate(auth: Arc<dyn HttpAuth>, req: Request, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    if let Err(err) = auth.authenticate(&Context::current(), &parts).await {
        return err.into_response();
    }
    next.run(Request::from_parts(parts, body)).await
}

#[derive(Clone)]
struct RequestScope {
    tracker: Option<Arc<dyn Tracker>>,
    tracing: Option<Arc<dyn RequestTracing>>,
    header: HeaderName,
    logger: Logger,
}

impl RequestScope {
    async fn handle(&self, mut req: Request, next: Next) -> Response {
        let mut ctx = Context::new();
        let tracker_id = self.tracker.as_ref().map(|tracker| {
            let id = tracker.generate();
            tracker.add(&mut ctx, id.clone());
            id
        });

        let mut resp = if req.method() == Method::GET && req.uri().path() == "/health" {
            StatusCode::OK.into_response()
        } else {
            let data = self.tracing.as_ref().and_then(|t| {
                t.start_measurements(&ctx, ServiceType::HTTP.as_str())
                    .inspect_err(|e| {
                        self.logger.error(
                            &ctx,
                            "tracing begin failed",
                            &[Attribute::string("error.message", e.to_string())],
                        )
                    })
                    .ok()
            });

            req.extensions_mut().insert(ctx.clone());
            let resp = ctx.clone().scope(next.run(req)).await;

            if let (Some(t), Some(data)) = (&self.tracing, data) {
                if let Err(e) = t.compute_metrics(&ctx, ServiceType::HTTP.as_str(), data) {
                    self.logger.error(
                        &ctx,
                        "tracing cease failed",
                        &[Attribute::string("error.message", e.to_string())],
                    );
                }
            }
            resp
        };

        if let Some(value) = tracker_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
            resp.headers_mut().insert(self.header.clone(), value);
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureSet;
    use crate::features::tracker::RequestTracker;
    use crate::testing::{initialized, test_service_options};
    use axum::body::{to_bytes, Body};
    use axum::routing::get;
    use tower::ServiceExt;

    struct Api;

    fn routes(_api: Arc<Api>) -> Router {
        Router::new()
            .route("/hello", get(|| async { "hi" }))
            .route("/boom", get(boom))
    }

    async fn boom() -> &'static str {
        panic!("handler exploded")
    }

    async fn router_with(features: FeatureSet) -> Router {
        let mut opts = test_service_options(
            ServiceType::HTTP,
            Arc::new(HttpServiceOptions::new(routes)),
            Arc::new(Api),
        );
        opts.features = initialized(features).await;
        let routes = routes(Arc::new(Api));
        build_router(&Context::new(), &opts, routes).unwrap()
    }

    fn get_req(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_and_tracking_header() {
        let mut features = FeatureSet::new();
        features.register(
            crate::contracts::names::TRACKER,
            Arc::new(RequestTracker::always_enabled()),
            &[],
        );
        let router = router_with(features).await;

        let resp = router.clone().oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));

        let resp = router.oneshot(get_req("/hello")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let id = resp.headers()["x-request-id"].to_str().unwrap().to_string();
        assert_eq!(id.len(), 36);
    }

    #[tokio::test]
    async fn panic_becomes_internal_error() {
        let router = router_with(FeatureSet::new()).await;
        let resp = router.oneshot(get_req("/boom")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["kind"], "InternalError");
        assert_eq!(v["details"], "handler exploded");
    }

    #[tokio::test]
    async fn unknown_route_is_404_without_tracker() {
        let router = router_with(FeatureSet::new()).await;
        let resp = router.oneshot(get_req("/missing")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(!resp.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn stop_without_run_releases_listener() {
        let server = HttpServer::new();
        let mut opts = test_service_options(
            ServiceType::HTTP,
            Arc::new(HttpServiceOptions::new(routes)),
            Arc::new(Api),
        );
        opts.port = 0;
        server.initialize(&Context::new(), opts).await.unwrap();
        server.stop(&Context::new()).await.unwrap();
        assert!(server.run(&Context::new(), Arc::new(Api)).await.is_err());
    }
}

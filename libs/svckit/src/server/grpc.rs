use anyhow::Context as _;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::metadata::MetadataMap;
use tonic::service::{Routes, RoutesBuilder};
use tonic::transport::Server;
use tower::{Layer, Service};

use svckit_bootstrap::ServiceType;
use svckit_errors::Attribute;

use super::{panic_detail, HostObject, ServerOptions, ServiceOptions, ServiceServer};
use crate::context::{Context, ServiceContext};
use crate::contracts::{PanicRecovery, Tracker};
use crate::errors::ErrorFactory;

type Install = Box<dyn Fn(HostObject, &mut RoutesBuilder) -> bool + Send + Sync>;

/// gRPC services exposed by the service handler.
pub struct GrpcServiceOptions {
    install: Install,
}

impl GrpcServiceOptions {
    /// `install` adds the generated tonic services, built from the handler,
    /// to the routes.
    pub fn new<H, F>(install: F) -> Self
    where
        H: Any + Send + Sync,
        F: Fn(Arc<H>, &mut RoutesBuilder) + Send + Sync + 'static,
    {
        Self {
            install: Box::new(move |host: HostObject, routes: &mut RoutesBuilder| {
                match host.downcast::<H>() {
                    Ok(host) => {
                        install(host, routes);
                        true
                    }
                    Err(_) => false,
                }
            }),
        }
    }
}

impl ServerOptions for GrpcServiceOptions {
    fn kind(&self) -> ServiceType {
        ServiceType::GRPC
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Prepared {
    listener: TcpListener,
    routes: Routes,
    scope: RequestScopeLayer,
}

#[derive(Default)]
struct State {
    port: u16,
    cancel: Option<CancellationToken>,
    prepared: Option<Prepared>,
}

#[derive(Default)]
pub struct GrpcServer {
    state: Mutex<State>,
}

impl GrpcServer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceServer for GrpcServer {
    fn name(&self) -> ServiceType {
        ServiceType::GRPC
    }

    fn info(&self) -> Vec<Attribute> {
        let port = self.state.lock().port;
        vec![
            Attribute::string("service.address", format!(":{port}")),
            Attribute::string("service.mode", ServiceType::GRPC.as_str()),
        ]
    }

    async fn initialize(&self, _ctx: &Context, opts: ServiceOptions) -> anyhow::Result<()> {
        let svc = opts.service_options::<GrpcServiceOptions>()?;
        let mut builder = RoutesBuilder::default();
        if !(svc.install)(opts.host.clone(), &mut builder) {
            anyhow::bail!("server object does not match the gRPC service options");
        }
        let scope = RequestScopeLayer::from_options(&opts)?;

        let listener = TcpListener::bind(("0.0.0.0", opts.port))
            .await
            .context("could not listen to service port")?;

        let mut state = self.state.lock();
        state.port = opts.port;
        state.cancel = Some(opts.cancel.child_token());
        state.prepared = Some(Prepared {
            listener,
            routes: builder.routes(),
            scope,
        });
        Ok(())
    }

    async fn run(&self, _ctx: &Context, _host: HostObject) -> anyhow::Result<()> {
        let (prepared, cancel) = {
            let mut state = self.state.lock();
            let prepared = state
                .prepared
                .take()
                .ok_or_else(|| anyhow::anyhow!("gRPC server was not initialized"))?;
            (prepared, state.cancel.clone().unwrap_or_default())
        };

        if let Ok(addr) = prepared.listener.local_addr() {
            tracing::info!("gRPC server bound on {}", addr);
        }

        let incoming = TcpListenerStream::new(prepared.listener);
        let shutdown = async move {
            cancel.cancelled().await;
            tracing::debug!("gRPC server shutting down gracefully (cancellation)");
        };

        Server::builder()
            .layer(prepared.scope)
            .add_routes(prepared.routes)
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await
            .context("gRPC server failed")
    }

    async fn stop(&self, _ctx: &Context) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
        state.prepared = None;
        Ok(())
    }
}

/// Per-call scope: request context from the incoming metadata and, unless
/// disabled, panic recovery into an `Internal` status.
#[derive(Clone)]
pub(crate) struct RequestScopeLayer {
    inner: Arc<ScopeSettings>,
}

struct ScopeSettings {
    header: HeaderName,
    tracker: Option<Arc<dyn Tracker>>,
    recovery: Option<Arc<dyn PanicRecovery>>,
    errors: ErrorFactory,
    recover_panics: bool,
}

impl RequestScopeLayer {
    fn from_options(opts: &ServiceOptions) -> anyhow::Result<Self> {
        let header = HeaderName::from_bytes(opts.env.tracker_header_name.as_bytes())
            .context("invalid tracker header name")?;
        Ok(Self {
            inner: Arc::new(ScopeSettings {
                header,
                tracker: opts.features.tracker(),
                recovery: opts.features.panic_recovery(),
                errors: opts.errors.clone(),
                recover_panics: !opts.definitions.http.disable_panic_recovery,
            }),
        })
    }
}

impl ScopeSettings {
    fn context_for<B>(&self, req: &http::Request<B>) -> Context {
        let mut ctx = Context::new();
        let md = MetadataMap::from_headers(req.headers().clone());
        if let Some(svc_ctx) = ServiceContext::from_metadata(&md) {
            ctx.insert(svc_ctx);
        }

        if let Some(tracker) = &self.tracker {
            let id = req
                .headers()
                .get(&self.header)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| tracker.generate());
            tracker.add(&mut ctx, id);
        }
        ctx
    }

    fn panic_response(
        &self,
        ctx: &Context,
        payload: Box<dyn Any + Send>,
    ) -> http::Response<Body> {
        let detail = panic_detail(payload.as_ref());
        let err = match &self.recovery {
            Some(r) => r.recover(ctx, &detail),
            None => self.errors.internal(detail).submit(ctx),
        };
        let status = tonic::Status::from(err);

        let mut resp = http::Response::new(Body::empty());
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/grpc"),
        );
        if let Err(e) = status.add_header(resp.headers_mut()) {
            tracing::warn!("could not encode recovered status: {}", e);
        }
        resp
    }
}

impl<S> Layer<S> for RequestScopeLayer {
    type Service = RequestScope<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestScope {
            inner,
            settings: self.inner.clone(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct RequestScope<S> {
    inner: S,
    settings: Arc<ScopeSettings>,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for RequestScope<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // the ready service goes with the call; the clone stays for the next one
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let settings = self.settings.clone();

        Box::pin(async move {
            let ctx = settings.context_for(&req);
            if !settings.recover_panics {
                return ctx.scope(inner.call(req)).await;
            }

            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req))) {
                Ok(fut) => {
                    ctx.clone()
                        .scope(AssertUnwindSafe(fut).catch_unwind())
                        .await
                }
                Err(payload) => Err(payload),
            };

            match outcome {
                Ok(res) => res,
                Err(payload) => Ok(settings.panic_response(&ctx, payload)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::names;
    use crate::feature::FeatureSet;
    use crate::features::tracker::RequestTracker;
    use crate::testing::{initialized, test_service_options};
    use std::convert::Infallible;
    use std::future;
    use std::time::Duration;
    use tonic::server::NamedService;
    use tower::ServiceExt;

    #[derive(Clone, Default)]
    struct Greeter;

    impl NamedService for Greeter {
        const NAME: &'static str = "svckit.test.Greeter";
    }

    impl Service<http::Request<Body>> for Greeter {
        type Response = http::Response<Body>;
        type Error = Infallible;
        type Future = future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: http::Request<Body>) -> Self::Future {
            future::ready(Ok(http::Response::new(Body::empty())))
        }
    }

    struct Api;

    fn install(_api: Arc<Api>, routes: &mut RoutesBuilder) {
        routes.add_service(Greeter);
    }

    async fn scope_layer(features: FeatureSet) -> RequestScopeLayer {
        let mut opts = test_service_options(
            ServiceType::GRPC,
            Arc::new(GrpcServiceOptions::new(install)),
            Arc::new(Api),
        );
        opts.features = initialized(features).await;
        RequestScopeLayer::from_options(&opts).unwrap()
    }

    fn request() -> http::Request<Body> {
        http::Request::builder()
            .uri("/svckit.test.Greeter/Hello")
            .header("x-request-id", "call-7")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn handler_panic_becomes_classified_status() {
        let layer = scope_layer(FeatureSet::new()).await;
        let svc = layer.layer(tower::service_fn(|_req: http::Request<Body>| async {
            if true {
                panic!("rpc exploded");
            }
            Ok::<_, Infallible>(http::Response::new(Body::empty()))
        }));

        let resp = svc.oneshot(request()).await.unwrap();
        let code = resp.headers()["grpc-status"].to_str().unwrap().to_string();
        assert_eq!(
            code,
            (svckit_errors::wire::CLASSIFIED_CODE as i32).to_string()
        );
        assert_eq!(resp.headers()["content-type"], "application/grpc");
    }

    #[tokio::test]
    async fn incoming_tracking_id_is_scoped() {
        let mut features = FeatureSet::new();
        features.register(names::TRACKER, Arc::new(RequestTracker::always_enabled()), &[]);
        let layer = scope_layer(features).await;

        let svc = layer.layer(tower::service_fn(|_req: http::Request<Body>| async {
            let id = Context::current().tracker_id().unwrap_or_default().to_string();
            let mut resp = http::Response::new(Body::empty());
            resp.headers_mut()
                .insert("seen-id", HeaderValue::from_str(&id).unwrap());
            Ok::<_, Infallible>(resp)
        }));

        let resp = svc.oneshot(request()).await.unwrap();
        assert_eq!(resp.headers()["seen-id"], "call-7");
    }

    #[tokio::test]
    async fn stop_unblocks_run() {
        let server = Arc::new(GrpcServer::new());
        let mut opts = test_service_options(
            ServiceType::GRPC,
            Arc::new(GrpcServiceOptions::new(install)),
            Arc::new(Api),
        );
        opts.port = 0;
        server.initialize(&Context::new(), opts).await.unwrap();

        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.run(&Context::new(), Arc::new(Api)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.stop(&Context::new()).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("run should return after stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn foreign_host_is_rejected() {
        let server = GrpcServer::new();
        let mut opts = test_service_options(
            ServiceType::GRPC,
            Arc::new(GrpcServiceOptions::new(install)),
            Arc::new(7u32),
        );
        opts.port = 0;
        let err = server.initialize(&Context::new(), opts).await.unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use svckit_bootstrap::ServiceType;
use svckit_errors::Attribute;

use super::{HostObject, ServerOptions, ServiceOptions, ServiceServer};
use crate::context::Context;

/// A one-shot job. The service exits once `run` returns.
#[async_trait]
pub trait ScriptService: Send + Sync + 'static {
    async fn run(&self, ctx: &Context) -> anyhow::Result<()>;
    async fn cleanup(&self, ctx: &Context) -> anyhow::Result<()>;
}

type Bind = fn(HostObject) -> Option<Arc<dyn ScriptService>>;

pub struct ScriptServiceOptions {
    bind: Bind,
}

impl ScriptServiceOptions {
    pub fn new<H: ScriptService>() -> Self {
        Self {
            bind: |host: HostObject| {
                host.downcast::<H>()
                    .ok()
                    .map(|h| h as Arc<dyn ScriptService>)
            },
        }
    }
}

impl ServerOptions for ScriptServiceOptions {
    fn kind(&self) -> ServiceType {
        ServiceType::SCRIPT
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct State {
    cancel: Option<CancellationToken>,
    bind: Option<Bind>,
    svc: Option<Arc<dyn ScriptService>>,
}

#[derive(Default)]
pub struct ScriptServer {
    state: Mutex<State>,
}

impl ScriptServer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceServer for ScriptServer {
    fn name(&self) -> ServiceType {
        ServiceType::SCRIPT
    }

    fn info(&self) -> Vec<Attribute> {
        vec![Attribute::string("service.mode", ServiceType::SCRIPT.as_str())]
    }

    async fn initialize(&self, _ctx: &Context, opts: ServiceOptions) -> anyhow::Result<()> {
        let bind = opts.service_options::<ScriptServiceOptions>()?.bind;
        let mut state = self.state.lock();
        state.cancel = Some(opts.cancel.child_token());
        state.bind = Some(bind);
        Ok(())
    }

    async fn run(&self, ctx: &Context, host: HostObject) -> anyhow::Result<()> {
        let (svc, cancel) = {
            let mut state = self.state.lock();
            let bind = state
                .bind
                .ok_or_else(|| anyhow::anyhow!("script server was not initialized"))?;
            let svc = bind(host).ok_or_else(|| {
                anyhow::anyhow!("server object does not implement the ScriptService trait")
            })?;
            state.svc = Some(svc.clone());
            (svc, state.cancel.clone().unwrap_or_default())
        };

        tokio::select! {
            res = svc.run(ctx) => res,
            _ = cancel.cancelled() => Ok(()),
        }
    }

    async fn stop(&self, ctx: &Context) -> anyhow::Result<()> {
        let svc = {
            let state = self.state.lock();
            if let Some(cancel) = &state.cancel {
                cancel.cancel();
            }
            state.svc.clone()
        };

        match svc {
            Some(svc) => svc.cleanup(ctx).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_service_options;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Job {
        runs: AtomicUsize,
        cleanups: AtomicUsize,
    }

    #[async_trait]
    impl ScriptService for Job {
        async fn run(&self, _ctx: &Context) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cleanup(&self, _ctx: &Context) -> anyhow::Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_once_then_cleans_up() {
        let server = ScriptServer::new();
        let job = Arc::new(Job::default());
        let opts = test_service_options(
            ServiceType::SCRIPT,
            Arc::new(ScriptServiceOptions::new::<Job>()),
            job.clone(),
        );
        let ctx = Context::new();
        server.initialize(&ctx, opts).await.unwrap();
        server.run(&ctx, job.clone()).await.unwrap();
        server.stop(&ctx).await.unwrap();

        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        assert_eq!(job.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_options_fail_initialization() {
        let server = ScriptServer::new();
        let opts = test_service_options(
            ServiceType::SCRIPT,
            Arc::new(crate::server::native::NativeServiceOptions::new::<NoopNative>()),
            Arc::new(()),
        );
        let err = server.initialize(&Context::new(), opts).await.unwrap_err();
        assert!(err.to_string().contains("unsupported options"));
    }

    struct NoopNative;

    #[async_trait]
    impl crate::server::native::NativeService for NoopNative {
        async fn run(&self, _ctx: &Context, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&self, _ctx: &Context) -> anyhow::Result<()> {
            Ok(())
        }
    }
}

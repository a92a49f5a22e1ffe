use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use svckit_bootstrap::ServiceType;
use svckit_errors::Attribute;

use super::{HostObject, ServerOptions, ServiceOptions, ServiceServer};
use crate::context::Context;

/// A long-running worker. `run` may block until `cancel` fires; `stop` is
/// called once on shutdown.
#[async_trait]
pub trait NativeService: Send + Sync + 'static {
    async fn run(&self, ctx: &Context, cancel: CancellationToken) -> anyhow::Result<()>;
    async fn stop(&self, ctx: &Context) -> anyhow::Result<()>;
}

type Bind = fn(HostObject) -> Option<Arc<dyn NativeService>>;

pub struct NativeServiceOptions {
    bind: Bind,
}

impl NativeServiceOptions {
    /// Options for a handler of type `H`.
    pub fn new<H: NativeService>() -> Self {
        Self {
            bind: |host: HostObject| {
                host.downcast::<H>()
                    .ok()
                    .map(|h| h as Arc<dyn NativeService>)
            },
        }
    }
}

impl ServerOptions for NativeServiceOptions {
    fn kind(&self) -> ServiceType {
        ServiceType::NATIVE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct State {
    cancel: Option<CancellationToken>,
    bind: Option<Bind>,
    svc: Option<Arc<dyn NativeService>>,
}

#[derive(Default)]
pub struct NativeServer {
    state: Mutex<State>,
}

impl NativeServer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceServer for NativeServer {
    fn name(&self) -> ServiceType {
        ServiceType::NATIVE
    }

    fn info(&self) -> Vec<Attribute> {
        vec![Attribute::string("service.mode", ServiceType::NATIVE.as_str())]
    }

    async fn initialize(&self, _ctx: &Context, opts: ServiceOptions) -> anyhow::Result<()> {
        let bind = opts.service_options::<NativeServiceOptions>()?.bind;
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
                .ok_or_else(|| anyhow::anyhow!("native server was not initialized"))?;
            let svc = bind(host).ok_or_else(|| {
                anyhow::anyhow!("server object does not implement the NativeService trait")
            })?;
            state.svc = Some(svc.clone());
            (svc, state.cancel.clone().unwrap_or_default())
        };

        svc.run(ctx, cancel).await
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
            Some(svc) => svc.stop(ctx).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_service_options;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Worker {
        stopped: AtomicBool,
    }

    #[async_trait]
    impl NativeService for Worker {
        async fn run(&self, _ctx: &Context, cancel: CancellationToken) -> anyhow::Result<()> {
            cancel.cancelled().await;
            Ok(())
        }

        async fn stop(&self, _ctx: &Context) -> anyhow::Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_unblocks_run() {
        let server = Arc::new(NativeServer::new());
        let worker = Arc::new(Worker::default());
        let opts = test_service_options(
            ServiceType::NATIVE,
            Arc::new(NativeServiceOptions::new::<Worker>()),
            worker.clone(),
        );
        server.initialize(&Context::new(), opts).await.unwrap();

        let running = {
            let server = server.clone();
            let host: HostObject = worker.clone();
            tokio::spawn(async move { server.run(&Context::new(), host).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.stop(&Context::new()).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("run should return after stop")
            .unwrap();
        assert!(result.is_ok());
        assert!(worker.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_before_run_is_safe() {
        let server = NativeServer::new();
        server.stop(&Context::new()).await.unwrap();
    }

    #[tokio::test]
    async fn run_rejects_foreign_host() {
        let server = NativeServer::new();
        let opts = test_service_options(
            ServiceType::NATIVE,
            Arc::new(NativeServiceOptions::new::<Worker>()),
            Arc::new(()),
        );
        server.initialize(&Context::new(), opts).await.unwrap();
        let err = server.run(&Context::new(), Arc::new(42u8)).await.unwrap_err();
        assert!(err.to_string().contains("NativeService"));
    }
}

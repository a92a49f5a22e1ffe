//! A real SIGTERM against a running service. Kept in its own test binary so
//! the signal only reaches this process.
#![cfg(unix)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use svckit::server::http::HttpServiceOptions;
use svckit::{
    Context, Definitions, DeploymentEnv, LifecycleState, RuntimeEnv, ServiceBuilder,
    ServiceHandle, ServiceHandler, ShutdownOptions, Slot,
};

#[derive(Clone, Default)]
struct ErrorCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct Catalog {
    service: Slot<ServiceHandle>,
    finished: AtomicBool,
}

#[async_trait]
impl ServiceHandler for Catalog {
    fn service_slot(&self) -> &Slot<ServiceHandle> {
        &self.service
    }

    async fn on_finish(&self, _ctx: &Context) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn sigterm_stops_a_running_service_cleanly() {
    let errors = ErrorCounter::default();
    let _guard = tracing_subscriber::registry()
        .with(errors.clone())
        .set_default();

    let mut defs = Definitions::default();
    defs.name = "catalog".into();
    defs.product = "shop".into();
    defs.version = "v0.3.0".into();
    defs.types = vec!["http".into()];
    let mut env = RuntimeEnv::default();
    env.service_deploy = DeploymentEnv::Local;
    env.http_port = free_port();

    let service = ServiceBuilder::new(defs)
        .with_env(env)
        .with_logging(false)
        .with_service(HttpServiceOptions::new(|_: Arc<Catalog>| Router::new()))
        .build()
        .unwrap();
    let mut state = service.state();

    let catalog = Arc::new(Catalog::default());
    let running = tokio::spawn(service.run(catalog.clone(), ShutdownOptions::Signals));

    while *state.borrow_and_update() < LifecycleState::Running {
        state.changed().await.unwrap();
    }

    let status = std::process::Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("service should stop after SIGTERM")
        .unwrap()
        .unwrap();

    assert_eq!(*state.borrow(), LifecycleState::Stopped);
    assert!(catalog.finished.load(Ordering::SeqCst));
    assert_eq!(errors.0.load(Ordering::SeqCst), 0);
}

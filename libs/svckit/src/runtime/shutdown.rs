use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// What ends a running service.
pub enum ShutdownOptions {
    /// SIGINT or SIGTERM.
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, the service stops.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

impl std::fmt::Debug for ShutdownOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownOptions::Signals => f.write_str("Signals"),
            ShutdownOptions::Token(_) => f.write_str("Token"),
            ShutdownOptions::Future(_) => f.write_str("Future"),
        }
    }
}

impl ShutdownOptions {
    /// Starts waiting and returns the token cancelled once shutdown is
    /// requested. Signal handlers are installed before this returns.
    pub(crate) fn arm(self) -> CancellationToken {
        match self {
            ShutdownOptions::Token(token) => token,
            ShutdownOptions::Signals => match svckit_bootstrap::ShutdownListener::register() {
                Ok(listener) => cancel_after(async move {
                    let signal = listener.recv().await;
                    tracing::info!(%signal, "shutdown requested");
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "could not watch SIGTERM, waiting for SIGINT only");
                    cancel_after(async {
                        let _ = tokio::signal::ctrl_c().await;
                    })
                }
            },
            ShutdownOptions::Future(waiter) => cancel_after(async move {
                waiter.await;
                tracing::info!("shutdown requested by the caller");
            }),
        }
    }
}

fn cancel_after(waiter: impl Future<Output = ()> + Send + 'static) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        waiter.await;
        trigger.cancel();
    });
    token
}

//! Termination signals that end a service.

use std::fmt;
use tokio::signal;

/// The signal that requested shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// SIGINT and SIGTERM handlers, installed as soon as the listener exists.
///
/// From then on neither signal runs its default action, so a signal that
/// arrives before [`ShutdownListener::recv`] is first polled is still seen.
/// Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct ShutdownListener {
    #[cfg(unix)]
    interrupt: signal::unix::Signal,
    #[cfg(unix)]
    terminate: signal::unix::Signal,
}

impl ShutdownListener {
    pub fn register() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Resolves on the first SIGINT or SIGTERM. No other signal is handled.
    pub async fn recv(mut self) -> ShutdownSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
                _ = self.terminate.recv() => ShutdownSignal::Terminate,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = signal::ctrl_c().await;
            ShutdownSignal::Interrupt
        }
    }
}

/// Registers the handlers and waits for the first signal.
pub async fn wait_for_shutdown() -> std::io::Result<ShutdownSignal> {
    Ok(ShutdownListener::register()?.recv().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_sent_before_polling_is_received() {
        let listener = ShutdownListener::register().unwrap();
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let signal = tokio::time::timeout(std::time::Duration::from_secs(5), listener.recv())
            .await
            .expect("SIGTERM should be delivered");
        assert_eq!(signal, ShutdownSignal::Terminate);
    }
}

use async_trait::async_trait;

use crate::context::Context;
use crate::coupling::{Declarations, Slot};
use crate::runtime::ServiceHandle;

/// The application object a service runs.
///
/// The runtime binds its [`ServiceHandle`] into [`service_slot`], resolves
/// the dependencies the handler declares and then hands the handler to every
/// configured server.
///
/// [`service_slot`]: ServiceHandler::service_slot
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    fn service_slot(&self) -> &Slot<ServiceHandle>;

    fn declare(&self, _decl: &mut Declarations) {}

    /// Runs after the servers are initialized and before dependencies are
    /// validated, so it may still fill declared fields. Skipped under test
    /// deployment.
    async fn on_start(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs last during shutdown. Skipped under test deployment.
    async fn on_finish(&self, _ctx: &Context) {}
}

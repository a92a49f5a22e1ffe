//! Service lifecycle: building, startup, run loop and shutdown.

mod handle;
mod service;
mod shutdown;
mod state;

pub use handle::ServiceHandle;
pub use service::{Service, ServiceBuilder};
pub use shutdown::ShutdownOptions;
pub use state::LifecycleState;

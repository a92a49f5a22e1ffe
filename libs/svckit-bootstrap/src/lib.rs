pub mod definitions;
pub mod env;
pub mod logging;
pub mod signals;

pub use definitions::*;
pub use env::*;
pub use logging::*;
pub use signals::*;

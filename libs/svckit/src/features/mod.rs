//! Features shipped with the runtime.
//!
//! `http` is internal and always registered. `tracker` is opt-in: add
//! [`tracker::features`] to the service builder to get request tracking ids
//! in responses, outgoing calls and log records.

pub mod http;
pub mod tracker;

//! Request-scoped values.
//!
//! A [`Context`] travels with every handler call. Transports install one per
//! request and scope the handler future with it, so code deeper in the call
//! stack (outgoing client calls, log extractors) can reach it through
//! [`Context::current`].

use std::collections::HashMap;
use std::future::Future;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};

tokio::task_local! {
    static CURRENT: Context;
}

/// Metadata prefix used when forwarding a [`ServiceContext`].
pub const SERVICE_CONTEXT_PREFIX: &str = "service-context-";

/// Correlation identifier attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerId(pub String);

#[derive(Debug, Clone, Default)]
pub struct Context {
    values: http::Extensions,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.values.insert(value);
        self
    }

    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(value);
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values.get::<T>()
    }

    pub fn tracker_id(&self) -> Option<&str> {
        self.get::<TrackerId>().map(|t| t.0.as_str())
    }

    /// Context of the request being served by the current task, or an empty
    /// one outside of a request.
    pub fn current() -> Context {
        CURRENT.try_with(Clone::clone).unwrap_or_default()
    }

    /// Runs `fut` with `self` as the current context.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }
}

/// Service-wide values forwarded to every service this one calls.
///
/// Always carries `caller` with the local service name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceContext {
    values: HashMap<String, String>,
}

impl ServiceContext {
    pub fn new(service_name: &str) -> Self {
        let mut ctx = Self::default();
        ctx.add("caller", service_name);
        ctx
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> HashMap<String, String> {
        self.values.clone()
    }

    /// Appends every value to outgoing call metadata. Keys or values that are
    /// not valid metadata are skipped.
    pub fn append_to(&self, md: &mut MetadataMap) {
        for (k, v) in &self.values {
            let key = format!("{SERVICE_CONTEXT_PREFIX}{}", k.to_ascii_lowercase());
            let (Ok(key), Ok(value)) = (
                MetadataKey::from_bytes(key.as_bytes()),
                MetadataValue::try_from(v.as_str()),
            ) else {
                continue;
            };
            md.append(key, value);
        }
    }

    /// Reads a context forwarded by a caller.
    pub fn from_metadata(md: &MetadataMap) -> Option<Self> {
        let mut ctx = Self::default();
        for kv in md.iter() {
            if let tonic::metadata::KeyAndValueRef::Ascii(key, value) = kv {
                if let Some(name) = key.as_str().strip_prefix(SERVICE_CONTEXT_PREFIX) {
                    if let Ok(v) = value.to_str() {
                        ctx.add(name, v);
                    }
                }
            }
        }
        (!ctx.values.is_empty()).then_some(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_context_is_scoped() {
        assert!(Context::current().tracker_id().is_none());

        let ctx = Context::new().with(TrackerId("abc".into()));
        let seen = ctx
            .scope(async { Context::current().tracker_id().map(str::to_owned) })
            .await;
        assert_eq!(seen.as_deref(), Some("abc"));
        assert!(Context::current().tracker_id().is_none());
    }

    #[test]
    fn service_context_round_trips_through_metadata() {
        let mut ctx = ServiceContext::new("orders");
        ctx.add("tenant", "acme");

        let mut md = MetadataMap::new();
        ctx.append_to(&mut md);
        assert_eq!(
            md.get("service-context-caller").unwrap().to_str().unwrap(),
            "orders"
        );

        let back = ServiceContext::from_metadata(&md).unwrap();
        assert_eq!(back, ctx);
    }
}

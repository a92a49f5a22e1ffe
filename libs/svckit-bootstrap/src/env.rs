//! Runtime environment read from `SVCKIT_*` variables.

use anyhow::Context;
use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Where the service is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeploymentEnv {
    #[default]
    Unknown,
    Production,
    Test,
    Development,
    Local,
}

impl DeploymentEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentEnv::Unknown => "unknown",
            DeploymentEnv::Production => "prod",
            DeploymentEnv::Test => "test",
            DeploymentEnv::Development => "dev",
            DeploymentEnv::Local => "local",
        }
    }

    /// Unrecognized values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => DeploymentEnv::Production,
            "test" => DeploymentEnv::Test,
            "dev" | "development" => DeploymentEnv::Development,
            "local" => DeploymentEnv::Local,
            _ => DeploymentEnv::Unknown,
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, DeploymentEnv::Test)
    }
}

impl fmt::Display for DeploymentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DeploymentEnv {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeploymentEnv {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(DeploymentEnv::parse(&raw))
    }
}

/// Variables every service reads at startup.
///
/// `SVCKIT_SERVICE_DEPLOY=prod` maps to `service_deploy`, and so on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEnv {
    pub service_deploy: DeploymentEnv,
    pub tracker_header_name: String,
    pub cicd_test: bool,
    pub coupled_namespace: String,
    pub coupled_port: u16,
    pub grpc_port: u16,
    pub http_port: u16,

    /// Values of the variables a service requires through its definitions.
    #[serde(skip)]
    defined: HashMap<String, String>,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            service_deploy: DeploymentEnv::Local,
            tracker_header_name: "X-Request-ID".to_string(),
            cicd_test: false,
            coupled_namespace: String::new(),
            coupled_port: 7070,
            grpc_port: 7070,
            http_port: 8080,
            defined: HashMap::new(),
        }
    }
}

impl RuntimeEnv {
    pub const PREFIX: &'static str = "SVCKIT_";

    /// Defaults overridden by `SVCKIT_*` process variables.
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(RuntimeEnv::default()))
                .merge(Env::prefixed(Self::PREFIX)),
        )
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        figment
            .extract()
            .context("Failed to extract runtime environment")
    }

    /// Loads every variable listed by the service, preferring a
    /// `NAME.<service>` variant over the plain name. Variables set beforehand
    /// are kept. Missing variables are an error.
    pub fn load_defined(&mut self, service: &str, names: &[String]) -> anyhow::Result<()> {
        for name in names {
            if self.defined.contains_key(name) {
                continue;
            }
            let value = std::env::var(format!("{name}.{service}"))
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| std::env::var(name).ok().filter(|v| !v.is_empty()))
                .with_context(|| format!("environment variable '{name}' is not set"))?;
            self.defined.insert(name.clone(), value);
        }
        Ok(())
    }

    pub fn set_defined(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.defined.insert(name.into(), value.into());
    }

    pub fn defined(&self, name: &str) -> Option<&str> {
        self.defined.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_is_set() {
        figment::Jail::expect_with(|_jail| {
            let env = RuntimeEnv::load().expect("load");
            assert_eq!(env.service_deploy, DeploymentEnv::Local);
            assert_eq!(env.tracker_header_name, "X-Request-ID");
            assert_eq!(env.coupled_port, 7070);
            assert_eq!(env.grpc_port, 7070);
            assert_eq!(env.http_port, 8080);
            assert!(!env.cicd_test);
            Ok(())
        });
    }

    #[test]
    fn prefixed_variables_override_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SVCKIT_SERVICE_DEPLOY", "test");
            jail.set_env("SVCKIT_HTTP_PORT", "9000");
            jail.set_env("SVCKIT_COUPLED_NAMESPACE", "shop.svc");
            let env = RuntimeEnv::load().expect("load");
            assert!(env.service_deploy.is_test());
            assert_eq!(env.http_port, 9000);
            assert_eq!(env.coupled_namespace, "shop.svc");
            Ok(())
        });
    }

    #[test]
    fn unknown_deploy_value_maps_to_unknown() {
        assert_eq!(DeploymentEnv::parse("staging"), DeploymentEnv::Unknown);
        assert_eq!(DeploymentEnv::parse("prod"), DeploymentEnv::Production);
        assert_eq!(DeploymentEnv::Development.to_string(), "dev");
    }

    #[test]
    fn required_variables_must_exist() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SVCKIT_TEST_DSN", "postgres://plain");
            jail.set_env("SVCKIT_TEST_DSN.orders", "postgres://orders");

            let mut env = RuntimeEnv::default();
            env.load_defined("orders", &["SVCKIT_TEST_DSN".into()])
                .expect("defined");
            assert_eq!(env.defined("SVCKIT_TEST_DSN"), Some("postgres://orders"));

            let err = env
                .load_defined("orders", &["SVCKIT_TEST_MISSING".into()])
                .unwrap_err();
            assert!(err.to_string().contains("SVCKIT_TEST_MISSING"));
            Ok(())
        });
    }
}

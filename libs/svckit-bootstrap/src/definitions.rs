//! Service definitions: the immutable configuration snapshot a service is
//! started from.
//!
//! Definitions are read once, before orchestration begins, from a TOML or
//! YAML file (chosen by extension) layered with `SVCKIT_DEFS__*` environment
//! overrides. External features and servers may attach their own typed
//! settings which are validated together with the core fields.

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::any::Any;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

static VERSION_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^v[0-9]{1,2}(|[.][0-9]{1,2})(|[.][0-9]{1,2})$"));

/// A transport type a service declares in `types`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceType(Cow<'static, str>);

impl ServiceType {
    pub const GRPC: ServiceType = ServiceType(Cow::Borrowed("grpc"));
    pub const HTTP: ServiceType = ServiceType(Cow::Borrowed("http"));
    pub const NATIVE: ServiceType = ServiceType(Cow::Borrowed("native"));
    pub const SCRIPT: ServiceType = ServiceType(Cow::Borrowed("script"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Built-in transports, always supported.
    pub fn builtin() -> [ServiceType; 4] {
        [Self::GRPC, Self::HTTP, Self::NATIVE, Self::SCRIPT]
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceType {
    fn from(s: &str) -> Self {
        match s {
            "grpc" => Self::GRPC,
            "http" => Self::HTTP,
            "native" => Self::NATIVE,
            "script" => Self::SCRIPT,
            other => Self::new(other),
        }
    }
}

/// Settings contributed by an external feature or server.
///
/// They are loaded by the owner's settings loader, merged into the
/// definitions and validated together with them.
pub trait ExternalDefinitions: Any + Send + Sync {
    fn validate(&self) -> anyhow::Result<()>;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone, Default)]
struct Extensions {
    features: HashMap<String, Arc<dyn ExternalDefinitions>>,
    services: HashMap<String, Arc<dyn ExternalDefinitions>>,
    supported_types: Vec<ServiceType>,
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("features", &self.features.keys().collect::<Vec<_>>())
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("supported_types", &self.supported_types)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct LogFileDefinitions {
    #[validate(length(min = 1))]
    pub path: String,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
    #[serde(default)]
    pub max_backups: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct LogDefinitions {
    #[serde(default)]
    #[validate(custom(function = "LogDefinitions::validate_level"))]
    pub level: Option<String>,
    #[serde(default)]
    pub error_stacktrace: bool,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    #[validate(nested)]
    pub file: Option<LogFileDefinitions>,
}

impl LogDefinitions {
    fn validate_level(level: &str) -> Result<(), ValidationError> {
        match level {
            "info" | "debug" | "error" | "warn" | "internal" => Ok(()),
            _ => Err(ValidationError::new("log_level")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpDefinitions {
    #[serde(default)]
    pub hide_error_details: bool,
    #[serde(default)]
    pub disable_auth: bool,
    #[serde(default)]
    pub disable_panic_recovery: bool,
}

/// Explicit address of a coupled gRPC client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDefinitions {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

/// Service definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Definitions {
    #[validate(length(min = 1))]
    pub name: String,

    #[validate(length(min = 1), custom(function = "Definitions::validate_types_shape"))]
    pub types: Vec<String>,

    #[validate(custom(function = "Definitions::validate_version"))]
    pub version: String,

    #[validate(length(min = 1))]
    pub product: String,

    #[serde(default)]
    #[validate(custom(function = "Definitions::validate_env_names"))]
    pub envs: Vec<String>,

    #[serde(default)]
    #[validate(nested)]
    pub log: LogDefinitions,

    #[serde(default)]
    pub http: HttpDefinitions,

    /// Free-form service custom settings.
    #[serde(default)]
    pub service: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub clients: HashMap<String, ClientDefinitions>,

    /// Per service type custom settings.
    #[serde(default)]
    pub services: HashMap<String, serde_json::Value>,

    /// Per feature custom settings.
    #[serde(default)]
    pub features: HashMap<String, serde_json::Value>,

    #[serde(skip)]
    extensions: Extensions,
}

#[derive(Debug, Error)]
pub enum DefinitionsError {
    #[error("failed to load service definitions")]
    Load(#[source] Box<figment::Error>),
    #[error("invalid service definitions: {0}")]
    Invalid(#[from] ValidationErrors),
    #[error("unsupported service type '{0}'")]
    UnsupportedType(String),
    #[error("invalid port in service type '{0}'")]
    InvalidPort(String),
    #[error("service type 'script' must be declared alone")]
    ScriptNotAlone,
    #[error("service type '{0}' declared more than once")]
    DuplicatedType(String),
    #[error("invalid settings for '{name}'")]
    External {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Definitions {
    /// Load definitions from a TOML or YAML file, layered with
    /// `SVCKIT_DEFS__*` environment overrides.
    ///
    /// Example: `SVCKIT_DEFS__LOG__LEVEL=debug` maps to `log.level`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DefinitionsError> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| DefinitionsError::Load(Box::new(e)))
    }

    /// The figment used by [`Definitions::load`], exposed so external
    /// features can extract their own sections from the same sources.
    pub fn figment(path: &Path) -> Figment {
        let base = Figment::new();
        let base = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => base.merge(Yaml::file(path)),
            _ => base.merge(Toml::file(path)),
        };

        base.merge(Env::prefixed("SVCKIT_DEFS__").split("__"))
    }

    /// Extract a custom section from a definitions file into `T`.
    pub fn load_external<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
        Self::figment(path)
            .extract()
            .with_context(|| format!("failed to load definitions from '{}'", path.display()))
    }

    /// Effective definitions rendered as YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("failed to render definitions")
    }

    /// Structural validation plus the checks that depend on the registered
    /// transports and external settings.
    pub fn validate_all(&self) -> Result<(), DefinitionsError> {
        self.validate()?;

        let supported = self.supported_service_types();
        let mut seen = HashSet::new();
        for entry in &self.types {
            let (name, port) = split_type_and_port(entry);
            if port.is_some_and(|p| p.parse::<u16>().is_err()) {
                return Err(DefinitionsError::InvalidPort(entry.clone()));
            }
            if !supported.iter().any(|t| t.as_str() == name) {
                return Err(DefinitionsError::UnsupportedType(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(DefinitionsError::DuplicatedType(name.to_string()));
            }
        }
        if self.types.len() > 1 && seen.contains(ServiceType::SCRIPT.as_str()) {
            return Err(DefinitionsError::ScriptNotAlone);
        }

        for (name, svc) in &self.extensions.services {
            svc.validate().map_err(|source| DefinitionsError::External {
                name: name.clone(),
                source,
            })?;
        }
        for (name, feature) in &self.extensions.features {
            feature.validate().map_err(|source| DefinitionsError::External {
                name: name.clone(),
                source,
            })?;
        }

        Ok(())
    }

    /// Declared transports with their optional port override, in
    /// configuration order.
    pub fn service_types(&self) -> Vec<(ServiceType, Option<u16>)> {
        self.types
            .iter()
            .map(|entry| {
                let (name, port) = split_type_and_port(entry);
                (
                    ServiceType::from(name),
                    port.and_then(|p| p.parse::<u16>().ok()).filter(|p| *p != 0),
                )
            })
            .collect()
    }

    pub fn is_service_type(&self, t: &ServiceType) -> bool {
        self.service_types().iter().any(|(st, _)| st == t)
    }

    /// Comma separated list of declared transport names.
    pub fn service_types_as_string(&self) -> String {
        self.service_types()
            .iter()
            .map(|(t, _)| t.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn supported_service_types(&self) -> Vec<ServiceType> {
        let mut out = ServiceType::builtin().to_vec();
        for t in &self.extensions.supported_types {
            if !out.contains(t) {
                out.push(t.clone());
            }
        }
        out
    }

    pub fn add_supported_service_type(&mut self, t: ServiceType) {
        if !self.extensions.supported_types.contains(&t) {
            self.extensions.supported_types.push(t);
        }
    }

    pub fn add_external_feature_definitions(
        &mut self,
        name: impl Into<String>,
        defs: Arc<dyn ExternalDefinitions>,
    ) {
        self.extensions.features.insert(name.into(), defs);
    }

    pub fn external_feature_definitions(
        &self,
        name: &str,
    ) -> Option<Arc<dyn ExternalDefinitions>> {
        self.extensions.features.get(name).cloned()
    }

    pub fn add_external_service_definitions(
        &mut self,
        name: impl Into<String>,
        defs: Arc<dyn ExternalDefinitions>,
    ) {
        self.extensions.services.insert(name.into(), defs);
    }

    pub fn external_service_definitions(
        &self,
        name: &str,
    ) -> Option<Arc<dyn ExternalDefinitions>> {
        self.extensions.services.get(name).cloned()
    }

    /// Raw settings block for a declared transport.
    pub fn service_settings(&self, t: &ServiceType) -> Option<&serde_json::Value> {
        self.services.get(t.as_str())
    }

    /// Deserialize a feature's settings block into `T`.
    pub fn feature_settings<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        self.features
            .get(name)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .with_context(|| format!("invalid settings for feature '{name}'"))
            })
            .transpose()
    }

    /// Whether a feature block carries `enabled = true`.
    pub fn is_feature_enabled(&self, name: &str) -> bool {
        self.features
            .get(name)
            .and_then(|v| v.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn validate_version(version: &str) -> Result<(), ValidationError> {
        match VERSION_RE.as_ref() {
            Ok(re) if re.is_match(version) => Ok(()),
            _ => Err(ValidationError::new("version")),
        }
    }

    fn validate_types_shape(types: &[String]) -> Result<(), ValidationError> {
        if types.iter().any(|t| t.trim().is_empty()) {
            return Err(ValidationError::new("empty_service_type"));
        }
        Ok(())
    }

    fn validate_env_names(envs: &[String]) -> Result<(), ValidationError> {
        let ok = envs.iter().all(|e| {
            !e.is_empty()
                && e.is_ascii()
                && e.chars().all(|c| !c.is_ascii_lowercase())
        });
        if ok {
            Ok(())
        } else {
            Err(ValidationError::new("env_name"))
        }
    }
}

fn split_type_and_port(entry: &str) -> (&str, Option<&str>) {
    match entry.split_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (entry, None),
    }
}

#[cfg(test)]
mod tests;

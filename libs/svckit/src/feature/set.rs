use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;

use super::{
    CanBeInitializedOptions, Controller, Feature, FeatureTester, InitializeOptions, Roles,
    SettingsLoader,
};
use crate::context::Context;
use crate::contracts::{
    names, FrameworkApi, HttpAuth, HttpCors, PanicRecovery, RequestTracing, Tracker,
};
use crate::logger::LogContextExtractor;
use crate::server::HostObject;

/// How `initialize_all` orders features and resolves their dependencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DependencyOrder {
    /// Registration order. A feature only sees the dependencies registered
    /// before it; a dependency registered later is silently absent.
    #[default]
    Registration,
    /// Topological order over declared dependencies. Unknown or cyclic
    /// dependencies fail initialization.
    Topological,
}

#[derive(Debug, Error)]
pub enum FeatureSetError {
    #[error("could not find feature '{0}'")]
    NotFound(String),
    #[error("invalid feature set configuration: {errors:?}")]
    InvalidConfiguration { errors: Vec<String> },
    #[error("feature '{feature}' depends on unknown feature '{depends_on}'")]
    UnknownDependency { feature: String, depends_on: String },
    #[error("cyclic feature dependency detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("initialization failed for feature '{feature}'")]
    Initialize {
        feature: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("start failed for feature '{feature}'")]
    Start {
        feature: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("cleanup failed for feature '{feature}'")]
    Cleanup {
        feature: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A feature plus everything resolved about it at registration.
pub struct RegisteredFeature {
    name: String,
    feature: Arc<dyn Feature>,
    dependencies: Vec<String>,
    roles: Roles,
    controller: Option<Arc<dyn Controller>>,
    settings: Option<Arc<dyn SettingsLoader>>,
    tester: Option<Arc<dyn FeatureTester>>,
    framework_api: Option<FrameworkApi>,
    public_api: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for RegisteredFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredFeature")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("roles", &self.roles)
            .field("framework_api", &self.framework_api)
            .finish()
    }
}

impl RegisteredFeature {
    fn new(name: &str, feature: Arc<dyn Feature>, dependencies: &[&str]) -> Self {
        let controller = feature.clone().controller();
        let settings = feature.clone().settings();
        let tester = feature.clone().tester();
        let framework_api = feature.clone().framework_api();
        let public_api = feature.clone().public_api();

        let mut roles = Roles::default();
        for (present, role) in [
            (controller.is_some(), Roles::CONTROLLER),
            (settings.is_some(), Roles::SETTINGS),
            (tester.is_some(), Roles::TESTER),
            (framework_api.is_some(), Roles::FRAMEWORK_API),
            (public_api.is_some(), Roles::PUBLIC_API),
        ] {
            if present {
                roles.insert(role);
            }
        }

        Self {
            name: name.to_string(),
            feature,
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            roles,
            controller,
            settings,
            tester,
            framework_api,
            public_api,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn feature(&self) -> &Arc<dyn Feature> {
        &self.feature
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn roles(&self) -> Roles {
        self.roles
    }

    pub fn settings(&self) -> Option<&Arc<dyn SettingsLoader>> {
        self.settings.as_ref()
    }

    pub fn tester(&self) -> Option<&Arc<dyn FeatureTester>> {
        self.tester.as_ref()
    }

    pub fn public_api(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.public_api.as_ref()
    }
}

/// Registry of the features a service uses.
///
/// The ordered sequence drives execution; the map is for lookup only. Both
/// always hold the same names.
#[derive(Default)]
pub struct FeatureSet {
    features: HashMap<String, Arc<RegisteredFeature>>,
    ordered: Vec<Arc<RegisteredFeature>>,
    errors: Vec<String>,
    order: DependencyOrder,
}

impl std::fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.ordered.iter().map(|f| f.name.as_str()).collect();
        f.debug_struct("FeatureSet")
            .field("features", &names)
            .field("order", &self.order)
            .field("errors", &self.errors)
            .finish()
    }
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependency_order(mut self, order: DependencyOrder) -> Self {
        self.order = order;
        self
    }

    pub fn set_dependency_order(&mut self, order: DependencyOrder) {
        self.order = order;
    }

    pub fn dependency_order(&self) -> DependencyOrder {
        self.order
    }

    /// Registers a feature under `name`. A name already taken is recorded
    /// as a configuration error, reported by [`FeatureSet::initialize_all`].
    pub fn register(&mut self, name: &str, feature: Arc<dyn Feature>, dependencies: &[&str]) {
        if self.features.contains_key(name) {
            self.errors
                .push(format!("Feature '{name}' is already registered"));
            return;
        }

        feature.entry().set_name(name);
        let registered = Arc::new(RegisteredFeature::new(name, feature, dependencies));
        self.features.insert(name.to_string(), registered.clone());
        self.ordered.push(registered);
    }

    /// Merges `other` preserving its relative order. Names already present
    /// keep their first registration.
    pub fn append(&mut self, other: FeatureSet) {
        self.errors.extend(other.errors);
        for registered in other.ordered {
            if self.features.contains_key(&registered.name) {
                tracing::debug!(feature = %registered.name, "Skipping already registered feature");
                continue;
            }
            self.features
                .insert(registered.name.clone(), registered.clone());
            self.ordered.push(registered);
        }
    }

    pub fn feature(&self, name: &str) -> Result<Arc<dyn Feature>, FeatureSetError> {
        self.features
            .get(name)
            .map(|f| f.feature.clone())
            .ok_or_else(|| FeatureSetError::NotFound(name.to_string()))
    }

    pub fn registered(&self) -> &[Arc<RegisteredFeature>] {
        &self.ordered
    }

    /// Cursor over the features as registered at call time.
    pub fn iter(&self) -> FeatureSetIter {
        FeatureSetIter {
            index: 0,
            features: self.ordered.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Decides and records which features are enabled, then initializes the
    /// enabled ones. Each feature is visited exactly once.
    pub async fn initialize_all(
        &self,
        ctx: &Context,
        opts: &InitializeOptions,
    ) -> Result<(), FeatureSetError> {
        if !self.errors.is_empty() {
            return Err(FeatureSetError::InvalidConfiguration {
                errors: self.errors.clone(),
            });
        }

        let sequence = match self.order {
            DependencyOrder::Registration => self.ordered.clone(),
            DependencyOrder::Topological => self.topo_sorted()?,
        };

        let mut visited: HashSet<&str> = HashSet::with_capacity(sequence.len());
        for registered in &sequence {
            let allow = CanBeInitializedOptions {
                deployment_env: opts.env.service_deploy,
                definitions: &opts.definitions,
            };
            let feature = &registered.feature;
            let enabled = feature.can_be_initialized(&allow);
            feature
                .entry()
                .update_info(enabled, opts.logger.clone(), opts.errors.clone());

            if enabled {
                let mut create = opts.clone();
                create.dependencies = self.visible_dependencies(registered, &visited);
                feature
                    .initialize(ctx, create)
                    .await
                    .map_err(|source| FeatureSetError::Initialize {
                        feature: registered.name.clone(),
                        source,
                    })?;
            }

            tracing::debug!(feature = %registered.name, enabled, "Feature initialized");
            visited.insert(registered.name.as_str());
        }

        Ok(())
    }

    fn visible_dependencies(
        &self,
        registered: &RegisteredFeature,
        visited: &HashSet<&str>,
    ) -> HashMap<String, Arc<dyn Feature>> {
        let mut deps = HashMap::new();
        for name in &registered.dependencies {
            match self.features.get(name) {
                Some(dep) if visited.contains(name.as_str()) => {
                    deps.insert(name.clone(), dep.feature.clone());
                }
                _ => {
                    tracing::warn!(
                        feature = %registered.name,
                        dependency = %name,
                        "Feature dependency is not available at initialization"
                    );
                }
            }
        }
        deps
    }

    /// Runs the start hook of every controller.
    pub async fn start_all(&self, ctx: &Context, host: HostObject) -> Result<(), FeatureSetError> {
        for registered in self.features.values() {
            if let Some(controller) = &registered.controller {
                controller
                    .start(ctx, host.clone())
                    .await
                    .map_err(|source| FeatureSetError::Start {
                        feature: registered.name.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Runs the cleanup hook of every controller.
    pub async fn cleanup_all(&self, ctx: &Context) -> Result<(), FeatureSetError> {
        for registered in self.features.values() {
            if let Some(controller) = &registered.controller {
                controller
                    .cleanup(ctx)
                    .await
                    .map_err(|source| FeatureSetError::Cleanup {
                        feature: registered.name.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Framework API of the enabled feature registered under `name`.
    pub fn framework_api(&self, name: &str) -> Option<FrameworkApi> {
        self.features
            .get(name)
            .filter(|f| f.feature.entry().is_enabled())
            .and_then(|f| f.framework_api.clone())
    }

    pub fn tracker(&self) -> Option<Arc<dyn Tracker>> {
        match self.framework_api(names::TRACKER)? {
            FrameworkApi::Tracker(t) => Some(t),
            _ => None,
        }
    }

    pub fn log_extractor(&self) -> Option<Arc<dyn LogContextExtractor>> {
        match self.framework_api(names::LOGGER_EXTRACTOR)? {
            FrameworkApi::LogExtractor(e) => Some(e),
            _ => None,
        }
    }

    pub fn cors(&self) -> Option<Arc<dyn HttpCors>> {
        match self.framework_api(names::HTTP_CORS)? {
            FrameworkApi::HttpCors(c) => Some(c),
            _ => None,
        }
    }

    pub fn auth(&self) -> Option<Arc<dyn HttpAuth>> {
        match self.framework_api(names::HTTP_AUTH)? {
            FrameworkApi::HttpAuth(a) => Some(a),
            _ => None,
        }
    }

    pub fn panic_recovery(&self) -> Option<Arc<dyn PanicRecovery>> {
        match self.framework_api(names::PANIC_RECOVERY)? {
            FrameworkApi::PanicRecovery(p) => Some(p),
            _ => None,
        }
    }

    pub fn tracing(&self) -> Option<Arc<dyn RequestTracing>> {
        match self.framework_api(names::TRACING)? {
            FrameworkApi::Tracing(t) => Some(t),
            _ => None,
        }
    }

    fn topo_sorted(&self) -> Result<Vec<Arc<RegisteredFeature>>, FeatureSetError> {
        let names: Vec<&str> = self.ordered.iter().map(|f| f.name.as_str()).collect();
        let idx: HashMap<&str, usize> = names.iter().enumerate().map(|(i, &n)| (n, i)).collect();

        let mut adj = vec![Vec::<usize>::new(); names.len()];
        for (u, registered) in self.ordered.iter().enumerate() {
            for dep in &registered.dependencies {
                let v = *idx
                    .get(dep.as_str())
                    .ok_or_else(|| FeatureSetError::UnknownDependency {
                        feature: registered.name.clone(),
                        depends_on: dep.clone(),
                    })?;
                // edge dep -> feature
                adj[v].push(u);
            }
        }

        if let Some(path) = detect_cycle_with_path(&names, &adj) {
            return Err(FeatureSetError::CycleDetected { path });
        }

        let mut indeg = vec![0usize; names.len()];
        for targets in &adj {
            for &t in targets {
                indeg[t] += 1;
            }
        }

        // Seeded in registration order so independent features keep it.
        let mut q: VecDeque<usize> = (0..names.len()).filter(|&i| indeg[i] == 0).collect();
        let mut order = Vec::with_capacity(names.len());
        while let Some(u) = q.pop_front() {
            order.push(self.ordered[u].clone());
            for &w in &adj[u] {
                indeg[w] -= 1;
                if indeg[w] == 0 {
                    q.push_back(w);
                }
            }
        }

        tracing::debug!(
            features = ?order.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "Feature dependency order resolved (topo)"
        );
        Ok(order)
    }
}

fn detect_cycle_with_path(names: &[&str], adj: &[Vec<usize>]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn dfs(
        node: usize,
        names: &[&str],
        adj: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &next in &adj[node] {
            match colors[next] {
                Color::Gray => {
                    if let Some(start) = path.iter().position(|&n| n == next) {
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|&i| names[i].to_string()).collect();
                        cycle.push(names[next].to_string());
                        return Some(cycle);
                    }
                }
                Color::White => {
                    if let Some(cycle) = dfs(next, names, adj, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; names.len()];
    let mut path = Vec::new();
    for i in 0..names.len() {
        if colors[i] == Color::White {
            if let Some(cycle) = dfs(i, names, adj, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Forward cursor over a snapshot of the registered features.
pub struct FeatureSetIter {
    index: usize,
    features: Vec<Arc<RegisteredFeature>>,
}

impl FeatureSetIter {
    pub fn reset(&mut self) {
        self.index = 0;
    }
}

impl Iterator for FeatureSetIter {
    type Item = Arc<dyn Feature>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.features.get(self.index)?.feature.clone();
        self.index += 1;
        Some(item)
    }
}

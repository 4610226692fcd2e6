//! The engine context.
//!
//! All engine-wide handles are owned by one construction-time container and
//! shared by reference; there is no global lookup. The context also provides
//! the views the pipeline repeatedly needs: the active set as the planner
//! sees it, the target set recorded in the configuration tree, and the
//! environment injected into lifecycle scripts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;

use talos_config::{paths as config_paths, ConfigStore};
use talos_core::{ComponentId, PlatformInfo, RunWith};
use talos_ipc::{AuthTokenRegistry, ConfigurationValidator, SubscriptionHub};
use talos_lifecycle::{
    ActiveComponent, LifecycleEventHub, LifecycleExecutor, ProcessScriptRunner, ScriptRunner,
    TargetComponent, UpdateGate,
};
use talos_store::{ComponentFetcher, ComponentStore, LocalStoreFetcher};

use crate::error::Result;
use crate::groups::{AlwaysMember, MembershipOracle};
use crate::status::{FileStatusConsumer, StatusBroadcaster};

/// Capability tags this engine supports.
pub const SUPPORTED_CAPABILITIES: &[&str] = &["LARGE_CONFIGURATION", "LINUX_RESOURCE_LIMITS"];

/// The persisted state layout under the engine root directory.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    root: PathBuf,
}

impl EnginePaths {
    /// Creates the path layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The engine root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `config/config.tlog`, the configuration transaction log.
    #[must_use]
    pub fn config_tlog(&self) -> PathBuf {
        self.root.join("config").join("config.tlog")
    }

    /// `packages/`, the component store root.
    #[must_use]
    pub fn packages(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// `deployments/`, snapshots and status records.
    #[must_use]
    pub fn deployments(&self) -> PathBuf {
        self.root.join("deployments")
    }

    /// `deployments/<id>/`.
    #[must_use]
    pub fn deployment_dir(&self, deployment_id: &str) -> PathBuf {
        self.deployments().join(deployment_id)
    }

    /// `deployments/<id>/snapshot.json`.
    #[must_use]
    pub fn snapshot_path(&self, deployment_id: &str) -> PathBuf {
        self.deployment_dir(deployment_id).join("snapshot.json")
    }

    /// `deployments/<id>/status.json`.
    #[must_use]
    pub fn status_path(&self, deployment_id: &str) -> PathBuf {
        self.deployment_dir(deployment_id).join("status.json")
    }

    /// `deployments/ongoing.json`, the crash-recovery marker.
    #[must_use]
    pub fn ongoing_path(&self) -> PathBuf {
        self.deployments().join("ongoing.json")
    }

    /// `deployments/groups.json`, the persisted group mappings.
    #[must_use]
    pub fn groups_path(&self) -> PathBuf {
        self.deployments().join("groups.json")
    }

    /// `ipc.sock`, the component IPC socket.
    #[must_use]
    pub fn ipc_socket(&self) -> PathBuf {
        self.root.join("ipc.sock")
    }
}

/// Construction-time container for every engine-wide handle.
pub struct EngineContext {
    /// Path layout.
    pub paths: EnginePaths,

    /// The configuration store.
    pub config: Arc<ConfigStore>,

    /// The on-disk component store.
    pub store: ComponentStore,

    /// Makes components present locally.
    pub fetcher: Arc<dyn ComponentFetcher>,

    /// Drives service lifecycles.
    pub executor: Arc<LifecycleExecutor>,

    /// Service state-change fan-out.
    pub events: Arc<LifecycleEventHub>,

    /// The disruption-policy gate.
    pub gate: Arc<dyn UpdateGate>,

    /// The configuration validation round-trip.
    pub validator: Arc<dyn ConfigurationValidator>,

    /// Confirms cloud group membership.
    pub oracle: Arc<dyn MembershipOracle>,

    /// Status fan-out.
    pub statuses: Arc<StatusBroadcaster>,

    /// IPC auth tokens, issued per service launch.
    pub auth: Arc<AuthTokenRegistry>,

    /// Capability tags this engine advertises.
    pub capabilities: BTreeSet<String>,
}

impl EngineContext {
    /// Starts building a context rooted at `root`.
    #[must_use]
    pub fn builder(root: impl Into<PathBuf>) -> EngineContextBuilder {
        EngineContextBuilder::new(root)
    }

    /// The active set as the planner sees it: version and run-with from the
    /// executor, live configuration from the store.
    pub async fn active_view(
        &self,
    ) -> (BTreeMap<String, ActiveComponent>, HashMap<String, Vec<String>>) {
        let mut view = BTreeMap::new();
        for summary in self.executor.snapshot().await {
            let configuration = self
                .config
                .to_json(&[config_paths::SERVICES, &summary.name, config_paths::CONFIGURATION])
                .unwrap_or(serde_json::Value::Null);
            view.insert(
                summary.name.clone(),
                ActiveComponent {
                    version: summary.version,
                    configuration,
                    run_with: summary.run_with,
                },
            );
        }
        (view, self.executor.dependency_map().await)
    }

    /// Rebuilds the target set recorded in the configuration tree; used by
    /// rollback and by startup reconciliation.
    ///
    /// # Errors
    ///
    /// Returns an error if a recorded recipe is missing from the store.
    pub fn targets_from_config(&self) -> Result<BTreeMap<String, TargetComponent>> {
        let services = self
            .config
            .to_json(&[config_paths::SERVICES])
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        let names: BTreeSet<String> = services.keys().cloned().collect();
        let mut targets = BTreeMap::new();

        for (name, entry) in services {
            let Some(version) = entry
                .get(config_paths::VERSION)
                .and_then(|v| v.as_str())
                .and_then(|v| Version::parse(v).ok())
            else {
                continue;
            };
            let id = ComponentId::new(name.clone(), version);
            let recipe = self.store.load_recipe(&id)?;

            let configuration = entry
                .get(config_paths::CONFIGURATION)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let run_with: Option<RunWith> = entry
                .get("runWith")
                .and_then(|v| serde_json::from_value(v.clone()).ok());

            let dependencies: Vec<String> = recipe
                .dependencies
                .keys()
                .filter(|dep| names.contains(*dep))
                .cloned()
                .collect();
            let environment = self.service_environment(&id);

            targets.insert(
                name,
                TargetComponent {
                    id,
                    recipe,
                    configuration,
                    run_with,
                    dependencies,
                    environment,
                },
            );
        }
        Ok(targets)
    }

    /// The environment the engine injects into a service's lifecycle
    /// scripts: IPC coordinates, a fresh auth token, and store paths.
    #[must_use]
    pub fn service_environment(&self, id: &ComponentId) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            talos_ipc::AUTH_TOKEN_ENV.to_string(),
            self.auth.issue(&id.name),
        );
        env.insert(
            talos_ipc::SOCKET_PATH_ENV.to_string(),
            self.paths.ipc_socket().display().to_string(),
        );
        env.insert(
            "TALOS_ROOT_PATH".to_string(),
            self.paths.root().display().to_string(),
        );
        env.insert(
            "TALOS_ARTIFACTS_PATH".to_string(),
            self.store.artifact_dir(id).display().to_string(),
        );
        env.insert(
            "TALOS_UNARCHIVED_ARTIFACTS_PATH".to_string(),
            self.store.unarchived_dir(id).display().to_string(),
        );
        env
    }
}

/// Builder for [`EngineContext`].
pub struct EngineContextBuilder {
    root: PathBuf,
    platform: PlatformInfo,
    runner: Option<Arc<dyn ScriptRunner>>,
    fetcher: Option<Arc<dyn ComponentFetcher>>,
    gate: Option<Arc<dyn UpdateGate>>,
    validator: Option<Arc<dyn ConfigurationValidator>>,
    oracle: Option<Arc<dyn MembershipOracle>>,
    hub: Option<Arc<SubscriptionHub>>,
    persist_config: bool,
}

impl EngineContextBuilder {
    fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            platform: PlatformInfo::current(),
            runner: None,
            fetcher: None,
            gate: None,
            validator: None,
            oracle: None,
            hub: None,
            persist_config: true,
        }
    }

    /// Overrides the platform recipes resolve against.
    #[must_use]
    pub fn platform(mut self, platform: PlatformInfo) -> Self {
        self.platform = platform;
        self
    }

    /// Overrides the script runner.
    #[must_use]
    pub fn runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Overrides the component fetcher.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn ComponentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Uses `hub` for both the update gate and configuration validation.
    #[must_use]
    pub fn ipc_hub(mut self, hub: Arc<SubscriptionHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Overrides the update gate only.
    #[must_use]
    pub fn gate(mut self, gate: Arc<dyn UpdateGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Overrides the configuration validator only.
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn ConfigurationValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Overrides the membership oracle.
    #[must_use]
    pub fn oracle(mut self, oracle: Arc<dyn MembershipOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Keeps the configuration store in memory (tests).
    #[must_use]
    pub const fn in_memory_config(mut self) -> Self {
        self.persist_config = false;
        self
    }

    /// Builds the context, creating the on-disk layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the store layout or transaction log cannot be
    /// initialized.
    pub fn build(self) -> Result<EngineContext> {
        let paths = EnginePaths::new(self.root);
        let store = ComponentStore::open(paths.packages(), self.platform)?;

        let config = if self.persist_config {
            Arc::new(ConfigStore::open(paths.config_tlog())?)
        } else {
            Arc::new(ConfigStore::new())
        };

        let events = Arc::new(LifecycleEventHub::new());
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ProcessScriptRunner::new()));
        let executor = Arc::new(LifecycleExecutor::new(runner, events.clone()));

        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(LocalStoreFetcher::new(store.clone())));

        let hub = self.hub.unwrap_or_else(|| Arc::new(SubscriptionHub::new()));
        let gate: Arc<dyn UpdateGate> = self.gate.unwrap_or_else(|| hub.clone());
        let validator: Arc<dyn ConfigurationValidator> =
            self.validator.unwrap_or_else(|| hub.clone());

        let oracle = self.oracle.unwrap_or_else(|| Arc::new(AlwaysMember));

        let statuses = Arc::new(StatusBroadcaster::new());
        statuses.register(Arc::new(FileStatusConsumer::new(paths.deployments())));

        Ok(EngineContext {
            paths,
            config,
            store,
            fetcher,
            executor,
            events,
            gate,
            validator,
            oracle,
            statuses,
            auth: Arc::new(AuthTokenRegistry::new()),
            capabilities: SUPPORTED_CAPABILITIES
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }
}

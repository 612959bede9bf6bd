//! Backend-agnostic dispatch of jobs.
//!
//! A [`ComputeBackend`] knows how to run calls on one kind of infrastructure
//! and how to manage the runtimes those calls execute in. Backends are not
//! selected by matching on a closed enum; they register a named factory in a
//! link-time registry instead, so that a backend living in any crate linked
//! into the final binary is available by name:
//!
//! ```ignore
//! nimbus::register_backend!(MY_BACKEND, "my-backend", MyBackend::from_config);
//! ```
//!
//! [`Compute`] resolves the configured backend once, when the session is set
//! up, and forwards every operation to it. An unknown backend name, a name
//! registered twice, or a factory that fails are all
//! [`JobError::Configuration`] errors, surfaced before any job is built.
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use linkme::distributed_slice;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::{config::Config, error::JobError};

pub mod invoker;

/// Settings handed to backend factories.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeConfig {
    pub config: Config,
    /// Backend-specific settings, opaque to the dispatcher.
    #[serde(default)]
    pub backend: Value,
}

impl From<&Config> for ComputeConfig {
    fn from(config: &Config) -> Self {
        Self {
            config: config.clone(),
            backend: Value::Null,
        }
    }
}

/// How a backend consumes a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InvocationMode {
    /// One invocation per call, carrying that call's payload.
    #[default]
    PerCall,
    /// One invocation for the whole job, carrying the job payload.
    PerJob,
}

/// A module preinstalled in a runtime, either as a bare name or as a
/// `[name, is_package]` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Preinstall {
    Name(String),
    Pair(String, bool),
}

impl Preinstall {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Pair(name, _) => name,
        }
    }
}

/// What a runtime reports about itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMeta {
    #[serde(default)]
    pub preinstalls: Vec<Preinstall>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RuntimeMeta {
    /// Names of the preinstalled modules.
    pub fn preinstalled_modules(&self) -> impl Iterator<Item = String> + '_ {
        self.preinstalls.iter().map(|p| p.name().to_string())
    }
}

/// Reported once a launched job's process exits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    pub executor_id: String,
    pub job_id: String,
    /// `None` if the process was terminated by a signal or couldn't be awaited.
    pub exit_code: Option<i32>,
}

impl LaunchOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// An execution backend.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &str;

    fn invocation_mode(&self) -> InvocationMode {
        InvocationMode::PerCall
    }

    /// Start one invocation and return its activation id. Must not wait for
    /// the invocation to finish.
    async fn invoke(&self, runtime_name: &str, runtime_memory: u32, payload: &Value)
        -> Result<String>;

    /// Build a runtime image, from `dockerfile` if given. The build context is
    /// the directory containing the dockerfile.
    async fn build_runtime(&self, runtime_name: &str, dockerfile: Option<&Path>) -> Result<()>;

    /// Make a built runtime available for invocations and report its
    /// metadata.
    async fn create_runtime(
        &self,
        runtime_name: &str,
        runtime_memory: u32,
        timeout: u64,
    ) -> Result<RuntimeMeta>;

    async fn build_and_create_runtime(
        &self,
        runtime_name: &str,
        dockerfile: Option<&Path>,
        runtime_memory: u32,
        timeout: u64,
    ) -> Result<RuntimeMeta> {
        self.build_runtime(runtime_name, dockerfile).await?;
        self.create_runtime(runtime_name, runtime_memory, timeout)
            .await
    }

    async fn delete_runtime(&self, runtime_name: &str, runtime_memory: u32) -> Result<()>;

    async fn delete_all_runtimes(&self) -> Result<()>;

    /// Deployed runtimes as `(name, memory)` pairs, optionally restricted to
    /// one name.
    async fn list_runtimes(&self, runtime_name: Option<&str>) -> Result<Vec<(String, u32)>>;

    /// A key identifying a deployed runtime, unique per backend.
    fn get_runtime_key(&self, runtime_name: &str, runtime_memory: u32) -> String;

    /// Hands out the receiving end of the backend's launch completion channel.
    /// Backends that don't supervise launches return `None`.
    fn take_launch_outcomes(&self) -> Option<mpsc::UnboundedReceiver<LaunchOutcome>> {
        None
    }
}

/// Constructs a backend from the session settings.
pub type BackendFactory = fn(&ComputeConfig) -> Result<Box<dyn ComputeBackend>>;

/// A named backend factory.
#[derive(Clone, Copy)]
pub struct BackendEntry {
    pub name: &'static str,
    pub factory: BackendFactory,
}

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEntry").field("name", &self.name).finish()
    }
}

/// Every backend linked into the binary.
#[distributed_slice]
pub static BACKENDS: [BackendEntry] = [..];

/// Registers a backend factory under a name.
///
/// ```ignore
/// nimbus::register_backend!(MY_BACKEND, "my-backend", MyBackend::from_config);
/// ```
#[macro_export]
macro_rules! register_backend {
    ($ident:ident, $name:expr, $factory:expr) => {
        #[$crate::__private::linkme::distributed_slice($crate::__private::BACKENDS)]
        #[linkme(crate = $crate::__private::linkme)]
        static $ident: $crate::compute::BackendEntry = $crate::compute::BackendEntry {
            name: $name,
            factory: $factory,
        };
    };
}

/// An explicit set of backend factories.
#[derive(Clone, Debug, Default)]
pub struct BackendRegistry {
    entries: Vec<BackendEntry>,
}

impl BackendRegistry {
    /// Every backend registered with [`register_backend!`](crate::register_backend).
    pub fn linked() -> Self {
        Self {
            entries: BACKENDS.iter().copied().collect(),
        }
    }

    pub fn with(mut self, name: &'static str, factory: BackendFactory) -> Self {
        self.entries.push(BackendEntry { name, factory });
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    fn lookup(&self, name: &str) -> Result<BackendFactory, JobError> {
        let mut matches = self.entries.iter().filter(|e| e.name == name);
        match (matches.next(), matches.next()) {
            (Some(entry), None) => Ok(entry.factory),
            (Some(_), Some(_)) => Err(JobError::configuration(format!(
                "compute backend `{name}` is registered more than once"
            ))),
            (None, _) => Err(JobError::configuration(format!(
                "unknown compute backend `{name}`, available: {:?}",
                self.names()
            ))),
        }
    }
}

/// The session's dispatcher.
pub struct Compute {
    backend: Box<dyn ComputeBackend>,
}

impl std::fmt::Debug for Compute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compute")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl Compute {
    /// Resolve the configured backend among those linked into the binary.
    pub fn from_config(config: &ComputeConfig) -> Result<Self, JobError> {
        Self::from_registry(&BackendRegistry::linked(), config)
    }

    pub fn from_registry(
        registry: &BackendRegistry,
        config: &ComputeConfig,
    ) -> Result<Self, JobError> {
        let name = config.config.backend.as_str();
        let factory = registry.lookup(name)?;
        let backend = factory(config).map_err(|err| {
            JobError::configuration(format!("failed to construct backend `{name}`: {err:#}"))
        })?;
        info!(backend = name, "compute backend ready");
        Ok(Self { backend })
    }

    /// Wrap an already constructed backend.
    pub fn from_backend(backend: Box<dyn ComputeBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn invocation_mode(&self) -> InvocationMode {
        self.backend.invocation_mode()
    }

    #[instrument(skip(self, payload), level = "trace")]
    pub async fn invoke(
        &self,
        runtime_name: &str,
        runtime_memory: u32,
        payload: &Value,
    ) -> Result<String> {
        self.backend
            .invoke(runtime_name, runtime_memory, payload)
            .await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn build_runtime(&self, runtime_name: &str, dockerfile: Option<&Path>) -> Result<()> {
        self.backend.build_runtime(runtime_name, dockerfile).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn create_runtime(
        &self,
        runtime_name: &str,
        runtime_memory: u32,
        timeout: u64,
    ) -> Result<RuntimeMeta> {
        self.backend
            .create_runtime(runtime_name, runtime_memory, timeout)
            .await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn build_and_create_runtime(
        &self,
        runtime_name: &str,
        dockerfile: Option<&Path>,
        runtime_memory: u32,
        timeout: u64,
    ) -> Result<RuntimeMeta> {
        self.backend
            .build_and_create_runtime(runtime_name, dockerfile, runtime_memory, timeout)
            .await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn delete_runtime(&self, runtime_name: &str, runtime_memory: u32) -> Result<()> {
        self.backend
            .delete_runtime(runtime_name, runtime_memory)
            .await
    }

    pub async fn delete_all_runtimes(&self) -> Result<()> {
        self.backend.delete_all_runtimes().await
    }

    pub async fn list_runtimes(&self, runtime_name: Option<&str>) -> Result<Vec<(String, u32)>> {
        let runtimes = self.backend.list_runtimes(runtime_name).await?;
        debug!(count = runtimes.len(), "listed runtimes");
        Ok(runtimes)
    }

    pub fn get_runtime_key(&self, runtime_name: &str, runtime_memory: u32) -> String {
        self.backend.get_runtime_key(runtime_name, runtime_memory)
    }

    pub fn take_launch_outcomes(&self) -> Option<mpsc::UnboundedReceiver<LaunchOutcome>> {
        self.backend.take_launch_outcomes()
    }
}

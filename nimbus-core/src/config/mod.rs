//! Shared session configuration.
//!
//! This module introduces types to facilitate the configuration of a job
//! submission session.
//!
//! # Features:
//! - [`Config`]: Represents the main configuration structure. It's adorned with
//!   [`clap`] attributes so it can be flattened into any command line
//!   interface, and with [`serde`] attributes so it can be embedded verbatim in
//!   the job files handed to execution environments.
//! - [`Serializer`]: Specifies the serialization format for call payloads and
//!   computation units.
//! - [`EnvironmentKind`]: Enumerates the available execution environments.
//! - [`FunctionDelivery`]: Enumerates the ways a computation unit reaches the
//!   runtime that executes it.
//!
//! # Usage:
//! A [`Config`] is built once per session and shared read-only by the
//! [`JobBuilder`](crate::job::JobBuilder), the
//! [`Compute`](crate::compute::Compute) dispatcher and the
//! [`JobCleaner`](crate::cleaner::JobCleaner).

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::unit::{ModuleFilter, ModuleSelection};

const HELP_HEADING: &str = "Nimbus options";

pub const DEFAULT_STORAGE_BUCKET: &str = "nimbus";
pub const DEFAULT_STORAGE_DIR: &str = "/tmp/nimbus";
pub const DEFAULT_TEMP_DIR: &str = "/tmp";
pub const DEFAULT_RUNTIME: &str = "default";
pub const DEFAULT_RUNTIME_MEMORY: u32 = 256;
pub const DEFAULT_RUNTIME_TIMEOUT: u64 = 600;
/// Default aggregated payload ceiling, in MiB.
pub const DEFAULT_DATA_LIMIT: u64 = 4;
pub const DEFAULT_INVOKE_POOL_THREADS: usize = 128;
pub const DEFAULT_BACKEND: &str = "localhost";
pub const DEFAULT_LAUNCHER: &str = "nimbus-handler";
pub const DEFAULT_CONTAINER_ENGINE: &str = "docker";
pub const DEFAULT_UPLOAD_RETRY_SECS: u64 = 10;

/// Represents the main configuration structure for a session.
#[derive(Args, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Bucket holding job artifacts (aggregated data, computation units).
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_STORAGE_BUCKET", default_value = DEFAULT_STORAGE_BUCKET)]
    pub storage_bucket: String,

    /// Local directory shared with execution environments. Job files, staged
    /// launchers and the launch log live here.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_STORAGE_DIR", default_value = DEFAULT_STORAGE_DIR)]
    pub storage_dir: PathBuf,

    /// Temporary directory mounted into containerized environments.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_TEMP_DIR", default_value = DEFAULT_TEMP_DIR)]
    pub temp_dir: PathBuf,

    /// Runtime identifier (image name for containerized backends).
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_RUNTIME", default_value = DEFAULT_RUNTIME)]
    pub runtime: String,

    /// Memory assigned to each invocation, in MB.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_RUNTIME_MEMORY", default_value_t = DEFAULT_RUNTIME_MEMORY)]
    pub runtime_memory: u32,

    /// Backend timeout for one invocation, in seconds. Calls get five seconds
    /// less unless a per-job timeout is given.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_RUNTIME_TIMEOUT", default_value_t = DEFAULT_RUNTIME_TIMEOUT)]
    pub runtime_timeout: u64,

    /// Ceiling for data plus computation unit size, in MiB. `0` disables the
    /// check.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_DATA_LIMIT", default_value_t = DEFAULT_DATA_LIMIT)]
    pub data_limit: u64,

    /// Only ship these modules. Unset ships every resolved module; passing the
    /// flag without values ships none.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_INCLUDE_MODULES", value_delimiter = ',', num_args = 0..)]
    pub include_modules: Option<Vec<String>>,

    /// Never ship these modules. Takes precedence over `include_modules`.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_EXCLUDE_MODULES", value_delimiter = ',')]
    pub exclude_modules: Vec<String>,

    /// Width of the invocation pool.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_INVOKE_POOL_THREADS", default_value_t = DEFAULT_INVOKE_POOL_THREADS)]
    pub invoke_pool_threads: usize,

    /// Name of the compute backend to dispatch to.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_BACKEND", default_value = DEFAULT_BACKEND)]
    pub backend: String,

    /// Execution environment used by the localhost backend.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_ENVIRONMENT", value_enum, default_value_t = EnvironmentKind::Process)]
    pub environment: EnvironmentKind,

    /// How the computation unit reaches the runtime.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_FUNCTION_DELIVERY", value_enum, default_value_t = FunctionDelivery::Upload)]
    pub function_delivery: FunctionDelivery,

    /// Format of the computation unit. Call arguments are always CBOR.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_SERIALIZER", value_enum, default_value_t = Serializer::Cbor)]
    pub serializer: Serializer,

    /// Launcher binary staged into the storage directory and run by execution
    /// environments.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_LAUNCHER", default_value = DEFAULT_LAUNCHER)]
    pub launcher: PathBuf,

    /// Container engine used by containerized environments.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_CONTAINER_ENGINE", default_value = DEFAULT_CONTAINER_ENGINE)]
    pub container_engine: String,

    /// Upper bound, in seconds, on retrying a failed artifact upload. `0`
    /// disables retries.
    #[arg(long, help_heading = HELP_HEADING, env = "NIMBUS_UPLOAD_RETRY_SECS", default_value_t = DEFAULT_UPLOAD_RETRY_SECS)]
    pub upload_retry_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_bucket: DEFAULT_STORAGE_BUCKET.to_string(),
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            runtime: DEFAULT_RUNTIME.to_string(),
            runtime_memory: DEFAULT_RUNTIME_MEMORY,
            runtime_timeout: DEFAULT_RUNTIME_TIMEOUT,
            data_limit: DEFAULT_DATA_LIMIT,
            include_modules: None,
            exclude_modules: Vec::new(),
            invoke_pool_threads: DEFAULT_INVOKE_POOL_THREADS,
            backend: DEFAULT_BACKEND.to_string(),
            environment: Default::default(),
            function_delivery: Default::default(),
            serializer: Default::default(),
            launcher: PathBuf::from(DEFAULT_LAUNCHER),
            container_engine: DEFAULT_CONTAINER_ENGINE.to_string(),
            upload_retry_secs: DEFAULT_UPLOAD_RETRY_SECS,
        }
    }
}

impl Config {
    /// The configured payload ceiling in bytes, if the check is enabled.
    pub fn data_limit_bytes(&self) -> Option<u64> {
        (self.data_limit > 0).then(|| self.data_limit.saturating_mul(1024 * 1024))
    }

    /// Session-wide module filter, before any per-job override is merged.
    pub fn module_filter(&self) -> ModuleFilter {
        ModuleFilter {
            include: match &self.include_modules {
                None => ModuleSelection::All,
                Some(modules) => ModuleSelection::Only(modules.iter().cloned().collect()),
            },
            exclude: self.exclude_modules.iter().cloned().collect(),
        }
    }
}

/// Enumerates the available serialization formats.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Serializer {
    #[default]
    Cbor,
    Postcard,
}

/// Enumerates the available execution environments.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    /// The launcher runs as a plain process on the host.
    #[default]
    Process,
    /// The launcher runs inside a container built from the runtime image.
    Container,
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Container => write!(f, "container"),
        }
    }
}

/// Enumerates the ways a computation unit is delivered to its runtime.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FunctionDelivery {
    /// Store the unit as an object next to the job's data.
    #[default]
    Upload,
    /// Bake the unit into an extension of the runtime image, tagged with the
    /// unit's content hash.
    Image,
}

//! The built-in backend, running jobs on the local machine.
//!
//! Each job is written to a job file inside the local storage tree and handed
//! to the launcher (`<launcher> run <job file>`) in the configured
//! [`ExecutionEnvironment`]. Launches don't block: every child is supervised
//! by its own task, which reports a [`LaunchOutcome`] once the child exits.
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::{
    compute::{
        invoker::JobPayload, ComputeBackend, ComputeConfig, InvocationMode, LaunchOutcome,
        RuntimeMeta,
    },
    config::{Config, EnvironmentKind},
    environment::{self, capture_output, program_name, ExecutionEnvironment, LaunchCommand},
    storage::{keys, local::LocalStorage},
};

pub const BACKEND_NAME: &str = "localhost";
pub const HANDLER_LOG: &str = "local_handler.log";

crate::register_backend!(
    LOCALHOST_BACKEND,
    BACKEND_NAME,
    LocalhostBackend::from_compute_config
);

/// Backend-specific settings, read from [`ComputeConfig::backend`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct LocalhostSettings {
    /// Overrides `<storage dir>/local_handler.log`.
    log_file: Option<PathBuf>,
}

pub struct LocalhostBackend {
    config: Config,
    environment: Arc<dyn ExecutionEnvironment>,
    storage: LocalStorage,
    log_file: PathBuf,
    outcomes_tx: mpsc::UnboundedSender<LaunchOutcome>,
    outcomes_rx: Mutex<Option<mpsc::UnboundedReceiver<LaunchOutcome>>>,
}

impl LocalhostBackend {
    pub fn new(config: Config, environment: Arc<dyn ExecutionEnvironment>) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            storage: LocalStorage::new(&config.storage_dir),
            log_file: config.storage_dir.join(HANDLER_LOG),
            config,
            environment,
            outcomes_tx,
            outcomes_rx: Mutex::new(Some(outcomes_rx)),
        }
    }

    pub fn from_compute_config(config: &ComputeConfig) -> Result<Box<dyn ComputeBackend>> {
        let settings: LocalhostSettings = if config.backend.is_null() {
            LocalhostSettings::default()
        } else {
            serde_json::from_value(config.backend.clone())
                .context("invalid localhost backend settings")?
        };
        let environment = Arc::from(environment::from_config(&config.config));
        let mut backend = Self::new(config.config.clone(), environment);
        if let Some(log_file) = settings.log_file {
            backend.log_file = log_file;
        }
        Ok(Box::new(backend))
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Where the job file of `(executor_id, job_id)` is written.
    pub fn job_file(&self, executor_id: &str, job_id: &str) -> PathBuf {
        self.storage.object_path(
            &self.config.storage_bucket,
            &keys::job_file_key(executor_id, job_id),
        )
    }

    /// Write the job file and start the launcher on it. Returns once the
    /// child is spawned.
    #[instrument(skip_all, fields(executor_id = %job.executor_id, job_id = %job.job_id))]
    pub async fn run_job(&self, runtime_name: &str, job: &JobPayload) -> Result<String> {
        self.environment.setup().await?;

        let job_file = self.job_file(&job.executor_id, &job.job_id);
        if let Some(parent) = job_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let contents = serde_json::to_vec_pretty(job).context("serializing job file")?;
        tokio::fs::write(&job_file, contents)
            .await
            .with_context(|| format!("writing job file {}", job_file.display()))?;

        let cmd = self
            .environment
            .execution_cmd(runtime_name)
            .arg("run")
            .arg(job_file.display().to_string());

        let log = self.open_log().await?;
        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()
            .with_context(|| format!("failed to launch `{cmd}`"))?;
        info!(pid = child.id(), command = %cmd, "job launched");

        let outcomes = self.outcomes_tx.clone();
        let executor_id = job.executor_id.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(%executor_id, %job_id, "failed to wait for launcher: {err}");
                    None
                }
            };
            debug!(%executor_id, %job_id, ?exit_code, "launcher exited");
            // Nobody listening is fine.
            let _ = outcomes.send(LaunchOutcome {
                executor_id,
                job_id,
                exit_code,
            });
        });

        Ok(format!("{}/{}", job.executor_id, job.job_id))
    }

    async fn open_log(&self) -> Result<std::fs::File> {
        if let Some(parent) = self.log_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .await
            .with_context(|| format!("opening {}", self.log_file.display()))?;
        Ok(file.into_std().await)
    }

    fn engine_cmd(&self) -> LaunchCommand {
        LaunchCommand::new(&self.config.container_engine)
    }

    fn is_container(&self) -> bool {
        self.environment.kind() == EnvironmentKind::Container
    }
}

#[async_trait]
impl ComputeBackend for LocalhostBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn invocation_mode(&self) -> InvocationMode {
        InvocationMode::PerJob
    }

    async fn invoke(&self, runtime_name: &str, _: u32, payload: &Value) -> Result<String> {
        let job: JobPayload =
            serde_json::from_value(payload.clone()).context("malformed job payload")?;
        self.run_job(runtime_name, &job).await
    }

    async fn build_runtime(&self, runtime_name: &str, dockerfile: Option<&Path>) -> Result<()> {
        if !self.is_container() {
            anyhow::bail!(
                "the {} environment can't build runtime `{runtime_name}`",
                self.environment.kind()
            );
        }
        let cmd = match dockerfile {
            Some(dockerfile) => {
                let context = dockerfile.parent().unwrap_or(Path::new("."));
                self.engine_cmd().args([
                    "build".to_string(),
                    "-t".to_string(),
                    runtime_name.to_string(),
                    "-f".to_string(),
                    dockerfile.display().to_string(),
                    context.display().to_string(),
                ])
            }
            None => self.engine_cmd().arg("pull").arg(runtime_name),
        };
        capture_output(&cmd).await?;
        info!(runtime = runtime_name, "runtime built");
        Ok(())
    }

    async fn create_runtime(&self, runtime_name: &str, _: u32, _: u64) -> Result<RuntimeMeta> {
        self.environment.setup().await?;
        let cmd = self.environment.execution_cmd(runtime_name).arg("modules");
        let output = capture_output(&cmd).await?;
        serde_json::from_str(output.trim())
            .with_context(|| format!("`{cmd}` printed invalid runtime metadata"))
    }

    async fn delete_runtime(&self, runtime_name: &str, _: u32) -> Result<()> {
        if self.is_container() {
            capture_output(&self.engine_cmd().arg("rmi").arg(runtime_name)).await?;
        } else {
            debug!(runtime = runtime_name, "nothing to delete for host processes");
        }
        Ok(())
    }

    async fn delete_all_runtimes(&self) -> Result<()> {
        for (runtime_name, memory) in self.list_runtimes(None).await? {
            self.delete_runtime(&runtime_name, memory).await?;
        }
        Ok(())
    }

    async fn list_runtimes(&self, runtime_name: Option<&str>) -> Result<Vec<(String, u32)>> {
        let memory = self.config.runtime_memory;
        if !self.is_container() {
            let runtime = &self.config.runtime;
            let listed = runtime_name.map_or(true, |name| name == runtime);
            return Ok(if listed {
                vec![(runtime.clone(), memory)]
            } else {
                vec![]
            });
        }

        let mut cmd = self.engine_cmd().args(["image", "ls"]);
        if let Some(name) = runtime_name {
            cmd = cmd.arg(name);
        }
        let cmd = cmd.args(["--format", "{{.Repository}}:{{.Tag}}"]);
        debug!(engine = ?program_name(&cmd), "listing runtime images");
        let output = capture_output(&cmd).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.ends_with(":<none>"))
            .map(|line| (line.to_string(), memory))
            .collect())
    }

    fn get_runtime_key(&self, runtime_name: &str, _: u32) -> String {
        format!("{BACKEND_NAME}/{}/{runtime_name}", self.environment.kind())
    }

    fn take_launch_outcomes(&self) -> Option<mpsc::UnboundedReceiver<LaunchOutcome>> {
        self.outcomes_rx.lock().ok()?.take()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        compute::{invoker::Invoker, Compute},
        job::{JobDescriptor, JobMetadata},
    };

    const LAUNCHER: &str = r#"#!/bin/sh
if [ "$1" = "modules" ]; then
    echo '{"preinstalls": ["six", ["numpy", true]]}'
else
    echo "running $2"
    exit 3
fi
"#;

    fn setup(dir: &Path) -> Config {
        let launcher = dir.join("launcher.sh");
        std::fs::write(&launcher, LAUNCHER).unwrap();
        Config {
            storage_dir: dir.join("storage"),
            temp_dir: dir.join("tmp"),
            launcher,
            ..Default::default()
        }
    }

    fn backend(config: &Config) -> LocalhostBackend {
        LocalhostBackend::new(config.clone(), Arc::from(environment::from_config(config)))
    }

    fn job(total_calls: usize) -> JobDescriptor {
        JobDescriptor {
            executor_id: "exec0001".into(),
            job_id: "M000".into(),
            runtime_name: "default".into(),
            runtime_memory: 256,
            execution_timeout: 595,
            function_name: "f".into(),
            total_calls,
            invoke_pool_threads: 4,
            extra_env: BTreeMap::new(),
            data_key: keys::agg_data_key("exec0001", "M000"),
            data_ranges: vec![],
            func_key: keys::func_key("exec0001", "M000"),
            parts_per_object: None,
            metadata: JobMetadata::default(),
        }
    }

    #[test]
    fn is_registered_and_keyed_by_environment() {
        let config = ComputeConfig::from(&Config::default());
        let compute = Compute::from_config(&config).unwrap();
        assert_eq!(compute.backend_name(), "localhost");
        assert_eq!(compute.invocation_mode(), InvocationMode::PerJob);
        assert_eq!(
            compute.get_runtime_key("default", 256),
            "localhost/process/default"
        );
    }

    #[test]
    fn rejects_malformed_settings() {
        let config = ComputeConfig {
            config: Config::default(),
            backend: serde_json::json!({ "log_file": 3 }),
        };
        assert!(LocalhostBackend::from_compute_config(&config).is_err());
    }

    #[tokio::test]
    async fn create_runtime_reports_preinstalls() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&setup(dir.path()));

        let meta = backend.create_runtime("default", 256, 600).await.unwrap();

        let names: Vec<_> = meta.preinstalled_modules().collect();
        assert_eq!(names, vec!["six", "numpy"]);
    }

    #[tokio::test]
    async fn jobs_are_launched_and_supervised() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let backend = backend(&config);
        let mut outcomes = backend.take_launch_outcomes().unwrap();
        assert!(backend.take_launch_outcomes().is_none());
        let job_file = backend.job_file("exec0001", "M000");
        let log_file = backend.log_file().to_path_buf();

        let compute = Arc::new(Compute::from_backend(Box::new(backend)));
        let results = Invoker::new(compute, Arc::new(config.clone()))
            .run(&job(2))
            .await;

        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.as_ref().unwrap().activation_id, "exec0001/M000");
        }

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.job_id, "M000");
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());

        let written: JobPayload =
            serde_json::from_slice(&std::fs::read(&job_file).unwrap()).unwrap();
        assert_eq!(written.job_description.total_calls, 2);
        assert_eq!(written.config, config);
        let log = std::fs::read_to_string(log_file).unwrap();
        assert!(log.contains(&format!("running {}", job_file.display())));
    }

    #[tokio::test]
    async fn process_environment_has_one_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&setup(dir.path()));

        assert_eq!(
            backend.list_runtimes(None).await.unwrap(),
            vec![("default".to_string(), 256)]
        );
        assert!(backend.list_runtimes(Some("other")).await.unwrap().is_empty());
        assert!(backend.build_runtime("other", None).await.is_err());
        backend.delete_all_runtimes().await.unwrap();
    }
}

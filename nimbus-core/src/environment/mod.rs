//! Execution environments of the localhost backend.
//!
//! An environment decides how the launcher binary is started for a job:
//! directly as a host process, or inside a container built from the runtime
//! image. Either way the launcher is first staged into the session storage
//! directory, which is shared with the job (containers mount it at the same
//! path), so that job files written by the backend are visible to it.
//!
//! Setup happens at most once per environment instance, on first use.
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{process::Command, sync::OnceCell};
use tracing::{debug, info};

use crate::config::{Config, EnvironmentKind};

/// File name of the launcher once staged into the storage directory.
pub const STAGED_LAUNCHER: &str = "nimbus_handler";

/// A program and its arguments. Never run through a shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl std::fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    fn kind(&self) -> EnvironmentKind;

    /// Stage the launcher. Idempotent.
    async fn setup(&self) -> Result<()>;

    /// The command that starts the launcher for `runtime_name`. Job-specific
    /// arguments are appended by the caller.
    fn execution_cmd(&self, runtime_name: &str) -> LaunchCommand;
}

/// Construct the environment selected in `config`.
pub fn from_config(config: &Config) -> Box<dyn ExecutionEnvironment> {
    match config.environment {
        EnvironmentKind::Process => Box::new(ProcessEnvironment::new(config)),
        EnvironmentKind::Container => Box::new(ContainerEnvironment::new(config)),
    }
}

/// Copies the launcher into the storage directory, once.
#[derive(Debug)]
struct LauncherStage {
    launcher: PathBuf,
    storage_dir: PathBuf,
    staged: OnceCell<()>,
}

impl LauncherStage {
    fn new(config: &Config) -> Self {
        Self {
            launcher: config.launcher.clone(),
            storage_dir: config.storage_dir.clone(),
            staged: OnceCell::new(),
        }
    }

    fn staged_path(&self) -> PathBuf {
        self.storage_dir.join(STAGED_LAUNCHER)
    }

    async fn ensure(&self) -> Result<()> {
        self.staged
            .get_or_try_init(|| async {
                let source = resolve_launcher(&self.launcher)?;
                let target = self.staged_path();
                tokio::fs::create_dir_all(&self.storage_dir)
                    .await
                    .with_context(|| format!("creating {}", self.storage_dir.display()))?;
                tokio::fs::copy(&source, &target).await.with_context(|| {
                    format!("staging {} to {}", source.display(), target.display())
                })?;
                make_executable(&target).await?;
                info!(launcher = %source.display(), staged = %target.display(), "staged launcher");
                anyhow::Ok(())
            })
            .await
            .map(|_| ())
    }
}

/// Bare names are looked up on `PATH`.
fn resolve_launcher(launcher: &Path) -> Result<PathBuf> {
    if launcher.components().count() > 1 || launcher.exists() {
        return Ok(launcher.to_path_buf());
    }
    let path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path)
        .map(|dir| dir.join(launcher))
        .find(|candidate| candidate.is_file())
        .with_context(|| format!("launcher `{}` not found on PATH", launcher.display()))
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
async fn make_executable(_: &Path) -> Result<()> {
    Ok(())
}

/// Runs the launcher directly on the host.
#[derive(Debug)]
pub struct ProcessEnvironment {
    stage: LauncherStage,
}

impl ProcessEnvironment {
    pub fn new(config: &Config) -> Self {
        Self {
            stage: LauncherStage::new(config),
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for ProcessEnvironment {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Process
    }

    async fn setup(&self) -> Result<()> {
        self.stage.ensure().await
    }

    fn execution_cmd(&self, _runtime_name: &str) -> LaunchCommand {
        LaunchCommand::new(self.stage.staged_path())
    }
}

/// Runs the launcher inside a container of the runtime image, as the current
/// user, with the temp and storage directories mounted.
#[derive(Debug)]
pub struct ContainerEnvironment {
    stage: LauncherStage,
    engine: String,
    temp_dir: PathBuf,
    uid: u32,
}

impl ContainerEnvironment {
    pub fn new(config: &Config) -> Self {
        Self {
            stage: LauncherStage::new(config),
            engine: config.container_engine.clone(),
            temp_dir: config.temp_dir.clone(),
            uid: nix::unistd::getuid().as_raw(),
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }
}

#[async_trait]
impl ExecutionEnvironment for ContainerEnvironment {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Container
    }

    async fn setup(&self) -> Result<()> {
        self.stage.ensure().await
    }

    fn execution_cmd(&self, runtime_name: &str) -> LaunchCommand {
        let storage_dir = self.stage.storage_dir.display().to_string();
        let cmd = LaunchCommand::new(&self.engine).args([
            "run".to_string(),
            "--user".to_string(),
            self.uid.to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/tmp", self.temp_dir.display()),
            "-v".to_string(),
            format!("{storage_dir}:{storage_dir}"),
            "--entrypoint".to_string(),
            self.stage.staged_path().display().to_string(),
            runtime_name.to_string(),
        ]);
        debug!(command = %cmd, "container launch command");
        cmd
    }
}

/// Run `command` to completion and return its stdout. Fails on a non-zero
/// exit status, with stderr in the error.
pub(crate) async fn capture_output(command: &LaunchCommand) -> Result<String> {
    let output = command
        .to_command()
        .output()
        .await
        .with_context(|| format!("failed to execute `{command}`"))?;
    if !output.status.success() {
        anyhow::bail!(
            "`{command}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn program_name(command: &LaunchCommand) -> &OsStr {
    command
        .program
        .file_name()
        .unwrap_or(command.program.as_os_str())
}

//! Delivery of computation units baked into runtime images.
//!
//! The unit is written into a build context next to a Dockerfile extending
//! the base runtime, and the result is tagged with the unit's content hash.
//! Identical units therefore map to the same image, which is only built once.
//!
//! Every build stages into its own temporary directory under
//! `<storage dir>/images`, removed once the build returns.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::{compute::Compute, config::Config, unit::ComputationUnit};

/// Directory inside the image (and inside the build context) holding the
/// unit's modules and function body.
pub(crate) const EXT_MOD_PATH: &str = "ext_mod_path";
pub(crate) const IMAGES_DIR: &str = "images";
const DOCKERFILE: &str = "Dockerfile";

/// The image name with any tag removed. Registry ports are preserved.
pub(crate) fn base_image(runtime_name: &str) -> &str {
    match runtime_name.rfind(':') {
        Some(i) if !runtime_name[i..].contains('/') => &runtime_name[..i],
        _ => runtime_name,
    }
}

pub(crate) fn dockerfile_contents(base_runtime: &str, function_file: &str) -> String {
    [
        format!("FROM {base_runtime}"),
        format!("ENV NIMBUS_EXT_MODULE_PATH=/{EXT_MOD_PATH}"),
        format!("ENV NIMBUS_EXT_FUNCTION=/{EXT_MOD_PATH}/{function_file}"),
        format!("COPY {EXT_MOD_PATH} /{EXT_MOD_PATH}"),
    ]
    .join("\n")
}

/// An extended runtime carrying a computation unit.
pub(crate) struct DeliveredImage {
    pub(crate) runtime_name: String,
    pub(crate) content_hash: String,
}

/// Make sure an image extending `base_runtime` with `unit` exists and return
/// its name.
#[instrument(skip(compute, config, unit, stored_unit), level = "debug")]
pub(crate) async fn deliver(
    compute: &Compute,
    config: &Config,
    base_runtime: &str,
    runtime_memory: u32,
    unit: &ComputationUnit,
    stored_unit: &[u8],
) -> Result<DeliveredImage> {
    let content_hash = unit.content_hash();
    let runtime_name = format!("{}:{content_hash}", base_image(base_runtime));

    if !compute.list_runtimes(Some(&runtime_name)).await?.is_empty() {
        debug!(runtime = %runtime_name, "reusing existing runtime image");
        return Ok(DeliveredImage {
            runtime_name,
            content_hash,
        });
    }

    let images = config.storage_dir.join(IMAGES_DIR);
    tokio::fs::create_dir_all(&images)
        .await
        .with_context(|| format!("creating {}", images.display()))?;
    let context = tempfile::Builder::new()
        .prefix(&format!("{content_hash}-"))
        .tempdir_in(&images)
        .with_context(|| format!("creating a build context in {}", images.display()))?;
    let dockerfile =
        stage_build_context(context.path(), base_runtime, &content_hash, unit, stored_unit)
            .await
            .with_context(|| format!("staging build context {}", context.path().display()))?;

    let built = compute
        .build_and_create_runtime(
            &runtime_name,
            Some(&dockerfile),
            runtime_memory,
            config.runtime_timeout,
        )
        .await;
    let staged = context.path().to_path_buf();
    if let Err(err) = context.close() {
        warn!(context = %staged.display(), "failed to remove build context: {err}");
    }
    built?;
    info!(runtime = %runtime_name, "built runtime image");

    Ok(DeliveredImage {
        runtime_name,
        content_hash,
    })
}

async fn stage_build_context(
    context: &Path,
    base_runtime: &str,
    content_hash: &str,
    unit: &ComputationUnit,
    stored_unit: &[u8],
) -> Result<PathBuf> {
    let mod_path = context.join(EXT_MOD_PATH);
    tokio::fs::create_dir_all(&mod_path).await?;

    for (relative, contents) in &unit.module_files {
        let target = mod_path.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents).await?;
    }

    let function_file = format!("{content_hash}.bin");
    tokio::fs::write(mod_path.join(&function_file), stored_unit).await?;

    let dockerfile = context.join(DOCKERFILE);
    tokio::fs::write(&dockerfile, dockerfile_contents(base_runtime, &function_file)).await?;
    Ok(dockerfile)
}

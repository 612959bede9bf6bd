//! Computation units: a function together with the modules it needs.
//!
//! Remote functions don't capture their environment. Instead each function
//! declares the modules it references ([`RemoteFunction::MODULES`]), and a
//! [`ModuleCatalog`] describes where every known module lives on disk and
//! which other modules it imports. Resolution starts at the declared modules
//! and walks the catalog breadth-first:
//! - modules whose top-level package is preinstalled in the runtime are
//!   skipped and not traversed,
//! - excluded modules are skipped and not traversed,
//! - any other module missing from the catalog is a resolution error.
//!
//! The include selection is applied to the final set, so a module that is not
//! itself included can still lead to included dependencies. Exclusion always
//! wins over inclusion.
//!
//! ```rust
//! use std::collections::BTreeSet;
//! use nimbus::unit::{resolve_modules, ModuleCatalog, ModuleFilter};
//!
//! let mut catalog = ModuleCatalog::default();
//! catalog.insert("app", "/src/app", ["app.util", "numpy"]);
//! catalog.insert("app.util", "/src/app/util.py", Vec::<String>::new());
//!
//! let preinstalls = BTreeSet::from(["numpy".to_string()]);
//! let paths = resolve_modules(&["app"], &catalog, &preinstalls, &ModuleFilter::default()).unwrap();
//! assert_eq!(paths.len(), 2);
//! ```
use std::{
    collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::{
    error::{JobError, Result},
    function::{CallArgs, RemoteFunction},
    serializer::{Serializer, CALL_DATA_SERIALIZER},
};

/// Where a module lives and what it imports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource {
    /// A file, or a directory shipped recursively.
    pub path: PathBuf,
    pub imports: Vec<String>,
}

/// The modules known to the session, by dotted name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCatalog {
    modules: BTreeMap<String, ModuleSource>,
}

impl ModuleCatalog {
    pub fn insert<I, S>(&mut self, name: impl Into<String>, path: impl Into<PathBuf>, imports: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules.insert(
            name.into(),
            ModuleSource {
                path: path.into(),
                imports: imports.into_iter().map(Into::into).collect(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&ModuleSource> {
        self.modules.get(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// The top-level package of a dotted module name.
pub fn top_level(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

fn matches_any(set: &BTreeSet<String>, name: &str) -> bool {
    set.contains(name) || set.contains(top_level(name))
}

/// Which resolved modules to ship.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleSelection {
    /// Every resolved module.
    #[default]
    All,
    /// Only the named modules (or modules of the named packages). An empty set
    /// ships nothing.
    Only(BTreeSet<String>),
}

impl ModuleSelection {
    pub fn admits(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(modules) => matches_any(modules, name),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFilter {
    pub include: ModuleSelection,
    pub exclude: BTreeSet<String>,
}

impl ModuleFilter {
    pub fn is_excluded(&self, name: &str) -> bool {
        matches_any(&self.exclude, name)
    }

    /// Combines this (session) filter with per-job overrides.
    ///
    /// Excludes always accumulate. A job selection of [`ModuleSelection::All`]
    /// ships everything; a job selection of specific modules is added to a
    /// session selection of specific modules, or replaces a session selection
    /// of everything.
    pub fn merge(&self, include: Option<&ModuleSelection>, exclude: &[String]) -> Self {
        let include = match (&self.include, include) {
            (session, None) => session.clone(),
            (_, Some(ModuleSelection::All)) => ModuleSelection::All,
            (ModuleSelection::All, Some(job)) => job.clone(),
            (ModuleSelection::Only(session), Some(ModuleSelection::Only(job))) => {
                ModuleSelection::Only(session.union(job).cloned().collect())
            }
        };
        let mut excluded = self.exclude.clone();
        excluded.extend(exclude.iter().cloned());

        Self {
            include,
            exclude: excluded,
        }
    }
}

/// Resolves the paths of every module reachable from `roots`.
#[instrument(skip(catalog, preinstalls, filter), level = "debug")]
pub fn resolve_modules(
    roots: &[&str],
    catalog: &ModuleCatalog,
    preinstalls: &BTreeSet<String>,
    filter: &ModuleFilter,
) -> Result<Vec<PathBuf>> {
    let mut queue: VecDeque<String> = roots.iter().map(|r| r.to_string()).collect();
    let mut seen = HashSet::new();
    let mut discovered = Vec::new();

    while let Some(name) = queue.pop_front() {
        if !seen.insert(name.clone()) {
            continue;
        }
        if matches_any(preinstalls, &name) {
            debug!(module = %name, "skipping preinstalled module");
            continue;
        }
        if filter.is_excluded(&name) {
            debug!(module = %name, "skipping excluded module");
            continue;
        }
        let source = catalog.get(&name).ok_or_else(|| {
            JobError::resolution(format!(
                "module `{name}` is neither in the catalog nor preinstalled"
            ))
        })?;
        queue.extend(source.imports.iter().cloned());
        discovered.push((name, &source.path));
    }

    let mut unique = HashSet::new();
    Ok(discovered
        .into_iter()
        .filter(|(name, _)| filter.include.admits(name))
        .filter(|(_, path)| unique.insert(*path))
        .map(|(_, path)| path.clone())
        .collect())
}

/// Reads every file under `paths` into a map of relative path to contents.
///
/// Directories are keyed below their own name, files by their name alone, the
/// layout a runtime sees once the bundle is unpacked onto its module path.
/// Blocking; async callers go through [`ComputationSerializer::serialize`].
pub fn bundle_modules(paths: &[PathBuf]) -> Result<BTreeMap<String, Bytes>> {
    let mut files = BTreeMap::new();
    for path in paths {
        let anchor = path.parent().unwrap_or(Path::new(""));
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                JobError::resolution(format!("cannot read module {}: {err}", path.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(anchor).unwrap_or(entry.path());
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let contents = std::fs::read(entry.path()).map_err(|err| {
                JobError::resolution(format!("cannot read {}: {err}", entry.path().display()))
            })?;
            files.insert(key, Bytes::from(contents));
        }
    }
    Ok(files)
}

/// A function body plus the modules it ships with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputationUnit {
    pub function_name: String,
    pub parameters: Vec<String>,
    pub function_body: Bytes,
    /// Resolved module paths, deduplicated, in discovery order.
    pub module_paths: Vec<PathBuf>,
    pub module_files: BTreeMap<String, Bytes>,
    /// `module_files`, serialized.
    pub module_payload: Bytes,
}

/// The stored form of a [`ComputationUnit`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct StoredUnit {
    pub function_name: String,
    pub parameters: Vec<String>,
    pub func: Bytes,
    pub module_data: Bytes,
}

impl ComputationUnit {
    pub fn to_bytes(&self, serializer: Serializer) -> Result<Vec<u8>> {
        serializer
            .to_bytes(&StoredUnit {
                function_name: self.function_name.clone(),
                parameters: self.parameters.clone(),
                func: self.function_body.clone(),
                module_data: self.module_payload.clone(),
            })
            .map_err(JobError::Serialization)
    }

    /// Hex SHA-256 over the function name, body and module payload.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.function_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(&self.function_body);
        hasher.update([0u8]);
        hasher.update(&self.module_payload);
        format!("{:x}", hasher.finalize())
    }
}

/// A serialized function and its per-call argument blobs.
#[derive(Clone, Debug)]
pub struct SerializedJob {
    pub unit: ComputationUnit,
    pub call_blobs: Vec<Vec<u8>>,
}

impl SerializedJob {
    pub fn data_size(&self) -> u64 {
        self.call_blobs.iter().map(|b| b.len() as u64).sum()
    }
}

/// Turns a function and its calls into a [`SerializedJob`].
#[derive(Clone, Debug)]
pub struct ComputationSerializer {
    serializer: Serializer,
    preinstalls: BTreeSet<String>,
}

impl ComputationSerializer {
    pub fn new(serializer: Serializer, preinstalls: impl IntoIterator<Item = String>) -> Self {
        Self {
            serializer,
            preinstalls: preinstalls.into_iter().collect(),
        }
    }

    #[instrument(skip_all, fields(function = F::NAME, calls = calls.len()), level = "debug")]
    pub async fn serialize<F: RemoteFunction>(
        &self,
        function: &F,
        calls: &[CallArgs],
        catalog: &ModuleCatalog,
        filter: &ModuleFilter,
    ) -> Result<SerializedJob> {
        let function_body = function
            .as_bytes(self.serializer)
            .map_err(JobError::Serialization)?;
        let call_blobs = calls
            .iter()
            .map(|call| CALL_DATA_SERIALIZER.to_bytes(call))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(JobError::Serialization)?;

        let module_paths = resolve_modules(F::MODULES, catalog, &self.preinstalls, filter)?;
        let paths = module_paths.clone();
        let module_files = tokio::task::spawn_blocking(move || bundle_modules(&paths))
            .await
            .map_err(|err| JobError::resolution(format!("module bundling task failed: {err}")))??;
        let module_payload = self
            .serializer
            .to_bytes(&module_files)
            .map_err(JobError::Serialization)?;
        debug!(modules = module_paths.len(), files = module_files.len(), "bundled modules");

        Ok(SerializedJob {
            unit: ComputationUnit {
                function_name: F::NAME.to_string(),
                parameters: F::PARAMETERS.iter().map(|p| p.to_string()).collect(),
                function_body: Bytes::from(function_body),
                module_paths,
                module_files,
                module_payload: Bytes::from(module_payload),
            },
            call_blobs,
        })
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ktl_stack_types::{
    ApplyOptions, ClusterTarget, DeleteOptions, HookConfig, RunnerConfig,
};

/// File name of a stack level descriptor.
pub const STACK_FILE: &str = "ktl-stack.yaml";

/// File name of a standalone release descriptor.
pub const RELEASE_FILE: &str = "release.yaml";

/// Defaults one directory level contributes to every release below it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LevelDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub apply: ApplyOptions,
    #[serde(default)]
    pub delete: DeleteOptions,
}

/// Profile block inside a stack file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileDefaults {
    #[serde(default)]
    pub defaults: LevelDefaults,
}

/// One release as declared on disk, before inheritance resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseSpecFile {
    pub name: String,
    pub chart: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default)]
    pub apply: ApplyOptions,
    #[serde(default)]
    pub delete: DeleteOptions,
    #[serde(default)]
    pub hooks: HookConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism_group: Option<String>,
}

/// One `ktl-stack.yaml`, as parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub defaults: LevelDefaults,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, ProfileDefaults>,
    #[serde(default)]
    pub hooks: HookConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner: Option<RunnerConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<ReleaseSpecFile>,
}

/// A release plus the directory it was declared in, relative to the root.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredRelease {
    pub dir: PathBuf,
    pub spec: ReleaseSpecFile,
}

/// Everything the compiler consumes: the stack root, the stack files keyed
/// by their (root-relative) directory, and the discovered releases.
#[derive(Debug, Clone, Default)]
pub struct Universe {
    pub root: PathBuf,
    pub stacks: BTreeMap<PathBuf, StackFile>,
    pub releases: Vec<DiscoveredRelease>,
}

impl Universe {
    /// The stack file at the root, if present.
    pub fn root_stack(&self) -> Option<&StackFile> {
        self.stacks.get(Path::new(""))
    }

    /// Stack name: declared at the root, else the root directory name.
    pub fn stack_name(&self) -> String {
        self.root_stack()
            .and_then(|s| s.name.clone())
            .unwrap_or_else(|| {
                self.root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "stack".to_string())
            })
    }

    /// Directory levels from the root down to `dir`, inclusive, for
    /// inheritance walks. The root level is the empty path.
    pub fn chain_for(&self, dir: &Path) -> Vec<PathBuf> {
        let mut chain = vec![PathBuf::new()];
        let mut acc = PathBuf::new();
        for part in dir.components() {
            acc.push(part);
            chain.push(acc.clone());
        }
        chain
    }
}

/// Walk a stack root and load every stack and release file under it.
///
/// Hidden directories and `.ktl` state are skipped. Paths in the returned
/// universe are relative to the root.
pub fn discover_universe(root: &Path) -> Result<Universe> {
    let root = root
        .canonicalize()
        .with_context(|| format!("stack root {} does not exist", root.display()))?;
    let mut universe = Universe {
        root: root.clone(),
        stacks: BTreeMap::new(),
        releases: Vec::new(),
    };
    walk(&root, Path::new(""), &mut universe)?;
    // Deterministic release order regardless of directory traversal.
    universe
        .releases
        .sort_by(|a, b| (&a.dir, &a.spec.name).cmp(&(&b.dir, &b.spec.name)));
    Ok(universe)
}

fn walk(root: &Path, rel: &Path, universe: &mut Universe) -> Result<()> {
    let dir = root.join(rel);

    let stack_path = dir.join(STACK_FILE);
    if stack_path.exists() {
        let raw = fs::read_to_string(&stack_path)
            .with_context(|| format!("failed to read {}", stack_path.display()))?;
        let stack: StackFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", stack_path.display()))?;
        for spec in &stack.releases {
            universe.releases.push(DiscoveredRelease {
                dir: rel.to_path_buf(),
                spec: spec.clone(),
            });
        }
        universe.stacks.insert(rel.to_path_buf(), stack);
    }

    let release_path = dir.join(RELEASE_FILE);
    if release_path.exists() {
        let raw = fs::read_to_string(&release_path)
            .with_context(|| format!("failed to read {}", release_path.display()))?;
        let spec: ReleaseSpecFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", release_path.display()))?;
        universe.releases.push(DiscoveredRelease {
            dir: rel.to_path_buf(),
            spec,
        });
    }

    let entries = fs::read_dir(&dir)
        .with_context(|| format!("failed to list directory {}", dir.display()))?;
    let mut subdirs: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if name.starts_with('.') {
            continue;
        }
        subdirs.push(rel.join(name.as_ref()));
    }
    subdirs.sort_unstable();
    for sub in subdirs {
        walk(root, &sub, universe)?;
    }
    Ok(())
}

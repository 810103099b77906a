//! On-disk discovery of container log targets.
//!
//! Two layouts are recognized under the logs root:
//!
//! * *docker*: per-pod directories holding symlinks whose targets are the
//!   actual `*.log` files; a `config.v2.json` next to each target carries
//!   the container id, running state and Kubernetes labels.
//! * *containerd*: per-container directories named after the container,
//!   whose parent directory name encodes `<namespace>_<pod>_<id>`; every
//!   regular `*.log` file inside is a target and is reported as running.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tracing::warn;

use crate::entry::LogFormat;

const DOCKER_CONFIG_FILE: &str = "config.v2.json";
const LOG_SUFFIX: &str = ".log";

pub const LABEL_POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
pub const LABEL_POD_NAME: &str = "io.kubernetes.pod.name";
pub const LABEL_CONTAINER_NAME: &str = "io.kubernetes.container.name";

/// A discovered log file with its format tag, runtime state and labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path: PathBuf,
    pub id: String,
    pub format: LogFormat,
    pub running: bool,
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

/// Current set of targets keyed by the canonical log file path.
pub type Targets = HashMap<PathBuf, Target>;

#[derive(Debug, Snafu)]
pub enum TargetError {
    #[snafu(display("unable to read logs directory '{}': {source}", path.display()))]
    ReadDir { path: PathBuf, source: io::Error },
}

/// Enumerates the current set of log targets on the host.
pub trait TargetProvider: Send + Sync {
    fn targets(&self) -> Result<Targets, TargetError>;
}

/// Shape of the docker `config.v2.json` sidecar file.
#[derive(Debug, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "State", default)]
    state: StateSection,
    #[serde(rename = "Config", default)]
    config: ConfigSection,
}

#[derive(Debug, Default, Deserialize)]
struct StateSection {
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigSection {
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

impl ContainerConfig {
    fn label(&self, name: &str) -> String {
        self.config.labels.get(name).cloned().unwrap_or_default()
    }
}

/// Filesystem scanner over the logs root.
pub struct FsTargetProvider {
    logs_path: PathBuf,
    self_container_name: String,
}

impl FsTargetProvider {
    /// `self_container_name` excludes the shipper's own container from
    /// discovery; following our own output would loop.
    pub fn new(
        logs_path: impl Into<PathBuf>,
        self_container_name: impl Into<String>,
    ) -> io::Result<Self> {
        let logs_path = std::path::absolute(logs_path.into())?;

        Ok(Self {
            logs_path,
            self_container_name: self_container_name.into(),
        })
    }
}

impl TargetProvider for FsTargetProvider {
    fn targets(&self) -> Result<Targets, TargetError> {
        let mut targets = Targets::new();

        for directory in tree(&self.logs_path)? {
            let entries = match fs::read_dir(&directory) {
                Ok(entries) => entries,
                Err(_) => {
                    warn!(message = "Unable to read directory.", path = %directory.display());
                    continue;
                }
            };

            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };

                if file_type.is_symlink() {
                    if let Some(target) = self.docker_target(&path) {
                        targets.insert(target.path.clone(), target);
                    }
                    continue;
                }

                if file_type.is_file() {
                    if let Some(target) = self.containerd_target(&path) {
                        targets.insert(target.path.clone(), target);
                    }
                }
            }
        }

        Ok(targets)
    }
}

impl FsTargetProvider {
    /// Resolves a symlink into a docker target via its sidecar config.
    fn docker_target(&self, link: &Path) -> Option<Target> {
        let resolved = match fs::canonicalize(link) {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(
                    message = "Unable to resolve log symlink.",
                    link = %link.display(),
                    %error,
                );
                return None;
            }
        };

        let config_path = resolved.parent()?.join(DOCKER_CONFIG_FILE);
        let contents = fs::read(&config_path).ok()?;
        let config: ContainerConfig = serde_json::from_slice(&contents).ok()?;

        let container = config.label(LABEL_CONTAINER_NAME);

        if self.is_own_container(&container) {
            return None;
        }

        Some(Target {
            path: resolved,
            id: config.id.clone(),
            format: LogFormat::Docker,
            running: config.state.running,
            namespace: config.label(LABEL_POD_NAMESPACE),
            pod: config.label(LABEL_POD_NAME),
            container,
        })
    }

    /// Interprets a plain `*.log` file as a containerd target, taking the
    /// labels from the `<namespace>_<pod>_<id>` directory layout.
    fn containerd_target(&self, path: &Path) -> Option<Target> {
        if !path
            .file_name()?
            .to_str()
            .is_some_and(|name| name.ends_with(LOG_SUFFIX))
        {
            return None;
        }

        let container_dir = path.parent()?;
        let container = container_dir.file_name()?.to_str()?.to_string();
        let pod_dir = container_dir.parent()?.file_name()?.to_str()?;

        let mut encoded = pod_dir.splitn(3, '_');
        let namespace = encoded.next()?.to_string();
        let pod = encoded.next()?.to_string();
        let id = encoded.next()?.to_string();

        if self.is_own_container(&container) {
            return None;
        }

        let path = std::path::absolute(path).ok()?;

        Some(Target {
            path,
            id,
            format: LogFormat::Containerd,
            running: true,
            namespace,
            pod,
            container,
        })
    }

    fn is_own_container(&self, container: &str) -> bool {
        !self.self_container_name.is_empty() && container.contains(&self.self_container_name)
    }
}

/// Recursively lists every directory under `path`, including `path` itself.
fn tree(path: &Path) -> Result<Vec<PathBuf>, TargetError> {
    let mut directories = vec![path.to_path_buf()];
    let entries = fs::read_dir(path).context(ReadDirSnafu { path })?;

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        // Symlinked directories stay unexpanded; the docker layout links to
        // files, not directories, and cycles are not worth chasing.
        if file_type.is_dir() {
            directories.extend(tree(&entry.path())?);
        }
    }

    Ok(directories)
}

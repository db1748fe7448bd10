//! Yaml representation of a [`Tree`].
//!
//! The manifest nests node mappings by folder name. Inside a node mapping, the
//! entry holding a `file` key is the job record of the node (keyed by the
//! generation name), every other entry is a child node:
//!
//! ```yaml
//! generation_1:
//!   generation_1:
//!     file: study/generation_1/generation_1.py
//!     status: finished
//!   x_1:
//!     generation_2: { file: study/generation_1/x_1/generation_2.py, status: failed }
//! absolute_path: /scratch/studies
//! status: to_finish
//! configured: true
//! ```
use super::{NodeStatus, StudyMetadata, StudyStatus, SubmissionMetadata, Tree, TreeNode, RESERVED_KEYS};
use crate::{
    executors::{Context, HtcFlavor, SubmissionType},
    sync::write_atomically,
};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const RECORD_MARKER: &str = "file";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to access manifest {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Failed to serialize manifest")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Manifest {path} is malformed at '{location}': {reason}")]
    Malformed {
        path: PathBuf,
        location: String,
        reason: String,
    },
}

fn default_status() -> NodeStatus {
    NodeStatus::NotSubmitted
}

#[derive(Deserialize, Serialize, Debug)]
struct JobRecord {
    file: PathBuf,
    #[serde(default)]
    context: Option<Context>,
    #[serde(default)]
    submission_type: Option<SubmissionType>,
    #[serde(default)]
    htc_flavor: Option<HtcFlavor>,
    #[serde(default = "default_status")]
    status: NodeStatus,
    #[serde(default)]
    path_run: Option<PathBuf>,
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    parameters: Mapping,
}

#[derive(Deserialize, Serialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct Header {
    #[serde(default)]
    python_environment: Option<PathBuf>,
    #[serde(default)]
    python_environment_container: Option<PathBuf>,
    #[serde(default)]
    container_image: Option<PathBuf>,
    #[serde(default)]
    absolute_path: Option<PathBuf>,
    #[serde(default)]
    status: StudyStatus,
    #[serde(default)]
    configured: bool,
    #[serde(default)]
    name_config: Option<String>,
}

fn node_to_value(node: &TreeNode) -> Result<Value, ManifestError> {
    let record = JobRecord {
        file: node.file.clone(),
        context: node.submission.context,
        submission_type: node.submission.submission_type,
        htc_flavor: node.submission.htc_flavor,
        status: node.status,
        path_run: node.submission.path_run.clone(),
        job_id: node.submission.job_id.clone(),
        parameters: node.parameters.clone(),
    };

    let mut mapping = Mapping::new();
    mapping.insert(
        Value::from(node.generation_name.as_str()),
        serde_yaml::to_value(record)?,
    );
    for child in &node.children {
        mapping.insert(Value::from(child.segment.as_str()), node_to_value(child)?);
    }

    Ok(Value::Mapping(mapping))
}

pub fn to_value(tree: &Tree) -> Result<Value, ManifestError> {
    let mut mapping = Mapping::new();
    for root in &tree.roots {
        mapping.insert(Value::from(root.segment.as_str()), node_to_value(root)?);
    }

    let header = Header {
        python_environment: tree.metadata.python_environment.clone(),
        python_environment_container: tree.metadata.python_environment_container.clone(),
        container_image: tree.metadata.container_image.clone(),
        absolute_path: Some(tree.metadata.absolute_path.clone()),
        status: tree.metadata.status,
        configured: tree.metadata.configured,
        name_config: tree.metadata.name_config.clone(),
    };
    if let Value::Mapping(header) = serde_yaml::to_value(header)? {
        mapping.extend(header);
    }

    Ok(Value::Mapping(mapping))
}

struct Parser<'a> {
    manifest: &'a Path,
}

impl Parser<'_> {
    fn malformed(&self, location: &Path, reason: impl Into<String>) -> ManifestError {
        ManifestError::Malformed {
            path: self.manifest.to_path_buf(),
            location: location.to_string_lossy().into_owned(),
            reason: reason.into(),
        }
    }

    fn node(
        &self,
        segment: &str,
        value: &Value,
        generation: usize,
        parent: &Path,
    ) -> Result<TreeNode, ManifestError> {
        let path = parent.join(segment);
        let Value::Mapping(mapping) = value else {
            return Err(self.malformed(&path, "node is not a mapping"));
        };

        let mut record: Option<(String, JobRecord)> = None;
        let mut children = Vec::new();
        for (key, entry) in mapping {
            let Some(key) = key.as_str() else {
                return Err(self.malformed(&path, "keys must be strings"));
            };
            let is_record = entry
                .as_mapping()
                .map(|entry| entry.contains_key(RECORD_MARKER))
                .unwrap_or(false);

            if is_record {
                if record.is_some() {
                    return Err(self.malformed(&path, "node holds more than one job record"));
                }
                let parsed = serde_yaml::from_value::<JobRecord>(entry.clone())
                    .map_err(|error| self.malformed(&path.join(key), error.to_string()))?;
                record = Some((key.to_string(), parsed));
            } else {
                children.push(self.node(key, entry, generation + 1, &path)?);
            }
        }

        let Some((generation_name, record)) = record else {
            return Err(self.malformed(&path, "node has no job record"));
        };

        Ok(TreeNode {
            generation,
            generation_name,
            segment: segment.to_string(),
            path,
            file: record.file,
            parameters: record.parameters,
            status: record.status,
            submission: SubmissionMetadata {
                submission_type: record.submission_type,
                context: record.context,
                htc_flavor: record.htc_flavor,
                path_run: record.path_run,
                job_id: record.job_id,
            },
            children,
        })
    }
}

/// Rebuild a tree from its manifest, `manifest` being the location of the file
pub fn from_value(value: Value, manifest: &Path) -> Result<Tree, ManifestError> {
    let parser = Parser { manifest };
    let study_dir = manifest.parent().unwrap_or(Path::new("."));
    let name = study_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| parser.malformed(manifest, "manifest is not inside a study folder"))?;
    let location = study_dir.parent().unwrap_or(Path::new(".")).to_path_buf();

    let Value::Mapping(mapping) = value else {
        return Err(parser.malformed(Path::new(&name), "manifest is not a mapping"));
    };

    let mut header = Mapping::new();
    let mut roots = Vec::new();
    for (key, entry) in mapping {
        match key.as_str() {
            Some(key) if RESERVED_KEYS.contains(&key) => {
                header.insert(Value::from(key), entry);
            }
            Some(key) => roots.push(parser.node(key, &entry, 1, Path::new(&name))?),
            None => return Err(parser.malformed(Path::new(&name), "keys must be strings")),
        }
    }

    let header: Header = serde_yaml::from_value(Value::Mapping(header))
        .map_err(|error| parser.malformed(Path::new(&name), error.to_string()))?;

    // the study may have been moved since it was written, its location wins
    let absolute_path = match header.absolute_path {
        Some(recorded) if recorded != location => {
            warn!(recorded = ?recorded, location = ?location, "Study was moved, using its current location");
            location
        }
        _ => location,
    };

    Ok(Tree {
        name,
        roots,
        metadata: StudyMetadata {
            python_environment: header.python_environment,
            python_environment_container: header.python_environment_container,
            container_image: header.container_image,
            absolute_path,
            status: header.status,
            configured: header.configured,
            name_config: header.name_config,
        },
    })
}

pub fn load(path: &Path) -> Result<Tree, ManifestError> {
    let path = std::path::absolute(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let content = std::fs::read_to_string(&path).map_err(|source| ManifestError::Io {
        path: path.clone(),
        source,
    })?;
    let value = serde_yaml::from_str(&content).map_err(|source| ManifestError::Parse {
        path: path.clone(),
        source,
    })?;

    debug!(path = ?path, "Loaded manifest");
    from_value(value, &path)
}

/// Persist the manifest, readers never observe a partially written file
pub fn save(tree: &Tree, path: &Path) -> Result<(), ManifestError> {
    let content = serde_yaml::to_string(&to_value(tree)?)?;
    write_atomically(path, content).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })
}

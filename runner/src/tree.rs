//! Persistent model of a study: the job nodes, their status and submission data.
pub mod manifest;

use crate::executors::{Context, HtcFlavor, SubmissionType};
pub use manifest::ManifestError;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// File name of the manifest inside the study folder
pub const MANIFEST_NAME: &str = "tree.yaml";

/// Top-level keys of the manifest that are not nodes
pub const RESERVED_KEYS: &[&str] = &[
    "python_environment",
    "python_environment_container",
    "container_image",
    "absolute_path",
    "status",
    "configured",
    "name_config",
];

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    NotSubmitted,
    QueuedOrRunning,
    Finished,
    Failed,
    OnHoldBlocked,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::OnHoldBlocked)
    }

    /// Descendants of a node in this state can never run
    pub fn blocks_children(self) -> bool {
        matches!(self, Self::Failed | Self::OnHoldBlocked)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotSubmitted => "not_submitted",
            Self::QueuedOrRunning => "queued_or_running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::OnHoldBlocked => "on_hold_blocked",
        };
        f.write_str(name)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StudyStatus {
    #[default]
    ToFinish,
    Finished,
    FinishedWithIssues,
}

impl StudyStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::ToFinish)
    }
}

/// How and where a node was submitted
#[derive(Clone, Debug, PartialEq, Default)]
pub struct SubmissionMetadata {
    pub submission_type: Option<SubmissionType>,
    pub context: Option<Context>,
    pub htc_flavor: Option<HtcFlavor>,
    pub path_run: Option<PathBuf>,
    pub job_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TreeNode {
    // 1-based position in the generation chain
    pub generation: usize,
    pub generation_name: String,
    pub segment: String,
    // relative to the folder containing the study
    pub path: PathBuf,
    // generation script, relative like `path`
    pub file: PathBuf,
    pub parameters: serde_yaml::Mapping,
    pub status: NodeStatus,
    pub submission: SubmissionMetadata,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(
        generation: usize,
        generation_name: &str,
        segment: &str,
        path: PathBuf,
        file: PathBuf,
        parameters: serde_yaml::Mapping,
    ) -> Self {
        Self {
            generation,
            generation_name: generation_name.to_string(),
            segment: segment.to_string(),
            path,
            file,
            parameters,
            status: NodeStatus::NotSubmitted,
            submission: SubmissionMetadata::default(),
            children: Vec::new(),
        }
    }

    fn collect<'a>(&'a self, parent: Option<&'a TreeNode>, into: &mut Vec<NodeRef<'a>>) {
        into.push(NodeRef { node: self, parent });
        for child in &self.children {
            child.collect(Some(self), into);
        }
    }

    fn find_mut(&mut self, path: &Path) -> Option<&mut TreeNode> {
        if self.path == path {
            return Some(self);
        }
        if !path.starts_with(&self.path) {
            return None;
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_mut(path))
    }
}

/// A node together with its parent (`None` for the first generation)
#[derive(Clone, Copy, Debug)]
pub struct NodeRef<'a> {
    pub node: &'a TreeNode,
    pub parent: Option<&'a TreeNode>,
}

impl NodeRef<'_> {
    /// Status of the parent, the study itself counts as a finished parent
    pub fn parent_status(&self) -> NodeStatus {
        self.parent
            .map(|parent| parent.status)
            .unwrap_or(NodeStatus::Finished)
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct StudyMetadata {
    pub python_environment: Option<PathBuf>,
    pub python_environment_container: Option<PathBuf>,
    pub container_image: Option<PathBuf>,
    // folder containing the study folder
    pub absolute_path: PathBuf,
    pub status: StudyStatus,
    pub configured: bool,
    // file name of the per-node configuration chosen at build time
    pub name_config: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tree {
    pub name: String,
    pub roots: Vec<TreeNode>,
    pub metadata: StudyMetadata,
}

impl Tree {
    pub fn study_dir(&self) -> PathBuf {
        self.metadata.absolute_path.join(&self.name)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.study_dir().join(MANIFEST_NAME)
    }

    /// Absolute location of something stored relative to the study parent folder
    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.metadata.absolute_path.join(relative)
    }

    /// Every node in depth-first, declaration order
    pub fn nodes(&self) -> Vec<NodeRef<'_>> {
        let mut nodes = Vec::new();
        for root in &self.roots {
            root.collect(None, &mut nodes);
        }
        nodes
    }

    pub fn find_mut(&mut self, path: &Path) -> Option<&mut TreeNode> {
        self.roots.iter_mut().find_map(|root| root.find_mut(path))
    }

    pub fn find(&self, path: &Path) -> Option<&TreeNode> {
        self.nodes()
            .into_iter()
            .map(|entry| entry.node)
            .find(|node| node.path == path)
    }

    pub fn generation_count(&self) -> usize {
        self.nodes()
            .iter()
            .map(|entry| entry.node.generation)
            .max()
            .unwrap_or_default()
    }

    /// Mark every not yet submitted descendant of a failed or blocked node as blocked.
    ///
    /// Returns the paths of the nodes that changed.
    pub fn propagate_blocks(&mut self) -> Vec<PathBuf> {
        fn visit(node: &mut TreeNode, parent_blocks: bool, changed: &mut Vec<PathBuf>) {
            if parent_blocks && node.status == NodeStatus::NotSubmitted {
                node.status = NodeStatus::OnHoldBlocked;
                changed.push(node.path.clone());
            }
            let blocks = node.status.blocks_children();
            for child in node.children.iter_mut() {
                visit(child, blocks, changed);
            }
        }

        let mut changed = Vec::new();
        for root in self.roots.iter_mut() {
            visit(root, false, &mut changed);
        }
        changed
    }

    /// Recompute the study status from the node statuses
    pub fn refresh_status(&mut self) -> StudyStatus {
        let nodes = self.nodes();
        self.metadata.status = if !nodes.iter().all(|entry| entry.node.status.is_terminal()) {
            StudyStatus::ToFinish
        } else if nodes
            .iter()
            .all(|entry| entry.node.status == NodeStatus::Finished)
        {
            StudyStatus::Finished
        } else {
            StudyStatus::FinishedWithIssues
        };
        self.metadata.status
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        manifest::load(path)
    }

    pub fn save(&self) -> Result<(), ManifestError> {
        manifest::save(self, &self.manifest_path())
    }
}

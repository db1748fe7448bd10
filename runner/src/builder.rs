//! Materialize a study on disk from its scan declaration.
//!
//! The whole expected tree is planned in memory first (expansion, naming and
//! configuration mutation), so a declaration error never leaves a partial study
//! behind. Only nodes missing from disk are then written, each one into a hidden
//! folder renamed into place once complete.
use crate::{
    config::{ConfigErrors, GenerationSpec, ScanSpec, DEFAULT_NAME_CONFIG, MAIN_CONFIGURATION},
    executors::{run_file, PollStatus},
    expansion::{Binding, BoundValue, GenerationPlan},
    expression::Scalar,
    mutation::{ConfigDocument, MutationError},
    naming::{self, NamingError},
    sync::{
        create_dir_atomically,
        locking::{lock_path, LockError, ManifestLock},
        write_atomically,
    },
    template::{ScriptTemplate, TemplateError},
    tree::{ManifestError, NodeStatus, StudyMetadata, Tree, TreeNode, MANIFEST_NAME},
};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use itertools::Itertools;
use serde_yaml::Mapping;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Configuration(#[from] ConfigErrors),
    #[error("Study tree is stale, {} node(s) exist but are not produced by the scan anymore: {}", paths.len(), paths.iter().map(|path| path.to_string_lossy()).join(", "))]
    StaleTree { paths: Vec<PathBuf> },
    #[error("Generation '{0}' scans variables, a single job study can't have any")]
    NotSingle(String),
    #[error("Dependencies {} would all be staged as {file_name}", keys.join(", "))]
    DependencyCollision { file_name: String, keys: Vec<String> },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("Node {path}: {source}")]
    Mutation {
        path: PathBuf,
        #[source]
        source: MutationError,
    },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("Failed to materialize {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<NamingError> for BuildError {
    fn from(error: NamingError) -> Self {
        Self::Configuration(ConfigErrors::Naming(error))
    }
}

impl BuildError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BuildOptions {
    // remove an existing study before building
    pub force_overwrite: bool,
    // file name of the per-node configuration
    pub name_config: String,
    // folder receiving the study folder, defaults to the folder of the scan file
    pub output_dir: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            force_overwrite: false,
            name_config: DEFAULT_NAME_CONFIG.to_string(),
            output_dir: None,
        }
    }
}

struct Generation<'a> {
    index: usize,
    name: &'a str,
    spec: &'a GenerationSpec,
    plan: GenerationPlan,
    template: ScriptTemplate,
    file_name: String,
}

struct PlannedNode {
    generation: usize,
    segment: String,
    // relative to the output folder
    path: PathBuf,
    binding: Binding,
    config: Option<ConfigDocument>,
    children: Vec<PlannedNode>,
}

impl PlannedNode {
    fn collect_paths(&self, into: &mut BTreeSet<PathBuf>) {
        into.insert(self.path.clone());
        self.children
            .iter()
            .for_each(|child| child.collect_paths(into));
    }
}

struct Builder<'a> {
    spec: &'a ScanSpec,
    generations: Vec<Generation<'a>>,
    output: PathBuf,
    name_config: &'a str,
}

impl<'a> Builder<'a> {
    fn new(
        spec: &'a ScanSpec,
        base_dir: &Path,
        options: &'a BuildOptions,
    ) -> Result<Self, BuildError> {
        let output = std::path::absolute(options.output_dir.as_deref().unwrap_or(base_dir))
            .map_err(BuildError::io(base_dir))?;

        let plans = spec.plans()?;
        let generations = spec
            .structure
            .iter()
            .zip(plans)
            .enumerate()
            .map(|(index, ((name, generation), plan))| -> Result<Generation<'a>, BuildError> {
                let template = ScriptTemplate::load(&base_dir.join(&generation.executable))?;
                let file_name = match template.extension() {
                    Some(extension) => format!("{name}.{extension}"),
                    None => name.clone(),
                };
                Ok(Generation {
                    index: index + 1,
                    name,
                    spec: generation,
                    plan,
                    template,
                    file_name,
                })
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        Ok(Self {
            spec,
            generations,
            output,
            name_config: &options.name_config,
        })
    }

    fn study_dir(&self) -> PathBuf {
        self.output.join(&self.spec.name)
    }

    fn root_config(&self, base_dir: &Path) -> Result<Option<ConfigDocument>, BuildError> {
        self.spec
            .main_configuration()
            .map(|path| {
                ConfigDocument::load(&base_dir.join(path)).map_err(|source| BuildError::Mutation {
                    path: PathBuf::from(&self.spec.name),
                    source,
                })
            })
            .transpose()
    }

    fn plan(&self, root_config: Option<&ConfigDocument>) -> Result<Vec<PlannedNode>, BuildError> {
        self.plan_children(
            0,
            Path::new(&self.spec.name),
            None,
            &BTreeMap::new(),
            root_config,
        )
    }

    fn plan_children(
        &self,
        depth: usize,
        parent_path: &Path,
        parent_generation: Option<&str>,
        inherited: &BTreeMap<String, Scalar>,
        parent_config: Option<&ConfigDocument>,
    ) -> Result<Vec<PlannedNode>, BuildError> {
        let Some(generation) = self.generations.get(depth) else {
            return Ok(Vec::new());
        };

        let mut context = inherited.clone();
        context.extend(
            generation
                .spec
                .scalar_common_parameters()
                .map(|(key, value)| (key.clone(), value)),
        );

        let bindings = generation
            .plan
            .expand(&context)
            .map_err(ConfigErrors::from)?;

        let mut segments = BTreeSet::new();
        let mut nodes = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let segment = naming::segment_for(generation.name, &binding)?;
            let path = parent_path.join(&segment);
            // the parent mapping also holds the job record keyed by its generation name
            if Some(segment.as_str()) == parent_generation || !segments.insert(segment.clone()) {
                return Err(NamingError::Collision(path.to_string_lossy().into_owned()).into());
            }

            let config = parent_config
                .map(|parent| {
                    let mut config = parent.clone();
                    apply_binding(&mut config, &binding).map(|()| config)
                })
                .transpose()
                .map_err(|source| BuildError::Mutation {
                    path: path.clone(),
                    source,
                })?;

            let mut child_context = context.clone();
            child_context.extend(
                binding
                    .scalars()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );

            let children = self.plan_children(
                depth + 1,
                &path,
                Some(generation.name),
                &child_context,
                config.as_ref(),
            )?;

            nodes.push(PlannedNode {
                generation: generation.index,
                segment,
                path,
                binding,
                config,
                children,
            });
        }

        Ok(nodes)
    }

    fn generation(&self, index: usize) -> &Generation<'a> {
        &self.generations[index - 1]
    }

    /// Node folders present on disk, found through their generation script
    fn discover(&self) -> Result<BTreeSet<PathBuf>, BuildError> {
        let study_dir = self.study_dir();
        if !study_dir.is_dir() {
            return Ok(BTreeSet::new());
        }

        let mut builder = GlobSetBuilder::new();
        for generation in &self.generations {
            let glob = Glob::new(&globset::escape(&generation.file_name)).map_err(|error| {
                BuildError::Io {
                    path: study_dir.clone(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, error),
                }
            })?;
            builder.add(glob);
        }
        let scripts: GlobSet = builder.build().map_err(|error| BuildError::Io {
            path: study_dir.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, error),
        })?;

        let mut found = BTreeSet::new();
        // hidden folders hold partially built nodes
        for entry in WalkBuilder::new(&study_dir)
            .standard_filters(false)
            .hidden(true)
            .build()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    warn!("Failed to scan study folder: {error}");
                    continue;
                }
            };
            // scripts sit inside node folders, never at the study root
            if entry.depth() < 2 {
                continue;
            }
            let is_script = entry.file_type().map_or(false, |kind| kind.is_file())
                && entry
                    .path()
                    .file_name()
                    .map_or(false, |name| scripts.is_match(name));
            if !is_script {
                continue;
            }
            if let Some(relative) = entry
                .path()
                .parent()
                .and_then(|parent| parent.strip_prefix(&self.output).ok())
            {
                found.insert(relative.to_path_buf());
            }
        }

        Ok(found)
    }

    /// Dependencies are staged flat at the study root, their file names must differ
    fn check_dependencies(&self) -> Result<(), BuildError> {
        let mut staged: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, path) in self.spec.dependencies.iter() {
            if let Some(file_name) = path.file_name() {
                staged
                    .entry(file_name.to_string_lossy().into_owned())
                    .or_default()
                    .push(key.clone());
            }
        }

        match staged.into_iter().find(|(_, keys)| keys.len() > 1) {
            Some((file_name, keys)) => Err(BuildError::DependencyCollision { file_name, keys }),
            None => Ok(()),
        }
    }

    fn stage_dependencies(&self, base_dir: &Path) -> Result<(), BuildError> {
        let study_dir = self.study_dir();
        fs::create_dir_all(&study_dir).map_err(BuildError::io(&study_dir))?;

        for (key, path) in self.spec.dependencies.iter() {
            let source = base_dir.join(path);
            let Some(file_name) = source.file_name() else {
                continue;
            };
            let destination = study_dir.join(file_name);
            if destination.exists() {
                debug!(key = %key, "Dependency already staged");
                continue;
            }
            let content = fs::read(&source).map_err(BuildError::io(&source))?;
            write_atomically(&destination, content).map_err(BuildError::io(&destination))?;
        }

        Ok(())
    }

    // dependencies relative to a node folder, they are staged at the study root
    fn dependencies_for(&self, node: &PlannedNode) -> BTreeMap<String, String> {
        let depth = node.path.components().count() - 1;
        self.spec
            .dependencies
            .iter()
            .filter_map(|(key, path)| {
                path.file_name().map(|file_name| {
                    (
                        key.clone(),
                        format!("{}{}", "../".repeat(depth), file_name.to_string_lossy()),
                    )
                })
            })
            .collect()
    }

    fn render(&self, node: &PlannedNode) -> Result<String, BuildError> {
        let generation = self.generation(node.generation);

        // scanned values win over common parameters of the same name
        let mut parameters: Mapping = generation
            .spec
            .common_parameters
            .iter()
            .map(|(key, value)| (serde_yaml::Value::from(key.as_str()), value.clone()))
            .collect();
        parameters.extend(node.binding.to_mapping());

        let mut dependencies = self.dependencies_for(node);
        dependencies.remove(MAIN_CONFIGURATION);

        Ok(generation.template.render(
            &parameters,
            node.config.as_ref().map(|_| self.name_config),
            &dependencies,
        )?)
    }

    fn materialize(&self, node: &PlannedNode) -> Result<(), BuildError> {
        let directory = self.output.join(&node.path);
        let script = self.render(node)?;
        let generation = self.generation(node.generation);

        create_dir_atomically(&directory, |partial| {
            fs::write(partial.join(&generation.file_name), &script)?;
            if let Some(config) = &node.config {
                let content = config
                    .to_yaml_string()
                    .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
                fs::write(partial.join(self.name_config), content)?;
            }
            Ok(())
        })
        .map_err(BuildError::io(&directory))?;

        debug!(path = ?node.path, "Materialized node");
        Ok(())
    }

    /// Write missing nodes top-down and assemble the matching tree nodes
    fn assemble(
        &self,
        planned: &[PlannedNode],
        existing: &BTreeMap<PathBuf, TreeNode>,
        created: &mut usize,
    ) -> Result<Vec<TreeNode>, BuildError> {
        planned
            .iter()
            .map(|node| -> Result<TreeNode, BuildError> {
                let generation = self.generation(node.generation);
                let on_disk = self.output.join(&node.path).is_dir();

                let mut assembled = match existing.get(&node.path) {
                    Some(known) if on_disk => TreeNode {
                        children: Vec::new(),
                        ..known.clone()
                    },
                    known => {
                        if known.is_some() {
                            warn!(path = ?node.path, "Node folder disappeared, rebuilding it");
                        }
                        if !on_disk {
                            self.materialize(node)?;
                            *created += 1;
                        }
                        let mut fresh = TreeNode::new(
                            node.generation,
                            generation.name,
                            &node.segment,
                            node.path.clone(),
                            node.path.join(&generation.file_name),
                            node.binding.to_mapping(),
                        );
                        if on_disk {
                            fresh.status = adopted_status(&self.output.join(&node.path));
                            debug!(path = ?node.path, status = %fresh.status, "Adopted node found on disk");
                        }
                        fresh
                    }
                };

                assembled.children = self.assemble(&node.children, existing, created)?;
                Ok(assembled)
            })
            .collect()
    }
}

// a node found on disk without manifest entry keeps the outcome its sentinels recorded
fn adopted_status(directory: &Path) -> NodeStatus {
    match run_file::sentinel_status(directory) {
        Some(PollStatus::Finished) => NodeStatus::Finished,
        Some(PollStatus::Failed) => NodeStatus::Failed,
        _ => NodeStatus::NotSubmitted,
    }
}

/// Empty the study folder, keeping the lock of the running build
fn clear_study(study_dir: &Path) -> Result<(), BuildError> {
    let lock = lock_path(&study_dir.join(MANIFEST_NAME));
    for entry in fs::read_dir(study_dir).map_err(BuildError::io(study_dir))? {
        let path = entry.map_err(BuildError::io(study_dir))?.path();
        if path == lock {
            continue;
        }
        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(BuildError::io(&path))?;
        } else {
            fs::remove_file(&path).map_err(BuildError::io(&path))?;
        }
    }
    Ok(())
}

fn apply_binding(config: &mut ConfigDocument, binding: &Binding) -> Result<(), MutationError> {
    for bound in binding.iter() {
        match &bound.value {
            BoundValue::Scalar(value) => config.mutate(&bound.name, value.to_yaml())?,
            BoundValue::PerSubvariable { keys, value } => {
                config.mutate_subkeys(&bound.name, keys, &value.to_yaml())?
            }
        }
    }
    Ok(())
}

fn flatten(nodes: Vec<TreeNode>, into: &mut BTreeMap<PathBuf, TreeNode>) {
    for mut node in nodes {
        let children = std::mem::take(&mut node.children);
        into.insert(node.path.clone(), node);
        flatten(children, into);
    }
}

/// Build or extend the study described by `spec`.
///
/// `base_dir` is the folder of the scan file, against which templates and
/// dependencies are resolved. Nodes of `existing` that are still expected keep
/// their status, missing nodes are created and any node that the scan no longer
/// produces makes the build fail with [`BuildError::StaleTree`].
#[instrument(skip_all, fields(study = %spec.name))]
pub fn build(
    spec: &ScanSpec,
    base_dir: &Path,
    existing: Option<Tree>,
    options: &BuildOptions,
) -> Result<Tree, BuildError> {
    let builder = Builder::new(spec, base_dir, options)?;
    builder.check_dependencies()?;
    let root_config = builder.root_config(base_dir)?;
    let planned = builder.plan(root_config.as_ref())?;

    let mut existing = existing;
    let study_dir = builder.study_dir();
    if options.force_overwrite && study_dir.exists() {
        info!(path = ?study_dir, "Removing existing study");
        clear_study(&study_dir)?;
        existing = None;
    }

    let mut expected = BTreeSet::new();
    planned
        .iter()
        .for_each(|node| node.collect_paths(&mut expected));

    let metadata = existing
        .as_ref()
        .map(|tree| tree.metadata.clone())
        .unwrap_or_default();
    let mut known = BTreeMap::new();
    if let Some(tree) = existing {
        flatten(tree.roots, &mut known);
    }

    let stale = known
        .keys()
        .cloned()
        .chain(builder.discover()?)
        .filter(|path| !expected.contains(path))
        .collect::<BTreeSet<_>>();
    if !stale.is_empty() {
        return Err(BuildError::StaleTree {
            paths: stale.into_iter().collect(),
        });
    }

    builder.stage_dependencies(base_dir)?;

    let mut created = 0;
    let roots = builder.assemble(&planned, &known, &mut created)?;
    if let Some(recorded) = metadata
        .name_config
        .as_ref()
        .filter(|recorded| **recorded != options.name_config)
    {
        warn!(
            recorded = %recorded,
            name_config = %options.name_config,
            "Existing nodes use another configuration file name"
        );
    }
    let mut tree = Tree {
        name: spec.name.clone(),
        roots,
        metadata: StudyMetadata {
            absolute_path: builder.output.clone(),
            name_config: Some(options.name_config.clone()),
            ..metadata
        },
    };
    // adopted nodes may carry failures
    tree.propagate_blocks();
    tree.refresh_status();
    tree.save()?;

    info!(
        nodes = expected.len(),
        created,
        manifest = ?study_dir.join(MANIFEST_NAME),
        "Study is up to date"
    );
    Ok(tree)
}

/// Build a study made of a single job per generation, without any scan
pub fn build_single(
    spec: &ScanSpec,
    base_dir: &Path,
    existing: Option<Tree>,
    options: &BuildOptions,
) -> Result<Tree, BuildError> {
    if let Some((name, _)) = spec
        .structure
        .iter()
        .find(|(_, generation)| !generation.scans.is_empty())
    {
        return Err(BuildError::NotSingle(name.clone()));
    }

    build(spec, base_dir, existing, options)
}

/// Load a scan file, validate it and build its study next to it (or in `output_dir`)
pub fn create_study(
    scan: &Path,
    options: &BuildOptions,
    single: bool,
    overrides: Option<&Path>,
) -> Result<Tree, BuildError> {
    let mut spec = ScanSpec::load(scan)?;
    let base_dir = scan
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    if let Some(overrides) = overrides {
        let content = fs::read_to_string(overrides).map_err(BuildError::io(overrides))?;
        let overrides = serde_yaml::from_str(&content).map_err(|source| ConfigErrors::Parse {
            path: overrides.to_path_buf(),
            source,
        })?;
        spec.apply_overrides(&overrides)?;
    }

    if spec.preflight_checks(base_dir) {
        return Err(ConfigErrors::InvalidSpec(scan.to_path_buf()).into());
    }

    let study_dir = options.output_dir.as_deref().unwrap_or(base_dir).join(&spec.name);
    let manifest = study_dir.join(MANIFEST_NAME);
    let fresh = !study_dir.exists();
    fs::create_dir_all(&study_dir).map_err(BuildError::io(&study_dir))?;

    // the coordinator writes the same manifest
    let result = ManifestLock::acquire(&manifest)
        .map_err(BuildError::from)
        .and_then(|_lock| {
            let existing = if manifest.is_file() && !options.force_overwrite {
                Some(Tree::load(&manifest)?)
            } else {
                None
            };

            if single {
                build_single(&spec, base_dir, existing, options)
            } else {
                build(&spec, base_dir, existing, options)
            }
        });

    if result.is_err() && fresh {
        if let Err(error) = fs::remove_dir_all(&study_dir) {
            warn!(path = ?study_dir, "Failed to remove the folder of a failed build: {error}");
        }
    }
    result
}

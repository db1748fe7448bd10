//! Submission cycles over a study manifest.
//!
//! One cycle polls the submitted jobs, blocks the descendants of failed nodes,
//! then dispatches every node whose parent has finished. The manifest is saved
//! after each transition, an interrupted coordinator only forgets the job it
//! was submitting, which is submitted again on the next run.
use crate::{
    config::{BackendConfig, ConfigErrors, SubmitConfig, DEFAULT_NAME_CONFIG},
    executors::{
        local::LocalExecutor, ExecutionEnvironment, ExecutorError, Executors, Invocation, JobSpec,
        PollStatus, SubmissionType,
    },
    sync::locking::{LockError, ManifestLock},
    tree::{ManifestError, NodeStatus, StudyStatus, Tree},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Configuration(#[from] ConfigErrors),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Decide the backend of the jobs of a generation
pub trait BackendResolver {
    fn resolve(&mut self, generation: &str, file_name: &str) -> Result<BackendConfig, ConfigErrors>;
}

/// Backends taken from the submission configuration only
#[derive(Clone, Debug)]
pub struct ConfiguredBackends {
    config: SubmitConfig,
}

impl ConfiguredBackends {
    pub fn new(config: &SubmitConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn lookup(&self, generation: &str, file_name: &str) -> Option<BackendConfig> {
        self.config.backend_for(generation, file_name).cloned()
    }
}

impl BackendResolver for ConfiguredBackends {
    fn resolve(&mut self, generation: &str, file_name: &str) -> Result<BackendConfig, ConfigErrors> {
        self.lookup(generation, file_name)
            .ok_or_else(|| ConfigErrors::UnresolvedBackend(generation.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct SubmitPolicy {
    // wait for a whole generation to be done before dispatching the next one
    pub one_generation_at_a_time: bool,
    // keep cycling until the study is done
    pub keep_submit_until_done: bool,
    pub wait: Duration,
    pub max_cycles: Option<usize>,
}

impl Default for SubmitPolicy {
    fn default() -> Self {
        Self {
            one_generation_at_a_time: false,
            keep_submit_until_done: false,
            wait: Duration::from_secs(30 * 60),
            max_cycles: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    pub name: String,
    pub waiting: usize,
    pub queued_or_running: usize,
    pub submitted_now: usize,
    pub finished: usize,
    pub failed: usize,
    pub on_hold_blocked: usize,
}

/// Counts per generation after a cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub generations: BTreeMap<usize, GenerationSummary>,
    pub failed: Vec<PathBuf>,
    pub blocked: Vec<PathBuf>,
    pub status: StudyStatus,
}

impl Summary {
    pub fn collect(tree: &Tree, submitted_now: &BTreeSet<PathBuf>) -> Self {
        let mut generations: BTreeMap<usize, GenerationSummary> = BTreeMap::new();
        let mut failed = Vec::new();
        let mut blocked = Vec::new();

        for entry in tree.nodes() {
            let node = entry.node;
            let summary = generations
                .entry(node.generation)
                .or_insert_with(|| GenerationSummary {
                    name: node.generation_name.clone(),
                    ..GenerationSummary::default()
                });

            if submitted_now.contains(&node.path) {
                summary.submitted_now += 1;
            }
            match node.status {
                NodeStatus::NotSubmitted => summary.waiting += 1,
                NodeStatus::QueuedOrRunning => summary.queued_or_running += 1,
                NodeStatus::Finished => summary.finished += 1,
                NodeStatus::Failed => {
                    summary.failed += 1;
                    failed.push(node.path.clone());
                }
                NodeStatus::OnHoldBlocked => {
                    summary.on_hold_blocked += 1;
                    blocked.push(node.path.clone());
                }
            }
        }

        Self {
            generations,
            failed,
            blocked,
            status: tree.metadata.status,
        }
    }

    pub fn generation(&self, index: usize) -> Option<&GenerationSummary> {
        self.generations.get(&index)
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<24} {:>8} {:>8} {:>10} {:>9} {:>7} {:>8}",
            "generation", "waiting", "queued", "submitted", "finished", "failed", "blocked"
        )?;
        for summary in self.generations.values() {
            writeln!(
                f,
                "{:<24} {:>8} {:>8} {:>10} {:>9} {:>7} {:>8}",
                summary.name,
                summary.waiting,
                summary.queued_or_running,
                summary.submitted_now,
                summary.finished,
                summary.failed,
                summary.on_hold_blocked
            )?;
        }
        for path in &self.failed {
            writeln!(f, "failed: {}", path.to_string_lossy())?;
        }
        for path in &self.blocked {
            writeln!(f, "blocked: {}", path.to_string_lossy())?;
        }
        write!(f, "study status: {:?}", self.status)
    }
}

/// Nodes that can be dispatched, in generation order
pub fn eligible(tree: &Tree, one_generation_at_a_time: bool) -> Vec<PathBuf> {
    let nodes = tree.nodes();

    // generations whose previous generation is entirely done
    let mut open = BTreeSet::from([1]);
    if one_generation_at_a_time {
        for generation in 2..=tree.generation_count() {
            let previous_done = nodes
                .iter()
                .filter(|entry| entry.node.generation == generation - 1)
                .all(|entry| entry.node.status.is_terminal());
            if previous_done {
                open.insert(generation);
            }
        }
    }

    let mut eligible = nodes
        .iter()
        .filter(|entry| entry.node.status == NodeStatus::NotSubmitted)
        .filter(|entry| entry.parent_status() == NodeStatus::Finished)
        .filter(|entry| !one_generation_at_a_time || open.contains(&entry.node.generation))
        .map(|entry| (entry.node.generation, entry.node.path.clone()))
        .collect::<Vec<_>>();
    eligible.sort_by_key(|(generation, _)| *generation);

    eligible.into_iter().map(|(_, path)| path).collect()
}

/// Submission settings, the configuration wins over what the manifest recorded
pub(crate) fn environment(config: &SubmitConfig, tree: &Tree) -> ExecutionEnvironment {
    ExecutionEnvironment {
        python_environment: config
            .python_environment
            .clone()
            .or_else(|| tree.metadata.python_environment.clone()),
        python_environment_container: config
            .python_environment_container
            .clone()
            .or_else(|| tree.metadata.python_environment_container.clone()),
        container_image: config
            .container_image
            .clone()
            .or_else(|| tree.metadata.container_image.clone()),
        name_config: config
            .name_config
            .clone()
            .or_else(|| tree.metadata.name_config.clone())
            .unwrap_or_else(|| DEFAULT_NAME_CONFIG.to_string()),
        threads: config.threads,
        local_timeout: config.local_timeout.map(Duration::from_secs),
    }
}

pub struct Coordinator<R> {
    manifest: PathBuf,
    config: SubmitConfig,
    resolver: R,
    policy: SubmitPolicy,
}

impl<R: BackendResolver> Coordinator<R> {
    pub fn new(manifest: &Path, config: SubmitConfig, resolver: R, policy: SubmitPolicy) -> Self {
        Self {
            manifest: manifest.to_path_buf(),
            config,
            resolver,
            policy,
        }
    }

    fn persist(&self, tree: &Tree) -> Result<(), CoordinatorError> {
        tree.save()?;
        Ok(())
    }

    /// Attach a backend to every node that has none yet
    fn configure(&mut self, tree: &mut Tree) -> Result<(), CoordinatorError> {
        let pending = tree
            .nodes()
            .iter()
            .filter(|entry| entry.node.submission.submission_type.is_none())
            .map(|entry| {
                (
                    entry.node.path.clone(),
                    entry.node.generation_name.clone(),
                    entry
                        .node
                        .file
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                )
            })
            .collect::<Vec<_>>();

        let mut backends: BTreeMap<String, BackendConfig> = BTreeMap::new();
        for (path, generation, file_name) in &pending {
            let backend = match backends.get(generation) {
                Some(backend) => backend.clone(),
                None => {
                    let backend = self.resolver.resolve(generation, file_name)?;
                    backends.insert(generation.clone(), backend.clone());
                    backend
                }
            };
            if let Some(node) = tree.find_mut(path) {
                node.submission.submission_type = Some(backend.submission_type);
                node.submission.context = Some(backend.context);
                node.submission.htc_flavor = backend.htc_flavor;
            }
        }

        let metadata = &mut tree.metadata;
        let before = metadata.clone();
        if let Some(environment) = &self.config.python_environment {
            metadata.python_environment = Some(environment.clone());
        }
        if let Some(environment) = &self.config.python_environment_container {
            metadata.python_environment_container = Some(environment.clone());
        }
        if let Some(image) = &self.config.container_image {
            metadata.container_image = Some(image.clone());
        }
        metadata.configured = true;

        if !pending.is_empty() || *metadata != before {
            debug!(nodes = pending.len(), "Configured submission");
            self.persist(tree)?;
        }
        Ok(())
    }

    fn executor(&self, tree: &Tree, submission_type: SubmissionType) -> Executors {
        Executors::load(submission_type, &environment(&self.config, tree))
    }

    fn cleanup(&self, directory: &Path, generation: &str) {
        let Some(command) = self.config.generation(generation).cleanup_command else {
            return;
        };

        match Command::new("bash")
            .arg("-c")
            .arg(&command)
            .current_dir(directory)
            .status()
        {
            Ok(status) if status.success() => debug!(directory = ?directory, "Cleanup done"),
            Ok(status) => warn!(directory = ?directory, %status, "Cleanup command failed"),
            Err(error) => warn!(directory = ?directory, error = ?error, "Failed to run cleanup command"),
        }
    }

    /// Poll submitted jobs and block descendants of failures
    fn refresh(&self, tree: &mut Tree) -> Result<(), CoordinatorError> {
        let running = tree
            .nodes()
            .iter()
            .filter(|entry| entry.node.status == NodeStatus::QueuedOrRunning)
            .map(|entry| {
                (
                    entry.node.path.clone(),
                    entry.node.generation_name.clone(),
                    entry.node.submission.submission_type,
                    entry.node.submission.job_id.clone(),
                )
            })
            .collect::<Vec<_>>();

        for (path, generation, submission_type, job_id) in running {
            let Some(submission_type) = submission_type else {
                warn!(path = ?path, "Running node has no submission type, it can't be polled");
                continue;
            };
            let directory = tree.absolute(&path);
            let status = match self
                .executor(tree, submission_type)
                .poll(&directory, job_id.as_deref())
            {
                PollStatus::Pending => continue,
                PollStatus::Finished => NodeStatus::Finished,
                PollStatus::Failed => NodeStatus::Failed,
                PollStatus::Lost => {
                    warn!(path = ?path, "Job can't be tracked, it will be submitted again");
                    self.set_status(tree, &path, NodeStatus::NotSubmitted)?;
                    continue;
                }
            };

            if let Some(node) = tree.find_mut(&path) {
                node.status = status;
            }
            info!(path = ?path, %status, "Job completed");
            self.persist(tree)?;

            if status == NodeStatus::Finished {
                self.cleanup(&directory, &generation);
            }
        }

        let blocked = tree.propagate_blocks();
        if !blocked.is_empty() {
            warn!(count = blocked.len(), "Nodes blocked by a failed ancestor");
            self.persist(tree)?;
        }

        let before = tree.metadata.status;
        if tree.refresh_status() != before {
            info!(status = ?tree.metadata.status, "Study status changed");
            self.persist(tree)?;
        }

        Ok(())
    }

    fn set_status(&self, tree: &mut Tree, path: &Path, status: NodeStatus) -> Result<(), CoordinatorError> {
        if let Some(node) = tree.find_mut(path) {
            node.status = status;
        }
        self.persist(tree)
    }

    fn mark_submitted(
        &self,
        tree: &mut Tree,
        path: &Path,
        invocation: &Invocation,
        job_id: Option<String>,
    ) -> Result<(), CoordinatorError> {
        if let Some(node) = tree.find_mut(path) {
            node.status = NodeStatus::QueuedOrRunning;
            node.submission.path_run = Some(invocation.run_file.clone());
            node.submission.job_id = job_id;
        }
        self.persist(tree)
    }

    // failed submissions are either retried on the next cycle or final
    fn handle_rejection(
        &self,
        tree: &mut Tree,
        path: &Path,
        error: &ExecutorError,
    ) -> Result<(), CoordinatorError> {
        if error.is_transient() {
            warn!(path = ?path, "Submission failed, retrying on the next cycle: {error}");
            self.set_status(tree, path, NodeStatus::NotSubmitted)
        } else {
            error!(path = ?path, "Submission failed: {error}");
            self.set_status(tree, path, NodeStatus::Failed)
        }
    }

    fn dispatch(
        &self,
        tree: &mut Tree,
        eligible: Vec<PathBuf>,
    ) -> Result<BTreeSet<PathBuf>, CoordinatorError> {
        let mut submitted = BTreeSet::new();
        let mut local_batch: Vec<Invocation> = Vec::new();

        for path in eligible {
            let Some(node) = tree.find(&path) else {
                continue;
            };
            let Some(submission_type) = node.submission.submission_type else {
                warn!(path = ?path, "Node has no backend, skipping");
                continue;
            };
            let job = JobSpec {
                path: path.clone(),
                directory: tree.absolute(&node.path),
                script: tree.absolute(&node.file),
                generation_name: node.generation_name.clone(),
                backend: BackendConfig {
                    submission_type,
                    context: node.submission.context.unwrap_or_default(),
                    htc_flavor: node.submission.htc_flavor,
                    interpreter: self
                        .config
                        .backend_for(
                            &node.generation_name,
                            &node.file.file_name().unwrap_or_default().to_string_lossy(),
                        )
                        .and_then(|backend| backend.interpreter.clone()),
                },
                settings: self.config.generation(&node.generation_name),
                run_file: node.submission.path_run.clone(),
            };

            let executor = self.executor(tree, submission_type);
            let invocation = match executor.prepare(&job) {
                Ok(invocation) => invocation,
                Err(error) => {
                    self.handle_rejection(tree, &path, &error)?;
                    continue;
                }
            };

            match executor {
                Executors::Local(_) => {
                    // local jobs are tracked through their pid file while running
                    self.mark_submitted(tree, &path, &invocation, None)?;
                    local_batch.push(invocation);
                }
                // status and job id are recorded together, a node is never
                // queued without the id that allows polling it
                executor => match executor.dispatch(&invocation) {
                    Ok(job_id) => {
                        info!(path = ?path, job_id = ?job_id, "Submitted");
                        self.mark_submitted(tree, &path, &invocation, job_id)?;
                        submitted.insert(path);
                    }
                    Err(error) => self.handle_rejection(tree, &path, &error)?,
                },
            }
        }

        if !local_batch.is_empty() {
            let local = LocalExecutor::load(environment(&self.config, tree));
            for (invocation, result) in local.dispatch_all(local_batch) {
                match result {
                    Ok(_) => {
                        submitted.insert(invocation.path);
                    }
                    Err(error) => self.handle_rejection(tree, &invocation.path, &error)?,
                }
            }
        }

        Ok(submitted)
    }

    /// Run a single submission cycle on the manifest
    #[instrument(skip(self), fields(manifest = ?self.manifest))]
    pub fn cycle(&mut self) -> Result<Summary, CoordinatorError> {
        let mut tree = Tree::load(&self.manifest)?;
        self.configure(&mut tree)?;
        self.refresh(&mut tree)?;

        let submitted = if tree.metadata.status.is_terminal() {
            BTreeSet::new()
        } else {
            let eligible = eligible(&tree, self.policy.one_generation_at_a_time);
            debug!(count = eligible.len(), "Eligible nodes");
            self.dispatch(&mut tree, eligible)?
        };

        // local jobs are already done at this point
        self.refresh(&mut tree)?;
        Ok(Summary::collect(&tree, &submitted))
    }

    /// Submit the study, cycling until done if the policy asks for it
    pub fn submit(&mut self) -> Result<Summary, CoordinatorError> {
        let _lock = ManifestLock::acquire(&self.manifest)?;

        let mut cycles = 0;
        loop {
            let summary = self.cycle()?;
            cycles += 1;
            info!("Cycle {cycles} done\n{summary}");

            let exhausted = self
                .policy
                .max_cycles
                .map_or(false, |max_cycles| cycles >= max_cycles);
            if !self.policy.keep_submit_until_done || summary.status.is_terminal() || exhausted {
                return Ok(summary);
            }

            debug!(wait = ?self.policy.wait, "Waiting before the next cycle");
            std::thread::sleep(self.policy.wait);
        }
    }

    /// Refresh the job statuses without submitting anything.
    ///
    /// When another coordinator holds the manifest, the persisted state is
    /// reported as is.
    pub fn status(&mut self) -> Result<Summary, CoordinatorError> {
        let lock = match ManifestLock::acquire(&self.manifest) {
            Ok(lock) => Some(lock),
            Err(LockError::Held { owner, .. }) => {
                warn!(owner = %owner, "Manifest is in use, reporting the last persisted state");
                None
            }
            Err(error) => return Err(error.into()),
        };

        let mut tree = Tree::load(&self.manifest)?;
        if lock.is_some() {
            self.refresh(&mut tree)?;
        }

        Ok(Summary::collect(&tree, &BTreeSet::new()))
    }
}

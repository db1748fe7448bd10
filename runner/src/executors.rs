pub mod htc;
pub mod local;
pub mod run_file;
pub mod slurm;

use crate::config::{BackendConfig, GenerationSubmitConfig};
use serde::{Deserialize, Serialize};
use std::{
    fmt, io,
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionType {
    Local,
    Slurm,
    SlurmDocker,
    Htc,
    HtcDocker,
}

impl SubmissionType {
    pub const ALL: [SubmissionType; 5] = [
        Self::Local,
        Self::Slurm,
        Self::SlurmDocker,
        Self::Htc,
        Self::HtcDocker,
    ];

    pub fn is_containerized(self) -> bool {
        matches!(self, Self::SlurmDocker | Self::HtcDocker)
    }

    pub fn is_htc(self) -> bool {
        matches!(self, Self::Htc | Self::HtcDocker)
    }
}

impl fmt::Display for SubmissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Slurm => "slurm",
            Self::SlurmDocker => "slurm_docker",
            Self::Htc => "htc",
            Self::HtcDocker => "htc_docker",
        };
        f.write_str(name)
    }
}

impl FromStr for SubmissionType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.to_string() == value)
            .ok_or_else(|| format!("unknown submission type '{value}'"))
    }
}

/// Hardware the job runs on, GPU contexts request a GPU from the scheduler
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Context {
    #[default]
    Cpu,
    Cupy,
    Opencl,
}

impl Context {
    pub fn requests_gpu(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Cupy => "cupy",
            Self::Opencl => "opencl",
        };
        f.write_str(name)
    }
}

/// HTCondor job flavours, i.e. maximum wall time
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HtcFlavor {
    #[default]
    Espresso,
    Microcentury,
    Longlunch,
    Workday,
    Tomorrow,
    Testmatch,
    Nextweek,
}

impl fmt::Display for HtcFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Espresso => "espresso",
            Self::Microcentury => "microcentury",
            Self::Longlunch => "longlunch",
            Self::Workday => "workday",
            Self::Tomorrow => "tomorrow",
            Self::Testmatch => "testmatch",
            Self::Nextweek => "nextweek",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Malformed submission for {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("Failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} rejected the submission: {stderr}")]
    Rejected { command: String, stderr: String },
    #[error("No job id in the output of {command}: {output}")]
    MissingJobId { command: String, output: String },
}

impl ExecutorError {
    /// Transient errors leave the job untouched so it is retried on the next cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. } | Self::Rejected { .. } | Self::MissingJobId { .. }
        )
    }
}

/// Result of checking a submitted job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Finished,
    Failed,
    // no sentinel and no job id to look the job up with
    Lost,
}

/// Settings shared by every job of a submission
#[derive(Clone, Debug, Default)]
pub struct ExecutionEnvironment {
    pub python_environment: Option<PathBuf>,
    pub python_environment_container: Option<PathBuf>,
    pub container_image: Option<PathBuf>,
    pub name_config: String,
    pub threads: Option<usize>,
    pub local_timeout: Option<Duration>,
}

/// Everything needed to submit one node
#[derive(Clone, Debug)]
pub struct JobSpec {
    // node identifier, relative to the folder containing the study
    pub path: PathBuf,
    // absolute node folder
    pub directory: PathBuf,
    // absolute generation script
    pub script: PathBuf,
    pub generation_name: String,
    pub backend: BackendConfig,
    pub settings: GenerationSubmitConfig,
    // run file of an earlier submission, reused as is
    pub run_file: Option<PathBuf>,
}

/// A prepared job, ready to be handed to its backend
#[derive(Clone, Debug)]
pub struct Invocation {
    pub path: PathBuf,
    pub directory: PathBuf,
    pub run_file: PathBuf,
    pub command: Vec<String>,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

pub trait Executor {
    /// Write the run file (and submission descriptor) of a job
    fn prepare(&self, job: &JobSpec) -> Result<Invocation, ExecutorError>;

    /// Submit a prepared job, returns the backend job id if there is one
    fn dispatch(&self, invocation: &Invocation) -> Result<Option<String>, ExecutorError>;

    /// Check a submitted job, an unreachable backend reports `Pending`
    fn poll(&self, directory: &Path, job_id: Option<&str>) -> PollStatus;
}

#[derive(Clone, Debug)]
pub enum Executors {
    Local(local::LocalExecutor),
    Slurm(slurm::SlurmExecutor),
    Htc(htc::HtcExecutor),
}

impl Executors {
    pub fn load(submission_type: SubmissionType, environment: &ExecutionEnvironment) -> Self {
        match submission_type {
            SubmissionType::Local => Self::Local(local::LocalExecutor::load(environment.clone())),
            SubmissionType::Slurm | SubmissionType::SlurmDocker => Self::Slurm(
                slurm::SlurmExecutor::load(environment.clone(), submission_type.is_containerized()),
            ),
            SubmissionType::Htc | SubmissionType::HtcDocker => Self::Htc(htc::HtcExecutor::load(
                environment.clone(),
                submission_type.is_containerized(),
            )),
        }
    }

    fn inner(&self) -> &dyn Executor {
        match self {
            Self::Local(executor) => executor,
            Self::Slurm(executor) => executor,
            Self::Htc(executor) => executor,
        }
    }

    pub fn prepare(&self, job: &JobSpec) -> Result<Invocation, ExecutorError> {
        self.inner().prepare(job)
    }

    pub fn dispatch(&self, invocation: &Invocation) -> Result<Option<String>, ExecutorError> {
        self.inner().dispatch(invocation)
    }

    pub fn poll(&self, directory: &Path, job_id: Option<&str>) -> PollStatus {
        self.inner().poll(directory, job_id)
    }
}

/// Presence of a job in a batch queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueueState {
    Present,
    Absent,
    Unknown,
}

/// Run a submission command and return its standard output
pub(crate) fn submit_command(command: &[String]) -> Result<String, ExecutorError> {
    let Some((program, arguments)) = command.split_first() else {
        return Err(ExecutorError::Rejected {
            command: String::new(),
            stderr: "empty command".into(),
        });
    };

    let output = Command::new(program)
        .args(arguments)
        .output()
        .map_err(|source| ExecutorError::Spawn {
            command: command.join(" "),
            source,
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(ExecutorError::Rejected {
            command: command.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Sentinels first, then the queue. A job that left the queue without tagging
/// its folder has crashed.
pub(crate) fn poll_queued<F>(directory: &Path, job_id: Option<&str>, query: F) -> PollStatus
where
    F: Fn(&str) -> QueueState,
{
    if let Some(status) = run_file::sentinel_status(directory) {
        return status;
    }

    let Some(job_id) = job_id else {
        warn!(directory = ?directory, "Job has no id and no sentinel, it can't be tracked");
        return PollStatus::Lost;
    };

    match query(job_id) {
        QueueState::Present | QueueState::Unknown => PollStatus::Pending,
        // the job may have tagged its folder in between
        QueueState::Absent => run_file::sentinel_status(directory).unwrap_or_else(|| {
            debug!(job_id, "Job left the queue without a sentinel");
            PollStatus::Failed
        }),
    }
}

/// Job id of a cluster submission, a submission that can't be tracked is an error
pub(crate) fn require_job_id(
    invocation: &Invocation,
    output: &str,
    marker: &str,
) -> Result<String, ExecutorError> {
    parse_job_id(output, marker).ok_or_else(|| ExecutorError::MissingJobId {
        command: invocation.command_line(),
        output: output.trim().to_string(),
    })
}

/// Word following `marker` in a submission output, without trailing punctuation
pub(crate) fn parse_job_id(output: &str, marker: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(marker)?;
        let id = rest
            .split_whitespace()
            .next()?
            .trim_end_matches('.')
            .to_string();
        (!id.is_empty()).then_some(id)
    })
}

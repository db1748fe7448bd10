use super::{
    poll_queued, require_job_id,
    run_file::{self, quote, RunFile},
    submit_command, ExecutionEnvironment, Executor, ExecutorError, Invocation, JobSpec,
    PollStatus, QueueState,
};
use std::{fmt::Write as _, path::Path, process::Command};
use tracing::{debug, instrument};

pub const DESCRIPTOR_FILE: &str = "submission.sbatch";
const SUBMITTED_MARKER: &str = "Submitted batch job";

/// Executor submitting jobs to Slurm with `sbatch`, optionally inside a container
#[derive(Clone, Debug)]
pub struct SlurmExecutor {
    environment: ExecutionEnvironment,
    containerized: bool,
}

impl SlurmExecutor {
    pub fn load(environment: ExecutionEnvironment, containerized: bool) -> Self {
        Self {
            environment,
            containerized,
        }
    }

    fn options(job: &JobSpec) -> Vec<String> {
        let mut options = vec![
            format!("--job-name={}", job.generation_name),
            "--ntasks=2".to_string(),
            format!("--output={}", job.directory.join("slurm.out").to_string_lossy()),
            format!("--error={}", job.directory.join("slurm.err").to_string_lossy()),
        ];
        if job.backend.context.requests_gpu() {
            options.push("--gres=gpu:1".to_string());
        }
        options
    }

    /// Batch script running the run file inside the container image
    pub fn descriptor(job: &JobSpec, image: &Path, run_file: &Path) -> String {
        let mut out = String::from("#!/bin/bash\n");
        for option in Self::options(job) {
            let _ = writeln!(out, "#SBATCH {option}");
        }
        let nv = if job.backend.context.requests_gpu() {
            "--nv "
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "singularity exec {nv}{} bash {}",
            quote(image.to_string_lossy()),
            quote(run_file.to_string_lossy())
        );
        out
    }
}

impl Executor for SlurmExecutor {
    fn prepare(&self, job: &JobSpec) -> Result<Invocation, ExecutorError> {
        let image = match (self.containerized, &self.environment.container_image) {
            (true, None) => {
                return Err(ExecutorError::Malformed {
                    path: job.path.clone(),
                    reason: "slurm_docker requires a container image".into(),
                })
            }
            (true, Some(image)) => Some(image),
            (false, _) => None,
        };

        run_file::clear_sentinels(&job.directory)?;
        let python_environment = if self.containerized {
            self.environment.python_environment_container.as_deref()
        } else {
            self.environment.python_environment.as_deref()
        };
        let run_file = run_file::ensure_run_file(job, || {
            RunFile::for_job(job, python_environment).render_in_place()
        })?;

        let command = match image {
            Some(image) => {
                let descriptor = job.directory.join(DESCRIPTOR_FILE);
                run_file::write_executable(&descriptor, &Self::descriptor(job, image, &run_file))?;
                vec![
                    "sbatch".to_string(),
                    descriptor.to_string_lossy().into_owned(),
                ]
            }
            None => std::iter::once("sbatch".to_string())
                .chain(Self::options(job))
                .chain(std::iter::once(run_file.to_string_lossy().into_owned()))
                .collect(),
        };

        Ok(Invocation {
            path: job.path.clone(),
            directory: job.directory.clone(),
            run_file,
            command,
        })
    }

    #[instrument(skip_all, fields(path = ?invocation.path))]
    fn dispatch(&self, invocation: &Invocation) -> Result<Option<String>, ExecutorError> {
        let output = submit_command(&invocation.command)?;
        let job_id = require_job_id(invocation, &output, SUBMITTED_MARKER)?;
        debug!(job_id = %job_id, "Submitted to Slurm");
        Ok(Some(job_id))
    }

    fn poll(&self, directory: &Path, job_id: Option<&str>) -> PollStatus {
        poll_queued(directory, job_id, |job_id| {
            match Command::new("squeue")
                .args(["-h", "-j", job_id, "-o", "%T"])
                .output()
            {
                Ok(output) if output.status.success() => {
                    if String::from_utf8_lossy(&output.stdout).trim().is_empty() {
                        QueueState::Absent
                    } else {
                        QueueState::Present
                    }
                }
                // squeue rejects ids that were purged from the controller
                Ok(output)
                    if String::from_utf8_lossy(&output.stderr).contains("Invalid job id") =>
                {
                    QueueState::Absent
                }
                Ok(_) | Err(_) => QueueState::Unknown,
            }
        })
    }
}

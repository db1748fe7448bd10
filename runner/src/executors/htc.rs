use super::{
    poll_queued, require_job_id,
    run_file::{self, RunFile},
    submit_command, ExecutionEnvironment, Executor, ExecutorError, Invocation, JobSpec,
    PollStatus, QueueState,
};
use crate::mutation::ConfigDocument;
use serde_yaml::Value;
use std::{fmt::Write as _, path::Path, process::Command};
use tracing::{debug, instrument};

pub const DESCRIPTOR_FILE: &str = "htc.sub";
const SUBMITTED_MARKER: &str = "submitted to cluster";

/// Executor submitting jobs to HTCondor with `condor_submit`
#[derive(Clone, Debug)]
pub struct HtcExecutor {
    environment: ExecutionEnvironment,
    containerized: bool,
}

impl HtcExecutor {
    pub fn load(environment: ExecutionEnvironment, containerized: bool) -> Self {
        Self {
            environment,
            containerized,
        }
    }

    pub fn descriptor(&self, job: &JobSpec, run_file: &Path) -> String {
        let directory = job.directory.to_string_lossy();
        let mut out = String::new();
        let _ = writeln!(out, "universe = vanilla");
        let _ = writeln!(out, "executable = {}", run_file.to_string_lossy());
        let _ = writeln!(out, "output = {directory}/htc.out");
        let _ = writeln!(out, "error = {directory}/htc.err");
        let _ = writeln!(out, "log = {directory}/htc.log");
        let _ = writeln!(out, "should_transfer_files = YES");
        let _ = writeln!(
            out,
            "+JobFlavour = \"{}\"",
            job.backend.htc_flavor.unwrap_or_default()
        );
        if job.backend.context.requests_gpu() {
            let _ = writeln!(out, "request_GPUs = 1");
        }
        if let (true, Some(image)) = (self.containerized, &self.environment.container_image) {
            let _ = writeln!(out, "+SingularityImage = \"{}\"", image.to_string_lossy());
        }
        let _ = writeln!(out, "queue");
        out
    }

    // jobs run in a scratch folder, relative paths of the configuration must be
    // made absolute before the first submission
    fn absolutize_dependencies(&self, job: &JobSpec) -> Result<(), ExecutorError> {
        if job.settings.dependencies.is_empty() {
            return Ok(());
        }

        let path = job.directory.join(&self.environment.name_config);
        let malformed = |reason: String| ExecutorError::Malformed {
            path: job.path.clone(),
            reason,
        };

        let mut document = ConfigDocument::load(&path).map_err(|error| malformed(error.to_string()))?;
        for key in &job.settings.dependencies {
            let value = document.get(key).map_err(|error| malformed(error.to_string()))?;
            let Some(relative) = value.as_str().filter(|value| !Path::new(value).is_absolute())
            else {
                continue;
            };
            let absolute = job.directory.join(relative);
            debug!(key = %key, path = ?absolute, "Making dependency absolute");
            document
                .mutate(key, Value::from(absolute.to_string_lossy().into_owned()))
                .map_err(|error| malformed(error.to_string()))?;
        }

        document
            .dump(&path)
            .map_err(|error| malformed(error.to_string()))
    }
}

impl Executor for HtcExecutor {
    fn prepare(&self, job: &JobSpec) -> Result<Invocation, ExecutorError> {
        if self.containerized && self.environment.container_image.is_none() {
            return Err(ExecutorError::Malformed {
                path: job.path.clone(),
                reason: "htc_docker requires a container image".into(),
            });
        }

        run_file::clear_sentinels(&job.directory)?;
        if job.run_file.is_none() {
            self.absolutize_dependencies(job)?;
        }

        let python_environment = if self.containerized {
            self.environment.python_environment_container.as_deref()
        } else {
            self.environment.python_environment.as_deref()
        };
        let run_file = run_file::ensure_run_file(job, || {
            RunFile::for_job(job, python_environment)
                .render_scratch(&self.environment.name_config, &job.settings.copy_back)
        })?;

        let descriptor = job.directory.join(DESCRIPTOR_FILE);
        run_file::write_executable(&descriptor, &self.descriptor(job, &run_file))?;

        Ok(Invocation {
            path: job.path.clone(),
            directory: job.directory.clone(),
            run_file,
            command: vec![
                "condor_submit".to_string(),
                descriptor.to_string_lossy().into_owned(),
            ],
        })
    }

    #[instrument(skip_all, fields(path = ?invocation.path))]
    fn dispatch(&self, invocation: &Invocation) -> Result<Option<String>, ExecutorError> {
        let output = submit_command(&invocation.command)?;
        let job_id = require_job_id(invocation, &output, SUBMITTED_MARKER)?;
        debug!(job_id = %job_id, "Submitted to HTCondor");
        Ok(Some(job_id))
    }

    fn poll(&self, directory: &Path, job_id: Option<&str>) -> PollStatus {
        poll_queued(directory, job_id, |job_id| {
            match Command::new("condor_q")
                .args([job_id, "-af", "JobStatus"])
                .output()
            {
                Ok(output) if output.status.success() => {
                    match String::from_utf8_lossy(&output.stdout).trim() {
                        // 3: removed, 4: completed
                        "" | "3" | "4" => QueueState::Absent,
                        _ => QueueState::Present,
                    }
                }
                Ok(_) | Err(_) => QueueState::Unknown,
            }
        })
    }
}

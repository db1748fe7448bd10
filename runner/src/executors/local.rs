use super::{
    run_file::{self, RunFile, FAILED_SENTINEL, PID_FILE},
    ExecutionEnvironment, Executor, ExecutorError, Invocation, JobSpec, PollStatus,
};
use crate::sync::locking::process_alive;
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    fs,
    os::unix::process::CommandExt,
    path::Path,
    process::{Command, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

/// Executor that runs jobs on the local machine
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    environment: ExecutionEnvironment,
}

impl LocalExecutor {
    pub fn load(environment: ExecutionEnvironment) -> Self {
        Self { environment }
    }

    /// Run prepared jobs concurrently with a thread pool, blocking until all are done
    #[instrument(skip_all, fields(jobs = invocations.len()), level = "info")]
    pub fn dispatch_all(
        &self,
        invocations: Vec<Invocation>,
    ) -> Vec<(Invocation, Result<Option<String>, ExecutorError>)> {
        let threads = self
            .environment
            .threads
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, usize::from));
        debug!("Starting thread pool with {threads} threads");

        let total = invocations.len() as u64;
        let processed = AtomicU64::new(0);
        let run = |invocation: Invocation| {
            let result = self.dispatch(&invocation);
            info!(
                "Done with {}/{total}",
                processed.fetch_add(1, Ordering::SeqCst) + 1
            );
            (invocation, result)
        };

        match ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => pool.install(|| invocations.into_par_iter().map(run).collect()),
            Err(error) => {
                warn!(error = ?error, "Failed to build thread pool, running jobs sequentially");
                invocations.into_iter().map(run).collect()
            }
        }
    }
}

impl Executor for LocalExecutor {
    fn prepare(&self, job: &JobSpec) -> Result<Invocation, ExecutorError> {
        run_file::clear_sentinels(&job.directory)?;
        let run_file = run_file::ensure_run_file(job, || {
            RunFile::for_job(job, self.environment.python_environment.as_deref())
                .render_in_place()
        })?;

        Ok(Invocation {
            path: job.path.clone(),
            directory: job.directory.clone(),
            command: vec!["bash".to_string(), run_file.to_string_lossy().into_owned()],
            run_file,
        })
    }

    #[instrument(skip_all, fields(path = ?invocation.path))]
    fn dispatch(&self, invocation: &Invocation) -> Result<Option<String>, ExecutorError> {
        let start = Instant::now();
        let mut child = Command::new("bash")
            .arg(&invocation.run_file)
            .current_dir(&invocation.directory)
            // own process group so a timeout also takes down the generation script
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                command: invocation.command_line(),
                source,
            })?;

        let waited = match self.environment.local_timeout {
            Some(timeout) => child.wait_timeout(timeout),
            None => child.wait().map(Some),
        };

        match waited {
            Ok(Some(status)) => {
                debug!(
                    "Finished in {} ms | status: {}",
                    start.elapsed().as_millis(),
                    status.success()
                );
            }
            Ok(None) => {
                warn!("Job exceeded its timeout, killing it");
                let group = nix::unistd::Pid::from_raw(child.id() as i32);
                if let Err(error) = nix::sys::signal::killpg(group, nix::sys::signal::SIGKILL) {
                    warn!(error = ?error, "Failed to kill process group");
                }
                let _ = child.wait();
                let sentinel = invocation.directory.join(FAILED_SENTINEL);
                fs::write(&sentinel, b"").map_err(|source| ExecutorError::Io {
                    path: sentinel,
                    source,
                })?;
            }
            Err(error) => warn!(error = ?error, "Failed to wait for job"),
        }

        Ok(None)
    }

    fn poll(&self, directory: &Path, _job_id: Option<&str>) -> PollStatus {
        if let Some(status) = run_file::sentinel_status(directory) {
            return status;
        }

        let pid = fs::read_to_string(directory.join(PID_FILE))
            .ok()
            .and_then(|pid| pid.trim().parse::<i32>().ok());
        match pid {
            Some(pid) if process_alive(pid) => PollStatus::Pending,
            // a job that died without tagging its folder has crashed
            _ => PollStatus::Failed,
        }
    }
}

//! Shell wrappers executed on behalf of a node.
//!
//! The run file records its pid, runs the generation script and tags the node
//! folder with a `.finished` or `.failed` sentinel, which is what polling relies on.
use super::{ExecutorError, JobSpec, PollStatus};
use crate::{config::CopyBack, sync::write_atomically};
use std::{
    fmt::Write as _,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const RUN_FILE: &str = "run.sh";
pub const FINISHED_SENTINEL: &str = ".finished";
pub const FAILED_SENTINEL: &str = ".failed";
pub const PID_FILE: &str = ".pid";
pub const OUTPUT_FILE: &str = "output_job.txt";
pub const ERROR_FILE: &str = "error_job.txt";

/// Quote a value for a POSIX shell
pub fn quote(value: impl AsRef<str>) -> String {
    format!("'{}'", value.as_ref().replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    quote(path.to_string_lossy())
}

/// Status reported by the sentinels of a node folder, if any
pub fn sentinel_status(directory: &Path) -> Option<PollStatus> {
    if directory.join(FINISHED_SENTINEL).exists() {
        Some(PollStatus::Finished)
    } else if directory.join(FAILED_SENTINEL).exists() {
        Some(PollStatus::Failed)
    } else {
        None
    }
}

/// Remove sentinels of an earlier attempt before resubmitting
pub fn clear_sentinels(directory: &Path) -> Result<(), ExecutorError> {
    for sentinel in [FINISHED_SENTINEL, FAILED_SENTINEL, PID_FILE] {
        let path = directory.join(sentinel);
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = ?path, "Removed stale sentinel"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ExecutorError::Io { path, source }),
        }
    }
    Ok(())
}

/// Activation script of a python environment given as folder or script
pub fn activation_script(environment: &Path) -> PathBuf {
    if environment.ends_with("activate") {
        environment.to_path_buf()
    } else {
        environment.join("bin").join("activate")
    }
}

/// Command used to run a generation script
pub fn interpreter(script: &Path, configured: Option<&str>) -> Option<String> {
    if let Some(configured) = configured {
        return Some(configured.to_string());
    }
    match script.extension().and_then(|extension| extension.to_str()) {
        Some("py") => Some("python".to_string()),
        Some("sh") | Some("bash") => Some("bash".to_string()),
        _ => None,
    }
}

/// Inputs of a run file
pub struct RunFile<'a> {
    pub directory: &'a Path,
    pub script: &'a Path,
    pub interpreter: Option<String>,
    pub activate: Option<PathBuf>,
    pub additional_command: Option<&'a str>,
}

impl RunFile<'_> {
    pub fn for_job<'a>(job: &'a JobSpec, environment: Option<&Path>) -> RunFile<'a> {
        RunFile {
            directory: &job.directory,
            script: &job.script,
            interpreter: interpreter(&job.script, job.backend.interpreter.as_deref()),
            activate: environment.map(activation_script),
            additional_command: job.settings.additional_command.as_deref(),
        }
    }

    fn run_line(&self) -> String {
        let script = quote_path(self.script);
        match &self.interpreter {
            Some(interpreter) => {
                format!("{interpreter} {script} > {OUTPUT_FILE} 2> {ERROR_FILE}")
            }
            None => format!("{script} > {OUTPUT_FILE} 2> {ERROR_FILE}"),
        }
    }

    fn header(&self, out: &mut String) {
        let directory = quote_path(self.directory);
        let _ = writeln!(out, "#!/bin/bash");
        let _ = writeln!(out, "echo $$ > {directory}/{PID_FILE}");
        if let Some(activate) = &self.activate {
            let _ = writeln!(out, "source {}", quote_path(activate));
        }
    }

    fn tag(&self, out: &mut String, status: &str) {
        let directory = quote_path(self.directory);
        let _ = writeln!(out, "if [ {status} -eq 0 ]; then");
        let _ = writeln!(out, "    touch {directory}/{FINISHED_SENTINEL}");
        let _ = writeln!(out, "else");
        let _ = writeln!(out, "    touch {directory}/{FAILED_SENTINEL}");
        let _ = writeln!(out, "fi");
    }

    fn footer(&self, out: &mut String) {
        let _ = writeln!(out, "path_job={}", quote_path(self.directory));
        if let Some(command) = self.additional_command {
            let _ = writeln!(out, "{command}");
        }
    }

    /// Run file for jobs executed in the node folder (local and Slurm)
    pub fn render_in_place(&self) -> String {
        let mut out = String::new();
        self.header(&mut out);
        let _ = writeln!(out, "cd {} || exit 1", quote_path(self.directory));
        let _ = writeln!(out, "{}", self.run_line());
        self.tag(&mut out, "$?");
        self.footer(&mut out);
        out
    }

    /// Run file for HTCondor jobs, which run in a scratch folder of the worker
    /// and copy their results back
    pub fn render_scratch(&self, name_config: &str, copy_back: &CopyBack) -> String {
        let directory = quote_path(self.directory);
        let mut out = String::new();
        self.header(&mut out);
        let _ = writeln!(out, "cp -f {directory}/{} . 2>/dev/null", quote(name_config));
        let _ = writeln!(out, "{}", self.run_line());
        let _ = writeln!(out, "job_status=$?");
        let _ = writeln!(out, "rm -f {}", quote(name_config));
        for pattern in copy_back.patterns() {
            if pattern == "*" {
                let _ = writeln!(out, "cp -rf * {directory}/ 2>/dev/null");
            } else {
                let _ = writeln!(out, "cp -f {pattern} {directory}/ 2>/dev/null");
            }
        }
        self.tag(&mut out, "$job_status");
        self.footer(&mut out);
        out
    }
}

/// Write an executable file, replacing any previous content atomically
pub fn write_executable(path: &Path, content: &str) -> Result<(), ExecutorError> {
    let io_error = |source| ExecutorError::Io {
        path: path.to_path_buf(),
        source,
    };

    write_atomically(path, content).map_err(io_error)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(io_error)
}

/// Reuse the run file of an earlier submission or write a new one
pub fn ensure_run_file<F>(job: &JobSpec, render: F) -> Result<PathBuf, ExecutorError>
where
    F: FnOnce() -> String,
{
    if let Some(existing) = job.run_file.as_ref().filter(|path| path.is_file()) {
        debug!(path = ?existing, "Reusing run file");
        return Ok(existing.clone());
    }

    let path = job.directory.join(RUN_FILE);
    write_executable(&path, &render())?;
    Ok(path)
}

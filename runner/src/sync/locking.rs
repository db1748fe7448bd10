use once_cell::sync::Lazy;
use std::{
    ffi::OsString,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, warn};

pub static LOCK_SUFFIX: Lazy<OsString> = Lazy::new(|| {
    let mut string = OsString::new();
    string.push(".lock");
    string
});

#[derive(Error, Debug)]
pub enum LockError {
    #[error("{path} is held by {owner}, another coordinator is working on this study")]
    Held { path: PathBuf, owner: String },
    #[error("Failed to retrieve hostname for the lock owner")]
    Hostname(#[source] nix::Error),
    #[error("Failed to access lock file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive ownership of a manifest, released on drop
#[derive(Debug)]
pub struct ManifestLock {
    path: PathBuf,
}

/// `hostname:pid` of the current process
pub fn owner_id() -> Result<String, LockError> {
    let hostname = nix::unistd::gethostname().map_err(LockError::Hostname)?;
    Ok(format!(
        "{}:{}",
        hostname.to_string_lossy(),
        nix::unistd::getpid()
    ))
}

/// Check if a process of this host is still alive
pub fn process_alive(pid: i32) -> bool {
    // signal 0 only performs the permission and existence checks
    match nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        None::<nix::sys::signal::Signal>,
    ) {
        Ok(()) => true,
        // exists but belongs to someone else
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn lock_path(manifest: &Path) -> PathBuf {
    let mut file_name = manifest.file_name().unwrap_or_default().to_os_string();
    file_name.push(LOCK_SUFFIX.as_os_str());

    let mut path = manifest.to_path_buf();
    path.set_file_name(file_name);
    path
}

impl ManifestLock {
    /// Take the lock of `manifest`, failing loudly if another live coordinator holds it
    pub fn acquire(manifest: &Path) -> Result<Self, LockError> {
        let path = lock_path(manifest);
        let owner = owner_id()?;

        match Self::create(&path, &owner) {
            Ok(lock) => Ok(lock),
            Err(LockError::Held { owner: holder, .. }) if Self::is_stale(&holder) => {
                warn!(path = ?path, holder = %holder, "Reclaiming lock of a coordinator that is no longer running");
                fs::remove_file(&path).map_err(|source| LockError::Io {
                    path: path.clone(),
                    source,
                })?;
                Self::create(&path, &owner)
            }
            Err(error) => Err(error),
        }
    }

    fn create(path: &Path, owner: &str) -> Result<Self, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(owner.as_bytes())
                    .map_err(|source| LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                debug!(path = ?path, owner, "Acquired manifest lock");
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => Err(LockError::Held {
                path: path.to_path_buf(),
                owner: fs::read_to_string(path)
                    .map(|owner| owner.trim().to_string())
                    .unwrap_or_else(|_| "unknown".to_string()),
            }),
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    // only a lock of this host can be checked for liveness
    fn is_stale(holder: &str) -> bool {
        let Some((host, pid)) = holder.rsplit_once(':') else {
            return false;
        };
        let Ok(pid) = pid.parse::<i32>() else {
            return false;
        };

        match nix::unistd::gethostname() {
            Ok(hostname) if hostname.to_string_lossy() == host => !process_alive(pid),
            _ => false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Released manifest lock"),
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to release manifest lock"),
        }
    }
}

//! Crash safe file system primitives.
//!
//! Every persistent artifact is first written next to its destination and then
//! renamed over it, a rename within a directory being atomic on POSIX file systems.
pub mod locking;

use once_cell::sync::Lazy;
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, error};

pub static PARTIAL_PREFIX: Lazy<OsString> = Lazy::new(|| {
    let mut string = OsString::new();
    string.push(".partial_");
    string
});

/// Sibling path used while `path` is being written
pub fn partial_path(path: &Path) -> PathBuf {
    let mut file_name = PARTIAL_PREFIX.clone();
    file_name.push(path.file_name().unwrap_or_default());

    let mut partial = path.to_path_buf();
    partial.set_file_name(file_name);
    partial
}

/// Replace the content of `path` without ever exposing a half written file
pub fn write_atomically(path: &Path, contents: impl AsRef<[u8]>) -> io::Result<()> {
    let partial = partial_path(path);
    fs::write(&partial, contents)?;

    match fs::rename(&partial, path) {
        Ok(()) => {
            debug!(path = ?path, "Replaced file");
            Ok(())
        }
        Err(error) => {
            error!(error = ?error, path = ?partial, "Failed to move partial file into place");
            // best effort, the rename error is the one worth reporting
            let _ = fs::remove_file(&partial);
            Err(error)
        }
    }
}

/// Populate a directory through `fill` and only then move it to `path`.
///
/// Leftovers of an interrupted earlier attempt are discarded first.
pub fn create_dir_atomically<F>(path: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let partial = partial_path(path);
    if partial.exists() {
        debug!(path = ?partial, "Removing leftover of an interrupted build");
        fs::remove_dir_all(&partial)?;
    }

    fs::create_dir_all(&partial)?;
    if let Err(error) = fill(&partial) {
        let _ = fs::remove_dir_all(&partial);
        return Err(error);
    }

    fs::rename(&partial, path)
}

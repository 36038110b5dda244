use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Removes the temp file unless the rename consumed it.
struct TempFileCleanup {
    path: PathBuf,
    armed: bool,
}

impl TempFileCleanup {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileCleanup {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WriteResult {
    pub path: String,
    pub bytes: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy)]
pub struct AtomicWriteOptions {
    pub mode: Option<u32>,
    pub fsync: bool,
}

impl Default for AtomicWriteOptions {
    fn default() -> Self {
        Self {
            mode: Some(0o600),
            fsync: true,
        }
    }
}

/// Unique sibling of `target`, so the final rename never crosses filesystems.
fn generate_temp_path(target: &Path) -> io::Result<PathBuf> {
    let filename = target.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no file name in {:?}", target))
    })?;

    let parent = match target.parent() {
        Some(p) if p == Path::new("") => Path::new("."),
        Some(p) => p,
        None => Path::new("."),
    };
    if !parent.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("parent directory does not exist: {:?}", parent),
        ));
    }

    let mut hasher = DefaultHasher::new();
    target.hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    Utc::now().timestamp_nanos_opt().unwrap_or(0).hash(&mut hasher);

    let mut temp_name = filename.to_os_string();
    temp_name.push(format!(".tmp.{}.{:x}", std::process::id(), hasher.finish()));
    Ok(parent.join(temp_name))
}

/// Replaces `path` with `data` through a temp file and a rename.
///
/// Readers see either the old content or the new one, never a partial file.
pub fn atomic_write<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    options: AtomicWriteOptions,
) -> io::Result<WriteResult> {
    let path = path.as_ref();
    let temp_path = generate_temp_path(path)?;

    let mut temp_file = File::create(&temp_path)?;
    let mut cleanup = TempFileCleanup::new(&temp_path);

    #[cfg(unix)]
    {
        if let Some(mode) = options.mode {
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(mode))?;
        }
    }

    temp_file.write_all(data)?;
    if options.fsync {
        temp_file.flush()?;
        temp_file.sync_data()?;
    }
    drop(temp_file);

    std::fs::rename(&temp_path, path)?;
    cleanup.disarm();

    if options.fsync {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_data();
            }
        }
    }

    log::debug!("Atomically wrote {} bytes to {}", data.len(), path.display());
    Ok(WriteResult {
        path: path.to_string_lossy().to_string(),
        bytes: data.len() as u64,
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, "old").unwrap();

        let result = atomic_write(&path, b"new content", AtomicWriteOptions::default()).unwrap();
        assert_eq!(result.bytes, 11);
        assert_eq!(fs::read_to_string(&path).unwrap(), "new content");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_sets_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");
        atomic_write(&path, b"x", AtomicWriteOptions::default()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_missing_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("state");
        let err = atomic_write(&path, b"x", AtomicWriteOptions::default()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}

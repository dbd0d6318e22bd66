use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;
use tempfile::NamedTempFile;

/// One entry yielded by directory enumeration.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub name: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub mtime: SystemTime,
    pub read_only: bool,
}

/// Host filesystem access consumed by the virtual image.
///
/// All calls are synchronous blocking I/O. The image serializes access, so
/// implementations need no interior locking.
pub trait HostFs {
    fn list_dir(&self, path: &Path) -> io::Result<Vec<HostEntry>>;
    fn stat(&self, path: &Path) -> io::Result<HostEntry>;
    fn open_read(&self, path: &Path) -> io::Result<File>;
    /// Creates or atomically replaces `path` with `content`.
    fn replace_file(&self, path: &Path, content: &[u8]) -> io::Result<()>;
    fn create_dir(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;
}

/// `std::fs`-backed provider.
pub struct LocalFs;

fn entry_from_metadata(name: String, meta: &fs::Metadata, is_symlink: bool) -> HostEntry {
    HostEntry {
        name,
        is_dir: meta.is_dir(),
        is_symlink,
        size: meta.len(),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        read_only: meta.permissions().readonly(),
    }
}

impl HostFs for LocalFs {
    fn list_dir(&self, path: &Path) -> io::Result<Vec<HostEntry>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(path)? {
            let dir_entry = dir_entry?;
            let name = match dir_entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    debug!("skipping non-UTF-8 entry {:?}", raw);
                    continue;
                }
            };
            let is_symlink = dir_entry.file_type()?.is_symlink();
            // Follows symlinks; a dangling link is skipped, not fatal
            match fs::metadata(dir_entry.path()) {
                Ok(meta) => entries.push(entry_from_metadata(name, &meta, is_symlink)),
                Err(err) if is_symlink => {
                    debug!("skipping dangling symlink {}: {}", name, err);
                }
                Err(err) => return Err(err),
            }
        }
        // Enumeration order is platform-dependent; make the layout stable
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> io::Result<HostEntry> {
        let meta = fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let is_symlink = fs::symlink_metadata(path)?.file_type().is_symlink();
        Ok(entry_from_metadata(name, &meta, is_symlink))
    }

    fn open_read(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn replace_file(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        let parent = path.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
        })?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        match fs::create_dir(path) {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            other => other,
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_list_dir_is_sorted_and_complete() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("beta.txt"), b"bb").unwrap();
        fs::write(dir.path().join("alpha.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let entries = LocalFs.list_dir(dir.path()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha.txt", "beta.txt", "sub"]);
        assert_eq!(entries[0].size, 1);
        assert!(!entries[0].is_dir);
        assert!(entries[2].is_dir);
    }

    #[test]
    fn test_replace_file_overwrites_atomically() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("data.bin");
        fs::write(&target, b"old").unwrap();

        LocalFs.replace_file(&target, b"new content").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new content");

        // No stray temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_create_dir_tolerates_existing() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        LocalFs.create_dir(&sub).unwrap();
        LocalFs.create_dir(&sub).unwrap();
        assert!(sub.is_dir());
    }

    #[test]
    fn test_remove_dir_is_recursive() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("inner.txt"), b"x").unwrap();
        LocalFs.remove_dir(&sub).unwrap();
        assert!(!sub.exists());
    }
}

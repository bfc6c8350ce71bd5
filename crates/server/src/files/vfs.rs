//! The filesystem interface shared by sandboxes and share views.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::SystemTime;

use super::sandbox::SandboxError;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read an existing file.
    Read,
    /// Create a new file; fails if it exists.
    CreateNew,
    /// Create or truncate.
    Truncate,
    /// Append to an existing file.
    Append,
}

impl OpenMode {
    /// Whether this mode can change file contents.
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Read)
    }

    pub(crate) fn options(&self) -> fs::OpenOptions {
        let mut options = fs::OpenOptions::new();
        match self {
            Self::Read => options.read(true),
            Self::CreateNew => options.write(true).create_new(true),
            Self::Truncate => options.write(true).create(true).truncate(true),
            Self::Append => options.append(true),
        };
        options
    }
}

/// Metadata for a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Entry name (not full path); `/` for a view's root.
    pub name: String,
    /// Virtual path inside the view.
    pub path: String,
    /// Whether the entry (or its link target) is a directory.
    pub is_dir: bool,
    /// Whether the entry itself is a symbolic link.
    pub is_symlink: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Unix permissions mode.
    pub mode: u32,
    /// Last modified timestamp.
    pub modified: SystemTime,
}

impl EntryInfo {
    /// Reads metadata for `real`, following links but reporting them.
    ///
    /// A dangling link is reported with its own metadata.
    pub(crate) fn read(virtual_path: &str, real: &Path) -> io::Result<Self> {
        let link_meta = fs::symlink_metadata(real)?;
        let is_symlink = link_meta.file_type().is_symlink();
        let metadata = if is_symlink {
            fs::metadata(real).unwrap_or(link_meta)
        } else {
            link_meta
        };

        let name = real
            .file_name()
            .filter(|_| virtual_path != "/")
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            name,
            path: virtual_path.to_string(),
            is_dir: metadata.is_dir(),
            is_symlink,
            size: if metadata.is_file() { metadata.len() } else { 0 },
            mode: metadata.mode(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }
}

/// Root-confined filesystem primitives.
///
/// Every argument is a virtual path relative to the view's root. Paths that
/// cannot be resolved inside the root fail with `NotExist`.
pub trait FileSystem: Send + Sync {
    /// Creates a single directory.
    fn mkdir(&self, name: &str) -> Result<(), SandboxError>;

    /// Opens a file.
    fn open_file(&self, name: &str, mode: OpenMode) -> Result<File, SandboxError>;

    /// Removes a file, link or directory tree.
    fn remove_all(&self, name: &str) -> Result<(), SandboxError>;

    /// Renames an entry.
    fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError>;

    /// Returns metadata for an entry.
    fn stat(&self, name: &str) -> Result<EntryInfo, SandboxError>;

    /// Copies a file or directory tree, returning the bytes copied.
    fn copy(&self, from: &str, to: &str) -> Result<u64, SandboxError>;

    /// Lists a directory, directories first, then by case-insensitive name.
    fn list_dir(&self, name: &str) -> Result<Vec<EntryInfo>, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_open_mode_is_write() {
        assert!(!OpenMode::Read.is_write());
        assert!(OpenMode::CreateNew.is_write());
        assert!(OpenMode::Truncate.is_write());
        assert!(OpenMode::Append.is_write());
    }

    #[test]
    fn test_entry_info_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.txt");
        fs::write(&path, "Hello").unwrap();

        let info = EntryInfo::read("/file.txt", &path).unwrap();
        assert_eq!(info.name, "file.txt");
        assert_eq!(info.path, "/file.txt");
        assert_eq!(info.size, 5);
        assert!(!info.is_dir);
        assert!(!info.is_symlink);
    }

    #[test]
    fn test_entry_info_follows_links() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target");
        fs::create_dir(&target).unwrap();
        let link = temp_dir.path().join("link");
        symlink(&target, &link).unwrap();

        let info = EntryInfo::read("/link", &link).unwrap();
        assert!(info.is_symlink);
        assert!(info.is_dir);
    }

    #[test]
    fn test_entry_info_dangling_link() {
        let temp_dir = TempDir::new().unwrap();
        let link = temp_dir.path().join("dangling");
        symlink(temp_dir.path().join("missing"), &link).unwrap();

        let info = EntryInfo::read("/dangling", &link).unwrap();
        assert!(info.is_symlink);
        assert!(!info.is_dir);
    }

    #[test]
    fn test_entry_info_root_name() {
        let temp_dir = TempDir::new().unwrap();
        let info = EntryInfo::read("/", temp_dir.path()).unwrap();
        assert_eq!(info.name, "/");
        assert!(info.is_dir);
    }
}

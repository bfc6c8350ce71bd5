//! Root-confined file operations for one identity.
//!
//! A [`Sandbox`] maps virtual paths (`/docs/a.txt`) onto a root directory and
//! performs every filesystem primitive through that mapping. Resolution is
//! purely lexical: `.` and `..` segments are cleaned, and a path that would
//! climb above the root is rejected instead of clamped.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use model::UserConfig;
use thiserror::Error;
use tracing::debug;

use super::copy::{apply_ownership, copy_entry};
use super::vfs::{EntryInfo, FileSystem, OpenMode};
use crate::error::ErrorKind;

/// Directory inside every sandbox that holds links to other identities' shares.
pub const SHARES_DIR: &str = "shares";

/// Errors that can occur during sandboxed file operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The path does not exist or could not be resolved inside the root.
    #[error("no such file or directory: {0}")]
    NotExist(String),

    /// The target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation is not allowed on this target.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The identity's flags do not allow the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SandboxError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotExist(_) => ErrorKind::NotExist,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Io(_) => ErrorKind::Internal,
        }
    }

    fn from_io(err: io::Error, name: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotExist(name.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(name.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// What an identity may do inside a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    /// May create new entries.
    pub can_create: bool,
    /// May modify, rename or delete existing entries.
    pub can_edit: bool,
}

impl AccessPolicy {
    /// Read-only access.
    pub fn read_only() -> Self {
        Self {
            can_create: false,
            can_edit: false,
        }
    }

    /// Unrestricted access.
    pub fn full() -> Self {
        Self {
            can_create: true,
            can_edit: true,
        }
    }

    /// The policy granted by an identity's flags.
    pub fn for_user(user: &UserConfig) -> Self {
        Self {
            can_create: user.can_create,
            can_edit: user.can_edit,
        }
    }

    fn require_create(&self, name: &str) -> Result<(), SandboxError> {
        if self.can_create {
            Ok(())
        } else {
            Err(SandboxError::PermissionDenied(name.to_string()))
        }
    }

    fn require_edit(&self, name: &str) -> Result<(), SandboxError> {
        if self.can_edit {
            Ok(())
        } else {
            Err(SandboxError::PermissionDenied(name.to_string()))
        }
    }
}

/// Returns the private storage directory of `username`.
pub fn home_dir(storage_root: &Path, username: &str) -> PathBuf {
    storage_root.join(username)
}

/// A filesystem view confined to one root directory.
#[derive(Debug, Clone)]
pub struct Sandbox {
    /// Root directory; every resolved path lies at or below it.
    root: PathBuf,
    /// Allowed operations.
    access: AccessPolicy,
    /// Ownership applied to created entries.
    owner: Option<(u32, u32)>,
}

impl Sandbox {
    /// Creates a sandbox over `root` with full access and no ownership changes.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            access: AccessPolicy::full(),
            owner: None,
        }
    }

    /// Creates the sandbox of `user` under `storage_root`.
    pub fn for_user(storage_root: &Path, user: &UserConfig) -> Self {
        Self::new(home_dir(storage_root, &user.username))
            .with_access(AccessPolicy::for_user(user))
            .with_owner(user.ownership())
    }

    /// Sets the access policy.
    pub fn with_access(mut self, access: AccessPolicy) -> Self {
        self.access = access;
        self
    }

    /// Sets the ownership applied to created entries.
    pub fn with_owner(mut self, owner: Option<(u32, u32)>) -> Self {
        self.owner = owner;
        self
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the access policy.
    pub fn access(&self) -> AccessPolicy {
        self.access
    }

    /// Creates the root directory if it is missing.
    pub fn ensure_root(&self) -> Result<(), SandboxError> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root)?;
            apply_ownership(&self.root, self.owner)?;
            debug!("Created sandbox root {:?}", self.root);
        }
        Ok(())
    }

    /// Resolves a virtual path to an absolute path inside the root.
    ///
    /// Fails with `NotExist` for paths containing null bytes or climbing
    /// above the root.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, SandboxError> {
        let relative =
            clean_virtual_path(name).ok_or_else(|| SandboxError::NotExist(name.to_string()))?;
        Ok(self.root.join(relative))
    }

    /// Whether `name` resolves to the root itself.
    pub fn is_root(&self, name: &str) -> bool {
        matches!(clean_virtual_path(name), Some(p) if p.as_os_str().is_empty())
    }

    /// Resolves a path that a destructive operation may target.
    fn resolve_mutable(&self, name: &str) -> Result<PathBuf, SandboxError> {
        let path = self.resolve(name)?;
        if path == self.root {
            return Err(SandboxError::InvalidOperation(format!(
                "{} is the sandbox root",
                name
            )));
        }
        Ok(path)
    }

    /// Resolves a source/destination pair for rename and copy.
    fn resolve_pair(&self, from: &str, to: &str) -> Result<(PathBuf, PathBuf), SandboxError> {
        let src = self.resolve_mutable(from)?;
        let dst = self.resolve_mutable(to)?;
        if src == dst {
            return Err(SandboxError::InvalidOperation(format!(
                "{} and {} are the same entry",
                from, to
            )));
        }
        if dst.starts_with(&src) {
            return Err(SandboxError::InvalidOperation(format!(
                "{} is inside {}",
                to, from
            )));
        }
        if fs::symlink_metadata(&src).is_err() {
            return Err(SandboxError::NotExist(from.to_string()));
        }
        Ok((src, dst))
    }
}

impl FileSystem for Sandbox {
    fn mkdir(&self, name: &str) -> Result<(), SandboxError> {
        let path = self.resolve_mutable(name)?;
        self.access.require_create(name)?;
        fs::create_dir(&path).map_err(|e| SandboxError::from_io(e, name))?;
        apply_ownership(&path, self.owner)?;
        Ok(())
    }

    fn open_file(&self, name: &str, mode: OpenMode) -> Result<File, SandboxError> {
        let path = self.resolve(name)?;
        let exists = fs::symlink_metadata(&path).is_ok();

        match mode {
            OpenMode::Read => {}
            OpenMode::CreateNew => self.access.require_create(name)?,
            OpenMode::Truncate if exists => self.access.require_edit(name)?,
            OpenMode::Truncate => self.access.require_create(name)?,
            OpenMode::Append => self.access.require_edit(name)?,
        }
        if mode.is_write() && path == self.root {
            return Err(SandboxError::InvalidOperation(format!(
                "{} is the sandbox root",
                name
            )));
        }

        let file = mode
            .options()
            .open(&path)
            .map_err(|e| SandboxError::from_io(e, name))?;
        if mode.is_write() && !exists {
            apply_ownership(&path, self.owner)?;
        }
        Ok(file)
    }

    fn remove_all(&self, name: &str) -> Result<(), SandboxError> {
        let path = self.resolve_mutable(name)?;
        self.access.require_edit(name)?;

        let metadata =
            fs::symlink_metadata(&path).map_err(|e| SandboxError::from_io(e, name))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        debug!("Removed {:?}", path);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        let (src, dst) = self.resolve_pair(from, to)?;
        self.access.require_edit(from)?;
        fs::rename(&src, &dst).map_err(|e| SandboxError::from_io(e, to))?;
        Ok(())
    }

    fn stat(&self, name: &str) -> Result<EntryInfo, SandboxError> {
        let path = self.resolve(name)?;
        EntryInfo::read(&display_path(name), &path).map_err(|e| SandboxError::from_io(e, name))
    }

    fn copy(&self, from: &str, to: &str) -> Result<u64, SandboxError> {
        let (src, dst) = self.resolve_pair(from, to)?;
        self.access.require_create(to)?;
        copy_entry(&src, &dst, self.owner).map_err(|e| SandboxError::from_io(e, from))
    }

    fn list_dir(&self, name: &str) -> Result<Vec<EntryInfo>, SandboxError> {
        let path = self.resolve(name)?;
        let base = display_path(name);

        let mut entries = Vec::new();
        for entry in fs::read_dir(&path).map_err(|e| SandboxError::from_io(e, name))? {
            let Ok(entry) = entry else {
                continue;
            };
            let child_name = entry.file_name().to_string_lossy().to_string();
            let virtual_path = if base == "/" {
                format!("/{}", child_name)
            } else {
                format!("{}/{}", base, child_name)
            };
            if let Ok(info) = EntryInfo::read(&virtual_path, &entry.path()) {
                entries.push(info);
            }
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });
        Ok(entries)
    }
}

/// Lexically cleans a virtual path into a root-relative path.
///
/// Returns `None` when the path contains a null byte or climbs above the root.
fn clean_virtual_path(name: &str) -> Option<PathBuf> {
    if name.contains('\0') {
        return None;
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.iter().collect())
}

/// Normalized `/a/b` form of a virtual path for display.
pub(super) fn display_path(name: &str) -> String {
    match clean_virtual_path(name) {
        Some(p) if !p.as_os_str().is_empty() => format!("/{}", p.to_string_lossy()),
        _ => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn create_test_sandbox() -> (Sandbox, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("alice");
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("docs/readme.txt"), "Hello").unwrap();
        (Sandbox::new(&root), temp_dir)
    }

    #[test]
    fn test_resolve_plain_paths() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        let root = sandbox.root().to_path_buf();

        assert_eq!(sandbox.resolve("/docs").unwrap(), root.join("docs"));
        assert_eq!(sandbox.resolve("docs/readme.txt").unwrap(), root.join("docs/readme.txt"));
        assert_eq!(sandbox.resolve("/").unwrap(), root);
        assert_eq!(sandbox.resolve("").unwrap(), root);
        assert_eq!(sandbox.resolve("/docs/./../docs//x").unwrap(), root.join("docs/x"));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let (sandbox, _temp_dir) = create_test_sandbox();

        for name in ["..", "/..", "/docs/../../etc/passwd", "../alice/docs"] {
            assert!(
                matches!(sandbox.resolve(name), Err(SandboxError::NotExist(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_resolve_rejects_null_bytes() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        let err = sandbox.resolve("/docs/readme.txt\0.jpg").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);
    }

    #[test]
    fn test_is_root() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        assert!(sandbox.is_root("/"));
        assert!(sandbox.is_root("/docs/.."));
        assert!(!sandbox.is_root("/docs"));
        assert!(!sandbox.is_root("/.."));
    }

    #[test]
    fn test_mkdir() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        sandbox.mkdir("/new").unwrap();
        assert!(sandbox.root().join("new").is_dir());

        let err = sandbox.mkdir("/new").unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyExists(_)));

        let err = sandbox.mkdir("/missing/child").unwrap_err();
        assert!(matches!(err, SandboxError::NotExist(_)));
    }

    #[test]
    fn test_mkdir_on_root_is_invalid() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        let err = sandbox.mkdir("/").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_open_file_read_and_write() {
        let (sandbox, _temp_dir) = create_test_sandbox();

        let mut file = sandbox.open_file("/docs/new.txt", OpenMode::CreateNew).unwrap();
        file.write_all(b"content").unwrap();
        drop(file);

        let mut contents = String::new();
        sandbox
            .open_file("/docs/new.txt", OpenMode::Read)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "content");

        let err = sandbox
            .open_file("/docs/new.txt", OpenMode::CreateNew)
            .unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyExists(_)));
    }

    #[test]
    fn test_open_missing_file() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        let err = sandbox.open_file("/nope.txt", OpenMode::Read).unwrap_err();
        assert!(matches!(err, SandboxError::NotExist(_)));
    }

    #[test]
    fn test_read_only_policy() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        let sandbox = sandbox.with_access(AccessPolicy::read_only());

        assert!(sandbox.open_file("/docs/readme.txt", OpenMode::Read).is_ok());
        assert_eq!(
            sandbox.mkdir("/x").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            sandbox
                .open_file("/docs/readme.txt", OpenMode::Truncate)
                .unwrap_err()
                .kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            sandbox.remove_all("/docs").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert!(sandbox.root().join("docs/readme.txt").exists());
    }

    #[test]
    fn test_create_without_edit() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        let sandbox = sandbox.with_access(AccessPolicy {
            can_create: true,
            can_edit: false,
        });

        assert!(sandbox.open_file("/docs/fresh.txt", OpenMode::Truncate).is_ok());
        assert_eq!(
            sandbox
                .open_file("/docs/readme.txt", OpenMode::Truncate)
                .unwrap_err()
                .kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn test_remove_all() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        sandbox.remove_all("/docs").unwrap();
        assert!(!sandbox.root().join("docs").exists());

        let err = sandbox.remove_all("/docs").unwrap_err();
        assert!(matches!(err, SandboxError::NotExist(_)));
    }

    #[test]
    fn test_remove_root_is_invalid() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        for name in ["/", "", "/docs/.."] {
            let err = sandbox.remove_all(name).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        }
        assert!(sandbox.root().exists());
    }

    #[test]
    fn test_remove_link_keeps_target() {
        let (sandbox, temp_dir) = create_test_sandbox();
        let outside = temp_dir.path().join("bob");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("keep.txt"), "keep").unwrap();
        symlink(&outside, sandbox.root().join("link")).unwrap();

        sandbox.remove_all("/link").unwrap();
        assert!(outside.join("keep.txt").exists());
    }

    #[test]
    fn test_rename() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        sandbox.rename("/docs/readme.txt", "/readme.txt").unwrap();
        assert!(sandbox.root().join("readme.txt").exists());
        assert!(!sandbox.root().join("docs/readme.txt").exists());
    }

    #[test]
    fn test_rename_invalid_targets() {
        let (sandbox, _temp_dir) = create_test_sandbox();

        assert_eq!(
            sandbox.rename("/", "/x").unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
        assert_eq!(
            sandbox.rename("/docs", "/").unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
        assert_eq!(
            sandbox.rename("/docs", "/docs/").unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
        assert_eq!(
            sandbox.rename("/docs", "/docs/inner").unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
        assert_eq!(
            sandbox.rename("/missing", "/other").unwrap_err().kind(),
            ErrorKind::NotExist
        );
    }

    #[test]
    fn test_stat() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        let info = sandbox.stat("/docs/readme.txt").unwrap();
        assert_eq!(info.name, "readme.txt");
        assert_eq!(info.path, "/docs/readme.txt");
        assert_eq!(info.size, 5);
        assert!(!info.is_dir);

        let root = sandbox.stat("/").unwrap();
        assert!(root.is_dir);
        assert_eq!(root.path, "/");

        assert_eq!(sandbox.stat("/none").unwrap_err().kind(), ErrorKind::NotExist);
        assert_eq!(sandbox.stat("/../x").unwrap_err().kind(), ErrorKind::NotExist);
    }

    #[test]
    fn test_copy_file_and_dir() {
        let (sandbox, _temp_dir) = create_test_sandbox();

        let copied = sandbox.copy("/docs/readme.txt", "/copy.txt").unwrap();
        assert_eq!(copied, 5);
        assert!(sandbox.root().join("copy.txt").is_file());

        sandbox.copy("/docs", "/docs2").unwrap();
        assert!(sandbox.root().join("docs2/readme.txt").is_file());
    }

    #[test]
    fn test_copy_invalid_targets() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        assert_eq!(
            sandbox.copy("/", "/backup").unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
        assert_eq!(
            sandbox.copy("/docs", "/").unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
        assert_eq!(
            sandbox.copy("/docs", "/docs/again").unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
        assert_eq!(
            sandbox.copy("/docs/readme.txt", "/docs/readme.txt").unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
    }

    #[test]
    fn test_list_dir_sorted() {
        let (sandbox, _temp_dir) = create_test_sandbox();
        fs::write(sandbox.root().join("b.txt"), "b").unwrap();
        fs::write(sandbox.root().join("A.txt"), "a").unwrap();
        fs::create_dir(sandbox.root().join("zdir")).unwrap();

        let entries = sandbox.list_dir("/").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "zdir", "A.txt", "b.txt"]);
        assert_eq!(entries[0].path, "/docs");

        let nested = sandbox.list_dir("/docs").unwrap();
        assert_eq!(nested[0].path, "/docs/readme.txt");
    }

    #[test]
    fn test_for_user_uses_flags() {
        let temp_dir = TempDir::new().unwrap();
        let user = UserConfig::new("bob").unwrap();
        let sandbox = Sandbox::for_user(temp_dir.path(), &user);

        assert_eq!(sandbox.root(), temp_dir.path().join("bob"));
        assert_eq!(sandbox.access(), AccessPolicy::read_only());

        sandbox.ensure_root().unwrap();
        assert!(sandbox.root().is_dir());
    }
}

//! Filesystem views over shared subtrees.

use std::fs::File;
use std::path::Path;

use model::{ShareItem, UserConfig};

use super::sandbox::{display_path, home_dir, AccessPolicy, Sandbox, SandboxError};
use super::vfs::{EntryInfo, FileSystem, OpenMode};

/// Who is looking at a share.
#[derive(Debug, Clone)]
pub enum Visitor {
    /// A registered identity.
    Identity(UserConfig),
    /// An anonymous visitor holding the share hash.
    Anonymous,
}

impl Visitor {
    /// The visitor's name, if registered.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Identity(user) => Some(&user.username),
            Self::Anonymous => None,
        }
    }

    /// Whether this visitor may see content governed by `share` of `owner`.
    ///
    /// Anonymous visitors need an external share. Registered visitors see
    /// their own shares, shares visible to them and external shares.
    pub fn may_see(&self, owner: &UserConfig, share: &ShareItem) -> bool {
        match self {
            Self::Anonymous => share.allow_external,
            Self::Identity(user) => {
                owner.is_named(&user.username)
                    || share.is_visible_to(&user.username)
                    || share.allow_external
            }
        }
    }
}

/// A share's subtree as seen by a visitor.
///
/// The share's directory is the view's root. Anonymous visitors get
/// read-only access; registered visitors get what their own flags allow.
/// Entries created through the view belong to the share's owner.
///
/// Every path is checked against the owner's most specific share covering
/// it, so a narrower share nested below the viewed one hides its subtree
/// from visitors it is not granted to. The owner's share list is the one
/// current when the view was opened.
#[derive(Debug, Clone)]
pub struct ShareView {
    /// Confined view of the shared directory.
    inner: Sandbox,
    /// Owner of the share, with the share list used for access checks.
    owner: UserConfig,
    /// The viewed share.
    share: ShareItem,
    visitor: Visitor,
}

impl ShareView {
    /// Opens `share` of `owner` for `visitor`.
    ///
    /// Fails with `NotExist` if `owner` has no share at that path or the
    /// path does not resolve inside the owner's sandbox.
    pub fn new(
        storage_root: &Path,
        owner: &UserConfig,
        share: &ShareItem,
        visitor: &Visitor,
    ) -> Result<Self, SandboxError> {
        if owner.find_share(&share.path).is_none() {
            return Err(SandboxError::NotExist(format!(
                "{}:{}",
                owner.username, share.path
            )));
        }
        let owner_sandbox = Sandbox::new(home_dir(storage_root, &owner.username));
        let share_root = owner_sandbox.resolve(&share.path)?;

        let access = match visitor {
            Visitor::Identity(user) => AccessPolicy::for_user(user),
            Visitor::Anonymous => AccessPolicy::read_only(),
        };

        Ok(Self {
            inner: Sandbox::new(share_root)
                .with_access(access)
                .with_owner(owner.ownership()),
            owner: owner.clone(),
            share: share.clone(),
            visitor: visitor.clone(),
        })
    }

    /// Name of the share's owner.
    pub fn owner(&self) -> &str {
        &self.owner.username
    }

    /// Hash of the share.
    pub fn hash(&self) -> &str {
        &self.share.hash
    }

    /// Absolute directory behind the view.
    pub fn root(&self) -> &Path {
        self.inner.root()
    }

    /// Path in the owner's sandbox for a path inside the view.
    fn owner_path(&self, name: &str) -> Result<String, SandboxError> {
        self.inner.resolve(name)?;
        let inside = display_path(name);
        Ok(match (self.share.path.as_str(), inside.as_str()) {
            (base, "/") => base.to_string(),
            ("/", rest) => rest.to_string(),
            (base, rest) => format!("{base}{rest}"),
        })
    }

    /// Fails unless the visitor may see `name`.
    fn check(&self, name: &str) -> Result<(), SandboxError> {
        let path = self.owner_path(name)?;
        let visible = self
            .owner
            .governing_share(&path)
            .is_some_and(|governing| self.visitor.may_see(&self.owner, governing));
        match (visible, &self.visitor) {
            (true, _) => Ok(()),
            (false, Visitor::Anonymous) => Err(SandboxError::NotExist(name.to_string())),
            (false, Visitor::Identity(_)) => {
                Err(SandboxError::PermissionDenied(name.to_string()))
            }
        }
    }
}

impl FileSystem for ShareView {
    fn mkdir(&self, name: &str) -> Result<(), SandboxError> {
        self.check(name)?;
        self.inner.mkdir(name)
    }

    fn open_file(&self, name: &str, mode: OpenMode) -> Result<File, SandboxError> {
        self.check(name)?;
        self.inner.open_file(name, mode)
    }

    fn remove_all(&self, name: &str) -> Result<(), SandboxError> {
        self.check(name)?;
        self.inner.remove_all(name)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        self.check(from)?;
        self.check(to)?;
        self.inner.rename(from, to)
    }

    fn stat(&self, name: &str) -> Result<EntryInfo, SandboxError> {
        self.check(name)?;
        self.inner.stat(name)
    }

    fn copy(&self, from: &str, to: &str) -> Result<u64, SandboxError> {
        self.check(from)?;
        self.check(to)?;
        self.inner.copy(from, to)
    }

    fn list_dir(&self, name: &str) -> Result<Vec<EntryInfo>, SandboxError> {
        self.check(name)?;
        let mut entries = self.inner.list_dir(name)?;
        entries.retain(|entry| self.check(&entry.path).is_ok());
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;

    fn setup() -> (TempDir, UserConfig, ShareItem) {
        let temp_dir = TempDir::new().unwrap();
        let mut owner = UserConfig::new("alice").unwrap().with_write_access();
        fs::create_dir_all(temp_dir.path().join("alice/docs/sub")).unwrap();
        fs::write(temp_dir.path().join("alice/docs/a.txt"), "A").unwrap();
        fs::write(temp_dir.path().join("alice/private.txt"), "P").unwrap();
        let share = ShareItem::new("/docs").unwrap().with_external(true);
        owner.shares = vec![share.clone()];
        (temp_dir, owner, share)
    }

    /// Alice shares `/docs` with everyone and `/docs/secret` with carol only.
    fn nested_setup() -> (TempDir, UserConfig, ShareItem) {
        let temp_dir = TempDir::new().unwrap();
        let secret_dir = temp_dir.path().join("alice/docs/secret");
        fs::create_dir_all(&secret_dir).unwrap();
        fs::write(secret_dir.join("f.txt"), "TOPSECRET").unwrap();
        fs::write(temp_dir.path().join("alice/docs/a.txt"), "A").unwrap();

        let mut owner = UserConfig::new("alice").unwrap().with_write_access();
        let docs = ShareItem::new("/docs")
            .unwrap()
            .with_local(true)
            .with_external(true);
        let secret = ShareItem::new("/docs/secret").unwrap().with_users(["carol"]);
        owner.shares = vec![docs.clone(), secret];
        owner.sort_shares();
        (temp_dir, owner, docs)
    }

    fn names(view: &ShareView, path: &str) -> Vec<String> {
        view.list_dir(path)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    #[test]
    fn test_view_is_rooted_at_share() {
        let (temp_dir, owner, share) = setup();
        let view = ShareView::new(temp_dir.path(), &owner, &share, &Visitor::Anonymous).unwrap();

        assert_eq!(view.root(), temp_dir.path().join("alice/docs"));
        assert_eq!(view.owner(), "alice");
        assert_eq!(view.hash(), share.hash);
        assert_eq!(names(&view, "/"), vec!["sub", "a.txt"]);
    }

    #[test]
    fn test_view_cannot_escape_share() {
        let (temp_dir, owner, share) = setup();
        let view = ShareView::new(temp_dir.path(), &owner, &share, &Visitor::Anonymous).unwrap();

        let err = view.open_file("/../private.txt", OpenMode::Read).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);
    }

    #[test]
    fn test_anonymous_is_read_only() {
        let (temp_dir, owner, share) = setup();
        let view = ShareView::new(temp_dir.path(), &owner, &share, &Visitor::Anonymous).unwrap();

        assert!(view.open_file("/a.txt", OpenMode::Read).is_ok());
        assert_eq!(view.mkdir("/x").unwrap_err().kind(), ErrorKind::PermissionDenied);
        assert_eq!(
            view.remove_all("/a.txt").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn test_identity_uses_own_flags() {
        let (temp_dir, owner, share) = setup();
        let writer = UserConfig::new("bob").unwrap().with_write_access();
        let view =
            ShareView::new(temp_dir.path(), &owner, &share, &Visitor::Identity(writer)).unwrap();

        view.mkdir("/from-bob").unwrap();
        assert!(temp_dir.path().join("alice/docs/from-bob").is_dir());

        let reader = UserConfig::new("carol").unwrap();
        let view =
            ShareView::new(temp_dir.path(), &owner, &share, &Visitor::Identity(reader)).unwrap();
        assert_eq!(view.mkdir("/x").unwrap_err().kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_view_root_is_protected() {
        let (temp_dir, owner, share) = setup();
        let writer = UserConfig::new("bob").unwrap().with_write_access();
        let view =
            ShareView::new(temp_dir.path(), &owner, &share, &Visitor::Identity(writer)).unwrap();
        assert_eq!(
            view.remove_all("/").unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
    }

    #[test]
    fn test_nested_narrow_share_is_hidden() {
        let (temp_dir, owner, docs) = nested_setup();
        let bob = UserConfig::new("bob").unwrap().with_write_access();
        let view =
            ShareView::new(temp_dir.path(), &owner, &docs, &Visitor::Identity(bob)).unwrap();

        assert_eq!(names(&view, "/"), vec!["a.txt"]);
        for path in ["/secret", "/secret/f.txt", "/sub/../secret/f.txt"] {
            assert_eq!(
                view.stat(path).unwrap_err().kind(),
                ErrorKind::PermissionDenied,
                "{path}"
            );
        }
        assert_eq!(
            view.open_file("/secret/f.txt", OpenMode::Read)
                .unwrap_err()
                .kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            view.list_dir("/secret").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            view.copy("/secret/f.txt", "/leak.txt").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            view.rename("/a.txt", "/secret/a.txt").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert!(!temp_dir.path().join("alice/docs/leak.txt").exists());
    }

    #[test]
    fn test_nested_share_visible_to_its_grantees() {
        let (temp_dir, owner, docs) = nested_setup();

        let carol = UserConfig::new("Carol").unwrap();
        let view =
            ShareView::new(temp_dir.path(), &owner, &docs, &Visitor::Identity(carol)).unwrap();
        assert_eq!(names(&view, "/"), vec!["secret", "a.txt"]);
        let mut contents = String::new();
        view.open_file("/secret/f.txt", OpenMode::Read)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "TOPSECRET");

        let as_owner = Visitor::Identity(owner.clone());
        let view = ShareView::new(temp_dir.path(), &owner, &docs, &as_owner).unwrap();
        assert!(view.stat("/secret/f.txt").is_ok());

        let view = ShareView::new(temp_dir.path(), &owner, &docs, &Visitor::Anonymous).unwrap();
        assert_eq!(names(&view, "/"), vec!["a.txt"]);
        assert_eq!(
            view.stat("/secret/f.txt").unwrap_err().kind(),
            ErrorKind::NotExist
        );
    }

    #[test]
    fn test_unresolvable_share_fails_to_open() {
        let (temp_dir, mut owner, _) = setup();
        let broken = ShareItem {
            path: "/../elsewhere".to_string(),
            ..ShareItem::default()
        };
        owner.shares.push(broken.clone());
        let err = ShareView::new(temp_dir.path(), &owner, &broken, &Visitor::Anonymous)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);

        let unowned = ShareItem::new("/docs/sub").unwrap().with_external(true);
        let err = ShareView::new(temp_dir.path(), &owner, &unowned, &Visitor::Anonymous)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);
    }

    #[test]
    fn test_visitor_name() {
        assert_eq!(Visitor::Anonymous.name(), None);
        let user = UserConfig::new("bob").unwrap();
        assert_eq!(Visitor::Identity(user).name(), Some("bob"));
    }
}

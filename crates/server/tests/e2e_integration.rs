//! End-to-end integration tests for Homeshare.
//!
//! These tests verify complete flows work correctly:
//! - Service startup, shutdown and registry persistence
//! - Share propagation seen through sandboxes
//! - Sandbox confinement
//! - Preview generation through the worker pool

use std::fs;
use std::io::{Read, Write};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use model::{ShareItem, UserConfig};
use server::config::Config;
use server::shares::link_dir;
use server::{
    ErrorKind, FileSystem, Homeshare, OpenMode, RegistryStore, ServiceState, SubmitOutcome,
    Visitor,
};
use tempfile::TempDir;

/// Create a test configuration with a temporary directory.
fn create_test_config() -> (Config, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.root = temp_dir.path().join("storage");
    config.storage.registry_path = temp_dir.path().join("registry.json");
    config.storage.save_interval_secs = 1;
    config.preview.cache_dir = temp_dir.path().join("previews");
    (config, temp_dir)
}

fn read_to_string(view: &dyn FileSystem, path: &str) -> String {
    let mut contents = String::new();
    view.open_file(path, OpenMode::Read)
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    contents
}

async fn wait_for_file(path: &Path) -> bool {
    for _ in 0..100 {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// =============================================================================
// Lifecycle and persistence
// =============================================================================

#[tokio::test]
async fn test_registry_survives_restart() {
    let (config, _temp_dir) = create_test_config();
    let addr: IpAddr = "192.168.1.20".parse().unwrap();

    let mut service = Homeshare::new(config.clone()).unwrap();
    service.start().await.unwrap();
    assert_eq!(service.state(), ServiceState::Running);

    let mut alice = UserConfig::new("alice")
        .unwrap()
        .with_write_access()
        .with_password("secret");
    alice.ips = vec![addr];
    service.shares().add_identity(alice).unwrap();
    let share = service
        .shares()
        .add_share("alice", ShareItem::new("/photos").unwrap().with_external(true))
        .unwrap();

    service.stop().await.unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);

    let service = Homeshare::new(config).unwrap();
    let registry = service.registry();

    let alice = registry.lookup_by_address(&addr).unwrap().unwrap();
    assert_eq!(alice.username, "alice");
    assert!(alice.verify_password("secret").unwrap());
    assert_eq!(alice.shares.len(), 1);
    assert_eq!(alice.shares[0].hash, share.hash);

    let entry = service.shares().lookup_anonymous(&share.hash).unwrap().unwrap();
    assert_eq!(entry.owner, "alice");
    assert_eq!(entry.share.path, "/photos");
}

#[tokio::test]
async fn test_periodic_persistence_while_running() {
    let (config, _temp_dir) = create_test_config();
    let registry_path = config.storage.registry_path.clone();

    let mut service = Homeshare::new(config).unwrap();
    service.start().await.unwrap();

    service
        .shares()
        .add_identity(UserConfig::new("carol").unwrap())
        .unwrap();

    let mut persisted = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if service.registry().dirty_count() == 0 {
            let on_disk = RegistryStore::load(&registry_path).unwrap();
            persisted = on_disk.lookup_by_name("carol").unwrap().is_some();
            if persisted {
                break;
            }
        }
    }
    assert!(persisted);

    service.stop().await.unwrap();
}

// =============================================================================
// Shares seen through sandboxes
// =============================================================================

#[tokio::test]
async fn test_shared_folder_is_reachable_from_viewer_sandbox() {
    let (config, _temp_dir) = create_test_config();
    let service = Homeshare::new(config).unwrap();
    let shares = service.shares();

    shares
        .add_identity(UserConfig::new("alice").unwrap().with_write_access())
        .unwrap();
    shares.add_identity(UserConfig::new("bob").unwrap()).unwrap();
    shares.add_identity(UserConfig::new("eve").unwrap()).unwrap();

    let alice_box = service.sandbox_for("alice").unwrap();
    alice_box.mkdir("/docs").unwrap();
    alice_box
        .open_file("/docs/report.txt", OpenMode::CreateNew)
        .unwrap()
        .write_all(b"quarterly")
        .unwrap();

    let share = shares
        .add_share("alice", ShareItem::new("/docs").unwrap().with_users(["Bob"]))
        .unwrap();

    let bob_box = service.sandbox_for("bob").unwrap();
    let listing = bob_box.list_dir("/shares/alice").unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, share.symlink_name());
    assert!(listing[0].is_symlink);
    assert!(listing[0].is_dir);

    let via_link = format!("/shares/alice/{}/report.txt", share.symlink_name());
    assert_eq!(read_to_string(&bob_box, &via_link), "quarterly");

    // Bob has no create rights, even through the link.
    let err = bob_box
        .open_file(
            &format!("/shares/alice/{}/new.txt", share.symlink_name()),
            OpenMode::CreateNew,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    assert!(!link_dir(shares.storage_root(), "eve", "alice").exists());
    assert_eq!(
        shares
            .resolve_access("eve", "alice", "/docs/report.txt")
            .unwrap_err()
            .kind(),
        ErrorKind::PermissionDenied
    );
    assert_eq!(
        shares
            .resolve_access("bob", "alice", "/docs/report.txt")
            .unwrap()
            .hash,
        share.hash
    );

    // Revoking the share removes the link and the now empty owner directory.
    shares.delete_share("alice", "/docs").unwrap();
    assert!(!link_dir(shares.storage_root(), "bob", "alice").exists());
    assert!(alice_box.stat("/docs/report.txt").is_ok());
}

#[tokio::test]
async fn test_share_views_for_visitors() {
    let (config, _temp_dir) = create_test_config();
    let service = Homeshare::new(config).unwrap();
    let shares = service.shares();

    shares
        .add_identity(UserConfig::new("alice").unwrap().with_write_access())
        .unwrap();
    shares
        .add_identity(UserConfig::new("bob").unwrap().with_write_access())
        .unwrap();

    let alice_box = service.sandbox_for("alice").unwrap();
    alice_box.mkdir("/drop").unwrap();

    let share = shares
        .add_share(
            "alice",
            ShareItem::new("/drop")
                .unwrap()
                .with_local(true)
                .with_external(true),
        )
        .unwrap();

    let anonymous = service.share_view(&Visitor::Anonymous, &share.hash).unwrap();
    assert_eq!(
        anonymous
            .open_file("/upload.txt", OpenMode::CreateNew)
            .unwrap_err()
            .kind(),
        ErrorKind::PermissionDenied
    );

    let bob = service.registry().lookup_by_name("bob").unwrap().unwrap();
    let as_bob = service
        .share_view(&Visitor::Identity(bob), &share.hash)
        .unwrap();
    as_bob
        .open_file("/upload.txt", OpenMode::CreateNew)
        .unwrap()
        .write_all(b"from bob")
        .unwrap();
    assert_eq!(read_to_string(&alice_box, "/drop/upload.txt"), "from bob");
    assert_eq!(read_to_string(&anonymous, "/upload.txt"), "from bob");

    assert_eq!(
        anonymous.stat("/../../bob").unwrap_err().kind(),
        ErrorKind::NotExist
    );
}

#[tokio::test]
async fn test_deleting_identity_cleans_every_link() {
    let (config, _temp_dir) = create_test_config();
    let service = Homeshare::new(config).unwrap();
    let shares = service.shares();

    let mut alice = UserConfig::new("alice").unwrap();
    alice.shares = vec![ShareItem::new("/").unwrap().with_local(true)];
    shares.add_identity(alice).unwrap();
    let mut bob = UserConfig::new("bob").unwrap();
    bob.shares = vec![ShareItem::new("/music").unwrap().with_users(["alice"])];
    shares.add_identity(bob).unwrap();

    let root = shares.storage_root().to_path_buf();
    assert!(link_dir(&root, "bob", "alice").is_dir());
    assert!(link_dir(&root, "alice", "bob").is_dir());

    shares.delete_identity("alice").unwrap();
    assert!(!link_dir(&root, "bob", "alice").exists());
    assert!(service.registry().lookup_by_name("alice").unwrap().is_none());

    // Deleting again is a no-op.
    shares.delete_identity("alice").unwrap();

    // The sandbox itself is left on disk.
    assert!(root.join("alice").is_dir());
}

// =============================================================================
// Sandbox confinement
// =============================================================================

#[tokio::test]
async fn test_sandbox_rejects_escapes() {
    let (config, _temp_dir) = create_test_config();
    let service = Homeshare::new(config).unwrap();
    service
        .shares()
        .add_identity(UserConfig::new("alice").unwrap().with_write_access())
        .unwrap();
    service
        .shares()
        .add_identity(UserConfig::new("bob").unwrap())
        .unwrap();
    fs::write(service.config().storage.root.join("bob/secret.txt"), "x").unwrap();

    let alice_box = service.sandbox_for("alice").unwrap();
    for path in ["/../bob/secret.txt", "../../bob/secret.txt", "/a\0b"] {
        assert_eq!(
            alice_box.stat(path).unwrap_err().kind(),
            ErrorKind::NotExist,
            "{path:?} escaped"
        );
    }

    assert_eq!(
        alice_box.remove_all("/").unwrap_err().kind(),
        ErrorKind::InvalidOperation
    );
}

// =============================================================================
// Previews
// =============================================================================

#[tokio::test]
async fn test_previews_through_worker_pool() {
    let (mut config, temp_dir) = create_test_config();
    let script = temp_dir.path().join("convert.sh");
    fs::write(&script, "printf '%s' \"$3\" > \"$2\"\n").unwrap();
    config.preview.script = Some(script);
    config.preview.workers = 2;

    let mut service = Homeshare::new(config).unwrap();
    service
        .shares()
        .add_identity(UserConfig::new("alice").unwrap().with_write_access())
        .unwrap();
    service.start().await.unwrap();

    let alice_box = service.sandbox_for("alice").unwrap();
    alice_box.mkdir("/media").unwrap();
    alice_box
        .open_file("/media/clip.mp4", OpenMode::CreateNew)
        .unwrap();
    alice_box
        .open_file("/media/photo.JPG", OpenMode::CreateNew)
        .unwrap();

    let alice = service.registry().lookup_by_name("alice").unwrap().unwrap();
    let (video, outcome) = service
        .request_preview(&alice, "/media/clip.mp4")
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Queued);
    let (image, outcome) = service
        .request_preview(&alice, "/media/photo.JPG")
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Queued);

    assert!(wait_for_file(&video).await);
    assert!(wait_for_file(&image).await);
    assert!(video.ends_with("alice/media/clip.mp4.mp4"));
    assert!(image.ends_with("alice/media/photo.JPG.jpg"));

    let mut kind = String::new();
    for _ in 0..100 {
        kind = fs::read_to_string(&video).unwrap();
        if !kind.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(kind, "video");

    let (_, outcome) = service
        .request_preview(&alice, "/media/clip.mp4")
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Skipped);

    service.stop().await.unwrap();
    assert!(service
        .request_preview(&alice, "/media/clip.mp4")
        .await
        .is_err());
}

use crate::error::{Error, Result};
use crate::fetcher::COMMIT_MARKER;
use crate::fsops;
use crate::profile::Profile;
use tokio_util::sync::CancellationToken;

pub async fn mirror(profile: &Profile, cancel: &CancellationToken) -> Result<()> {
    let live = profile.paths.live().to_path_buf();
    let copy = profile.paths.copy().to_path_buf();
    let copy_root = profile.paths.copy_root().to_path_buf();

    if !live.is_dir() {
        return Err(Error::NotFound(live));
    }

    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || {
        fsops::ensure_dir(&copy_root, false)?;
        fsops::mirror_tree(&live, &copy, Some(&fsops::git_exclude), &cancel)?;

        let marker = live.join(COMMIT_MARKER);
        if marker.is_file() {
            std::fs::copy(&marker, copy.join(COMMIT_MARKER)).map_err(|err| {
                Error::Mirror(format!("failed to copy commit marker: {err}"))
            })?;
        }
        Ok(())
    })
    .await
    .map_err(|err| Error::Internal(err.to_string()))?
}

pub async fn delete_live(profile: &Profile) -> Result<()> {
    let root = profile.paths.live_root().to_path_buf();
    tokio::task::spawn_blocking(move || fsops::force_delete(&root))
        .await
        .map_err(|err| Error::Internal(err.to_string()))?
}

pub async fn delete_copy(profile: &Profile) -> Result<()> {
    let root = profile.paths.copy_root().to_path_buf();
    tokio::task::spawn_blocking(move || fsops::force_delete(&root))
        .await
        .map_err(|err| Error::Internal(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileConfig;
    use std::path::Path;

    fn test_profile(root: &Path) -> Profile {
        let config = ProfileConfig {
            name: "Server 1".to_string(),
            live_path: Some(root.join("Live/repo").display().to_string()),
            copy_path: Some(root.join("Live_Copy/repo-copy").display().to_string()),
            backup_root: Some(root.join("Backup").display().to_string()),
            backup_zip_root: Some(root.join("BackupZip").display().to_string()),
            world_exe_path: None,
            auth_exe_path: None,
        };
        Profile::from_config(&config).expect("profile")
    }

    fn seed_live(profile: &Profile) {
        let live = profile.paths.live();
        std::fs::create_dir_all(live.join(".git/objects")).expect("git dir");
        std::fs::create_dir_all(live.join("sub")).expect("sub dir");
        std::fs::write(live.join("a.txt"), "a").expect("a.txt");
        std::fs::write(live.join(".git/objects/x.pack"), "pack").expect("pack");
        std::fs::write(live.join("sub/b.bin"), "b").expect("b.bin");
    }

    #[tokio::test]
    async fn mirror_excludes_git_and_copies_commit_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = test_profile(dir.path());
        seed_live(&profile);
        std::fs::write(profile.paths.live().join(COMMIT_MARKER), "abc123").expect("marker");

        mirror(&profile, &CancellationToken::new()).await.expect("mirror");

        let copy = profile.paths.copy();
        assert_eq!(std::fs::read_to_string(copy.join("a.txt")).expect("a"), "a");
        assert_eq!(
            std::fs::read_to_string(copy.join("sub/b.bin")).expect("b"),
            "b"
        );
        assert!(!copy.join(".git").exists());
        assert_eq!(
            std::fs::read_to_string(copy.join(COMMIT_MARKER)).expect("marker"),
            "abc123"
        );
    }

    #[tokio::test]
    async fn mirror_without_live_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = test_profile(dir.path());

        let err = mirror(&profile, &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_live_and_copy_remove_roots_and_are_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = test_profile(dir.path());
        seed_live(&profile);
        mirror(&profile, &CancellationToken::new()).await.expect("mirror");

        delete_live(&profile).await.expect("delete live");
        assert!(!profile.paths.live_root().exists());
        delete_live(&profile).await.expect("delete live again");

        delete_copy(&profile).await.expect("delete copy");
        assert!(!profile.paths.copy_root().exists());
        delete_copy(&profile).await.expect("delete copy again");
    }
}

use crate::config::{AppConfig, ArchiveFormat};
use crate::error::{Error, Result};
use crate::fsops;
use crate::mirror;
use crate::profile::Profile;
use crate::tool;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

pub async fn rotate(
    profile: &Profile,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let copy = profile.paths.copy().to_path_buf();
    let archive_root = profile.paths.archive_root().to_path_buf();

    if !copy.is_dir() {
        mirror::mirror(profile, cancel).await?;
    }

    {
        let archive_root = archive_root.clone();
        tokio::task::spawn_blocking(move || fsops::ensure_dir(&archive_root, false))
            .await
            .map_err(|err| Error::Internal(err.to_string()))??;
    }

    let stem = reserve_archive_stem(&archive_root, &date_tag());

    let seven = tool::locate("7z");
    let rar = tool::locate("rar");

    for format in &config.preferred_archive_order {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let dst = archive_root.join(format!("{stem}.{}", format.extension()));
        let attempt = match format {
            ArchiveFormat::SevenZip => match &seven {
                Some(exe) => {
                    external_archive(
                        exe,
                        &["a", "-t7z", "-mx=7", "-mmt=on"],
                        &dst,
                        &copy,
                        cancel,
                    )
                    .await
                }
                None => continue,
            },
            ArchiveFormat::Rar => match &rar {
                Some(exe) => {
                    external_archive(exe, &["a", "-ep1", "-m5", "-r"], &dst, &copy, cancel).await
                }
                None => continue,
            },
            ArchiveFormat::Zip => {
                let src = copy.clone();
                let dst = dst.clone();
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || zip_directory(&src, &dst, &cancel))
                    .await
                    .map_err(|err| Error::Internal(err.to_string()))?
            }
        };

        match attempt {
            Ok(()) => {
                {
                    let copy = copy.clone();
                    tokio::task::spawn_blocking(move || fsops::force_delete(&copy))
                        .await
                        .map_err(|err| Error::Internal(err.to_string()))??;
                }
                mirror::mirror(profile, cancel).await?;
                return Ok(dst);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                tracing::warn!(format = format.extension(), error = %err, "archive format failed");
            }
        }
    }

    Err(Error::Archive(
        "no supported archive format available".to_string(),
    ))
}

async fn external_archive(
    exe: &Path,
    args: &[&str],
    dst: &Path,
    copy: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let dst = dst.display().to_string();
    let glob = format!("{}{}*", copy.display(), std::path::MAIN_SEPARATOR);
    let mut full_args = args.to_vec();
    full_args.push(&dst);
    full_args.push(&glob);
    tool::run_checked(exe, &full_args, None, cancel).await?;
    Ok(())
}

pub fn reserve_archive_stem(archive_root: &Path, tag: &str) -> String {
    let extensions = ["7z", "rar", "zip"];
    let taken = |stem: &str| {
        extensions
            .iter()
            .any(|ext| archive_root.join(format!("{stem}.{ext}")).exists())
    };

    let mut stem = format!("Backup_{tag}");
    let mut counter = 0;
    while taken(&stem) {
        counter += 1;
        stem = format!("Backup_{tag}_{counter}");
    }
    stem
}

pub fn date_tag() -> String {
    let format = time::format_description::parse("[day]_[month]_[year repr:last_two]")
        .expect("static format");
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    now.format(&format).unwrap_or_else(|_| "00_00_00".to_string())
}

fn zip_directory(src: &Path, dst: &Path, cancel: &CancellationToken) -> Result<()> {
    let file = std::fs::File::create(dst)
        .map_err(|err| Error::Archive(format!("failed to create {}: {err}", dst.display())))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(9));

    for entry in WalkDir::new(src).min_depth(1) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let entry =
            entry.map_err(|err| Error::Archive(format!("failed to walk copy tree: {err}")))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(src)
            .map_err(|err| Error::Internal(format!("path escaped copy tree: {err}")))?;
        let name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer
                .add_directory(format!("{name}/"), options)
                .map_err(|err| Error::Archive(format!("failed to add {name}: {err}")))?;
        } else if entry.file_type().is_file() {
            writer
                .start_file(&name, options)
                .map_err(|err| Error::Archive(format!("failed to add {name}: {err}")))?;
            let mut reader = std::fs::File::open(path).map_err(|err| {
                Error::Archive(format!("failed to read {}: {err}", path.display()))
            })?;
            std::io::copy(&mut reader, &mut writer).map_err(|err| {
                Error::Archive(format!("failed to compress {}: {err}", path.display()))
            })?;
        }
    }

    writer
        .finish()
        .and_then(|mut file| file.flush().map_err(zip::result::ZipError::Io))
        .map_err(|err| Error::Archive(format!("failed to finish archive: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileConfig;

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
        std::fs::create_dir_all(live.join("sub")).expect("live dirs");
        std::fs::write(live.join("a.txt"), "a").expect("a.txt");
        std::fs::write(live.join("sub/b.bin"), "b").expect("b.bin");
    }

    fn zip_only_config() -> AppConfig {
        AppConfig {
            preferred_archive_order: vec![ArchiveFormat::Zip],
            ..AppConfig::default()
        }
    }

    #[test]
    fn reserve_skips_existing_names_across_extensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(root.join("Backup_01_01_25.7z"), "x").expect("seed 7z");
        std::fs::write(root.join("Backup_01_01_25_1.rar"), "x").expect("seed rar");

        assert_eq!(reserve_archive_stem(root, "01_01_25"), "Backup_01_01_25_2");
    }

    #[test]
    fn reserve_uses_plain_name_when_free() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(reserve_archive_stem(dir.path(), "02_03_24"), "Backup_02_03_24");
    }

    #[test]
    fn date_tag_has_day_month_short_year_shape() {
        let tag = date_tag();
        let parts: Vec<&str> = tag.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|part| part.len() == 2));
    }

    #[tokio::test]
    async fn rotate_with_zip_preference_archives_and_remirrors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = test_profile(dir.path());
        seed_live(&profile);

        let archive = rotate(&profile, &zip_only_config(), &CancellationToken::new())
            .await
            .expect("rotate");

        assert_eq!(archive.extension().and_then(|ext| ext.to_str()), Some("zip"));
        assert!(archive.is_file());
        assert!(archive.starts_with(profile.paths.archive_root()));

        let copy = profile.paths.copy();
        assert_eq!(std::fs::read_to_string(copy.join("a.txt")).expect("a"), "a");
        assert_eq!(std::fs::read_to_string(copy.join("sub/b.bin")).expect("b"), "b");

        let reader = std::fs::File::open(&archive).expect("open archive");
        let mut zip = zip::ZipArchive::new(reader).expect("read archive");
        let names: Vec<String> = (0..zip.len())
            .map(|index| zip.by_index(index).expect("entry").name().to_string())
            .collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"sub/b.bin".to_string()));
        assert!(names.iter().all(|name| !name.starts_with("repo-copy")));
    }

    #[tokio::test]
    async fn rotate_without_copy_mirrors_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = test_profile(dir.path());
        seed_live(&profile);
        assert!(!profile.paths.copy().exists());

        rotate(&profile, &zip_only_config(), &CancellationToken::new())
            .await
            .expect("rotate");

        assert!(profile.paths.copy().join("a.txt").is_file());
    }

    #[tokio::test]
    async fn successive_rotations_reserve_distinct_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = test_profile(dir.path());
        seed_live(&profile);
        let config = zip_only_config();

        let first = rotate(&profile, &config, &CancellationToken::new())
            .await
            .expect("first rotate");
        let second = rotate(&profile, &config, &CancellationToken::new())
            .await
            .expect("second rotate");

        assert_ne!(first, second);
        assert!(first.is_file());
        assert!(second.is_file());
    }

    #[tokio::test]
    async fn rotate_with_empty_preference_list_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = test_profile(dir.path());
        seed_live(&profile);
        let config = AppConfig {
            preferred_archive_order: Vec::new(),
            ..AppConfig::default()
        };

        let err = rotate(&profile, &config, &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Archive(_)));
    }
}

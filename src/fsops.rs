use crate::error::{Error, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

const DELETE_RETRIES: usize = 12;
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(250);

pub fn ensure_dir(path: &Path, harden: bool) -> Result<()> {
    if !path.is_dir() {
        fs::create_dir_all(path).map_err(|err| {
            Error::Mirror(format!("failed to create {}: {err}", path.display()))
        })?;
    }
    if harden {
        if let Err(err) = harden_dir(path) {
            tracing::warn!(path = %path.display(), error = %err, "acl hardening failed");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn harden_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(windows)]
fn harden_dir(path: &Path) -> std::io::Result<()> {
    use std::process::Command;
    let user = std::env::var("USERNAME")
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
    let grant = format!("{user}:(OI)(CI)F");
    for args in [
        vec!["/remove:g".to_string(), "Everyone".to_string()],
        vec!["/grant:r".to_string(), grant],
        vec!["/setowner".to_string(), user.clone()],
    ] {
        let status = Command::new("icacls").arg(path).args(&args).status()?;
        if !status.success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("icacls exited with {status}"),
            ));
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn harden_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

pub fn force_delete(path: &Path) -> Result<()> {
    if !path.is_dir() {
        return Ok(());
    }

    for entry in WalkDir::new(path).into_iter().filter_map(|entry| entry.ok()) {
        let _ = clear_readonly(entry.path());
    }

    for attempt in 0..DELETE_RETRIES {
        match fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(_) if attempt + 1 < DELETE_RETRIES => std::thread::sleep(DELETE_RETRY_DELAY),
            Err(err) => {
                return Err(Error::Mirror(format!(
                    "failed to delete {}: {err}",
                    path.display()
                )))
            }
        }
    }
    Ok(())
}

pub fn atomic_swap(temp_src: &Path, final_dst: &Path) -> Result<()> {
    if !temp_src.is_dir() {
        return Err(Error::NotFound(temp_src.to_path_buf()));
    }
    if final_dst.exists() {
        force_delete(final_dst)?;
    }
    fs::rename(temp_src, final_dst).map_err(|err| {
        Error::Mirror(format!(
            "failed to move {} to {}: {err}",
            temp_src.display(),
            final_dst.display()
        ))
    })
}

pub fn mirror_tree<F>(
    src: &Path,
    dst: &Path,
    exclude: Option<&F>,
    cancel: &CancellationToken,
) -> Result<()>
where
    F: Fn(&Path) -> bool,
{
    if !src.is_dir() {
        return Err(Error::NotFound(src.to_path_buf()));
    }

    force_delete(dst)?;
    fs::create_dir_all(dst)
        .map_err(|err| Error::Mirror(format!("failed to create {}: {err}", dst.display())))?;

    for entry in WalkDir::new(src).min_depth(1) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let entry =
            entry.map_err(|err| Error::Mirror(format!("failed to walk source tree: {err}")))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        if exclude.map(|predicate| predicate(path)).unwrap_or(false) {
            continue;
        }
        let target = dst.join(relative(src, path)?);
        fs::create_dir_all(&target).map_err(|err| {
            Error::Mirror(format!("failed to create {}: {err}", target.display()))
        })?;
    }

    for entry in WalkDir::new(src).min_depth(1) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let entry =
            entry.map_err(|err| Error::Mirror(format!("failed to walk source tree: {err}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if exclude.map(|predicate| predicate(path)).unwrap_or(false) {
            continue;
        }
        let target = dst.join(relative(src, path)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                Error::Mirror(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        if target.exists() {
            let _ = clear_readonly(&target);
        }
        fs::copy(path, &target).map_err(|err| {
            Error::Mirror(format!(
                "failed to copy {} to {}: {err}",
                path.display(),
                target.display()
            ))
        })?;
    }

    for entry in WalkDir::new(dst).min_depth(1).contents_first(true) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let path = entry.path();
        let counterpart = src.join(relative(dst, path)?);
        if counterpart.exists() {
            continue;
        }
        let _ = clear_readonly(path);
        let removed = if entry.file_type().is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        removed.map_err(|err| {
            Error::Mirror(format!("failed to remove {}: {err}", path.display()))
        })?;
    }

    Ok(())
}

pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::NotFound(src.to_path_buf()));
    }
    ensure_dir(dst, false)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry =
            entry.map_err(|err| Error::Mirror(format!("failed to walk source tree: {err}")))?;
        let path = entry.path();
        let target = dst.join(relative(src, path)?);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|err| {
                Error::Mirror(format!("failed to create {}: {err}", target.display()))
            })?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    Error::Mirror(format!("failed to create {}: {err}", parent.display()))
                })?;
            }
            fs::copy(path, &target).map_err(|err| {
                Error::Mirror(format!(
                    "failed to copy {} to {}: {err}",
                    path.display(),
                    target.display()
                ))
            })?;
        }
    }
    Ok(())
}

pub fn git_exclude(path: &Path) -> bool {
    if path
        .components()
        .any(|component| component.as_os_str() == ".git")
    {
        return true;
    }
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("pack") | Some("idx")
    )
}

fn relative<'a>(base: &Path, path: &'a Path) -> Result<&'a Path> {
    path.strip_prefix(base)
        .map_err(|err| Error::Internal(format!("path {} escaped its base: {err}", path.display())))
}

fn clear_readonly(path: &Path) -> std::io::Result<()> {
    let metadata = path.metadata()?;
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    #[serde(default)]
    pub live_path: Option<String>,
    #[serde(default)]
    pub copy_path: Option<String>,
    #[serde(default)]
    pub backup_root: Option<String>,
    #[serde(default)]
    pub backup_zip_root: Option<String>,
    #[serde(default)]
    pub world_exe_path: Option<String>,
    #[serde(default)]
    pub auth_exe_path: Option<String>,
}

impl ProfileConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            live_path: None,
            copy_path: None,
            backup_root: None,
            backup_zip_root: None,
            world_exe_path: None,
            auth_exe_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Live,
    Copy,
    BackupRoot,
    ArchiveRoot,
    WorldExe,
    AuthExe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilePaths {
    live: PathBuf,
    copy: PathBuf,
    backup_root: PathBuf,
    archive_root: PathBuf,
}

impl ProfilePaths {
    pub fn new(
        live: impl AsRef<Path>,
        copy: impl AsRef<Path>,
        backup_root: impl AsRef<Path>,
        archive_root: impl AsRef<Path>,
    ) -> Result<Self> {
        let live = normalize(live.as_ref(), "live")?;
        let copy = normalize(copy.as_ref(), "copy")?;
        let backup_root = normalize(backup_root.as_ref(), "backup root")?;
        let archive_root = normalize(archive_root.as_ref(), "archive root")?;

        if live == copy {
            return Err(Error::Config(
                "live and copy paths must not be the same".to_string(),
            ));
        }

        let all = [
            ("live", &live),
            ("copy", &copy),
            ("backup root", &backup_root),
            ("archive root", &archive_root),
        ];
        for (left_name, left) in &all {
            for (right_name, right) in &all {
                if left_name != right_name && right.starts_with(left) {
                    return Err(Error::Config(format!(
                        "{left_name} path {} is a prefix of {right_name} path {}",
                        left.display(),
                        right.display()
                    )));
                }
            }
        }

        Ok(Self {
            live,
            copy,
            backup_root,
            archive_root,
        })
    }

    pub fn live(&self) -> &Path {
        &self.live
    }

    pub fn copy(&self) -> &Path {
        &self.copy
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    pub fn live_root(&self) -> &Path {
        self.live.parent().unwrap_or(&self.live)
    }

    pub fn copy_root(&self) -> &Path {
        self.copy.parent().unwrap_or(&self.copy)
    }
}

fn normalize(path: &Path, which: &str) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(Error::Config(format!(
            "{which} path must be absolute: {}",
            path.display()
        )));
    }
    Ok(path
        .components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect())
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub paths: ProfilePaths,
    pub world_exe: Option<PathBuf>,
    pub auth_exe: Option<PathBuf>,
}

impl Profile {
    pub fn from_config(config: &ProfileConfig) -> Result<Self> {
        let missing = |field: &str| {
            Error::Config(format!(
                "profile {} has no {field} configured",
                config.name
            ))
        };
        let paths = ProfilePaths::new(
            config.live_path.as_deref().ok_or_else(|| missing("live path"))?,
            config.copy_path.as_deref().ok_or_else(|| missing("copy path"))?,
            config
                .backup_root
                .as_deref()
                .ok_or_else(|| missing("backup root"))?,
            config
                .backup_zip_root
                .as_deref()
                .ok_or_else(|| missing("archive root"))?,
        )?;
        Ok(Self {
            name: config.name.clone(),
            paths,
            world_exe: config.world_exe_path.as_deref().map(PathBuf::from),
            auth_exe: config.auth_exe_path.as_deref().map(PathBuf::from),
        })
    }

    pub fn resolved_world_exe(&self) -> PathBuf {
        self.world_exe
            .clone()
            .unwrap_or_else(|| self.paths.live().join("bin").join(default_exe("worldserver")))
    }

    pub fn resolved_auth_exe(&self) -> PathBuf {
        self.auth_exe
            .clone()
            .unwrap_or_else(|| self.paths.live().join("bin").join(default_exe("authserver")))
    }
}

fn default_exe(stem: &str) -> String {
    if cfg!(windows) {
        format!("{stem}.exe")
    } else {
        stem.to_string()
    }
}

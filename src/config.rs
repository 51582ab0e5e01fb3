use crate::error::{Error, Result};
use crate::profile::ProfileConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_REPOSITORY_URL: &str = "https://github.com/azerothcore/azerothcore-wotlk.git";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[serde(rename = "7z")]
    SevenZip,
    #[serde(rename = "rar")]
    Rar,
    #[serde(rename = "zip")]
    Zip,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::SevenZip => "7z",
            ArchiveFormat::Rar => "rar",
            ArchiveFormat::Zip => "zip",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub repository_url: String,
    pub repository_ref: Option<String>,
    pub download_path: Option<String>,
    pub preferred_archive_order: Vec<ArchiveFormat>,
    pub mirror_threads: usize,
    pub language: String,
    pub live_path: Option<String>,
    pub copy_path: Option<String>,
    pub backup_root: Option<String>,
    pub backup_zip: Option<String>,
    pub profiles: Vec<ProfileConfig>,
    pub selected_profile_index: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            repository_url: DEFAULT_REPOSITORY_URL.to_string(),
            repository_ref: None,
            download_path: None,
            preferred_archive_order: vec![
                ArchiveFormat::SevenZip,
                ArchiveFormat::Rar,
                ArchiveFormat::Zip,
            ],
            mirror_threads: 8,
            language: "en".to_string(),
            live_path: None,
            copy_path: None,
            backup_root: None,
            backup_zip: None,
            profiles: Vec::new(),
            selected_profile_index: 0,
        }
    }
}

impl AppConfig {
    pub fn ensure_profiles(&mut self) {
        if self.profiles.is_empty() {
            self.profiles.push(ProfileConfig::named("Server 1"));
        }
        self.selected_profile_index = self
            .selected_profile_index
            .min(self.profiles.len().saturating_sub(1));
    }

    pub fn resolved_profile(&self, index: usize) -> Option<ProfileConfig> {
        let mut profile = self.profiles.get(index)?.clone();
        let blank = |value: &Option<String>| {
            value
                .as_deref()
                .map(|value| value.trim().is_empty())
                .unwrap_or(true)
        };
        if blank(&profile.live_path) {
            profile.live_path = self.live_path.clone();
        }
        if blank(&profile.copy_path) {
            profile.copy_path = self.copy_path.clone();
        }
        if blank(&profile.backup_root) {
            profile.backup_root = self.backup_root.clone();
        }
        if blank(&profile.backup_zip_root) {
            profile.backup_zip_root = self.backup_zip.clone().or_else(|| {
                profile
                    .backup_root
                    .as_deref()
                    .map(|root| Path::new(root).join("Zip").display().to_string())
            });
        }
        Some(profile)
    }

    pub fn repository_name(&self) -> String {
        let trimmed = self.repository_url.trim_end_matches('/');
        let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
        let name = last.trim_end_matches(".git");
        if name.is_empty() {
            "azerothcore-wotlk".to_string()
        } else {
            name.to_string()
        }
    }
}

pub fn config_path() -> PathBuf {
    let base = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("appsettings.json")
}

pub async fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config = match tokio::fs::read_to_string(path).await {
        Ok(contents) => serde_json::from_str(&contents)
            .map_err(|err| Error::Config(format!("failed to parse config: {err}")))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(err) => return Err(Error::Config(format!("failed to read config: {err}"))),
    };
    config.ensure_profiles();
    Ok(config)
}

pub async fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| Error::Config(format!("failed to create config dir: {err}")))?;
    }

    let data = serde_json::to_string_pretty(config)
        .map_err(|err| Error::Config(format!("failed to serialize config: {err}")))?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|err| Error::Config(format!("failed to write temp config: {err}")))?;

    if tokio::fs::metadata(path).await.is_ok() {
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| Error::Config(format!("failed to remove old config: {err}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|err| Error::Config(format!("failed to move config into place: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults_with_one_profile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(&dir.path().join("appsettings.json"))
            .await
            .expect("load config");

        assert_eq!(config.repository_url, DEFAULT_REPOSITORY_URL);
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles[0].name, "Server 1");
        assert_eq!(config.selected_profile_index, 0);
    }

    #[tokio::test]
    async fn unknown_fields_are_ignored_and_missing_fields_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("appsettings.json");
        tokio::fs::write(
            &path,
            r#"{"repository_url":"https://example.invalid/repo.git","no_such_field":42}"#,
        )
        .await
        .expect("write config");

        let config = load_config(&path).await.expect("load config");
        assert_eq!(config.repository_url, "https://example.invalid/repo.git");
        assert_eq!(config.mirror_threads, 8);
        assert_eq!(config.profiles.len(), 1);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("appsettings.json");

        let mut config = AppConfig::default();
        config.repository_ref = Some("wotlk".to_string());
        config.preferred_archive_order = vec![ArchiveFormat::Zip];
        config.ensure_profiles();
        config.profiles[0].name = "Main".to_string();
        save_config(&path, &config).await.expect("save config");

        let loaded = load_config(&path).await.expect("load config");
        assert_eq!(loaded.repository_ref.as_deref(), Some("wotlk"));
        assert_eq!(loaded.preferred_archive_order, vec![ArchiveFormat::Zip]);
        assert_eq!(loaded.profiles[0].name, "Main");
    }

    #[test]
    fn selected_index_is_clamped() {
        let mut config = AppConfig::default();
        config.profiles.push(ProfileConfig::named("Only"));
        config.selected_profile_index = 7;
        config.ensure_profiles();
        assert_eq!(config.selected_profile_index, 0);
    }

    #[test]
    fn resolved_profile_backfills_blank_paths_from_globals() {
        let mut config = AppConfig::default();
        config.live_path = Some("/srv/Live/tree".to_string());
        config.copy_path = Some("/srv/Live_Copy/tree-copy".to_string());
        config.backup_root = Some("/srv/Backup".to_string());
        config.profiles.push(ProfileConfig::named("Default"));

        let resolved = config.resolved_profile(0).expect("profile");
        assert_eq!(resolved.live_path.as_deref(), Some("/srv/Live/tree"));
        assert_eq!(resolved.copy_path.as_deref(), Some("/srv/Live_Copy/tree-copy"));
        assert_eq!(resolved.backup_root.as_deref(), Some("/srv/Backup"));
        let zip = resolved.backup_zip_root.expect("zip root");
        assert!(zip.ends_with("Zip"));
        assert!(zip.starts_with("/srv/Backup"));
    }

    #[test]
    fn resolved_profile_keeps_explicit_paths() {
        let mut config = AppConfig::default();
        config.live_path = Some("/srv/Live/tree".to_string());
        let mut profile = ProfileConfig::named("Custom");
        profile.live_path = Some("/elsewhere/Live/tree".to_string());
        config.profiles.push(profile);

        let resolved = config.resolved_profile(0).expect("profile");
        assert_eq!(resolved.live_path.as_deref(), Some("/elsewhere/Live/tree"));
    }

    #[test]
    fn repository_name_strips_git_suffix() {
        let mut config = AppConfig::default();
        assert_eq!(config.repository_name(), "azerothcore-wotlk");

        config.repository_url = "https://example.invalid/teams/repo".to_string();
        assert_eq!(config.repository_name(), "repo");
    }

    #[test]
    fn archive_format_uses_short_names() {
        let order = vec![ArchiveFormat::SevenZip, ArchiveFormat::Rar, ArchiveFormat::Zip];
        let json = serde_json::to_string(&order).expect("serialize order");
        assert_eq!(json, r#"["7z","rar","zip"]"#);
    }
}

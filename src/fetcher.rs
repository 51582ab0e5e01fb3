use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::fsops;
use crate::profile::Profile;
use crate::tool;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const COMMIT_MARKER: &str = "commit.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Clean,
    Update,
}

#[async_trait]
pub trait ArchiveDownloader: Send + Sync {
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

pub struct ReqwestDownloader {
    client: reqwest::Client,
}

impl ReqwestDownloader {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("acsm/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for ReqwestDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArchiveDownloader for ReqwestDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| Error::Fetch(format!("failed to request {url}: {err}")))?
            .error_for_status()
            .map_err(|err| Error::Fetch(format!("request for {url} failed: {err}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| Error::Fetch(format!("failed to read body of {url}: {err}")))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|err| Error::Fetch(format!("failed to store archive: {err}")))
    }
}

#[derive(Clone)]
pub struct Fetcher {
    downloader: Arc<dyn ArchiveDownloader>,
}

impl Fetcher {
    pub fn new() -> Self {
        Self {
            downloader: Arc::new(ReqwestDownloader::new()),
        }
    }

    pub fn with_downloader(downloader: Arc<dyn ArchiveDownloader>) -> Self {
        Self { downloader }
    }

    pub async fn fetch(
        &self,
        profile: &Profile,
        config: &AppConfig,
        mode: FetchMode,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let live = profile.paths.live().to_path_buf();
        let live_root = profile.paths.live_root().to_path_buf();

        let root = live_root.clone();
        tokio::task::spawn_blocking(move || fsops::ensure_dir(&root, true))
            .await
            .map_err(|err| Error::Internal(err.to_string()))??;

        let git = tool::locate("git");

        if mode == FetchMode::Update && live.join(".git").is_dir() {
            if let Some(git) = &git {
                let commit = refresh(git, &live, config, cancel).await?;
                write_marker(&live, &commit).await?;
                return Ok(commit);
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let target = live.clone();
        tokio::task::spawn_blocking(move || fsops::force_delete(&target))
            .await
            .map_err(|err| Error::Internal(err.to_string()))??;

        if let Some(git) = &git {
            match clone(git, &live, config, cancel).await {
                Ok(commit) => {
                    write_marker(&live, &commit).await?;
                    return Ok(commit);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    tracing::warn!(error = %err, "git clone failed, trying archive download");
                    let target = live.clone();
                    tokio::task::spawn_blocking(move || fsops::force_delete(&target))
                        .await
                        .map_err(|err| Error::Internal(err.to_string()))??;
                }
            }
        }

        let commit = self
            .download_archive(&live, &live_root, config, cancel)
            .await?;
        write_marker(&live, &commit).await?;
        Ok(commit)
    }

    async fn download_archive(
        &self,
        live: &Path,
        live_root: &Path,
        config: &AppConfig,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let base = config.repository_url.trim_end_matches(".git");
        let candidates: Vec<String> = match &config.repository_ref {
            Some(branch) => vec![branch.clone()],
            None => vec!["master".to_string(), "main".to_string()],
        };

        let mut failures = Vec::new();
        for branch in &candidates {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let url = format!("{base}/archive/refs/heads/{branch}.zip");
            match self
                .try_branch_archive(&url, live, live_root, branch, cancel)
                .await
            {
                Ok(commit) => return Ok(commit),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    tracing::warn!(branch = %branch, error = %err, "archive download failed");
                    failures.push(format!("{branch}: {err}"));
                }
            }
        }

        Err(Error::Fetch(format!(
            "all branch candidates failed: {}",
            failures.join("; ")
        )))
    }

    async fn try_branch_archive(
        &self,
        url: &str,
        live: &Path,
        live_root: &Path,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let staging = tempfile::Builder::new()
            .prefix(".acsm-fetch-")
            .tempdir_in(live_root)
            .map_err(|err| Error::Fetch(format!("failed to create staging dir: {err}")))?;

        let archive_path = staging.path().join("archive.zip");
        self.downloader.download(url, &archive_path).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let tree_dir = staging.path().join("tree");
        let expand_archive = archive_path.clone();
        let expand_into = tree_dir.clone();
        tokio::task::spawn_blocking(move || expand_zip(&expand_archive, &expand_into))
            .await
            .map_err(|err| Error::Internal(err.to_string()))??;

        let top = single_top_level_dir(&tree_dir)?;
        let live = live.to_path_buf();
        tokio::task::spawn_blocking(move || fsops::atomic_swap(&top, &live))
            .await
            .map_err(|err| Error::Internal(err.to_string()))??;

        Ok(synthesize_commit_id(branch))
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn clone(
    git: &Path,
    live: &Path,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<String> {
    let live_str = live.display().to_string();
    let mut args = vec!["clone", "--depth", "1"];
    if let Some(branch) = &config.repository_ref {
        args.push("--branch");
        args.push(branch);
    }
    args.push(&config.repository_url);
    args.push(&live_str);

    tool::run_checked(git, &args, None, cancel).await?;
    head_commit(git, live, cancel).await
}

async fn refresh(
    git: &Path,
    live: &Path,
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<String> {
    match &config.repository_ref {
        Some(branch) => {
            tool::run_checked(git, &["fetch", "--all"], Some(live), cancel).await?;
            let target = format!("origin/{branch}");
            tool::run_checked(git, &["reset", "--hard", &target], Some(live), cancel).await?;
        }
        None => {
            tool::run_checked(git, &["pull", "--ff-only"], Some(live), cancel).await?;
        }
    }
    head_commit(git, live, cancel).await
}

async fn head_commit(git: &Path, live: &Path, cancel: &CancellationToken) -> Result<String> {
    let output = tool::run_checked(git, &["rev-parse", "HEAD"], Some(live), cancel).await?;
    let commit = output.stdout.trim().to_string();
    if commit.is_empty() {
        return Err(Error::Fetch("rev-parse produced no commit id".to_string()));
    }
    Ok(commit)
}

fn expand_zip(archive: &Path, into: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .map_err(|err| Error::Fetch(format!("failed to open archive: {err}")))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|err| Error::Fetch(format!("failed to read archive: {err}")))?;
    zip.extract(into)
        .map_err(|err| Error::Fetch(format!("failed to expand archive: {err}")))
}

fn single_top_level_dir(root: &Path) -> Result<PathBuf> {
    let mut entries = std::fs::read_dir(root)
        .map_err(|err| Error::Fetch(format!("failed to list expanded archive: {err}")))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect::<Vec<_>>();

    match (entries.len(), entries.pop()) {
        (1, Some(single)) if single.is_dir() => Ok(single),
        _ => Err(Error::Fetch(
            "archive does not contain a single top-level directory".to_string(),
        )),
    }
}

fn synthesize_commit_id(branch: &str) -> String {
    let format = time::format_description::parse("[year][month][day]-[hour][minute]")
        .expect("static format");
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let stamp = now.format(&format).unwrap_or_else(|_| "unknown".to_string());
    format!("ZIP-{branch}-{stamp}")
}

async fn write_marker(live: &Path, commit: &str) -> Result<()> {
    tokio::fs::write(live.join(COMMIT_MARKER), commit)
        .await
        .map_err(|err| Error::Fetch(format!("failed to write commit marker: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileConfig;
    use std::io::Write;

    struct ZipFixtureDownloader {
        top_level: String,
    }

    #[async_trait]
    impl ArchiveDownloader for ZipFixtureDownloader {
        async fn download(&self, _url: &str, dest: &Path) -> Result<()> {
            let file = std::fs::File::create(dest)
                .map_err(|err| Error::Fetch(format!("fixture create failed: {err}")))?;
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default();
            writer
                .add_directory(format!("{}/", self.top_level), options)
                .map_err(|err| Error::Fetch(format!("fixture dir failed: {err}")))?;
            writer
                .start_file(format!("{}/README.md", self.top_level), options)
                .map_err(|err| Error::Fetch(format!("fixture file failed: {err}")))?;
            writer
                .write_all(b"fixture")
                .map_err(|err| Error::Fetch(format!("fixture write failed: {err}")))?;
            writer
                .finish()
                .map_err(|err| Error::Fetch(format!("fixture finish failed: {err}")))?;
            Ok(())
        }
    }

    struct FailingDownloader;

    #[async_trait]
    impl ArchiveDownloader for FailingDownloader {
        async fn download(&self, url: &str, _dest: &Path) -> Result<()> {
            Err(Error::Fetch(format!("no route to {url}")))
        }
    }

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

    fn offline_config() -> AppConfig {
        AppConfig {
            repository_url: "https://example.invalid/repo.git".to_string(),
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn archive_fallback_populates_live_and_commit_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = test_profile(dir.path());
        let config = offline_config();

        let fetcher = Fetcher::with_downloader(Arc::new(ZipFixtureDownloader {
            top_level: "repo-master".to_string(),
        }));

        let commit = fetcher
            .fetch(&profile, &config, FetchMode::Clean, &CancellationToken::new())
            .await
            .expect("fetch");

        assert!(commit.starts_with("ZIP-master-"));
        assert!(profile.paths.live().join("README.md").is_file());
        let marker = std::fs::read_to_string(profile.paths.live().join(COMMIT_MARKER))
            .expect("read marker");
        assert_eq!(marker, commit);
        assert!(
            std::fs::read_dir(profile.paths.live_root())
                .expect("list live root")
                .filter_map(|entry| entry.ok())
                .all(|entry| !entry.file_name().to_string_lossy().starts_with(".acsm-fetch")),
            "staging dirs must be cleaned up"
        );
    }

    #[tokio::test]
    async fn all_candidates_failing_is_a_fetch_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = test_profile(dir.path());
        let config = offline_config();

        let fetcher = Fetcher::with_downloader(Arc::new(FailingDownloader));

        let err = fetcher
            .fetch(&profile, &config, FetchMode::Clean, &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Fetch(_)));
        let message = err.to_string();
        assert!(message.contains("master"));
        assert!(message.contains("main"));
    }

    #[test]
    fn synthesized_commit_ids_carry_branch_and_stamp() {
        let id = synthesize_commit_id("main");
        assert!(id.starts_with("ZIP-main-"));
        assert_eq!(id.len(), "ZIP-main-".len() + 13);
    }

    #[test]
    fn single_top_level_requires_exactly_one_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("one")).expect("mkdir");
        assert_eq!(
            single_top_level_dir(dir.path()).expect("single"),
            dir.path().join("one")
        );

        std::fs::create_dir(dir.path().join("two")).expect("mkdir");
        assert!(single_top_level_dir(dir.path()).is_err());
    }
}

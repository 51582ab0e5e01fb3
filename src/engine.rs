use crate::archiver;
use crate::config::{self, AppConfig};
use crate::error::{Error, Result};
use crate::events::{Event, EventSink, LogLevel, ProcessTarget, RunState};
use crate::fetcher::{ArchiveDownloader, FetchMode, Fetcher};
use crate::fsops;
use crate::mirror;
use crate::profile::{PathKind, Profile, ProfileConfig};
use crate::sampler::{ProcessSample, Sampler};
use crate::supervisor::Supervisor;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const SNAPSHOT_PREFIX: &str = "snapshot_";
pub const DEFAULT_SNAPSHOT_KEEP: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PathStates {
    pub live: bool,
    pub copy: bool,
    pub backup_root: bool,
    pub archive_root: bool,
}

#[derive(Default)]
struct ProfileSlot {
    state: RunState,
    cancel: Option<CancellationToken>,
}

struct EngineInner {
    config_path: PathBuf,
    config: Mutex<AppConfig>,
    slots: Mutex<HashMap<String, ProfileSlot>>,
    samplers: Mutex<HashMap<(String, ProcessTarget), Sampler>>,
    sink: Arc<dyn EventSink>,
    fetcher: Fetcher,
    supervisor: Supervisor,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub async fn new(config_path: impl Into<PathBuf>, sink: Arc<dyn EventSink>) -> Result<Self> {
        Self::build(config_path.into(), sink, Fetcher::new()).await
    }

    pub async fn with_downloader(
        config_path: impl Into<PathBuf>,
        sink: Arc<dyn EventSink>,
        downloader: Arc<dyn ArchiveDownloader>,
    ) -> Result<Self> {
        Self::build(config_path.into(), sink, Fetcher::with_downloader(downloader)).await
    }

    async fn build(config_path: PathBuf, sink: Arc<dyn EventSink>, fetcher: Fetcher) -> Result<Self> {
        let config = config::load_config(&config_path).await?;
        let supervisor = Supervisor::new();

        let mut receiver = supervisor.subscribe();
        let forward_sink = Arc::clone(&sink);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(line) => forward_sink.on_event(Event::log(LogLevel::Info, line)),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Self {
            inner: Arc::new(EngineInner {
                config_path,
                config: Mutex::new(config),
                slots: Mutex::new(HashMap::new()),
                samplers: Mutex::new(HashMap::new()),
                sink,
                fetcher,
                supervisor,
            }),
        })
    }

    pub async fn config(&self) -> AppConfig {
        self.inner.config.lock().await.clone()
    }

    pub async fn profiles(&self) -> Vec<ProfileConfig> {
        self.inner.config.lock().await.profiles.clone()
    }

    pub async fn run_state(&self, id: &str) -> RunState {
        self.inner
            .slots
            .lock()
            .await
            .get(id)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    pub async fn add_profile(&self, name: Option<String>) -> Result<String> {
        let mut config = self.inner.config.lock().await;
        let name = name.unwrap_or_else(|| format!("Server {}", config.profiles.len() + 1));
        if name.trim().is_empty() {
            return Err(Error::Config("profile name must not be empty".to_string()));
        }
        if config.profiles.iter().any(|profile| profile.name == name) {
            return Err(Error::Config(format!("profile {name} already exists")));
        }
        config.profiles.push(ProfileConfig::named(name.clone()));
        config::save_config(&self.inner.config_path, &config).await?;
        drop(config);

        self.emit(Event::log(LogLevel::Info, format!("✓ profile {name} added")));
        Ok(name)
    }

    pub async fn remove_profile(&self, id: &str) -> Result<()> {
        self.require_idle(id).await?;

        let mut config = self.inner.config.lock().await;
        let index = profile_index(&config, id)?;
        if config.profiles.len() == 1 {
            return Err(Error::Config(
                "the last profile cannot be deleted".to_string(),
            ));
        }
        config.profiles.remove(index);
        config.ensure_profiles();
        config::save_config(&self.inner.config_path, &config).await?;
        drop(config);

        self.inner.slots.lock().await.remove(id);
        let mut samplers = self.inner.samplers.lock().await;
        samplers.retain(|(profile, _), sampler| {
            if profile == id {
                sampler.stop();
                false
            } else {
                true
            }
        });
        drop(samplers);

        self.emit(Event::log(LogLevel::Info, format!("✓ profile {id} removed")));
        Ok(())
    }

    pub async fn rename_profile(&self, id: &str, new_name: &str) -> Result<()> {
        self.require_idle(id).await?;
        if new_name.trim().is_empty() {
            return Err(Error::Config("profile name must not be empty".to_string()));
        }

        let mut config = self.inner.config.lock().await;
        if config
            .profiles
            .iter()
            .any(|profile| profile.name == new_name)
        {
            return Err(Error::Config(format!("profile {new_name} already exists")));
        }
        let index = profile_index(&config, id)?;
        config.profiles[index].name = new_name.to_string();
        config::save_config(&self.inner.config_path, &config).await?;
        drop(config);

        let mut slots = self.inner.slots.lock().await;
        if let Some(slot) = slots.remove(id) {
            slots.insert(new_name.to_string(), slot);
        }
        drop(slots);

        let mut samplers = self.inner.samplers.lock().await;
        let moved: Vec<_> = samplers
            .keys()
            .filter(|(profile, _)| profile == id)
            .cloned()
            .collect();
        for key in moved {
            if let Some(sampler) = samplers.remove(&key) {
                samplers.insert((new_name.to_string(), key.1), sampler);
            }
        }
        drop(samplers);

        self.emit(Event::log(
            LogLevel::Info,
            format!("✓ profile {id} renamed to {new_name}"),
        ));
        Ok(())
    }

    pub async fn set_path(&self, id: &str, kind: PathKind, value: &str) -> Result<()> {
        self.require_idle(id).await?;

        let mut config = self.inner.config.lock().await;
        let index = profile_index(&config, id)?;
        let previous = config.profiles[index].clone();

        {
            let profile = &mut config.profiles[index];
            let value = Some(value.to_string());
            match kind {
                PathKind::Live => profile.live_path = value,
                PathKind::Copy => profile.copy_path = value,
                PathKind::BackupRoot => profile.backup_root = value,
                PathKind::ArchiveRoot => profile.backup_zip_root = value,
                PathKind::WorldExe => profile.world_exe_path = value,
                PathKind::AuthExe => profile.auth_exe_path = value,
            }
        }

        if let Err(err) = validate_profile_paths(&config.profiles[index], kind, value) {
            config.profiles[index] = previous;
            return Err(err);
        }

        config::save_config(&self.inner.config_path, &config).await?;
        drop(config);

        self.emit(Event::log(
            LogLevel::Info,
            format!("✓ path updated for profile {id}"),
        ));
        Ok(())
    }

    pub async fn path_states(&self, id: &str) -> Result<PathStates> {
        let config = self.inner.config.lock().await;
        let index = profile_index(&config, id)?;
        let profile = &config.profiles[index];
        let exists = |path: &Option<String>| {
            path.as_deref()
                .map(|path| Path::new(path).is_dir())
                .unwrap_or(false)
        };
        Ok(PathStates {
            live: exists(&profile.live_path),
            copy: exists(&profile.copy_path),
            backup_root: exists(&profile.backup_root),
            archive_root: exists(&profile.backup_zip_root),
        })
    }

    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let slots = self.inner.slots.lock().await;
        match slots.get(id).and_then(|slot| slot.cancel.clone()) {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn create_structure(&self, id: &str, root: &Path) -> Result<()> {
        let token = self.begin(id, RunState::Preparing).await?;
        self.progress(id, "creating folder structure");
        let result = self.do_create_structure(id, root).await;
        self.finish(id, "create structure", &result, |_| {
            "folder structure created".to_string()
        })
        .await;
        drop(token);
        result
    }

    async fn do_create_structure(&self, id: &str, root: &Path) -> Result<()> {
        if !root.is_absolute() {
            return Err(Error::Config(format!(
                "structure root must be absolute: {}",
                root.display()
            )));
        }

        let repo_name = { self.inner.config.lock().await.repository_name() };

        let live_root = root.join("Live");
        let copy_root = root.join("Live_Copy");
        let backup_root = root.join("Backup");
        let archive_root = root.join("BackupZip");

        let dirs = vec![
            live_root.clone(),
            copy_root.clone(),
            backup_root.clone(),
            archive_root.clone(),
        ];
        tokio::task::spawn_blocking(move || {
            for dir in &dirs {
                fsops::ensure_dir(dir, false)?;
            }
            Ok::<(), Error>(())
        })
        .await
        .map_err(|err| Error::Internal(err.to_string()))??;

        let mut config = self.inner.config.lock().await;
        let index = profile_index(&config, id)?;
        {
            let profile = &mut config.profiles[index];
            profile.live_path = Some(live_root.join(&repo_name).display().to_string());
            profile.copy_path = Some(
                copy_root
                    .join(format!("{repo_name}-copy"))
                    .display()
                    .to_string(),
            );
            profile.backup_root = Some(backup_root.display().to_string());
            profile.backup_zip_root = Some(archive_root.display().to_string());
        }
        Profile::from_config(&config.profiles[index])?;
        config::save_config(&self.inner.config_path, &config).await
    }

    pub async fn fetch(&self, id: &str, mode: FetchMode) -> Result<String> {
        let token = self.begin(id, RunState::Fetching).await?;
        self.progress(id, "fetching repository");
        let result = async {
            let (profile, config) = self.profile_and_config(id).await?;
            self.inner.fetcher.fetch(&profile, &config, mode, &token).await
        }
        .await;
        self.finish(id, "fetch", &result, |commit| {
            format!("fetch completed at {commit}")
        })
        .await;
        result
    }

    pub async fn mirror(&self, id: &str) -> Result<()> {
        let token = self.begin(id, RunState::Mirroring).await?;
        self.progress(id, "mirroring live to copy");
        let result = async {
            let profile = self.profile(id).await?;
            mirror::mirror(&profile, &token).await
        }
        .await;
        self.finish(id, "mirror", &result, |_| "copy updated".to_string())
            .await;
        result
    }

    pub async fn delete_live(&self, id: &str) -> Result<()> {
        let token = self.begin(id, RunState::DeletingLive).await?;
        self.progress(id, "deleting live tree");
        let result = async {
            let profile = self.profile(id).await?;
            mirror::delete_live(&profile).await
        }
        .await;
        self.finish(id, "delete live", &result, |_| "live tree deleted".to_string())
            .await;
        drop(token);
        result
    }

    pub async fn delete_copy(&self, id: &str) -> Result<()> {
        let token = self.begin(id, RunState::DeletingCopy).await?;
        self.progress(id, "deleting copy tree");
        let result = async {
            let profile = self.profile(id).await?;
            mirror::delete_copy(&profile).await
        }
        .await;
        self.finish(id, "delete copy", &result, |_| "copy tree deleted".to_string())
            .await;
        drop(token);
        result
    }

    pub async fn rotate(&self, id: &str) -> Result<PathBuf> {
        let token = self.begin(id, RunState::Archiving).await?;
        self.progress(id, "rotating backup archive");
        let result = async {
            let (profile, config) = self.profile_and_config(id).await?;
            archiver::rotate(&profile, &config, &token).await
        }
        .await;
        self.finish(id, "rotate", &result, |path| {
            format!("backup created at {}", path.display())
        })
        .await;
        result
    }

    pub async fn snapshot(&self, id: &str) -> Result<PathBuf> {
        let token = self.begin(id, RunState::Snapshotting).await?;
        self.progress(id, "taking snapshot");
        let result = async {
            let profile = self.profile(id).await?;
            snapshot_live(&profile).await
        }
        .await;
        self.finish(id, "snapshot", &result, |path| {
            format!("snapshot created at {}", path.display())
        })
        .await;
        drop(token);
        result
    }

    pub async fn prune_snapshots(&self, id: &str, keep: usize) -> Result<usize> {
        let token = self.begin(id, RunState::Snapshotting).await?;
        self.progress(id, "pruning snapshots");
        let result = async {
            let profile = self.profile(id).await?;
            prune_snapshots_in(profile.paths.backup_root(), keep).await
        }
        .await;
        self.finish(id, "prune snapshots", &result, |removed| {
            format!("{removed} snapshots removed")
        })
        .await;
        drop(token);
        result
    }

    pub async fn start_server(&self, id: &str, target: ProcessTarget) -> Result<u32> {
        let exe = self.server_exe(id, target).await?;
        let pid = self.inner.supervisor.start(&exe).await?;
        self.emit(Event::log(
            LogLevel::Info,
            format!("✓ {target} server started (pid {pid})"),
        ));

        let mut samplers = self.inner.samplers.lock().await;
        let sampler = samplers
            .entry((id.to_string(), target))
            .or_insert_with(|| Sampler::new(exe.clone(), None));
        let sink = Arc::clone(&self.inner.sink);
        let profile_name = id.to_string();
        sampler.start(move |sample| {
            sink.on_event(Event::Metrics {
                profile: profile_name.clone(),
                target,
                cpu_percent: sample.cpu_percent,
                rss_mb: sample.rss_mb,
            });
        });
        Ok(pid)
    }

    pub async fn stop_server(&self, id: &str, target: ProcessTarget) -> Result<bool> {
        let exe = self.server_exe(id, target).await?;
        let stopped = self.inner.supervisor.stop(&exe).await?;

        if let Some(sampler) = self
            .inner
            .samplers
            .lock()
            .await
            .get_mut(&(id.to_string(), target))
        {
            sampler.stop();
        }

        if stopped {
            self.emit(Event::log(
                LogLevel::Info,
                format!("✓ {target} server stopped"),
            ));
        }
        Ok(stopped)
    }

    pub async fn restart_server(&self, id: &str, target: ProcessTarget) -> Result<u32> {
        self.stop_server(id, target).await?;
        self.start_server(id, target).await
    }

    pub async fn is_server_running(&self, id: &str, target: ProcessTarget) -> Result<bool> {
        let exe = self.server_exe(id, target).await?;
        tokio::task::spawn_blocking(move || Supervisor::is_running(&exe))
            .await
            .map_err(|err| Error::Internal(err.to_string()))
    }

    pub async fn server_sample(&self, id: &str, target: ProcessTarget) -> ProcessSample {
        self.inner
            .samplers
            .lock()
            .await
            .get(&(id.to_string(), target))
            .map(|sampler| sampler.current())
            .unwrap_or_default()
    }

    async fn server_exe(&self, id: &str, target: ProcessTarget) -> Result<PathBuf> {
        let profile = self.profile(id).await?;
        Ok(match target {
            ProcessTarget::World => profile.resolved_world_exe(),
            ProcessTarget::Auth => profile.resolved_auth_exe(),
        })
    }

    async fn profile(&self, id: &str) -> Result<Profile> {
        let config = self.inner.config.lock().await;
        let index = profile_index(&config, id)?;
        let resolved = config
            .resolved_profile(index)
            .ok_or_else(|| Error::Internal(format!("profile index {index} out of range")))?;
        Profile::from_config(&resolved)
    }

    async fn profile_and_config(&self, id: &str) -> Result<(Profile, AppConfig)> {
        let config = self.inner.config.lock().await;
        let index = profile_index(&config, id)?;
        let resolved = config
            .resolved_profile(index)
            .ok_or_else(|| Error::Internal(format!("profile index {index} out of range")))?;
        let profile = Profile::from_config(&resolved)?;
        Ok((profile, config.clone()))
    }

    async fn require_idle(&self, id: &str) -> Result<()> {
        {
            let config = self.inner.config.lock().await;
            profile_index(&config, id)?;
        }
        let slots = self.inner.slots.lock().await;
        match slots.get(id) {
            Some(slot) if slot.state != RunState::Idle => Err(Error::Busy {
                profile: id.to_string(),
                state: slot.state,
            }),
            _ => Ok(()),
        }
    }

    async fn begin(&self, id: &str, state: RunState) -> Result<CancellationToken> {
        {
            let config = self.inner.config.lock().await;
            profile_index(&config, id)?;
        }

        let mut slots = self.inner.slots.lock().await;
        let slot = slots.entry(id.to_string()).or_default();
        if slot.state != RunState::Idle {
            return Err(Error::Busy {
                profile: id.to_string(),
                state: slot.state,
            });
        }
        let token = CancellationToken::new();
        slot.state = state;
        slot.cancel = Some(token.clone());
        drop(slots);

        self.emit(Event::Status {
            profile: id.to_string(),
            state,
        });
        Ok(token)
    }

    async fn finish<T>(
        &self,
        id: &str,
        op: &str,
        result: &Result<T>,
        success_text: impl FnOnce(&T) -> String,
    ) {
        {
            let mut slots = self.inner.slots.lock().await;
            if let Some(slot) = slots.get_mut(id) {
                slot.state = RunState::Idle;
                slot.cancel = None;
            }
        }
        self.emit(Event::Status {
            profile: id.to_string(),
            state: RunState::Idle,
        });

        match result {
            Ok(value) => self.emit(Event::log(
                LogLevel::Info,
                format!("✓ {}", success_text(value)),
            )),
            Err(Error::Cancelled) => self.emit(Event::log(
                LogLevel::Cancelled,
                format!("✗ {op} cancelled"),
            )),
            Err(err) => self.emit(Event::log(LogLevel::Error, format!("✗ {err}"))),
        }
    }

    fn progress(&self, id: &str, text: &str) {
        self.emit(Event::Progress {
            profile: id.to_string(),
            text: text.to_string(),
        });
    }

    fn emit(&self, event: Event) {
        self.inner.sink.on_event(event);
    }
}

fn profile_index(config: &AppConfig, id: &str) -> Result<usize> {
    config
        .profiles
        .iter()
        .position(|profile| profile.name == id)
        .ok_or_else(|| Error::Config(format!("no profile named {id}")))
}

fn validate_profile_paths(profile: &ProfileConfig, kind: PathKind, value: &str) -> Result<()> {
    let primary = matches!(
        kind,
        PathKind::Live | PathKind::Copy | PathKind::BackupRoot | PathKind::ArchiveRoot
    );
    if primary && !Path::new(value).is_absolute() {
        return Err(Error::Config(format!("path must be absolute: {value}")));
    }

    let all_set = profile.live_path.is_some()
        && profile.copy_path.is_some()
        && profile.backup_root.is_some()
        && profile.backup_zip_root.is_some();
    if all_set {
        Profile::from_config(profile)?;
    }
    Ok(())
}

async fn snapshot_live(profile: &Profile) -> Result<PathBuf> {
    let live = profile.paths.live().to_path_buf();
    let backup_root = profile.paths.backup_root().to_path_buf();

    if !live.is_dir() {
        return Err(Error::NotFound(live));
    }

    let format = time::format_description::parse("[year][month][day]_[hour][minute][second]")
        .expect("static format");
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let stamp = now.format(&format).unwrap_or_else(|_| "unknown".to_string());
    let target = backup_root.join(format!("{SNAPSHOT_PREFIX}{stamp}"));

    let copy_target = target.clone();
    tokio::task::spawn_blocking(move || {
        fsops::ensure_dir(&backup_root, false)?;
        fsops::copy_tree(&live, &copy_target)
    })
    .await
    .map_err(|err| Error::Internal(err.to_string()))??;

    Ok(target)
}

async fn prune_snapshots_in(backup_root: &Path, keep: usize) -> Result<usize> {
    let backup_root = backup_root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if !backup_root.is_dir() {
            return Ok(0);
        }

        let mut snapshots: Vec<PathBuf> = std::fs::read_dir(&backup_root)
            .map_err(|err| Error::Mirror(format!("failed to list snapshots: {err}")))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_dir()
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| name.starts_with(SNAPSHOT_PREFIX))
                        .unwrap_or(false)
            })
            .collect();

        if snapshots.len() <= keep {
            return Ok(0);
        }

        snapshots.sort();
        snapshots.reverse();

        let mut removed = 0;
        for old in snapshots.split_off(keep) {
            fsops::force_delete(&old)?;
            removed += 1;
        }
        Ok(removed)
    })
    .await
    .map_err(|err| Error::Internal(err.to_string()))?
}

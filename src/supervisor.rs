use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Process, ProcessStatus, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Mutex<SupervisorInner>>,
    sender: broadcast::Sender<String>,
}

struct SupervisorInner {
    children: HashMap<PathBuf, Vec<Child>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(200);
        Self {
            inner: Arc::new(Mutex::new(SupervisorInner {
                children: HashMap::new(),
            })),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub async fn start(&self, exe: &Path) -> Result<u32> {
        if !exe.is_file() {
            return Err(Error::NotFound(exe.to_path_buf()));
        }
        let working_dir = exe
            .parent()
            .ok_or_else(|| Error::Internal(format!("{} has no parent", exe.display())))?;

        let mut child = Command::new(exe)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::Internal(format!("failed to start {}: {err}", exe.display())))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Internal("spawned process has no pid".to_string()))?;

        let label = image_label(exe);
        if let Some(stdout) = child.stdout.take() {
            self.forward_lines(stdout, label.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            self.forward_lines(stderr, label.clone());
        }

        let mut inner = self.inner.lock().await;
        reap_exited(&mut inner.children);
        inner
            .children
            .entry(exe.to_path_buf())
            .or_default()
            .push(child);

        let _ = self.sender.send(format!("[{label}] started (pid {pid})"));
        Ok(pid)
    }

    pub async fn stop(&self, exe: &Path) -> Result<bool> {
        let name = image_label(exe);
        let mut any = {
            let name = name.clone();
            tokio::task::spawn_blocking(move || kill_by_image_name(&name))
                .await
                .map_err(|err| Error::Internal(err.to_string()))?
        };

        let owned = {
            let mut inner = self.inner.lock().await;
            inner.children.remove(&exe.to_path_buf())
        };
        if let Some(children) = owned {
            for mut child in children {
                if child.try_wait().ok().flatten().is_none() {
                    let _ = child.kill().await;
                    any = true;
                }
                let _ = child.wait().await;
            }
        }

        if any {
            let _ = self.sender.send(format!("[{name}] stopped"));
        }
        Ok(any)
    }

    pub async fn restart(&self, exe: &Path) -> Result<u32> {
        self.stop(exe).await?;
        self.start(exe).await
    }

    pub fn is_running(exe: &Path) -> bool {
        let name = image_label(exe);
        let mut system = System::new();
        system.refresh_processes();
        system
            .processes()
            .values()
            .any(|process| is_live(process) && matches_image(process.name(), &name))
    }

    fn forward_lines(&self, stream: impl tokio::io::AsyncRead + Unpin + Send + 'static, label: String) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = sender.send(format!("[{label}] {line}"));
            }
        });
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn reap_exited(children: &mut HashMap<PathBuf, Vec<Child>>) {
    for owned in children.values_mut() {
        owned.retain_mut(|child| matches!(child.try_wait(), Ok(None)));
    }
    children.retain(|_, owned| !owned.is_empty());
}

fn kill_by_image_name(name: &str) -> bool {
    let mut system = System::new();
    system.refresh_processes();

    let mut targets: std::collections::HashSet<sysinfo::Pid> = system
        .processes()
        .iter()
        .filter(|(_, process)| is_live(process) && matches_image(process.name(), name))
        .map(|(pid, _)| *pid)
        .collect();
    if targets.is_empty() {
        return false;
    }

    loop {
        let before = targets.len();
        for (pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                if targets.contains(&parent) {
                    targets.insert(*pid);
                }
            }
        }
        if targets.len() == before {
            break;
        }
    }

    let mut any = false;
    for pid in &targets {
        if let Some(process) = system.process(*pid) {
            if process.kill() {
                any = true;
            }
        }
    }
    if !any {
        return false;
    }

    let deadline = std::time::Instant::now() + STOP_TIMEOUT;
    loop {
        system.refresh_processes();
        let alive = targets
            .iter()
            .any(|pid| system.process(*pid).map(is_live).unwrap_or(false));
        if !alive || std::time::Instant::now() >= deadline {
            return true;
        }
        std::thread::sleep(STOP_POLL_INTERVAL);
    }
}

pub(crate) fn is_live(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

pub(crate) fn image_label(exe: &Path) -> String {
    exe.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| exe.display().to_string())
}

pub(crate) fn matches_image(process_name: &str, image: &str) -> bool {
    if process_name.eq_ignore_ascii_case(image) {
        return true;
    }
    let stem = Path::new(image)
        .file_stem()
        .map(|stem| stem.to_string_lossy());
    match stem {
        Some(stem) => process_name.eq_ignore_ascii_case(&stem),
        None => false,
    }
}

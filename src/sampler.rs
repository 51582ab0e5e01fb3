use crate::supervisor::{image_label, is_live, matches_image};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    pub cpu_percent: f64,
    pub rss_mb: f64,
}

pub struct Sampler {
    exe: PathBuf,
    interval: Duration,
    shared: Arc<Mutex<ProcessSample>>,
    cancel: Option<CancellationToken>,
}

impl Sampler {
    pub fn new(exe: impl Into<PathBuf>, interval: Option<Duration>) -> Self {
        Self {
            exe: exe.into(),
            interval: interval.unwrap_or(DEFAULT_SAMPLE_INTERVAL),
            shared: Arc::new(Mutex::new(ProcessSample::default())),
            cancel: None,
        }
    }

    pub fn current(&self) -> ProcessSample {
        self.shared
            .lock()
            .map(|sample| *sample)
            .unwrap_or_default()
    }

    pub fn start<F>(&mut self, on_sample: F)
    where
        F: Fn(ProcessSample) + Send + 'static,
    {
        if self.cancel.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let name = image_label(&self.exe);
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;

        tokio::spawn(async move {
            let mut system = System::new();
            let mut cached_pid: Option<Pid> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }

                let sample = read_sample(&mut system, &name, &mut cached_pid);
                if let Ok(mut shared) = shared.lock() {
                    *shared = sample;
                }
                on_sample(sample);
            }
        });
    }

    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_sample(system: &mut System, name: &str, cached_pid: &mut Option<Pid>) -> ProcessSample {
    system.refresh_processes();

    let process = cached_pid
        .and_then(|pid| system.process(pid))
        .filter(|process| is_live(process) && matches_image(process.name(), name))
        .or_else(|| {
            system
                .processes()
                .values()
                .find(|process| is_live(process) && matches_image(process.name(), name))
        });

    match process {
        Some(process) => {
            *cached_pid = Some(process.pid());
            let cores = std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1);
            ProcessSample {
                cpu_percent: f64::from(process.cpu_usage()) / cores as f64,
                rss_mb: process.memory() as f64 / (1024.0 * 1024.0),
            }
        }
        None => {
            *cached_pid = None;
            ProcessSample::default()
        }
    }
}

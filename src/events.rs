use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Preparing,
    Fetching,
    Mirroring,
    Archiving,
    Snapshotting,
    DeletingLive,
    DeletingCopy,
}

impl Default for RunState {
    fn default() -> Self {
        RunState::Idle
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Preparing => "preparing",
            RunState::Fetching => "fetching",
            RunState::Mirroring => "mirroring",
            RunState::Archiving => "archiving",
            RunState::Snapshotting => "snapshotting",
            RunState::DeletingLive => "deleting-live",
            RunState::DeletingCopy => "deleting-copy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessTarget {
    World,
    Auth,
}

impl std::fmt::Display for ProcessTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessTarget::World => f.write_str("world"),
            ProcessTarget::Auth => f.write_str("auth"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum Event {
    Log {
        timestamp: OffsetDateTime,
        level: LogLevel,
        text: String,
    },
    Status {
        profile: String,
        state: RunState,
    },
    Progress {
        profile: String,
        text: String,
    },
    Metrics {
        profile: String,
        target: ProcessTarget,
        cpu_percent: f64,
        rss_mb: f64,
    },
}

impl Event {
    pub fn log(level: LogLevel, text: impl Into<String>) -> Self {
        Event::Log {
            timestamp: OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()),
            level,
            text: text.into(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: Event);
}

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync,
{
    fn on_event(&self, event: Event) {
        self(event)
    }
}

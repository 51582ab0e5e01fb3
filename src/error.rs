use crate::events::RunState;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("mirror failed: {0}")]
    Mirror(String),
    #[error("archive failed: {0}")]
    Archive(String),
    #[error("{tool} exited with code {code}: {stderr}")]
    Tool {
        tool: String,
        code: i32,
        stderr: String,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("profile {profile} is busy ({state})")]
    Busy { profile: String, state: RunState },
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

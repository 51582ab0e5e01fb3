pub mod archiver;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod fsops;
pub mod mirror;
pub mod profile;
pub mod sampler;
pub mod supervisor;
pub mod tool;

pub use config::{AppConfig, ArchiveFormat};
pub use engine::Engine;
pub use error::{Error, Result};
pub use events::{Event, EventSink, LogLevel, ProcessTarget, RunState};
pub use fetcher::FetchMode;
pub use profile::{PathKind, Profile, ProfileConfig};

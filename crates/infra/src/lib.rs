//! Infrastructure layer: the embedded store, the source warehouse client and
//! the sync machinery built on them.

pub mod config;
pub mod db;
pub mod destination;
pub mod engine;
pub mod jobs;
pub mod reaper;
pub mod registry;
pub mod source;
pub mod watermark;

pub use config::{AppConfig, ConfigError};
pub use engine::{EngineConfig, RunOutcome, SubmittedJob, SyncEngine};
pub use reaper::{Reaper, ReaperConfig, ReaperHandle};

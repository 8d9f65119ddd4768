pub mod checksum;
pub mod config;
pub mod content;
pub mod control;
pub mod credentials;
pub mod download;
pub mod error;
pub mod events;
pub mod handlers;
pub mod information;
pub mod manager;
pub mod metadata;
pub mod net;
pub mod paths;
pub mod platform;
pub mod pool;
pub mod scan;
pub mod storage;
pub mod task;

#[cfg(test)]
mod tests;

pub use crate::config::ManagerConfig;
pub use crate::content::{TaskContent, TaskStatus};
pub use crate::credentials::CredentialStore;
pub use crate::error::{CoreError, CoreResult};
pub use crate::events::{Broadcaster, Event, EventKind};
pub use crate::manager::{TaskManager, TaskManagerBuilder};
pub use crate::paths::PathRegistry;
pub use crate::platform::Platform;
pub use crate::scan::{ModelRecord, ScanCache, ScanSnapshot};
pub use crate::task::{Task, TaskId, TaskKind, TaskState};

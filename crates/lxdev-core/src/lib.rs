#![forbid(unsafe_code)]

mod config;
mod container;
mod engine;
mod error;
mod orchestrator;
pub mod preflight;
mod redir;
mod run_state;
mod shared_folder;
mod status;
mod system;

#[cfg(test)]
mod testing;

use std::time::Duration;

pub use config::BoxConfig;
pub use container::{Container, ContainerDescriptor};
pub use engine::{ContainerState, ContainerStatus, Device, Snapshot};
pub use error::{Error, ReadinessError, Result};
pub use orchestrator::{Orchestrator, PROVISIONED_SNAPSHOT};
pub use preflight::Readiness;
pub use redir::{match_forwarder, ForwardTarget, ProcessTable, PsTable, Redir};
pub use run_state::RunState;
pub use shared_folder::{IdentityMapping, IdmapStrategy, SharedFolder};
pub use status::{BoxStatus, FolderStatus, ForwardStatus, StatusReport};
pub use system::{shell_quote, CommandOutput, CommandRunner, HostIdentity, Privilege, ShellRunner, System};

/// How many times `start` polls for an address before giving up.
pub const BOOT_ATTEMPTS: u32 = 30;
pub const BOOT_INTERVAL: Duration = Duration::from_secs(1);

/// Uid and gid the image's own user is moved to when the development user
/// needs the host's ids.
pub const RELOCATED_ID: u32 = 1500;

pub const CONFIG_FILE: &str = "lxdev.yml";
/// Per-project directory holding [`RunState`].
pub const STATE_DIR: &str = ".lxdev";

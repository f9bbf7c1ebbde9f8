use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::config::BoxConfig;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::preflight::Readiness;
use crate::redir::{PsTable, Redir};
use crate::run_state::RunState;
use crate::shared_folder::{IdentityMapping, SharedFolder};
use crate::status::{BoxStatus, FolderStatus, ForwardStatus, StatusReport};
use crate::system::System;
use crate::STATE_DIR;

/// Snapshot taken after the first successful provisioning when
/// `auto_snapshots` is on.
pub const PROVISIONED_SNAPSHOT: &str = "provisioned";

/// Runs the user-facing commands for one box.
///
/// Operations that change the container take a [`Readiness`], so the host
/// checks always happen first.
pub struct Orchestrator<'a> {
    system: &'a System,
    config: BoxConfig,
    project_dir: PathBuf,
    container: Container<'a>,
    redirs: Vec<Redir>,
    mapping: Option<IdentityMapping>,
}

impl<'a> Orchestrator<'a> {
    /// `project_dir` holds `lxdev.yml`; relative folders resolve against it.
    pub fn new(system: &'a System, config: BoxConfig, project_dir: &Path) -> Result<Self> {
        let container = Container::new(system, config.descriptor())?;
        Ok(Orchestrator {
            system,
            redirs: config.redirs(),
            config,
            project_dir: project_dir.to_path_buf(),
            container,
            mapping: None,
        })
    }

    pub fn with_boot_wait(mut self, attempts: u32, interval: Duration) -> Self {
        self.container = self.container.with_boot_wait(attempts, interval);
        self
    }

    pub fn container(&self) -> &Container<'a> {
        &self.container
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(STATE_DIR)
    }

    fn mapping(&mut self) -> Result<IdentityMapping> {
        if let Some(mapping) = self.mapping {
            return Ok(mapping);
        }
        let mapping = IdentityMapping::resolve(self.system)?;
        info!("Shared folders use the {:?} id strategy", mapping.strategy);
        self.mapping = Some(mapping);
        Ok(mapping)
    }

    /// Resolve the configured folders. Two folders mapping to the same
    /// device name are rejected here, before anything is changed.
    fn folders(&self) -> Result<Vec<SharedFolder>> {
        let folders = self
            .config
            .folders
            .iter()
            .map(|(host, guest)| SharedFolder::resolve(&self.project_dir, host, guest))
            .collect::<Result<Vec<_>>>()?;

        let mut devices: BTreeMap<String, &Path> = BTreeMap::new();
        for folder in &folders {
            let device = folder.link_name();
            if let Some(existing) = devices.insert(device.clone(), folder.host()) {
                return Err(Error::FolderConflict {
                    name: self.config.name.clone(),
                    device,
                    existing: existing.display().to_string(),
                    host: folder.host().to_path_buf(),
                });
            }
        }
        Ok(folders)
    }

    fn enforce_created(&self) -> Result<()> {
        if !self.container.exists() {
            return Err(Error::NotCreated {
                name: self.config.name.clone(),
            });
        }
        Ok(())
    }

    fn enforce_running(&self) -> Result<()> {
        self.enforce_created()?;
        if !self.container.is_running() {
            return Err(Error::NotRunning {
                name: self.config.name.clone(),
            });
        }
        Ok(())
    }

    /// Bring the box up: create, start, provision, forward ports, share
    /// folders. Every step is skipped when already done, so `up` can be
    /// repeated after a failure.
    pub fn up(&mut self, ready: &Readiness, sink: &mut dyn Write) -> Result<()> {
        let state_dir = self.state_dir();
        if RunState::load(&state_dir)?.is_some() && !self.container.is_running() {
            warn!(
                "{} exists but {} is not running; it might have stopped unexpectedly",
                RunState::path(&state_dir).display(),
                self.config.name
            );
        }

        let folders = self.folders()?;
        let mapping = self.mapping()?;

        if !self.container.exists() {
            info!("Launching {}...", self.config.name);
            self.container.create()?;
        }

        info!("Starting {}...", self.config.name);
        self.container.start()?;

        let fresh = !self.container.is_provisioned()?;
        if fresh {
            info!("Provisioning {}...", self.config.name);
            self.container.provision(
                &self.config.provisioning,
                ready.ssh_keys(),
                mapping.required_ids(),
                sink,
            )?;
        }

        let table = PsTable::new(self.system);
        for redir in &self.redirs {
            redir.start(&self.container, &table)?;
        }

        if !folders.is_empty() {
            if !mapping.is_system_setup(&self.container)? {
                mapping.system_setup(&self.container)?;
            }
            for folder in &folders {
                folder.link(&self.container, &mapping)?;
            }
        }

        if fresh && self.config.auto_snapshots {
            info!("Creating snapshot {}", PROVISIONED_SNAPSHOT);
            if !self.container.snapshot(PROVISIONED_SNAPSHOT)? {
                warn!("could not create snapshot {}", PROVISIONED_SNAPSHOT);
            }
        }

        let mut pids = Vec::new();
        for redir in &self.redirs {
            pids.extend(redir.pid(&self.container, &table)?);
        }
        RunState::running(pids).save(&state_dir)?;
        self.container.refresh()
    }

    pub fn halt(&mut self, _ready: &Readiness) -> Result<()> {
        self.enforce_created()?;
        self.stop_forwarders()?;
        info!("Stopping {}...", self.config.name);
        self.container.stop()?;
        RunState::remove(&self.state_dir())
    }

    pub fn destroy(&mut self, _ready: &Readiness) -> Result<()> {
        self.stop_forwarders()?;
        if self.container.exists() {
            info!("Destroying {}...", self.config.name);
        }
        self.container.destroy()?;
        RunState::remove(&self.state_dir())
    }

    fn stop_forwarders(&self) -> Result<()> {
        let table = PsTable::new(self.system);
        for redir in &self.redirs {
            redir.stop(&self.container, &table)?;
        }
        Ok(())
    }

    pub fn status(&self) -> Result<StatusReport> {
        if !self.container.exists() {
            return Ok(StatusReport::Missing {
                name: self.config.name.clone(),
            });
        }

        let state = self.container.state();
        let table = PsTable::new(self.system);
        let mut forwards = Vec::new();
        for redir in &self.redirs {
            forwards.push(ForwardStatus {
                guest: redir.guest,
                host: redir.host,
                pid: redir.pid(&self.container, &table)?,
            });
        }

        Ok(StatusReport::Present(BoxStatus {
            name: self.config.name.clone(),
            status: state.status_text.clone(),
            ip: state.ip.clone(),
            image: self.config.image.clone(),
            folders: state
                .shared_folders()
                .map(|(device, source, path)| FolderStatus {
                    device: device.to_string(),
                    source: source.to_string(),
                    path: path.to_string(),
                })
                .collect(),
            forwards,
            snapshots: state.snapshots.clone(),
        }))
    }

    /// Run the provisioning commands against a running box, creating the
    /// development user first if it is missing.
    pub fn provision(&mut self, ready: &Readiness, sink: &mut dyn Write) -> Result<()> {
        self.enforce_running()?;

        if self.config.auto_snapshots {
            let seconds = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let name = format!("provision_{}", seconds);
            info!("Creating snapshot {}", name);
            if !self.container.snapshot(&name)? {
                warn!("could not create snapshot {}", name);
            }
        }

        if !self.container.is_provisioned()? {
            let mapping = self.mapping()?;
            info!("Provisioning {}...", self.config.name);
            return self.container.provision(
                &self.config.provisioning,
                ready.ssh_keys(),
                mapping.required_ids(),
                sink,
            );
        }

        if self.config.provisioning.is_empty() {
            info!("Nothing to do");
            return Ok(());
        }
        info!("Provisioning {}...", self.config.name);
        self.container.run_provisioning(&self.config.provisioning, sink)
    }

    pub fn snapshot(&mut self, _ready: &Readiness, name: &str) -> Result<bool> {
        self.enforce_created()?;
        info!("Creating snapshot {}", name);
        self.container.snapshot(name)
    }

    pub fn restore(&mut self, _ready: &Readiness, name: &str) -> Result<bool> {
        self.enforce_created()?;
        info!("Restoring snapshot {}", name);
        self.container.restore(name)
    }

    pub fn rmsnapshot(&mut self, _ready: &Readiness, name: &str) -> Result<bool> {
        self.enforce_created()?;
        info!("Deleting snapshot {}", name);
        self.container.delete_snapshot(name)
    }

    /// Restore the most recent snapshot, then delete it.
    pub fn revert(&mut self, ready: &Readiness) -> Result<bool> {
        self.enforce_created()?;
        let Some(latest) = self.container.state().snapshots.last() else {
            return Err(Error::NoSnapshots {
                name: self.config.name.clone(),
            });
        };
        let name = latest.name.clone();
        if !self.restore(ready, &name)? {
            return Ok(false);
        }
        info!("Reverted to snapshot {}", name);
        self.rmsnapshot(ready, &name)
    }

    /// User and address to reach the box over SSH.
    pub fn ssh_target(&self) -> Result<(String, String)> {
        self.enforce_created()?;
        let ip = self.container.ip().ok_or_else(|| Error::NotRunning {
            name: self.config.name.clone(),
        })?;
        Ok((self.config.user.clone(), ip.to_string()))
    }

    /// Run an ad-hoc command in the guest, streaming its output.
    pub fn exec(&self, command: &str, sink: &mut dyn Write) -> Result<i32> {
        self.enforce_running()?;
        self.container.shell(command, sink)
    }
}

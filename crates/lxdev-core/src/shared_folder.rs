//! Read-write host folders inside the guest.
//!
//! Files created by the guest user must belong to the host user and the other
//! way round. LXD offers two ways to get there, see
//! <https://documentation.ubuntu.com/lxd/en/latest/userns-idmap/>:
//!
//! * **shift**: the kernel shifts ownership on the mount (shiftfs or idmapped
//!   mounts). The guest user only needs the host user's numeric ids, which
//!   [`Container::provision`] arranges.
//! * **classic**: the host ids are delegated to LXD's root through
//!   `/etc/subuid` and `/etc/subgid`, and the container gets a `raw.idmap`
//!   mapping them onto the guest user.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::container::Container;
use crate::error::{Error, Result};
use crate::system::{engine_error, shell_quote, HostIdentity, Privilege, System};

/// Engine service units tried, in order, when LXD must be restarted.
pub const ENGINE_SERVICES: &[&str] = &["lxd.service", "snap.lxd.daemon.service"];

const KERNEL_FEATURES: &[&str] = &["shiftfs", "idmapped_mounts"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdmapStrategy {
    Shift,
    Classic,
}

impl IdmapStrategy {
    /// Ask the engine whether the kernel can shift mount ownership.
    pub fn detect(system: &System) -> Result<Self> {
        let info = system.check("failed to query LXD", "lxc info")?;
        Ok(if supports_shift(&info.stdout) {
            IdmapStrategy::Shift
        } else {
            IdmapStrategy::Classic
        })
    }
}

fn supports_shift(info: &str) -> bool {
    info.lines().any(|line| {
        let Some((key, value)) = line.trim().split_once(':') else {
            return false;
        };
        KERNEL_FEATURES.contains(&key.trim()) && value.trim().trim_matches('"') == "true"
    })
}

/// The identity strategy for one run, shared by every folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMapping {
    pub strategy: IdmapStrategy,
    pub host: HostIdentity,
}

impl IdentityMapping {
    pub fn resolve(system: &System) -> Result<Self> {
        Ok(IdentityMapping {
            strategy: IdmapStrategy::detect(system)?,
            host: system.host_identity()?,
        })
    }

    /// Host ids the guest user has to be created with, if any.
    pub fn required_ids(&self) -> Option<HostIdentity> {
        match self.strategy {
            IdmapStrategy::Shift => Some(self.host),
            IdmapStrategy::Classic => None,
        }
    }

    pub fn is_system_setup(&self, container: &Container<'_>) -> Result<bool> {
        match self.strategy {
            IdmapStrategy::Shift => self.guest_user_owns_host_uid(container),
            IdmapStrategy::Classic => self.classic_is_setup(container),
        }
    }

    pub fn system_setup(&self, container: &Container<'_>) -> Result<()> {
        match self.strategy {
            IdmapStrategy::Shift => {
                // Nothing to change on the host; provisioning already gave the
                // guest user the host ids.
                if !self.guest_user_owns_host_uid(container)? {
                    return Err(Error::UserNotMapped {
                        name: container.name().to_string(),
                        user: container.user().to_string(),
                        uid: self.host.uid,
                    });
                }
                Ok(())
            }
            IdmapStrategy::Classic => self.classic_setup(container),
        }
    }

    fn guest_user_owns_host_uid(&self, container: &Container<'_>) -> Result<bool> {
        let output = container.exec(&format!("getent passwd {}", self.host.uid))?;
        Ok(output.success() && output.text().split(':').next() == Some(container.user()))
    }

    fn guest_id(&self, container: &Container<'_>, flag: &str) -> Result<u32> {
        let command = format!("id {} {}", flag, container.user());
        let output = container.exec(&command)?;
        if !output.success() {
            return Err(engine_error(
                &format!("failed to look up user in box \"{}\"", container.name()),
                &command,
                &output,
            ));
        }
        output
            .text()
            .parse()
            .map_err(|_| Error::Protocol(format!("`{}` returned {:?}", command, output.text())))
    }

    fn raw_idmap(&self, container: &Container<'_>) -> Result<[String; 2]> {
        Ok([
            format!("uid {} {}", self.host.uid, self.guest_id(container, "-u")?),
            format!("gid {} {}", self.host.gid, self.guest_id(container, "-g")?),
        ])
    }

    fn classic_is_setup(&self, container: &Container<'_>) -> Result<bool> {
        let system = container.system();
        if !has_subordinate(system, "/etc/subuid", self.host.uid)?
            || !has_subordinate(system, "/etc/subgid", self.host.gid)?
        {
            return Ok(false);
        }
        let current = system.check(
            "failed to read id map",
            &format!("lxc config get {} raw.idmap", container.name()),
        )?;
        let wanted = self.raw_idmap(container)?;
        Ok(wanted
            .iter()
            .all(|line| current.stdout.lines().any(|l| l.trim() == line)))
    }

    fn classic_setup(&self, container: &Container<'_>) -> Result<()> {
        let system = container.system();
        let mut restart = false;
        for (file, id) in [("/etc/subuid", self.host.uid), ("/etc/subgid", self.host.gid)] {
            if has_subordinate(system, file, id)? {
                continue;
            }
            info!("Delegating id {} to LXD in {} (needs root)", id, file);
            let command = format!("tee -a {} <<'EOS'\nroot:{}:1\nEOS", file, id);
            let output = system.exec_as(Privilege::Sudo, &command)?;
            if !output.success() {
                return Err(engine_error(
                    &format!("failed to update {}", file),
                    &command,
                    &output,
                ));
            }
            restart = true;
        }
        if restart {
            restart_engine(system)?;
        }

        let idmap = self.raw_idmap(container)?.join("\n");
        system.check(
            &format!("failed to set id map on box \"{}\"", container.name()),
            &format!(
                "lxc config set {} raw.idmap - <<'EOS'\n{}\nEOS",
                container.name(),
                idmap
            ),
        )?;
        info!(
            "Id map set on {}; it applies from the next container start",
            container.name()
        );
        Ok(())
    }
}

fn has_subordinate(system: &System, file: &str, id: u32) -> Result<bool> {
    let entry = format!("root:{}:1", id);
    let output = system.host(&format!("cat {}", file))?;
    Ok(output.success() && output.stdout.lines().any(|line| line.trim() == entry))
}

/// Restart LXD so new subordinate ids are picked up.
///
/// Not finding the service is not fatal, but the user must hear about it.
fn restart_engine(system: &System) -> Result<()> {
    for service in ENGINE_SERVICES {
        if !system.host(&format!("systemctl status {}", service))?.success() {
            continue;
        }
        info!("Restarting {}", service);
        let command = format!("systemctl restart {}", service);
        let output = system.exec_as(Privilege::Sudo, &command)?;
        if !output.success() {
            return Err(engine_error(
                &format!("failed to restart {}", service),
                &command,
                &output,
            ));
        }
        return Ok(());
    }
    warn!("The LXD service needs to be restarted, but the service name cannot be detected. Please restart it manually.");
    Ok(())
}

/// One host folder mapped into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFolder {
    host: PathBuf,
    guest: String,
}

impl SharedFolder {
    /// `host` must already be absolute.
    pub fn new(host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        SharedFolder {
            host: host.into(),
            guest: guest.into(),
        }
    }

    /// Resolve `host` against `base` and make sure it exists.
    pub fn resolve(base: &Path, host: &str, guest: &str) -> Result<Self> {
        let joined = base.join(host);
        let host = std::fs::canonicalize(&joined)
            .map_err(|source| Error::MissingFolder {
                path: joined,
                source,
            })?;
        Ok(SharedFolder::new(host, guest))
    }

    pub fn host(&self) -> &Path {
        &self.host
    }

    pub fn guest(&self) -> &str {
        &self.guest
    }

    /// Device name for this folder, derived from the host path only.
    pub fn link_name(&self) -> String {
        let base = self
            .host
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let base: String = base
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("shared_folder_{}", base)
    }

    /// Whether this folder is already attached. A device of the same name
    /// sharing a different host directory is a [`Error::FolderConflict`].
    pub fn is_linked(&self, container: &Container<'_>) -> Result<bool> {
        let system = container.system();
        let devices = system.check(
            &format!("failed to list devices of box \"{}\"", container.name()),
            &format!("lxc config device list {}", container.name()),
        )?;
        let name = self.link_name();
        if !devices.stdout.lines().any(|line| line.trim() == name) {
            return Ok(false);
        }

        let source = system.check(
            &format!("failed to inspect device {} of box \"{}\"", name, container.name()),
            &format!("lxc config device get {} {} source", container.name(), name),
        )?;
        if Path::new(source.text()) != self.host {
            return Err(Error::FolderConflict {
                name: container.name().to_string(),
                device: name,
                existing: source.text().to_string(),
                host: self.host.clone(),
            });
        }
        Ok(true)
    }

    pub fn link(&self, container: &Container<'_>, mapping: &IdentityMapping) -> Result<()> {
        if !mapping.is_system_setup(container)? {
            return Err(Error::SystemSetupRequired {
                name: container.name().to_string(),
            });
        }
        if self.is_linked(container)? {
            return Ok(());
        }

        info!("Mounting {} in {}", self.host.display(), self.guest);
        let mut command = format!(
            "lxc config device add {} {} disk {} {}",
            container.name(),
            self.link_name(),
            shell_quote(&format!("source={}", self.host.display())),
            shell_quote(&format!("path={}", self.guest))
        );
        if mapping.strategy == IdmapStrategy::Shift {
            command.push_str(" shift=true");
        }
        container.system().check(
            &format!("failed to share {} with box \"{}\"", self.host.display(), container.name()),
            &command,
        )?;
        Ok(())
    }
}

use std::io::Write;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{ContainerState, ContainerStatus};
use crate::error::{Error, Result};
use crate::system::{engine_error, shell_quote, CommandOutput, HostIdentity, System};
use crate::{BOOT_ATTEMPTS, BOOT_INTERVAL, RELOCATED_ID};

/// Immutable identity of the box, straight from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub name: String,
    pub image: String,
    pub user: String,
}

/// One named LXD container and its last observed state.
pub struct Container<'a> {
    system: &'a System,
    descriptor: ContainerDescriptor,
    state: ContainerState,
    boot_attempts: u32,
    boot_interval: Duration,
}

impl<'a> Container<'a> {
    /// Look the container up in the engine.
    pub fn new(system: &'a System, descriptor: ContainerDescriptor) -> Result<Self> {
        let mut container = Container {
            system,
            descriptor,
            state: ContainerState::absent(),
            boot_attempts: BOOT_ATTEMPTS,
            boot_interval: BOOT_INTERVAL,
        };
        container.refresh()?;
        Ok(container)
    }

    /// Override how long [`Container::start`] waits for an address.
    pub fn with_boot_wait(mut self, attempts: u32, interval: Duration) -> Self {
        self.boot_attempts = attempts;
        self.boot_interval = interval;
        self
    }

    pub fn system(&self) -> &'a System {
        self.system
    }

    pub fn descriptor(&self) -> &ContainerDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn user(&self) -> &str {
        &self.descriptor.user
    }

    pub fn state(&self) -> &ContainerState {
        &self.state
    }

    pub fn exists(&self) -> bool {
        self.state.exists()
    }

    pub fn is_running(&self) -> bool {
        self.state.status == ContainerStatus::Running
    }

    pub fn ip(&self) -> Option<&str> {
        self.state.ip.as_deref()
    }

    pub fn refresh(&mut self) -> Result<()> {
        let pattern = shell_quote(&format!("^{}$", self.name()));
        let listing = self.system.check(
            &format!("failed to query box \"{}\"", self.name()),
            &format!("lxc ls --format json {}", pattern),
        )?;
        self.state = ContainerState::decode(self.name(), &listing.stdout)?;
        Ok(())
    }

    pub fn create(&mut self) -> Result<()> {
        if self.exists() {
            return Err(Error::AlreadyExists {
                name: self.name().to_string(),
            });
        }
        let context = format!("failed to create box \"{}\"", self.name());
        self.system.check(
            &context,
            &format!(
                "lxc init {} {}",
                shell_quote(&self.descriptor.image),
                shell_quote(self.name())
            ),
        )?;
        self.system.check(
            &context,
            &format!("lxc config set {} boot.autostart false", self.name()),
        )?;
        self.refresh()
    }

    /// Start the container and block until it has an IPv4 address.
    pub fn start(&mut self) -> Result<()> {
        self.enforce_created()?;
        if self.is_running() {
            return Ok(());
        }

        let command = format!("lxc start {}", self.name());
        let output = self.system.exec(&command)?;
        if !output.success() {
            return Err(engine_error(
                &format!("Box \"{}\" failed to start", self.name()),
                &command,
                &output,
            ));
        }

        for attempt in 1..=self.boot_attempts {
            self.refresh()?;
            if self.ip().is_some() {
                return Ok(());
            }
            debug!("{}: no address yet (attempt {})", self.name(), attempt);
            thread::sleep(self.boot_interval);
        }

        Err(Error::BootTimeout {
            name: self.name().to_string(),
            attempts: self.boot_attempts,
        })
    }

    pub fn stop(&mut self) -> Result<()> {
        self.enforce_created()?;
        if !self.is_running() {
            return Ok(());
        }
        self.system.check(
            &format!("Box \"{}\" failed to stop", self.name()),
            &format!("lxc stop {}", self.name()),
        )?;
        self.refresh()
    }

    /// Delete the container if it exists. Calling it again is harmless.
    pub fn destroy(&mut self) -> Result<()> {
        if self.exists() {
            self.system.check(
                &format!("failed to delete box \"{}\"", self.name()),
                &format!("lxc delete --force {}", self.name()),
            )?;
        }
        self.state = ContainerState::absent();
        Ok(())
    }

    /// Run a single command line inside the guest and capture its output.
    pub fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.system
            .exec(&format!("lxc exec {} -- {}", self.name(), command))
    }

    /// Run `command` through the guest's `/bin/sh`, streaming its combined
    /// output to `sink`. Returns the command's exit status.
    pub fn shell(&self, command: &str, sink: &mut dyn Write) -> Result<i32> {
        self.system.stream(
            &format!(
                "lxc exec {} -- /bin/sh -c {}",
                self.name(),
                shell_quote(command)
            ),
            sink,
        )
    }

    /// Whether the development user already exists in the guest.
    pub fn is_provisioned(&self) -> Result<bool> {
        Ok(self.exec(&format!("id -u {}", self.user()))?.success())
    }

    /// Create the development user, then run the provisioning commands.
    ///
    /// `remap` carries the host ids the user must own inside the guest when
    /// shared folders rely on shifted mounts.
    pub fn provision(
        &mut self,
        commands: &[String],
        ssh_keys: &str,
        remap: Option<HostIdentity>,
        sink: &mut dyn Write,
    ) -> Result<()> {
        self.enforce_running()?;
        self.provision_user(ssh_keys, remap)?;
        self.run_provisioning(commands, sink)
    }

    /// Run each provisioning command in order.
    ///
    /// A command exiting non-zero is reported and skipped over; losing the
    /// container while doing so aborts the run.
    pub fn run_provisioning(&mut self, commands: &[String], sink: &mut dyn Write) -> Result<()> {
        self.enforce_running()?;
        for command in commands {
            info!("{}: {}", self.name(), command);
            let status = self.shell(command, sink)?;
            if status == 0 {
                continue;
            }
            self.refresh()?;
            if !self.is_running() {
                return Err(Error::EngineCommand {
                    context: format!("Box \"{}\" became unreachable while provisioning", self.name()),
                    command: command.clone(),
                    status,
                    output: format!("box is {}", self.state.status_text),
                });
            }
            warn!("provisioning command `{}` exited with status {}", command, status);
        }
        Ok(())
    }

    pub fn snapshot(&mut self, snapshot: &str) -> Result<bool> {
        let output = self
            .system
            .exec(&format!("lxc snapshot {} {}", self.name(), snapshot))?;
        self.refresh()?;
        Ok(output.success())
    }

    pub fn restore(&mut self, snapshot: &str) -> Result<bool> {
        let output = self
            .system
            .exec(&format!("lxc restore {} {}", self.name(), snapshot))?;
        self.refresh()?;
        Ok(output.success())
    }

    pub fn delete_snapshot(&mut self, snapshot: &str) -> Result<bool> {
        let output = self
            .system
            .exec(&format!("lxc delete {}/{}", self.name(), snapshot))?;
        self.refresh()?;
        Ok(output.success())
    }

    fn enforce_created(&self) -> Result<()> {
        if !self.exists() {
            return Err(Error::NotCreated {
                name: self.name().to_string(),
            });
        }
        Ok(())
    }

    fn enforce_running(&self) -> Result<()> {
        self.enforce_created()?;
        if !self.is_running() {
            return Err(Error::NotRunning {
                name: self.name().to_string(),
            });
        }
        Ok(())
    }

    fn guest_check(&self, command: &str) -> Result<CommandOutput> {
        let output = self.exec(command)?;
        if !output.success() {
            return Err(engine_error(
                &format!("failed to set up user in box \"{}\"", self.name()),
                command,
                &output,
            ));
        }
        Ok(output)
    }

    /// Name of the guest account (or group) with numeric id `id`, if any.
    fn guest_entry(&self, database: &str, id: u32) -> Result<Option<String>> {
        let output = self.exec(&format!("getent {} {}", database, id))?;
        if !output.success() {
            return Ok(None);
        }
        Ok(output
            .text()
            .split(':')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string))
    }

    /// Move whatever guest user and group hold `uid`/`gid` out of the way.
    fn relocate_ids(&self, uid: u32, gid: u32) -> Result<()> {
        let user = self.guest_entry("passwd", uid)?;
        let group = self.guest_entry("group", gid)?;

        if let Some(user) = &user {
            info!("moving guest user {} from uid {} to {}", user, uid, RELOCATED_ID);
            self.guest_check(&format!("usermod -u {} {}", RELOCATED_ID, user))?;
        }
        if let Some(group) = &group {
            self.guest_check(&format!("groupmod -g {} {}", RELOCATED_ID, group))?;
        }
        if let (Some(user), Some(group)) = (&user, &group) {
            if user == group {
                self.guest_check(&format!("chown -R {0}:{0} /home/{0}", user))?;
            }
        }
        Ok(())
    }

    fn provision_user(&self, ssh_keys: &str, remap: Option<HostIdentity>) -> Result<()> {
        let user = self.user();
        info!("Creating user {}...", user);

        match remap {
            Some(host) => {
                self.relocate_ids(host.uid, host.gid)?;
                self.guest_check(&format!("groupadd -g {} {}", host.gid, user))?;
                self.guest_check(&format!(
                    "useradd -m -s /bin/bash -g {0} -u {1} {0}",
                    user, host.uid
                ))?;
            }
            None => {
                self.guest_check(&format!("useradd -m -s /bin/bash -U {}", user))?;
            }
        }

        let home = format!("/home/{}", user);
        self.guest_check(&format!("mkdir -p {}/.ssh", home))?;
        self.guest_check(&format!(
            "tee {}/.ssh/authorized_keys <<'EOS'\n{}\nEOS",
            home,
            ssh_keys.trim_end()
        ))?;
        self.guest_check(&format!("touch {}/.hushlogin", home))?;
        self.guest_check(&format!("chmod 0700 {}/.ssh", home))?;
        self.guest_check(&format!("chown -R {0}:{0} {1}", user, home))?;
        self.guest_check(&format!(
            "tee -a /etc/sudoers <<'EOS'\n{} ALL=(ALL) NOPASSWD: ALL\nEOS",
            user
        ))?;
        self.guest_check("chmod 0440 /etc/sudoers")?;
        Ok(())
    }
}

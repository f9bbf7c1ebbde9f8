use tracing::debug;

use crate::error::{ReadinessError, Result};
use crate::system::System;

/// Programs every mutating command depends on.
pub const REQUIRED_PROGRAMS: &[&str] = &["lxc", "redir", "ssh-add"];

const KEY_PREFIXES: &[&str] = &["ssh-", "ecdsa-", "sk-"];

/// Proof that the host was checked and is ready for container changes.
///
/// Only [`verify`] builds one, so operations that take a `&Readiness` cannot
/// run before the checks did.
#[derive(Debug, Clone)]
pub struct Readiness {
    ssh_keys: String,
}

impl Readiness {
    /// Public keys offered by the caller's SSH agent, one per line.
    pub fn ssh_keys(&self) -> &str {
        &self.ssh_keys
    }
}

pub fn verify(system: &System) -> Result<Readiness> {
    check_programs(system, REQUIRED_PROGRAMS)?;
    check_engine(system)?;
    Ok(Readiness {
        ssh_keys: ssh_keys(system)?,
    })
}

pub fn check_programs(system: &System, programs: &[&str]) -> Result<()> {
    for program in programs {
        if !system.host(&format!("command -v {}", program))?.success() {
            return Err(ReadinessError::MissingProgram(program.to_string()).into());
        }
    }
    Ok(())
}

/// The default profile needs a root disk and a network device before any
/// container can be created; `lxd init` provides both.
pub fn check_engine(system: &System) -> Result<()> {
    let output = system.exec("lxc profile device list default")?;
    let devices: Vec<&str> = output.stdout.lines().map(str::trim).collect();
    debug!("default profile devices: {:?}", devices);
    if !output.success() || !devices.contains(&"root") || !devices.contains(&"eth0") {
        return Err(ReadinessError::EngineNotInitialized.into());
    }
    Ok(())
}

pub fn ssh_keys(system: &System) -> Result<String> {
    let output = system.host("ssh-add -L")?;
    let keys: Vec<&str> = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| KEY_PREFIXES.iter().any(|p| line.starts_with(p)))
        .collect();
    if !output.success() || keys.is_empty() {
        return Err(ReadinessError::NoSshKey.into());
    }
    Ok(keys.join("\n"))
}

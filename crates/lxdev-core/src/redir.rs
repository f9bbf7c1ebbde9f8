use std::thread;
use std::time::Duration;

use tracing::info;

use crate::container::Container;
use crate::error::{Error, Result};
use crate::system::{engine_error, System};

/// Program relaying a host TCP port to the guest.
pub const FORWARDER: &str = "redir";

/// The exact relay a forwarder process is expected to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardTarget<'a> {
    pub host_port: u16,
    pub ip: &'a str,
    pub guest_port: u16,
}

/// Looks up live forwarder processes.
///
/// Matching running processes by their command line is the fragile part of
/// forwarding; it stays behind this trait so [`Redir`] never depends on it.
pub trait ProcessTable {
    fn find_forwarder(&self, target: &ForwardTarget<'_>) -> Result<Option<u32>>;
}

/// Scans `ps axo pid,args` on the host.
pub struct PsTable<'a> {
    system: &'a System,
}

impl<'a> PsTable<'a> {
    pub fn new(system: &'a System) -> Self {
        PsTable { system }
    }
}

impl ProcessTable for PsTable<'_> {
    fn find_forwarder(&self, target: &ForwardTarget<'_>) -> Result<Option<u32>> {
        let listing = self.system.host("ps axo pid,args")?;
        if !listing.success() {
            return Err(engine_error(
                "failed to list processes",
                "ps axo pid,args",
                &listing,
            ));
        }
        Ok(match_forwarder(&listing.stdout, target))
    }
}

fn program_name(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

fn relays(args: &[&str], target: &ForwardTarget<'_>) -> bool {
    let listen = format!(":{}", target.host_port);
    let connect = format!("{}:{}", target.ip, target.guest_port);
    let positional: Vec<&str> = args.iter().copied().filter(|a| !a.starts_with('-')).collect();
    if positional == [listen.as_str(), connect.as_str()] {
        return true;
    }

    // redir 2.x spells everything as options.
    let lport = format!("--lport={}", target.host_port);
    let caddr = format!("--caddr={}", target.ip);
    let cport = format!("--cport={}", target.guest_port);
    [lport, caddr, cport]
        .iter()
        .all(|option| args.contains(&option.as_str()))
}

/// Pick the forwarder relaying exactly `target` out of a `pid args` listing.
///
/// A `sudo redir ...` wrapper is only returned when the forwarder itself is
/// not visible.
pub fn match_forwarder(listing: &str, target: &ForwardTarget<'_>) -> Option<u32> {
    let mut wrapper = None;

    for line in listing.lines() {
        let mut tokens = line.split_whitespace();
        let Some(pid) = tokens.next().and_then(|t| t.parse::<u32>().ok()) else {
            continue;
        };
        let args: Vec<&str> = tokens.collect();
        let Some(position) = args.iter().position(|a| program_name(a) == FORWARDER) else {
            continue;
        };
        if !relays(&args[position + 1..], target) {
            continue;
        }
        if position == 0 {
            return Some(pid);
        }
        if args[..position].iter().any(|a| program_name(a) == "sudo") {
            wrapper.get_or_insert(pid);
        }
    }

    wrapper
}

/// A guest:host port pair and the forwarder serving it.
///
/// No process id is stored; liveness is looked up in the process table
/// every time it is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redir {
    pub guest: u16,
    pub host: u16,
}

impl Redir {
    pub fn new(guest: u16, host: u16) -> Self {
        Redir { guest, host }
    }

    pub fn pid(&self, container: &Container<'_>, table: &dyn ProcessTable) -> Result<Option<u32>> {
        let Some(ip) = container.ip() else {
            return Ok(None);
        };
        table.find_forwarder(&ForwardTarget {
            host_port: self.host,
            ip,
            guest_port: self.guest,
        })
    }

    pub fn is_running(&self, container: &Container<'_>, table: &dyn ProcessTable) -> Result<bool> {
        Ok(self.pid(container, table)?.is_some())
    }

    pub fn start(&self, container: &Container<'_>, table: &dyn ProcessTable) -> Result<()> {
        let Some(ip) = container.ip().filter(|_| container.is_running()) else {
            return Ok(());
        };
        if self.is_running(container, table)? {
            return Ok(());
        }

        info!("Forwarding {}:{} to local port {}", ip, self.guest, self.host);
        container
            .system()
            .spawn(&format!("{} :{} {}:{}", FORWARDER, self.host, ip, self.guest))?;

        // The child can take a moment to exec.
        for _ in 0..10 {
            if self.is_running(container, table)? {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(100));
        }

        Err(Error::ForwarderStart {
            guest: self.guest,
            host: self.host,
        })
    }

    pub fn stop(&self, container: &Container<'_>, table: &dyn ProcessTable) -> Result<()> {
        let Some(pid) = self.pid(container, table)? else {
            return Ok(());
        };
        let command = format!("kill {}", pid);
        let output = container.system().exec(&command)?;
        if !output.success() {
            return Err(engine_error(
                &format!("failed to stop forwarder for guest={} host={}", self.guest, self.host),
                &command,
                &output,
            ));
        }
        Ok(())
    }
}

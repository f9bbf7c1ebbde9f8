use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{Error, Result};

/// Captured result of a finished host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout with surrounding whitespace removed.
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }
}

/// Runs shell command lines on the host.
///
/// Everything lxdev does to the engine, the guest and the host goes through
/// this seam, so tests substitute a fake without touching a real system.
pub trait CommandRunner {
    /// Run `command` through `sh -c`, wait for it and capture its output.
    fn run(&self, command: &str) -> io::Result<CommandOutput>;

    /// Run `command`, copying its combined stdout/stderr line by line to
    /// `sink` as it is produced. Returns the exit status.
    fn stream(&self, command: &str, sink: &mut dyn Write) -> io::Result<i32>;

    /// Start `command` in its own process group with all stdio detached and
    /// return immediately. The child outlives the calling process.
    fn spawn_detached(&self, command: &str) -> io::Result<u32>;
}

/// The real runner, backed by `/bin/sh`.
pub struct ShellRunner;

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(if status.success() { 0 } else { 1 })
}

/// Forward raw output line by line; guest output need not be UTF-8.
fn copy_lines(mut reader: impl BufRead, sink: &mut dyn Write) -> io::Result<()> {
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        sink.write_all(&line)?;
        sink.flush()?;
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> io::Result<CommandOutput> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()?;
        Ok(CommandOutput {
            status: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn stream(&self, command: &str, sink: &mut dyn Write) -> io::Result<i32> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!("{{ {}\n}} 2>&1", command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;

        let copied = match child.stdout.take() {
            Some(stdout) => copy_lines(BufReader::new(stdout), sink),
            None => Ok(()),
        };
        // Reap the child even when forwarding its output failed.
        let status = child.wait()?;
        copied?;
        Ok(exit_code(status))
    }

    fn spawn_detached(&self, command: &str) -> io::Result<u32> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(format!("exec {}", command))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        Ok(child.id())
    }
}

/// Whether engine and forwarder commands need `sudo`.
///
/// Decided once at start-up and carried by [`System`]; never changed
/// while a command is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Direct,
    Sudo,
}

/// Group whose members may talk to the LXD socket without root.
pub const ENGINE_GROUP: &str = "lxd";

impl Privilege {
    /// Members of the `lxd` group talk to the engine directly, everyone
    /// else goes through sudo.
    pub fn detect(runner: &dyn CommandRunner) -> io::Result<Privilege> {
        let groups = runner.run("id -nG")?;
        let member = groups
            .stdout
            .split_whitespace()
            .any(|group| group == ENGINE_GROUP);
        Ok(if member {
            Privilege::Direct
        } else {
            Privilege::Sudo
        })
    }

    pub fn apply(self, command: &str) -> String {
        match self {
            Privilege::Direct => command.to_string(),
            Privilege::Sudo => format!("sudo {}", command),
        }
    }
}

/// Numeric identity of the user running lxdev on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Host access handle shared by every component for one invocation.
pub struct System {
    runner: Box<dyn CommandRunner>,
    privilege: Privilege,
}

impl System {
    pub fn new(runner: impl CommandRunner + 'static, privilege: Privilege) -> Self {
        System {
            runner: Box::new(runner),
            privilege,
        }
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    /// Run an engine-level command with the configured privilege.
    pub fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.exec_as(self.privilege, command)
    }

    /// Run a command with an explicit privilege, for host changes that
    /// need root no matter how the engine is reached.
    pub fn exec_as(&self, privilege: Privilege, command: &str) -> Result<CommandOutput> {
        self.host(&privilege.apply(command))
    }

    /// Run a plain host command as the invoking user.
    pub fn host(&self, command: &str) -> Result<CommandOutput> {
        debug!("exec: {}", command);
        let output = self.runner.run(command)?;
        debug!("exit {}: {}", output.status, output.stdout.trim_end());
        Ok(output)
    }

    /// Like [`System::exec`], but a non-zero exit becomes an
    /// [`Error::EngineCommand`] carrying `context`.
    pub fn check(&self, context: &str, command: &str) -> Result<CommandOutput> {
        let output = self.exec(command)?;
        if !output.success() {
            return Err(engine_error(context, command, &output));
        }
        Ok(output)
    }

    pub fn stream(&self, command: &str, sink: &mut dyn Write) -> Result<i32> {
        let command = self.privilege.apply(command);
        debug!("stream: {}", command);
        Ok(self.runner.stream(&command, sink)?)
    }

    pub fn spawn(&self, command: &str) -> Result<u32> {
        let command = self.privilege.apply(command);
        debug!("spawn: {}", command);
        Ok(self.runner.spawn_detached(&command)?)
    }

    pub fn host_identity(&self) -> Result<HostIdentity> {
        Ok(HostIdentity {
            uid: self.numeric("id -u")?,
            gid: self.numeric("id -g")?,
        })
    }

    fn numeric(&self, command: &str) -> Result<u32> {
        let output = self.host(command)?;
        output
            .text()
            .parse()
            .map_err(|_| Error::Protocol(format!("`{}` returned {:?}", command, output.text())))
    }
}

pub(crate) fn engine_error(context: &str, command: &str, output: &CommandOutput) -> Error {
    let message = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    Error::EngineCommand {
        context: context.to_string(),
        command: command.to_string(),
        status: output.status,
        output: message.to_string(),
    }
}

/// Quote `value` for safe use as one word in a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

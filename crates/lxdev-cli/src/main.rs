mod cli;
mod config;
mod sudoers;

use std::io;
use std::os::unix::process::CommandExt;
use std::process;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lxdev_core::{preflight, Orchestrator, Privilege, Readiness, ShellRunner, System};

use crate::cli::{Cli, Commands};
use crate::config::LoadedConfig;

/// The box described by the config file, and the host it runs on.
struct Project {
    system: System,
    loaded: LoadedConfig,
}

impl Project {
    fn load(config_flag: Option<&str>) -> Result<Self> {
        let loaded = config::load_config(config_flag)?;
        let privilege =
            Privilege::detect(&ShellRunner).context("failed to check group membership")?;
        Ok(Project {
            system: System::new(ShellRunner, privilege),
            loaded,
        })
    }

    fn name(&self) -> &str {
        &self.loaded.config.name
    }

    fn open(&self) -> Result<Orchestrator<'_>> {
        Orchestrator::new(
            &self.system,
            self.loaded.config.clone(),
            &self.loaded.project_dir,
        )
        .with_context(|| format!("failed to look up container \"{}\"", self.name()))
    }

    /// Commands that only look at the box need nothing but `lxc`.
    fn inspect(&self) -> Result<Orchestrator<'_>> {
        preflight::check_programs(&self.system, &["lxc"])?;
        self.open()
    }

    /// Commands that change the box run only on a verified host.
    fn prepare(&self) -> Result<(Readiness, Orchestrator<'_>)> {
        let ready = preflight::verify(&self.system)?;
        Ok((ready, self.open()?))
    }
}

fn ssh(lxdev: &Orchestrator<'_>, command: &[String]) -> Result<()> {
    let (user, ip) = lxdev.ssh_target()?;

    let mut ssh = process::Command::new("ssh");
    ssh.args(["-o", "StrictHostKeyChecking=no", "-t"])
        .arg(format!("{}@{}", user, ip));
    if !command.is_empty() {
        ssh.arg(command.join(" "));
    }

    // Only returns on failure.
    let err = ssh.exec();
    Err(err).context("failed to run ssh")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.verbose.tracing_level_filter().into())
                .from_env_lossy(),
        )
        .with_target(false)
        .without_time()
        .init();

    let config = cli.config.as_deref();

    match cli.command {
        Commands::Sudoers => {
            let system = System::new(ShellRunner, Privilege::Sudo);
            sudoers::create(&system, &mut io::stdin().lock())?;
        }
        Commands::Status => {
            let project = Project::load(config)?;
            print!("{}", project.inspect()?.status()?);
        }
        Commands::Ssh { command } => {
            let project = Project::load(config)?;
            let lxdev = project.inspect()?;
            preflight::check_programs(&project.system, &["ssh"])?;
            ssh(&lxdev, &command)?;
        }
        Commands::Exec { command } => {
            let project = Project::load(config)?;
            let code = project
                .inspect()?
                .exec(&command.join(" "), &mut io::stdout())?;
            process::exit(code);
        }
        Commands::Up => {
            let project = Project::load(config)?;
            let (ready, mut lxdev) = project.prepare()?;
            eprintln!("lxdev: bringing up \"{}\"...", project.name());
            lxdev.up(&ready, &mut io::stdout())?;
            match lxdev.container().ip() {
                Some(ip) => eprintln!("lxdev: \"{}\" is up at {}", project.name(), ip),
                None => eprintln!("lxdev: \"{}\" is up", project.name()),
            }
        }
        Commands::Halt => {
            let project = Project::load(config)?;
            let (ready, mut lxdev) = project.prepare()?;
            lxdev.halt(&ready)?;
            eprintln!("lxdev: \"{}\" stopped", project.name());
        }
        Commands::Destroy => {
            let project = Project::load(config)?;
            let (ready, mut lxdev) = project.prepare()?;
            lxdev.destroy(&ready)?;
            eprintln!("lxdev: \"{}\" destroyed", project.name());
        }
        Commands::Provision => {
            let project = Project::load(config)?;
            let (ready, mut lxdev) = project.prepare()?;
            lxdev.provision(&ready, &mut io::stdout())?;
        }
        Commands::Snapshot { name } => {
            let project = Project::load(config)?;
            let (ready, mut lxdev) = project.prepare()?;
            if !lxdev.snapshot(&ready, &name)? {
                bail!("failed to create snapshot \"{}\"", name);
            }
            eprintln!("lxdev: created snapshot \"{}\"", name);
        }
        Commands::Restore { name } => {
            let project = Project::load(config)?;
            let (ready, mut lxdev) = project.prepare()?;
            if !lxdev.restore(&ready, &name)? {
                bail!("failed to restore snapshot \"{}\"", name);
            }
            eprintln!("lxdev: restored snapshot \"{}\"", name);
        }
        Commands::Rmsnapshot { name } => {
            let project = Project::load(config)?;
            let (ready, mut lxdev) = project.prepare()?;
            if !lxdev.rmsnapshot(&ready, &name)? {
                bail!("failed to delete snapshot \"{}\"", name);
            }
            eprintln!("lxdev: deleted snapshot \"{}\"", name);
        }
        Commands::Revert => {
            let project = Project::load(config)?;
            let (ready, mut lxdev) = project.prepare()?;
            if !lxdev.revert(&ready)? {
                bail!("failed to revert \"{}\"", project.name());
            }
            eprintln!("lxdev: reverted \"{}\" to its latest snapshot", project.name());
        }
    }

    Ok(())
}

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[derive(Parser)]
#[command(name = "lxdev", about = "Development boxes in LXD containers", version)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Path to config file (default: ./lxdev.yml)
    #[arg(long, global = true, env = "LXDEV_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand)]
pub(crate) enum Commands {
    /// Create, start and provision the box, then forward ports and share folders
    Up,

    /// Stop port forwarding and the box
    Halt,

    /// Stop port forwarding and delete the box
    Destroy,

    /// Show the box, its folders, forwarded ports and snapshots
    Status,

    /// Open an SSH session in the box, or run a command over SSH
    Ssh {
        /// Command and arguments to run instead of a login shell
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run a command in the box as root
    Exec {
        /// Command and arguments to run inside the box
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Run the provisioning commands again
    Provision,

    /// Take a snapshot of the box
    Snapshot {
        /// Snapshot name
        name: String,
    },

    /// Restore a snapshot
    Restore {
        /// Snapshot name
        name: String,
    },

    /// Delete a snapshot
    Rmsnapshot {
        /// Snapshot name
        name: String,
    },

    /// Restore the most recent snapshot and delete it
    Revert,

    /// Let your user run lxc, redir and kill through sudo without a password
    Sudoers,
}

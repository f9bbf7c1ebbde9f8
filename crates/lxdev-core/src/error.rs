/// Environment problems detected before any container is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadinessError {
    #[error("required program `{0}` was not found on PATH")]
    MissingProgram(String),

    #[error("Please run 'lxd init' and configure LXD first")]
    EngineNotInitialized,

    #[error(
        "No ssh keys detected. Make sure you have an ssh key, a running agent, \
         and the key added to the agent, e.g. with ssh-add."
    )]
    NoSshKey,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Readiness(ReadinessError),

    #[error("Box \"{name}\" has not been created yet")]
    NotCreated { name: String },

    #[error("Box \"{name}\" already exists")]
    AlreadyExists { name: String },

    #[error("Box \"{name}\" is not running")]
    NotRunning { name: String },

    #[error("uid {uid} in box \"{name}\" does not belong to user {user}; it was not provisioned for shifted folders")]
    UserNotMapped { name: String, user: String, uid: u32 },

    #[error("shared folder {} does not exist", .path.display())]
    MissingFolder {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Box \"{name}\" has no snapshots")]
    NoSnapshots { name: String },

    #[error(
        "device {device} in box \"{name}\" already shares {existing}, not {}; rename one of the folders",
        .host.display()
    )]
    FolderConflict {
        name: String,
        device: String,
        existing: String,
        host: std::path::PathBuf,
    },

    #[error("shared folder system setup has not been run for box \"{name}\"")]
    SystemSetupRequired { name: String },

    #[error("{context}: `{command}` exited with status {status}: {output}")]
    EngineCommand {
        context: String,
        command: String,
        status: i32,
        output: String,
    },

    #[error("Box \"{name}\" timed out waiting for boot after {attempts} attempts")]
    BootTimeout { name: String, attempts: u32 },

    #[error("failed to start forwarder for guest={guest} host={host}")]
    ForwarderStart { guest: u16, host: u16 },

    #[error("failed to decode engine output: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unexpected engine output: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ReadinessError> for Error {
    fn from(err: ReadinessError) -> Self {
        Error::Readiness(err)
    }
}

impl Error {
    /// True for the errors reported before any mutation was attempted.
    pub fn is_readiness(&self) -> bool {
        matches!(self, Error::Readiness(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

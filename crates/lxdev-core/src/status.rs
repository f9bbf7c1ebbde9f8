use std::fmt;

use crate::engine::Snapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardStatus {
    pub guest: u16,
    pub host: u16,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderStatus {
    pub device: String,
    pub source: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxStatus {
    pub name: String,
    pub status: String,
    pub ip: Option<String>,
    pub image: String,
    pub folders: Vec<FolderStatus>,
    pub forwards: Vec<ForwardStatus>,
    pub snapshots: Vec<Snapshot>,
}

/// Result of `lxdev status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReport {
    Missing { name: String },
    Present(BoxStatus),
}

const SEPARATOR: &str = "------------------------------------------------------------";

fn row(f: &mut fmt::Formatter<'_>, key: &str, value: &str) -> fmt::Result {
    writeln!(f, "{:<16} {}", key, value)
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            StatusReport::Missing { name } => {
                return writeln!(
                    f,
                    "Container \"{}\" does not exist. Run `lxdev up` to create it.",
                    name
                );
            }
            StatusReport::Present(status) => status,
        };

        row(f, "Name", &status.name)?;
        row(f, "Status", &status.status)?;
        row(f, "IP", status.ip.as_deref().unwrap_or("-"))?;
        row(f, "Image", &status.image)?;

        if !status.folders.is_empty() {
            writeln!(f, "{}", SEPARATOR)?;
            for folder in &status.folders {
                row(
                    f,
                    &folder.device,
                    &format!("{} => {}", folder.source, folder.path),
                )?;
            }
        }

        if !status.forwards.is_empty() {
            writeln!(f, "{}", SEPARATOR)?;
            for forward in &status.forwards {
                let state = match forward.pid {
                    Some(pid) => format!("running, pid {}", pid),
                    None => "not running".to_string(),
                };
                row(
                    f,
                    "Forwarded port",
                    &format!("guest: {} host: {} ({})", forward.guest, forward.host, state),
                )?;
            }
        }

        if !status.snapshots.is_empty() {
            writeln!(f, "{}", SEPARATOR)?;
            row(f, "Snapshots", "")?;
            for snapshot in &status.snapshots {
                row(f, &snapshot.name, &snapshot.created_at)?;
            }
        }

        Ok(())
    }
}

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Lifecycle position of a container as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Absent,
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub kind: Option<String>,
    pub source: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Snapshot name without the `<container>/` prefix.
    pub name: String,
    pub created_at: String,
}

/// Everything lxdev knows about a container, decoded from one
/// `lxc ls --format json` query. Replaced wholesale on every refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub status: ContainerStatus,
    /// Status text as the engine reported it (`Running`, `Stopped`, `Frozen`...).
    pub status_text: String,
    pub ip: Option<String>,
    pub devices: BTreeMap<String, Device>,
    pub snapshots: Vec<Snapshot>,
}

impl ContainerState {
    pub fn absent() -> Self {
        ContainerState {
            status: ContainerStatus::Absent,
            status_text: "Absent".to_string(),
            ip: None,
            devices: BTreeMap::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn exists(&self) -> bool {
        self.status != ContainerStatus::Absent
    }

    /// Disk devices that map a host directory into the guest.
    pub fn shared_folders(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.devices.iter().filter_map(|(name, device)| {
            match (device.source.as_deref(), device.path.as_deref()) {
                (Some(source), Some(path)) => Some((name.as_str(), source, path)),
                _ => None,
            }
        })
    }

    /// Decode the engine's listing for the container called `name`.
    ///
    /// The listing is a JSON array; the engine filters by regular expression,
    /// so only an entry whose name matches exactly is taken.
    pub fn decode(name: &str, json: &str) -> Result<Self> {
        let listing: Vec<RawContainer> = serde_json::from_str(json)?;
        let mut matching = listing.into_iter().filter(|c| c.name == name);
        let Some(raw) = matching.next() else {
            return Ok(ContainerState::absent());
        };
        if matching.next().is_some() {
            return Err(Error::Protocol(format!(
                "engine listed container \"{}\" more than once",
                name
            )));
        }
        Ok(raw.into_state())
    }
}

// --- wire format ---

#[derive(Deserialize)]
struct RawContainer {
    name: String,
    status: String,
    state: Option<RawState>,
    #[serde(default)]
    devices: BTreeMap<String, RawDevice>,
    #[serde(default)]
    snapshots: Option<Vec<RawSnapshot>>,
}

#[derive(Deserialize)]
struct RawState {
    #[serde(default)]
    network: Option<BTreeMap<String, RawNetwork>>,
}

#[derive(Deserialize)]
struct RawNetwork {
    addresses: Vec<RawAddress>,
}

#[derive(Deserialize)]
struct RawAddress {
    family: String,
    address: String,
}

#[derive(Deserialize)]
struct RawDevice {
    #[serde(rename = "type")]
    kind: Option<String>,
    source: Option<String>,
    path: Option<String>,
}

#[derive(Deserialize)]
struct RawSnapshot {
    name: String,
    created_at: String,
}

impl RawContainer {
    fn into_state(self) -> ContainerState {
        let status = if self.status == "Running" {
            ContainerStatus::Running
        } else {
            ContainerStatus::Stopped
        };

        let ip = self
            .state
            .and_then(|s| s.network)
            .and_then(|mut networks| networks.remove("eth0"))
            .and_then(|eth0| {
                eth0.addresses
                    .into_iter()
                    .find(|a| a.family == "inet")
                    .map(|a| a.address)
            });

        let devices = self
            .devices
            .into_iter()
            .map(|(name, d)| {
                (
                    name,
                    Device {
                        kind: d.kind,
                        source: d.source,
                        path: d.path,
                    },
                )
            })
            .collect();

        let snapshots = self
            .snapshots
            .unwrap_or_default()
            .into_iter()
            .map(|s| Snapshot {
                name: match s.name.split_once('/') {
                    Some((_, short)) => short.to_string(),
                    None => s.name,
                },
                created_at: s.created_at,
            })
            .collect();

        ContainerState {
            status,
            status_text: self.status,
            ip,
            devices,
            snapshots,
        }
    }
}

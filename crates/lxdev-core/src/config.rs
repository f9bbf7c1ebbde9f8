use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

use crate::container::ContainerDescriptor;
use crate::redir::Redir;

/// The `box` section of `lxdev.yml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoxConfig {
    pub name: String,
    pub image: String,
    pub user: String,
    /// Guest port to host port.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ports: BTreeMap<u16, u16>,
    /// Host path to guest path.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub folders: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub provisioning: Vec<String>,
    #[serde(default)]
    pub auto_snapshots: bool,
}

/// A key written without a value (`provisioning:`) means "none".
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl BoxConfig {
    pub fn descriptor(&self) -> ContainerDescriptor {
        ContainerDescriptor {
            name: self.name.clone(),
            image: self.image.clone(),
            user: self.user.clone(),
        }
    }

    pub fn redirs(&self) -> Vec<Redir> {
        self.ports
            .iter()
            .map(|(&guest, &host)| Redir::new(guest, host))
            .collect()
    }
}

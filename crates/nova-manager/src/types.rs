use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

/// Server status as reported by Nova.
///
/// Only the two settled states the CLI waits for get their own variant; everything else
/// (BUILD, REBOOT, SHUTOFF, ERROR, ...) is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum ServerStatus {
    Active,
    Suspended,
    #[default]
    Unknown,
    Other(String),
}

impl From<String> for ServerStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ACTIVE" => ServerStatus::Active,
            "SUSPENDED" => ServerStatus::Suspended,
            "" => ServerStatus::Unknown,
            _ => ServerStatus::Other(s),
        }
    }
}

impl From<&str> for ServerStatus {
    fn from(s: &str) -> Self {
        ServerStatus::from(s.to_string())
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Active => write!(f, "ACTIVE"),
            ServerStatus::Suspended => write!(f, "SUSPENDED"),
            ServerStatus::Unknown => write!(f, "UNKNOWN"),
            ServerStatus::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A single address record attached to a server on one network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddressRecord {
    pub addr: String,
    #[serde(default)]
    pub version: Option<u8>,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    pub kind: Option<String>,
}

/// Network name to address records, in the order the provider returned them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addresses(Vec<(String, Vec<AddressRecord>)>);

impl Addresses {
    pub fn new(networks: Vec<(String, Vec<AddressRecord>)>) -> Self {
        Self(networks)
    }

    /// First address of the first network that has one.
    pub fn first(&self) -> Option<&str> {
        self.0
            .iter()
            .find_map(|(_, records)| records.first())
            .map(|r| r.addr.as_str())
    }

    pub fn networks(&self) -> impl Iterator<Item = (&str, &[AddressRecord])> {
        self.0.iter().map(|(n, r)| (n.as_str(), r.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Addresses {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AddressesVisitor;

        impl<'de> Visitor<'de> for AddressesVisitor {
            type Value = Addresses;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of network name to address list")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Addresses, A::Error> {
                let mut networks = Vec::new();
                while let Some((name, records)) = map.next_entry::<String, Vec<AddressRecord>>()? {
                    networks.push((name, records));
                }
                Ok(Addresses(networks))
            }
        }

        deserializer.deserialize_map(AddressesVisitor)
    }
}

/// A compute server. The non-detailed listing only carries `id` and `name`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default)]
    pub addresses: Addresses,
}

impl Server {
    pub fn first_address(&self) -> Option<&str> {
        self.addresses.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
}

/// A Nova keypair. `private_key` is only present in the response to a create call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Keypair {
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityGroupRef {
    pub name: String,
}

/// Body of a server create request.
///
/// Unresolved flavor or image references are left out and the provider rejects the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerCreate {
    pub name: String,
    #[serde(rename = "flavorRef", skip_serializing_if = "Option::is_none")]
    pub flavor_ref: Option<String>,
    #[serde(rename = "imageRef", skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    pub key_name: String,
    pub availability_zone: String,
    pub security_groups: Vec<SecurityGroupRef>,
}

/// Server actions issued through `POST /servers/{id}/action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    Suspend,
    Resume,
    SoftReboot,
}

impl ServerAction {
    pub fn body(&self) -> serde_json::Value {
        match self {
            ServerAction::Suspend => serde_json::json!({ "suspend": null }),
            ServerAction::Resume => serde_json::json!({ "resume": null }),
            ServerAction::SoftReboot => serde_json::json!({ "reboot": { "type": "SOFT" } }),
        }
    }
}

impl fmt::Display for ServerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAction::Suspend => write!(f, "suspend"),
            ServerAction::Resume => write!(f, "resume"),
            ServerAction::SoftReboot => write!(f, "reboot"),
        }
    }
}

/// Filter for server listings. `name` is a regular expression evaluated by Nova.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerQuery {
    pub name: Option<String>,
    pub detailed: bool,
}

impl ServerQuery {
    pub fn detailed(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            detailed: true,
        }
    }
}

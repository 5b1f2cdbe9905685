//! Core network construct types

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// Attribute key holding a VLAN id
pub const ATTR_VLAN_ID: &str = "id";
/// Attribute key holding bond/bridge members (comma separated)
pub const ATTR_MEMBERS: &str = "interfaces";
/// Attribute key holding addresses (comma separated)
pub const ATTR_ADDRESSES: &str = "addresses";
/// Attribute key holding the MTU
pub const ATTR_MTU: &str = "mtu";
/// Attribute key holding the bond mode
pub const ATTR_BOND_MODE: &str = "mode";

/// Maximum kernel interface name length
const MAX_NAME_LEN: usize = 15;

/// Kind of network construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstructKind {
    Physical,
    Vlan,
    Bond,
    Bridge,
}

impl ConstructKind {
    pub const ALL: [ConstructKind; 4] = [
        ConstructKind::Physical,
        ConstructKind::Vlan,
        ConstructKind::Bond,
        ConstructKind::Bridge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConstructKind::Physical => "physical",
            ConstructKind::Vlan => "vlan",
            ConstructKind::Bond => "bond",
            ConstructKind::Bridge => "bridge",
        }
    }
}

impl fmt::Display for ConstructKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConstructKind {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "physical" | "ethernet" => Ok(ConstructKind::Physical),
            "vlan" => Ok(ConstructKind::Vlan),
            "bond" => Ok(ConstructKind::Bond),
            "bridge" => Ok(ConstructKind::Bridge),
            _ => Err(TopologyError::UnknownConstruct {
                name: s.to_string(),
            }),
        }
    }
}

/// A network construct managed through the layered store.
///
/// The kind is fixed at construction time; only the parent and the
/// attributes can change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConstruct {
    /// Interface identity
    pub name: String,
    kind: ConstructKind,
    /// Name of the parent construct, if any
    #[serde(default)]
    pub parent: Option<String>,
    /// Addresses, MTU, bond mode, member list, ...
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl NetworkConstruct {
    /// Create a construct without parent or attributes
    pub fn new(name: impl Into<String>, kind: ConstructKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parent: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn physical(name: impl Into<String>) -> Self {
        Self::new(name, ConstructKind::Physical)
    }

    /// VLAN with the given parent and tag
    pub fn vlan(name: impl Into<String>, parent: impl Into<String>, tag: u16) -> Self {
        Self::new(name, ConstructKind::Vlan)
            .with_parent(parent)
            .with_attribute(ATTR_VLAN_ID, tag.to_string())
    }

    /// Bond over the given member interfaces
    pub fn bond<S: AsRef<str>>(name: impl Into<String>, members: &[S]) -> Self {
        Self::new(name, ConstructKind::Bond).with_members(members)
    }

    /// Bridge over the given member interfaces
    pub fn bridge<S: AsRef<str>>(name: impl Into<String>, members: &[S]) -> Self {
        Self::new(name, ConstructKind::Bridge).with_members(members)
    }

    pub fn kind(&self) -> ConstructKind {
        self.kind
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_members<S: AsRef<str>>(self, members: &[S]) -> Self {
        let joined = members
            .iter()
            .map(|m| m.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.with_attribute(ATTR_MEMBERS, joined)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Member interfaces of a bond or bridge
    pub fn members(&self) -> Vec<String> {
        split_list(self.attribute(ATTR_MEMBERS))
    }

    /// Configured addresses
    pub fn addresses(&self) -> Vec<String> {
        split_list(self.attribute(ATTR_ADDRESSES))
    }

    /// VLAN id from the `id` attribute, falling back to a `.<tag>` name suffix
    pub fn vlan_id(&self) -> Option<u16> {
        if let Some(id) = self.attribute(ATTR_VLAN_ID) {
            return id.trim().parse().ok();
        }
        self.name
            .rsplit_once('.')
            .and_then(|(_, tag)| tag.parse().ok())
    }
}

/// Split a comma or whitespace separated attribute value
pub fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Validate an interface identity
pub fn validate_name(name: &str) -> Result<(), TopologyError> {
    let invalid = || TopologyError::InvalidName {
        name: name.to_string(),
    };

    let first = name.chars().next().ok_or_else(invalid)?;
    if !first.is_ascii_alphabetic() || name.len() > MAX_NAME_LEN {
        return Err(invalid());
    }

    // Dots are allowed for VLAN sub-interfaces
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(invalid());
    }

    if name.ends_with('.') || name.contains("..") {
        return Err(invalid());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_name_validation() {
        assert!(validate_name("eth0").is_ok());
        assert!(validate_name("br-test").is_ok());
        assert!(validate_name("bond_0").is_ok());
        assert!(validate_name("eth0.100").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("0eth").is_err());
        assert!(validate_name("eth@0").is_err());
        assert!(validate_name("eth0.").is_err());
        assert!(validate_name("very-long-interface-name").is_err());
    }

    #[test]
    fn test_construct_builders() {
        let vlan = NetworkConstruct::vlan("eth0.100", "eth0", 100);
        assert_eq!(vlan.kind(), ConstructKind::Vlan);
        assert_eq!(vlan.parent.as_deref(), Some("eth0"));
        assert_eq!(vlan.vlan_id(), Some(100));

        let bond = NetworkConstruct::bond("bond0", &["eth1", "eth2"])
            .with_attribute(ATTR_BOND_MODE, "active-backup");
        assert_eq!(bond.members(), vec!["eth1", "eth2"]);
        assert_eq!(bond.attribute(ATTR_BOND_MODE), Some("active-backup"));
    }

    #[test]
    fn test_vlan_id_from_name() {
        let vlan = NetworkConstruct::new("bond0.42", ConstructKind::Vlan);
        assert_eq!(vlan.vlan_id(), Some(42));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Bridge".parse::<ConstructKind>().unwrap(), ConstructKind::Bridge);
        assert_eq!("ethernet".parse::<ConstructKind>().unwrap(), ConstructKind::Physical);
        assert!("wifi".parse::<ConstructKind>().is_err());
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&ConstructKind::Vlan).unwrap();
        assert_eq!(json, "\"vlan\"");
    }
}

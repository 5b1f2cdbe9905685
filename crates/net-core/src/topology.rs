//! Name-based interface topology classification
//!
//! Classification only looks at the interface name. A physical NIC that
//! happens to be called `bond0`, or a bridge named without `br`, will be
//! misclassified; callers must tolerate that and prefer an explicit
//! [`crate::ConstructRegistry`] when one is available.

use serde::{Deserialize, Serialize};

use crate::priority::ParentInfo;
use crate::types::ConstructKind;

/// Best-effort description of what an interface sits on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentHint {
    /// Parent identity when it can be read from the name
    pub name: Option<String>,
    pub kind: ConstructKind,
    /// VLAN id taken from the `.<id>` suffix
    pub vlan_id: Option<u16>,
}

/// Result of analysing an interface identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyAnalysis {
    pub name: String,
    pub kind: ConstructKind,
    pub parent: Option<ParentHint>,
    /// Anything stacked on something other than a physical NIC
    pub complex: bool,
}

impl TopologyAnalysis {
    /// Parent information suitable for priority lookup
    pub fn parent_info(&self) -> ParentInfo {
        match &self.parent {
            None => ParentInfo::none(),
            Some(hint) => ParentInfo {
                kind: Some(hint.kind),
                nested_on_vlan: hint
                    .name
                    .as_deref()
                    .map(InterfaceTopologyAnalyzer::stacked_on_vlan)
                    .unwrap_or(false),
            },
        }
    }
}

/// Pure, deterministic interface name classifier
pub struct InterfaceTopologyAnalyzer;

impl InterfaceTopologyAnalyzer {
    /// Classify `identity`.
    ///
    /// Rules, first match wins:
    /// 1. trailing `.<digits>`: VLAN on the prefix, the prefix is analysed recursively
    /// 2. contains `bond`: bond, on a VLAN when the name contains a dot
    /// 3. `br-`/`bridge` prefix or contains `br`: bridge, on a VLAN when dotted
    /// 4. anything else is physical
    pub fn analyze(identity: &str) -> TopologyAnalysis {
        if let Some((prefix, tag)) = split_vlan_suffix(identity) {
            let parent = Self::analyze(prefix);
            return TopologyAnalysis {
                name: identity.to_string(),
                kind: ConstructKind::Vlan,
                complex: parent.kind != ConstructKind::Physical,
                parent: Some(ParentHint {
                    name: Some(prefix.to_string()),
                    kind: parent.kind,
                    vlan_id: tag.parse().ok(),
                }),
            };
        }

        if identity.contains("bond") {
            return Self::stacked(identity, ConstructKind::Bond);
        }

        if identity.starts_with("br-") || identity.starts_with("bridge") || identity.contains("br")
        {
            return Self::stacked(identity, ConstructKind::Bridge);
        }

        TopologyAnalysis {
            name: identity.to_string(),
            kind: ConstructKind::Physical,
            parent: None,
            complex: false,
        }
    }

    /// Infer the parent of a bond or bridge from its member interfaces.
    /// The first non-physical member decides; all-physical members give a
    /// physical parent.
    pub fn parent_for_members<S: AsRef<str>>(members: &[S]) -> ParentInfo {
        members
            .iter()
            .map(|member| (member.as_ref(), Self::analyze(member.as_ref())))
            .find(|(_, analysis)| analysis.kind != ConstructKind::Physical)
            .map(|(name, analysis)| ParentInfo {
                kind: Some(analysis.kind),
                nested_on_vlan: Self::stacked_on_vlan(name),
            })
            .unwrap_or_else(|| ParentInfo::of(ConstructKind::Physical))
    }

    /// Whether a VLAN appears anywhere below `identity` in its parent chain
    pub fn stacked_on_vlan(identity: &str) -> bool {
        match Self::analyze(identity).parent {
            Some(ParentHint {
                kind: ConstructKind::Vlan,
                ..
            }) => true,
            Some(ParentHint {
                name: Some(parent),
                ..
            }) => Self::stacked_on_vlan(&parent),
            _ => false,
        }
    }

    fn stacked(identity: &str, kind: ConstructKind) -> TopologyAnalysis {
        let parent_kind = if identity.contains('.') {
            ConstructKind::Vlan
        } else {
            ConstructKind::Physical
        };

        TopologyAnalysis {
            name: identity.to_string(),
            kind,
            parent: Some(ParentHint {
                name: None,
                kind: parent_kind,
                vlan_id: None,
            }),
            complex: parent_kind != ConstructKind::Physical,
        }
    }
}

fn split_vlan_suffix(identity: &str) -> Option<(&str, &str)> {
    let (prefix, tag) = identity.rsplit_once('.')?;
    if prefix.is_empty() || tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((prefix, tag))
}

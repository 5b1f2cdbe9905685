//! Arena of network constructs keyed by name

use indexmap::IndexMap;
use log::debug;

use crate::error::TopologyError;
use crate::priority::ParentInfo;
use crate::types::{validate_name, ConstructKind, NetworkConstruct};

/// Registry of the constructs defined on one host.
///
/// Invariants enforced on every mutation:
/// - a construct's kind never changes once registered
/// - a VLAN always has a parent, and every named parent is registered
/// - parent chains are acyclic
#[derive(Debug, Clone, Default)]
pub struct ConstructRegistry {
    constructs: IndexMap<String, NetworkConstruct>,
}

impl ConstructRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a construct
    pub fn insert(&mut self, construct: NetworkConstruct) -> Result<(), TopologyError> {
        validate_name(&construct.name)?;

        if let Some(existing) = self.constructs.get(&construct.name) {
            if existing.kind() != construct.kind() {
                return Err(TopologyError::KindChange {
                    name: construct.name.clone(),
                    existing: existing.kind().to_string(),
                    requested: construct.kind().to_string(),
                });
            }
        }

        if construct.kind() == ConstructKind::Vlan {
            match construct.vlan_id() {
                Some(id) if (1..=4094).contains(&id) => {}
                _ => {
                    return Err(TopologyError::InvalidVlanId {
                        name: construct.name.clone(),
                        id: construct
                            .attribute(crate::types::ATTR_VLAN_ID)
                            .unwrap_or("")
                            .to_string(),
                    })
                }
            }
        }

        self.check_parent(&construct.name, construct.kind(), construct.parent.as_deref())?;

        debug!(
            "Registering {} {} (parent: {:?})",
            construct.kind(),
            construct.name,
            construct.parent
        );
        self.constructs.insert(construct.name.clone(), construct);
        Ok(())
    }

    /// Move a construct under a new parent
    pub fn reparent(&mut self, name: &str, parent: Option<String>) -> Result<(), TopologyError> {
        let kind = self.require(name)?.kind();
        self.check_parent(name, kind, parent.as_deref())?;

        if let Some(construct) = self.constructs.get_mut(name) {
            construct.parent = parent;
        }
        Ok(())
    }

    /// Remove a construct that no other construct depends on
    pub fn remove(&mut self, name: &str) -> Result<NetworkConstruct, TopologyError> {
        self.require(name)?;

        if let Some(dependent) = self
            .constructs
            .values()
            .find(|c| c.parent.as_deref() == Some(name))
        {
            return Err(TopologyError::InUse {
                name: name.to_string(),
                dependent: dependent.name.clone(),
            });
        }

        self.constructs
            .shift_remove(name)
            .ok_or_else(|| TopologyError::UnknownConstruct {
                name: name.to_string(),
            })
    }

    pub fn get(&self, name: &str) -> Option<&NetworkConstruct> {
        self.constructs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.constructs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkConstruct> {
        self.constructs.values()
    }

    /// Parent information for priority lookup
    pub fn parent_info(&self, name: &str) -> Result<ParentInfo, TopologyError> {
        let construct = self.require(name)?;
        let parent = match construct.parent.as_deref() {
            None => return Ok(ParentInfo::none()),
            Some(parent) => self.require(parent)?,
        };

        Ok(ParentInfo {
            kind: Some(parent.kind()),
            nested_on_vlan: self
                .ancestors(&parent.name)
                .any(|c| c.kind() == ConstructKind::Vlan),
        })
    }

    /// Constructs ordered so that every parent precedes its children
    pub fn topological_order(&self) -> Vec<&NetworkConstruct> {
        let mut ordered: Vec<(usize, &NetworkConstruct)> = self
            .constructs
            .values()
            .map(|c| (self.ancestors(&c.name).count(), c))
            .collect();
        ordered.sort_by_key(|(depth, _)| *depth);
        ordered.into_iter().map(|(_, c)| c).collect()
    }

    /// Walk the parent chain of `name`, excluding `name` itself
    fn ancestors<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a NetworkConstruct> + 'a {
        let mut next = self.constructs.get(name).and_then(|c| c.parent.clone());
        let mut remaining = self.constructs.len();

        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            let current = self.constructs.get(next.as_deref()?)?;
            next = current.parent.clone();
            Some(current)
        })
    }

    fn check_parent(
        &self,
        name: &str,
        kind: ConstructKind,
        parent: Option<&str>,
    ) -> Result<(), TopologyError> {
        let parent = match parent {
            Some(parent) => parent,
            None if kind == ConstructKind::Vlan => {
                return Err(TopologyError::MissingParent {
                    name: name.to_string(),
                })
            }
            None => return Ok(()),
        };

        if !self.constructs.contains_key(parent) {
            return Err(TopologyError::UnknownParent {
                name: name.to_string(),
                parent: parent.to_string(),
            });
        }

        if parent == name || self.ancestors(parent).any(|c| c.name == name) {
            return Err(TopologyError::Cycle {
                name: name.to_string(),
                through: parent.to_string(),
            });
        }

        Ok(())
    }

    fn require(&self, name: &str) -> Result<&NetworkConstruct, TopologyError> {
        self.constructs
            .get(name)
            .ok_or_else(|| TopologyError::UnknownConstruct {
                name: name.to_string(),
            })
    }
}

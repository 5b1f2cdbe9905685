//! Load-order priorities for layered configuration files
//!
//! The configuration backend loads files in lexical order, so a construct's
//! file must sort after the file defining its parent. Priorities are fixed
//! bands per placement scenario and grow with nesting depth.

use serde::{Deserialize, Serialize};

use crate::types::ConstructKind;

/// What a construct sits on top of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ParentInfo {
    /// Kind of the direct parent, `None` for top-level constructs
    pub kind: Option<ConstructKind>,
    /// Whether a VLAN appears somewhere above the direct parent
    pub nested_on_vlan: bool,
}

impl ParentInfo {
    pub const fn none() -> Self {
        Self {
            kind: None,
            nested_on_vlan: false,
        }
    }

    pub const fn of(kind: ConstructKind) -> Self {
        Self {
            kind: Some(kind),
            nested_on_vlan: false,
        }
    }

    pub const fn nested(kind: ConstructKind) -> Self {
        Self {
            kind: Some(kind),
            nested_on_vlan: true,
        }
    }

    /// Every parent variant a construct could have been placed under
    pub fn variants() -> [ParentInfo; 7] {
        [
            ParentInfo::none(),
            ParentInfo::of(ConstructKind::Physical),
            ParentInfo::of(ConstructKind::Bond),
            ParentInfo::of(ConstructKind::Bridge),
            ParentInfo::of(ConstructKind::Vlan),
            ParentInfo::nested(ConstructKind::Bond),
            ParentInfo::nested(ConstructKind::Bridge),
        ]
    }
}

/// Named placement scenarios, each owning a priority band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Physical,
    VlanOnPhysical,
    BondOnPhysical,
    BridgeOnPhysical,
    VlanOnBond,
    BridgeOnBond,
    VlanOnBridge,
    BondOnVlan,
    BridgeOnVlan,
    /// VLAN on VLAN, or on a bond/bridge that itself sits on a VLAN
    VlanNested,
    BridgeOnBondOnVlan,
}

impl Placement {
    pub const ALL: [Placement; 11] = [
        Placement::Physical,
        Placement::VlanOnPhysical,
        Placement::BondOnPhysical,
        Placement::BridgeOnPhysical,
        Placement::VlanOnBond,
        Placement::BridgeOnBond,
        Placement::VlanOnBridge,
        Placement::BondOnVlan,
        Placement::BridgeOnVlan,
        Placement::VlanNested,
        Placement::BridgeOnBondOnVlan,
    ];

    /// Classify a construct of `kind` placed under `parent`.
    ///
    /// Combinations the kernel does not support (bond on bridge, bridge on
    /// bridge) fall back to the on-physical band of their kind.
    pub fn classify(kind: ConstructKind, parent: &ParentInfo) -> Self {
        use ConstructKind as K;

        match (kind, parent.kind) {
            (K::Physical, _) => Placement::Physical,

            (K::Vlan, None) | (K::Vlan, Some(K::Physical)) => Placement::VlanOnPhysical,
            (K::Vlan, Some(K::Vlan)) => Placement::VlanNested,
            (K::Vlan, Some(_)) if parent.nested_on_vlan => Placement::VlanNested,
            (K::Vlan, Some(K::Bond)) => Placement::VlanOnBond,
            (K::Vlan, Some(K::Bridge)) => Placement::VlanOnBridge,

            (K::Bond, Some(K::Vlan)) => Placement::BondOnVlan,
            (K::Bond, _) => Placement::BondOnPhysical,

            (K::Bridge, Some(K::Bond)) if parent.nested_on_vlan => Placement::BridgeOnBondOnVlan,
            (K::Bridge, Some(K::Bond)) => Placement::BridgeOnBond,
            (K::Bridge, Some(K::Vlan)) => Placement::BridgeOnVlan,
            (K::Bridge, _) => Placement::BridgeOnPhysical,
        }
    }

    /// Priority band, lower loads first
    pub const fn priority(self) -> u8 {
        match self {
            Placement::Physical => 80,
            Placement::VlanOnPhysical => 85,
            Placement::BondOnPhysical => 87,
            Placement::BridgeOnPhysical => 89,
            Placement::VlanOnBond => 90,
            Placement::BridgeOnBond => 92,
            Placement::VlanOnBridge => 94,
            Placement::BondOnVlan => 96,
            Placement::BridgeOnVlan => 97,
            Placement::VlanNested => 98,
            Placement::BridgeOnBondOnVlan => 99,
        }
    }
}

/// Priority for a construct of `kind` whose direct parent is `parent_kind`
pub fn priority_for(kind: ConstructKind, parent_kind: Option<ConstructKind>) -> u8 {
    let parent = ParentInfo {
        kind: parent_kind,
        nested_on_vlan: false,
    };
    Placement::classify(kind, &parent).priority()
}

/// Priority for a construct with full parent information
pub fn priority_for_parent(kind: ConstructKind, parent: &ParentInfo) -> u8 {
    Placement::classify(kind, parent).priority()
}

//! Netplan document rendering
//!
//! Every construct is rendered into its own self-contained netplan document so
//! it can live in a single layered file.

use log::debug;
use serde_yaml::{Mapping, Value};

use safenet_core::{
    split_list, ConstructKind, NetworkConstruct, Result, StoreError, ATTR_ADDRESSES,
    ATTR_BOND_MODE, ATTR_MEMBERS, ATTR_MTU, ATTR_VLAN_ID,
};

const NETPLAN_VERSION: u64 = 2;
const PARAMETERS_PREFIX: &str = "parameters.";

/// Top-level netplan section holding constructs of `kind`
pub fn section_for(kind: ConstructKind) -> &'static str {
    match kind {
        ConstructKind::Physical => "ethernets",
        ConstructKind::Vlan => "vlans",
        ConstructKind::Bond => "bonds",
        ConstructKind::Bridge => "bridges",
    }
}

/// Build the netplan document for a single construct
pub fn render_construct(construct: &NetworkConstruct, renderer: &str) -> Value {
    let mut body = Mapping::new();
    let mut parameters = Mapping::new();

    match construct.kind() {
        ConstructKind::Vlan => {
            if let Some(id) = construct.vlan_id() {
                body.insert(key("id"), Value::from(u64::from(id)));
            }
            if let Some(link) = &construct.parent {
                body.insert(key("link"), Value::from(link.as_str()));
            }
        }
        ConstructKind::Bond | ConstructKind::Bridge => {
            body.insert(key("interfaces"), string_list(construct.members()));
        }
        ConstructKind::Physical => {}
    }

    for (name, value) in &construct.attributes {
        let name = name.as_str();
        match name {
            ATTR_VLAN_ID | ATTR_MEMBERS => {}
            ATTR_BOND_MODE if construct.kind() == ConstructKind::Bond => {
                parameters.insert(key("mode"), Value::from(value.as_str()));
            }
            ATTR_ADDRESSES => {
                body.insert(key(name), string_list(split_list(Some(value))));
            }
            ATTR_MTU => {
                body.insert(key(name), scalar(value));
            }
            "dhcp4" | "dhcp6" => {
                body.insert(key(name), scalar(value));
            }
            "gateway" => {
                let mut route = Mapping::new();
                route.insert(key("to"), Value::from("default"));
                route.insert(key("via"), Value::from(value.as_str()));
                body.insert(key("routes"), Value::Sequence(vec![Value::Mapping(route)]));
            }
            "nameservers" => {
                let mut servers = Mapping::new();
                servers.insert(key("addresses"), string_list(split_list(Some(value))));
                body.insert(key(name), Value::Mapping(servers));
            }
            other => match other.strip_prefix(PARAMETERS_PREFIX) {
                Some(param) => {
                    parameters.insert(key(param), scalar(value));
                }
                None => {
                    body.insert(key(other), scalar(value));
                }
            },
        }
    }

    if !parameters.is_empty() {
        body.insert(key("parameters"), Value::Mapping(parameters));
    }

    let mut section = Mapping::new();
    section.insert(key(&construct.name), Value::Mapping(body));

    let mut network = Mapping::new();
    network.insert(key("version"), Value::from(NETPLAN_VERSION));
    network.insert(key("renderer"), Value::from(renderer));
    network.insert(key(section_for(construct.kind())), Value::Mapping(section));

    let mut root = Mapping::new();
    root.insert(key("network"), Value::Mapping(network));
    Value::Mapping(root)
}

/// Render a construct to YAML text
pub fn render_to_string(construct: &NetworkConstruct, renderer: &str) -> Result<String> {
    let document = render_construct(construct, renderer);
    let text = serde_yaml::to_string(&document)?;
    debug!("Rendered {} {}", construct.kind(), construct.name);
    Ok(text)
}

/// Add a `renderer:` line right after `network:` when the document lacks one
pub fn ensure_renderer(text: &str, renderer: &str) -> String {
    let has_renderer = text
        .lines()
        .any(|line| line.trim_start().starts_with("renderer:"));
    if has_renderer {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len() + renderer.len() + 14);
    let mut inserted = false;
    for line in text.split_inclusive('\n') {
        out.push_str(line);
        if !inserted && line.trim_end() == "network:" {
            if !line.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("  renderer: ");
            out.push_str(renderer);
            out.push('\n');
            inserted = true;
        }
    }
    out
}

/// Check that `text` is a netplan document defining `construct`
pub fn validate_document(text: &str, construct: &NetworkConstruct) -> Result<()> {
    let invalid = |reason: &str| StoreError::InvalidDocument {
        name: construct.name.clone(),
        reason: reason.to_string(),
    };

    let document: Value = serde_yaml::from_str(text)?;
    let network = document
        .get("network")
        .ok_or_else(|| invalid("missing top-level network key"))?;
    let section = network
        .get(section_for(construct.kind()))
        .ok_or_else(|| invalid("missing section for construct kind"))?;
    if section.get(construct.name.as_str()).is_none() {
        return Err(invalid("construct is not defined in its section").into());
    }
    Ok(())
}

fn key(name: &str) -> Value {
    Value::from(name)
}

fn string_list(items: Vec<String>) -> Value {
    Value::Sequence(items.into_iter().map(Value::from).collect())
}

/// Interpret an attribute value as a YAML scalar, keeping it a string when
/// it does not parse as one
fn scalar(value: &str) -> Value {
    match serde_yaml::from_str::<Value>(value) {
        Ok(parsed @ (Value::Bool(_) | Value::Number(_))) => parsed,
        _ => Value::from(value),
    }
}

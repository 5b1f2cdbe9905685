//! Routing table entries and per-attempt snapshots

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SystemError;

/// Route types that are not plain unicast routes and are never restored
const SPECIAL_ROUTE_TYPES: &[&str] = &[
    "local",
    "broadcast",
    "multicast",
    "throw",
    "unreachable",
    "prohibit",
    "blackhole",
    "nat",
    "anycast",
];

/// `ip route` keywords followed by a value this model does not keep
const IGNORED_KEYWORDS: &[&str] = &[
    "src", "scope", "table", "mtu", "pref", "expires", "advmss", "realm", "weight", "initcwnd",
    "initrwnd", "hoplimit", "rtt", "rttvar", "congctl", "nhid", "tos", "dsfield",
];

/// Route destination. The default route exists once per address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteDestination {
    Default { ipv6: bool },
    Prefix(IpNet),
}

impl RouteDestination {
    pub const DEFAULT_V4: RouteDestination = RouteDestination::Default { ipv6: false };
    pub const DEFAULT_V6: RouteDestination = RouteDestination::Default { ipv6: true };

    pub fn is_ipv6(&self) -> bool {
        matches!(
            self,
            RouteDestination::Default { ipv6: true } | RouteDestination::Prefix(IpNet::V6(_))
        )
    }
}

impl fmt::Display for RouteDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDestination::Default { .. } => f.write_str("default"),
            RouteDestination::Prefix(net) => write!(f, "{}", net),
        }
    }
}

impl FromStr for RouteDestination {
    type Err = SystemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" | "0.0.0.0/0" => return Ok(RouteDestination::DEFAULT_V4),
            "::/0" => return Ok(RouteDestination::DEFAULT_V6),
            _ => {}
        }
        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(RouteDestination::Prefix(net));
        }
        s.parse::<IpAddr>()
            .map(|addr| RouteDestination::Prefix(IpNet::from(addr)))
            .map_err(|_| SystemError::RouteParse {
                line: s.to_string(),
            })
    }
}

/// A single routing table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub destination: RouteDestination,
    pub gateway: Option<IpAddr>,
    pub device: Option<String>,
    pub protocol: Option<String>,
    pub metric: Option<u32>,
}

impl RouteEntry {
    pub fn new(destination: RouteDestination) -> Self {
        Self {
            destination,
            gateway: None,
            device: None,
            protocol: None,
            metric: None,
        }
    }

    pub fn default_via(gateway: IpAddr, device: impl Into<String>) -> Self {
        Self {
            gateway: Some(gateway),
            device: Some(device.into()),
            ..Self::new(RouteDestination::Default {
                ipv6: gateway.is_ipv6(),
            })
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn is_default(&self) -> bool {
        matches!(self.destination, RouteDestination::Default { .. })
    }

    /// Routes the kernel creates on its own when an address is assigned
    pub fn is_kernel(&self) -> bool {
        self.protocol.as_deref() == Some("kernel")
    }

    pub fn is_ipv6(&self) -> bool {
        self.destination.is_ipv6() || matches!(self.gateway, Some(IpAddr::V6(_)))
    }

    /// Identity used when deciding whether a route went missing: default
    /// routes compare destination, gateway and device; everything else
    /// compares destination only.
    pub fn same_route(&self, other: &RouteEntry) -> bool {
        if self.destination != other.destination {
            return false;
        }
        if self.is_default() {
            return self.gateway == other.gateway && self.device == other.device;
        }
        true
    }

    /// Whether `line` lists a route type other than plain unicast
    pub fn is_special(line: &str) -> bool {
        let mut tokens = line.split_whitespace();
        let first = match tokens.next() {
            Some("unicast") => tokens.next(),
            other => other,
        };
        first.is_some_and(|t| SPECIAL_ROUTE_TYPES.contains(&t))
    }

    /// Parse one line of `ip -6 route show` output. A bare `default` there
    /// is the IPv6 default route even without an IPv6 gateway.
    pub fn parse_ipv6(line: &str) -> Result<Self, SystemError> {
        let mut entry = Self::parse(line)?;
        if entry.is_default() {
            entry.destination = RouteDestination::DEFAULT_V6;
        }
        Ok(entry)
    }

    /// Parse one line of `ip route show` output
    pub fn parse(line: &str) -> Result<Self, SystemError> {
        let parse_error = || SystemError::RouteParse {
            line: line.to_string(),
        };

        let mut tokens = line.split_whitespace();
        let mut first = tokens.next().ok_or_else(parse_error)?;
        if first == "unicast" {
            first = tokens.next().ok_or_else(parse_error)?;
        }
        if SPECIAL_ROUTE_TYPES.contains(&first) {
            return Err(parse_error());
        }

        let mut entry = RouteEntry::new(first.parse().map_err(|_| parse_error())?);

        while let Some(token) = tokens.next() {
            match token {
                "via" => {
                    let mut value = tokens.next().ok_or_else(parse_error)?;
                    // `via inet6 fe80::1`
                    if value == "inet" || value == "inet6" {
                        value = tokens.next().ok_or_else(parse_error)?;
                    }
                    entry.gateway = Some(value.parse().map_err(|_| parse_error())?);
                }
                "dev" => entry.device = Some(tokens.next().ok_or_else(parse_error)?.to_string()),
                "proto" => {
                    entry.protocol = Some(tokens.next().ok_or_else(parse_error)?.to_string())
                }
                "metric" => {
                    let value = tokens.next().ok_or_else(parse_error)?;
                    entry.metric = Some(value.parse().map_err(|_| parse_error())?);
                }
                keyword if IGNORED_KEYWORDS.contains(&keyword) => {
                    tokens.next();
                }
                // flags such as onlink, linkdown, dead
                _ => {}
            }
        }

        if entry.is_default() && matches!(entry.gateway, Some(IpAddr::V6(_))) {
            entry.destination = RouteDestination::DEFAULT_V6;
        }

        Ok(entry)
    }

    /// Arguments for `ip route add` that recreate this entry
    pub fn add_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.is_ipv6() {
            args.push("-6".to_string());
        }
        args.push("route".to_string());
        args.push("add".to_string());
        args.push(self.destination.to_string());
        if let Some(gateway) = &self.gateway {
            args.push("via".to_string());
            args.push(gateway.to_string());
        }
        if let Some(device) = &self.device {
            args.push("dev".to_string());
            args.push(device.clone());
        }
        if let Some(protocol) = &self.protocol {
            args.push("proto".to_string());
            args.push(protocol.clone());
        }
        if let Some(metric) = self.metric {
            args.push("metric".to_string());
            args.push(metric.to_string());
        }
        args
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gateway) = &self.gateway {
            write!(f, " via {}", gateway)?;
        }
        if let Some(device) = &self.device {
            write!(f, " dev {}", device)?;
        }
        if let Some(protocol) = &self.protocol {
            write!(f, " proto {}", protocol)?;
        }
        if let Some(metric) = self.metric {
            write!(f, " metric {}", metric)?;
        }
        Ok(())
    }
}

/// Immutable copy of the routing table taken for one safe-apply attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSnapshot {
    attempt_id: Uuid,
    taken_at: DateTime<Utc>,
    entries: Vec<RouteEntry>,
}

impl RouteSnapshot {
    pub fn new(attempt_id: Uuid, entries: Vec<RouteEntry>) -> Self {
        Self {
            attempt_id,
            taken_at: Utc::now(),
            entries,
        }
    }

    pub fn empty(attempt_id: Uuid) -> Self {
        Self::new(attempt_id, Vec::new())
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of this snapshot absent from `current`, kernel routes excluded
    pub fn missing_from<'a>(&'a self, current: &[RouteEntry]) -> Vec<&'a RouteEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_kernel())
            .filter(|entry| !current.iter().any(|now| entry.same_route(now)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_route() {
        let route =
            RouteEntry::parse("default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.5 metric 100")
                .unwrap();
        assert!(route.is_default());
        assert_eq!(route.gateway, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(route.device.as_deref(), Some("eth0"));
        assert_eq!(route.protocol.as_deref(), Some("dhcp"));
        assert_eq!(route.metric, Some(100));
    }

    #[test]
    fn test_parse_kernel_and_host_routes() {
        let route =
            RouteEntry::parse("192.168.1.0/24 dev eth0 proto kernel scope link src 192.168.1.5")
                .unwrap();
        assert!(route.is_kernel());
        assert_eq!(route.gateway, None);

        let host = RouteEntry::parse("10.9.8.7 via 192.168.1.254 dev eth0").unwrap();
        assert_eq!(host.destination.to_string(), "10.9.8.7/32");
    }

    #[test]
    fn test_parse_ipv6_default() {
        let route =
            RouteEntry::parse("default via fe80::1 dev eth0 proto ra metric 1024 pref medium")
                .unwrap();
        assert!(route.is_ipv6());
        assert_eq!(route.add_args()[0], "-6");
    }

    #[test]
    fn test_device_only_ipv6_default_keeps_family() {
        let line = "default dev wg0 proto static metric 1024 pref medium";
        let v6 = RouteEntry::parse_ipv6(line).unwrap();
        let v4 = RouteEntry::parse(line).unwrap();

        assert_eq!(v6.destination, RouteDestination::DEFAULT_V6);
        assert_eq!(
            v6.add_args(),
            vec!["-6", "route", "add", "default", "dev", "wg0", "proto", "static", "metric", "1024"]
        );
        assert_eq!(v4.add_args()[0], "route");
        assert!(!v6.same_route(&v4));
        assert!(!v4.same_route(&v6));

        let snapshot = RouteSnapshot::new(Uuid::new_v4(), vec![v6.clone(), v4.clone()]);
        assert_eq!(snapshot.missing_from(&[v4]), vec![&v6]);
    }

    #[test]
    fn test_unspecified_prefixes_are_defaults() {
        assert_eq!(
            "::/0".parse::<RouteDestination>().unwrap(),
            RouteDestination::DEFAULT_V6
        );
        assert_eq!(
            "0.0.0.0/0".parse::<RouteDestination>().unwrap(),
            RouteDestination::DEFAULT_V4
        );
    }

    #[test]
    fn test_special_route_types() {
        assert!(RouteEntry::is_special("broadcast 10.0.0.255 dev eth0 table local"));
        assert!(RouteEntry::is_special("unicast local 10.0.0.1 dev lo"));
        assert!(!RouteEntry::is_special("default via 10.0.0.1 dev eth0"));
        assert!(!RouteEntry::is_special(""));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RouteEntry::parse("").is_err());
        assert!(RouteEntry::parse("unreachable 10.0.0.0/8").is_err());
        assert!(RouteEntry::parse("default via not-an-ip dev eth0").is_err());
        assert!(RouteEntry::parse("nonsense").is_err());
    }

    #[test]
    fn test_add_args() {
        let route = RouteEntry::parse("10.0.0.0/8 via 192.168.1.254 dev eth0 proto static").unwrap();
        assert_eq!(
            route.add_args(),
            vec![
                "route",
                "add",
                "10.0.0.0/8",
                "via",
                "192.168.1.254",
                "dev",
                "eth0",
                "proto",
                "static"
            ]
        );
    }

    #[test]
    fn test_display_matches_ip_syntax() {
        let line = "default via 10.0.0.1 dev bond0 proto static metric 50";
        assert_eq!(RouteEntry::parse(line).unwrap().to_string(), line);
    }

    #[test]
    fn test_default_routes_match_on_gateway_and_device() {
        let a = RouteEntry::default_via("10.0.0.1".parse().unwrap(), "eth0");
        let b = RouteEntry::default_via("10.0.0.1".parse().unwrap(), "bond0");
        let c = RouteEntry::default_via("10.0.0.1".parse().unwrap(), "eth0").with_metric(5);
        assert!(!a.same_route(&b));
        assert!(a.same_route(&c));
    }

    #[test]
    fn test_missing_from() {
        let default = RouteEntry::default_via("10.0.0.1".parse().unwrap(), "eth0");
        let kernel = RouteEntry::parse("10.0.0.0/24 dev eth0 proto kernel scope link").unwrap();
        let static_route = RouteEntry::parse("172.16.0.0/12 via 10.0.0.254 dev eth0").unwrap();

        let snapshot = RouteSnapshot::new(
            Uuid::new_v4(),
            vec![default.clone(), kernel, static_route.clone()],
        );

        let missing = snapshot.missing_from(&[static_route]);
        assert_eq!(missing, vec![&default]);
        assert!(snapshot.missing_from(&[]).iter().all(|r| !r.is_kernel()));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Converges a node's firewall towards a declared per-zone policy.
//!
//! For every zone in the [`FirewallPolicy`], the live daemon is queried once,
//! the difference is computed on four independent axes (ports, sources,
//! interfaces, target), and a [`ZoneAction`] describing the exact remediation
//! commands is returned.  Nothing is changed until the action is ensured.
//!
//! Convergence is additive at the zone level: a zone missing from the policy
//! is never deleted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

mod diff;
mod firewalld;

pub use diff::{diff_zone, ZoneDiff};
pub use firewalld::{
    ensurer, FirewallEnsurer, FirewallPlan, Firewalld, NoopEnsurer,
    OperatingSystem, Step, ZoneAction,
};

/// Desired state of one zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZonePolicy {
    pub ports: BTreeSet<Port>,
    pub sources: BTreeSet<String>,
    pub interfaces: BTreeSet<String>,
    /// `None` leaves whatever target the zone currently has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Desired state of a node's firewall, keyed by zone name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallPolicy {
    pub zones: BTreeMap<String, ZonePolicy>,
}

impl FirewallPolicy {
    /// Merges `other` into this policy, unioning ports, sources, and
    /// interfaces of zones present in both.  A target in `other` wins.
    pub fn merge(&mut self, other: FirewallPolicy) {
        for (name, zone) in other.zones {
            let mine = self.zones.entry(name).or_default();
            mine.ports.extend(zone.ports);
            mine.sources.extend(zone.sources);
            mine.interfaces.extend(zone.interfaces);
            if zone.target.is_some() {
                mine.target = zone.target;
            }
        }
    }
}

/// A port (or port range, e.g. `"8000-8100"`) and its protocol.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Port {
    pub port: String,
    pub protocol: String,
}

impl Port {
    pub fn tcp(port: impl Into<String>) -> Port {
        Port { port: port.into(), protocol: "tcp".to_string() }
    }

    pub fn udp(port: impl Into<String>) -> Port {
        Port { port: port.into(), protocol: "udp".to_string() }
    }

    /// Parses firewalld's `port/protocol` notation.
    pub fn parse(s: &str) -> Option<Port> {
        let (port, protocol) = s.split_once('/')?;
        if port.is_empty() || protocol.is_empty() {
            return None;
        }
        Some(Port { port: port.to_string(), protocol: protocol.to_string() })
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// A service enabled in a zone, as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
}

/// A port opened in a zone, as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowed {
    pub port: String,
    pub protocol: String,
}

impl From<&Port> for Allowed {
    fn from(p: &Port) -> Self {
        Allowed { port: p.port.clone(), protocol: p.protocol.clone() }
    }
}

/// Observed state of one zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneDesc {
    pub name: String,
    pub interfaces: Vec<String>,
    pub sources: Vec<String>,
    pub services: Vec<Service>,
    pub fw: Vec<Allowed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("querying firewall zone {zone} failed")]
    Query {
        zone: String,
        #[source]
        err: remote_machine::ExecutionError,
    },

    #[error("{step} in firewall zone {zone} failed")]
    Apply {
        zone: String,
        step: String,
        #[source]
        err: remote_machine::ExecutionError,
    },

    #[error(transparent)]
    Contract(#[from] fleet_common::ContractError),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_port_notation() {
        assert_eq!(Port::parse("22/tcp"), Some(Port::tcp("22")));
        assert_eq!(Port::parse("8000-8100/udp"), Some(Port::udp("8000-8100")));
        assert_eq!(Port::parse("22"), None);
        assert_eq!(Port::parse("/tcp"), None);
        assert_eq!(Port::tcp("443").to_string(), "443/tcp");
    }

    #[test]
    fn test_policy_from_yaml() {
        let policy: FirewallPolicy = serde_yaml::from_str(
            r#"
zones:
  internal:
    ports:
      - port: "6443"
        protocol: tcp
    sources: ["10.0.0.0/8"]
    target: ACCEPT
"#,
        )
        .unwrap();
        let internal = &policy.zones["internal"];
        assert!(internal.ports.contains(&Port::tcp("6443")));
        assert!(internal.interfaces.is_empty());
        assert_eq!(internal.target.as_deref(), Some("ACCEPT"));
    }

    #[test]
    fn test_policy_merge() {
        let mut a = FirewallPolicy::default();
        a.zones
            .entry("public".into())
            .or_default()
            .ports
            .insert(Port::tcp("22"));
        let mut b = FirewallPolicy::default();
        let zone = b.zones.entry("public".into()).or_default();
        zone.ports.insert(Port::tcp("443"));
        zone.target = Some("DROP".into());

        a.merge(b);
        let public = &a.zones["public"];
        assert_eq!(public.ports.len(), 2);
        assert_eq!(public.target.as_deref(), Some("DROP"));
    }
}

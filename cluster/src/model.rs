// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Desired and current state documents of a cluster.

use crate::Error;

use node_firewall::{FirewallPolicy, ZoneDesc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Control-plane sizes which keep an etcd quorum.
pub const VALID_CONTROL_PLANE_SIZES: [usize; 3] = [1, 3, 5];

/// The user-declared shape of a cluster.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredSpec {
    #[serde(default)]
    pub destroyed: bool,
    #[serde(default)]
    pub verbose: bool,
    pub kubernetes: KubernetesVersion,
    pub networking: Networking,
    pub control_plane: PoolSpec,
    #[serde(default)]
    pub workers: BTreeMap<String, PoolSpec>,
    /// Registry overriding the public ones for network add-on images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image_registry: Option<String>,
}

impl DesiredSpec {
    /// Fails unless the control plane can hold a quorum.  Anything goes when
    /// the cluster is being destroyed.
    pub fn validate(&self, destroy: bool) -> Result<(), Error> {
        let nodes = self.control_plane.nodes;
        if destroy || VALID_CONTROL_PLANE_SIZES.contains(&nodes) {
            return Ok(());
        }
        Err(Error::Validation(format!(
            "control plane nodes can only be scaled to 1, 3 or 5, not {nodes}"
        )))
    }

    /// The worker group declaring `provider`/`pool`, if any.
    pub fn worker_group(
        &self,
        provider: &str,
        pool: &str,
    ) -> Option<(&str, &PoolSpec)> {
        self.workers
            .iter()
            .find(|(_, w)| w.provider == provider && w.pool == pool)
            .map(|(group, w)| (group.as_str(), w))
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    pub dns_domain: String,
    /// `calico`, `cilium`, empty for none, or the path of a manifest in the
    /// state store.
    #[serde(default)]
    pub network: String,
    pub service_cidr: String,
    pub pod_cidr: String,
}

/// A provider-scoped group of computes and how many of them are wanted.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    #[serde(default)]
    pub updates_disabled: bool,
    pub provider: String,
    pub nodes: usize,
    pub pool: String,
}

impl PoolSpec {
    pub fn key(&self) -> PoolKey {
        PoolKey { provider: self.provider.clone(), pool: self.pool.clone() }
    }
}

/// Identifies a pool across providers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolKey {
    pub provider: String,
    pub pool: String,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.pool)
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, PartialEq, Eq, PartialOrd, Ord, Serialize,
)]
pub enum Tier {
    #[serde(rename = "controlplane")]
    ControlPlane,
    #[serde(rename = "workers")]
    Workers,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::ControlPlane => write!(f, "controlplane"),
            Tier::Workers => write!(f, "workers"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Maintaining,
    Running,
}

/// Where a compute is in joining the cluster.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinState {
    #[default]
    Unjoined,
    /// Bootstrapping a fresh cluster as its first control-plane node.
    Initializing,
    Joining,
    Joined,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ComputeMetadata {
    pub tier: Tier,
    pub provider: String,
    pub pool: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

/// One provisioned node as last observed.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Compute {
    pub status: Status,
    pub metadata: ComputeMetadata,
    #[serde(default)]
    pub join: JoinState,
}

impl Compute {
    pub fn joined(&self) -> bool {
        self.join == JoinState::Joined
    }
}

/// Observed cluster state, persisted after every pass.
///
/// Keys this version does not know about are kept in `extra` and written
/// back unchanged.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CurrentState {
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub computes: BTreeMap<String, Compute>,
    /// Admin credentials read back from the initializing node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl CurrentState {
    /// Joined computes of `tier`, ordered by identity.
    pub fn joined(&self, tier: Tier) -> impl Iterator<Item = &str> + '_ {
        self.computes
            .iter()
            .filter(move |(_, c)| c.metadata.tier == tier && c.joined())
            .map(|(id, _)| id.as_str())
    }
}

/// How the cluster's API servers are reached.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeApi {
    /// Name or address clients use, e.g. of a load balancer.
    pub location: String,
    /// Port clients connect to at `location`.
    pub frontend_port: u16,
    /// Port each API server listens on.
    pub backend_port: u16,
}

impl fmt::Display for KubeApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.location, self.frontend_port)
    }
}

/// A `vMAJOR.MINOR.PATCH` Kubernetes release.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KubernetesVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FromStr for KubernetesVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid kubernetes version {s:?}");
        let mut parts = s.trim().trim_start_matches('v').splitn(3, '.');
        let mut next = || -> Result<u32, String> {
            parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)
        };
        Ok(KubernetesVersion {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }
}

impl fmt::Display for KubernetesVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for KubernetesVersion {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KubernetesVersion {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Versions of the Kubernetes binaries on a node.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct Software {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeadm: Option<KubernetesVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<KubernetesVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubectl: Option<KubernetesVersion>,
}

/// What a node agent reports about its node.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct NodeAgentCurrent {
    pub ready: bool,
    pub software: Software,
    pub open: Vec<ZoneDesc>,
}

/// What a node agent is told to converge its node to.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct NodeAgentSpec {
    pub software: Software,
    pub firewall: FirewallPolicy,
}

/// Key decrypting the secrets in the state documents.
///
/// It is handed to whatever parses or writes documents during a single pass
/// and never stored anywhere else.
#[derive(Clone)]
pub struct MasterKey(String);

impl MasterKey {
    pub fn new(key: impl Into<String>) -> MasterKey {
        MasterKey(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DESIRED: &str = r#"
kubernetes: v1.18.2
networking:
  dnsDomain: cluster.local
  network: calico
  serviceCidr: 10.96.0.0/12
  podCidr: 100.64.0.0/10
controlPlane:
  provider: static
  pool: masters
  nodes: 3
workers:
  apps:
    provider: static
    pool: workers
    nodes: 2
"#;

    #[test]
    fn test_desired_spec_parses() {
        let desired: DesiredSpec = serde_yaml::from_str(DESIRED).unwrap();
        assert_eq!(
            desired.kubernetes,
            KubernetesVersion { major: 1, minor: 18, patch: 2 }
        );
        assert_eq!(desired.control_plane.nodes, 3);
        assert!(!desired.destroyed);
        let (group, pool) = desired.worker_group("static", "workers").unwrap();
        assert_eq!(group, "apps");
        assert_eq!(pool.nodes, 2);
        assert!(desired.worker_group("static", "masters").is_none());
    }

    #[test]
    fn test_control_plane_size_validation() {
        let mut desired: DesiredSpec = serde_yaml::from_str(DESIRED).unwrap();
        for nodes in [1, 3, 5] {
            desired.control_plane.nodes = nodes;
            desired.validate(false).unwrap();
        }
        for nodes in [0, 2, 4, 6, 7] {
            desired.control_plane.nodes = nodes;
            assert!(matches!(
                desired.validate(false),
                Err(Error::Validation(_))
            ));
            desired.validate(true).unwrap();
        }
    }

    #[test]
    fn test_version_notation() {
        let v: KubernetesVersion = "v1.20.11".parse().unwrap();
        assert_eq!(v.to_string(), "v1.20.11");
        assert_eq!("1.20.11".parse::<KubernetesVersion>().unwrap(), v);
        assert!("v1.20".parse::<KubernetesVersion>().is_err());
        assert!("latest".parse::<KubernetesVersion>().is_err());
        assert!(v < "v1.21.0".parse().unwrap());
    }

    #[test]
    fn test_current_state_keeps_unknown_keys() {
        let doc = r#"
status: running
computes:
  cp-0:
    status: running
    metadata:
      tier: controlplane
      provider: static
      pool: masters
    join: joined
ingress:
  address: 10.0.0.1
"#;
        let current: CurrentState = serde_yaml::from_str(doc).unwrap();
        assert_eq!(current.status, Status::Running);
        let joined: Vec<_> = current.joined(Tier::ControlPlane).collect();
        assert_eq!(joined, ["cp-0"]);
        assert!(current.extra.contains_key("ingress"));

        let written = serde_yaml::to_string(&current).unwrap();
        let reread: CurrentState = serde_yaml::from_str(&written).unwrap();
        assert_eq!(reread, current);
        assert!(written.contains("address: 10.0.0.1"));
    }

    #[test]
    fn test_master_key_is_not_printed() {
        let key = MasterKey::new("hunter2");
        assert!(!format!("{key:?}").contains("hunter2"));
        assert_eq!(key.expose(), "hunter2");
    }
}

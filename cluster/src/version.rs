// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rolling the target Kubernetes version out to joined nodes.
//!
//! One node is upgraded per pass, control plane first.  A node goes through
//! three stages, each driven by what its node agent reports:
//!
//! 1. its agent is told to install kubeadm at the target version,
//! 2. once kubeadm is reported, `kubeadm upgrade` runs on the node and the
//!    agent is told to install kubelet and kubectl,
//! 3. the node is upgraded once the agent reports kubelet at target.

use crate::model::{CurrentState, KubernetesVersion, Tier};
use crate::pool::Topology;
use crate::store::{NodeAgentsCurrent, NodeAgentsDesired};

use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeStep {
    InstallKubeadm,
    /// Runs `command` on the node, then installs kubelet and kubectl.
    Upgrade { command: String },
    /// Waiting for the node agent to report the new kubelet.
    Wait,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeUpgrade {
    pub machine: String,
    pub tier: Tier,
    pub step: UpgradeStep,
}

/// The version convergence step of one pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPlan {
    pub target: KubernetesVersion,
    /// The node currently being upgraded, `None` once every node runs the
    /// target version.
    pub upgrade: Option<NodeUpgrade>,
}

impl VersionPlan {
    pub fn is_done(&self) -> bool {
        self.upgrade.is_none()
    }
}

pub fn upgrade_command(
    target: &KubernetesVersion,
    first_control_plane: bool,
) -> String {
    if first_control_plane {
        format!("sudo kubeadm upgrade apply --yes {target}")
    } else {
        "sudo kubeadm upgrade node".to_string()
    }
}

/// Finds the next node to upgrade and what to do with it.
///
/// Only joined computes count; unjoined ones get the target version when
/// they join.  Pools with updates disabled are left alone.
pub fn plan_version(
    target: &KubernetesVersion,
    topology: &Topology,
    current: &CurrentState,
    agents_current: &NodeAgentsCurrent,
    agents_desired: &NodeAgentsDesired,
) -> VersionPlan {
    let frozen: BTreeSet<&str> = topology
        .machines()
        .filter(|(pool, _)| pool.assignment.spec.updates_disabled)
        .map(|(_, m)| m.id())
        .collect();

    let mut upgrade = None;
    for tier in [Tier::ControlPlane, Tier::Workers] {
        let nodes = current.joined(tier).filter(|id| !frozen.contains(id));
        for (i, id) in nodes.enumerate() {
            let reported = agents_current.get(id).map(|a| &a.software);
            let kubelet = reported.and_then(|s| s.kubelet.as_ref());
            if kubelet == Some(target) {
                continue;
            }

            let kubeadm = reported.and_then(|s| s.kubeadm.as_ref());
            let wanted = agents_desired.get(id).map(|a| &a.software);
            let step = if kubeadm != Some(target) {
                if wanted.and_then(|s| s.kubeadm.as_ref()) == Some(target) {
                    UpgradeStep::Wait
                } else {
                    UpgradeStep::InstallKubeadm
                }
            } else if wanted.and_then(|s| s.kubelet.as_ref()) != Some(target)
            {
                let first = tier == Tier::ControlPlane && i == 0;
                UpgradeStep::Upgrade { command: upgrade_command(target, first) }
            } else {
                UpgradeStep::Wait
            };
            upgrade = Some(NodeUpgrade { machine: id.to_string(), tier, step });
            break;
        }
        if upgrade.is_some() {
            break;
        }
    }

    VersionPlan { target: target.clone(), upgrade }
}

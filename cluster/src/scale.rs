// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Growing and shrinking pools towards their desired size.

use crate::cluster::Pass;
use crate::join::{self, Bootstrap, JoinContext, Joined};
use crate::model::{
    Compute, CurrentState, DesiredSpec, JoinState, KubernetesVersion, PoolKey,
    Software, Status, Tier,
};
use crate::network::NetworkAddon;
use crate::pool::{Pool, ScaleablePool, Topology};
use crate::resources::{ClientError, ObjectKind, ObjectRef};
use crate::Error;

use fleet_common::EnsureOutcome;
use node_firewall::{FirewallPolicy, Port};
use remote_machine::{BoxedMachine, RemoteMachine};
use slog::{debug, info, o, Logger};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

const TOKEN_GENERATE: &str = "sudo kubeadm token generate";
const TOKEN_CREATE: &str = "sudo kubeadm token create";
const UPLOAD_CERTS: &str =
    "sudo kubeadm init phase upload-certs --upload-certs 2>/dev/null | tail -1";
const RESET_NODE: &str = "sudo kubeadm reset -f";

/// The compute a join applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinTarget {
    /// A live compute which has not joined yet.
    Existing(String),
    /// A compute the pool provisions during the pass.
    Provisioned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScaleOp {
    /// Create the cluster on the first control-plane node.
    Init { pool: PoolKey, target: JoinTarget },
    Join { pool: PoolKey, tier: Tier, target: JoinTarget },
    Remove { pool: PoolKey, tier: Tier, machine: String },
}

impl ScaleOp {
    fn pool(&self) -> &PoolKey {
        match self {
            ScaleOp::Init { pool, .. }
            | ScaleOp::Join { pool, .. }
            | ScaleOp::Remove { pool, .. } => pool,
        }
    }

    fn provisions(&self) -> bool {
        matches!(
            self,
            ScaleOp::Init { target: JoinTarget::Provisioned, .. }
                | ScaleOp::Join { target: JoinTarget::Provisioned, .. }
        )
    }
}

/// The scale convergence step of one pass, in execution order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalePlan {
    pub ops: Vec<ScaleOp>,
    /// Installed by the `Init` operation, if there is one.
    pub network: NetworkAddon,
}

impl ScalePlan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn needs_init(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, ScaleOp::Init { .. }))
    }

    /// Number of planned joins of `tier`, not counting an init.
    pub fn joins(&self, tier: Tier) -> usize {
        self.ops
            .iter()
            .filter(|op| {
                matches!(op, ScaleOp::Join { tier: t, .. } if *t == tier)
            })
            .count()
    }

    pub fn removals(&self, tier: Tier) -> usize {
        self.ops
            .iter()
            .filter(|op| {
                matches!(op, ScaleOp::Remove { tier: t, .. } if *t == tier)
            })
            .count()
    }
}

fn is_joined(current: &CurrentState, id: &str) -> bool {
    current.computes.get(id).is_some_and(Compute::joined)
}

/// Plans the joins and removals bringing every pool to its desired size.
///
/// Control-plane operations come first.  Excess computes are removed newest
/// first.  Control-plane computes are only removed once every remaining one
/// has joined, so the etcd quorum is never put at risk.
pub fn plan_scale(topology: &Topology, current: &CurrentState) -> ScalePlan {
    let mut ops = Vec::new();
    let mut initialized = current.joined(Tier::ControlPlane).next().is_some();

    for sp in topology.pools() {
        plan_pool(sp, current, &mut initialized, &mut ops);
    }

    ScalePlan { ops, network: NetworkAddon::None }
}

fn plan_pool(
    sp: &ScaleablePool,
    current: &CurrentState,
    initialized: &mut bool,
    ops: &mut Vec<ScaleOp>,
) {
    let pool = sp.pool();
    let key = pool.key();
    let tier = pool.tier();
    let live = &pool.computes;
    let desired = sp.desired_scale();
    let kept = &live[..desired.min(live.len())];

    let mut join = |target: JoinTarget, ops: &mut Vec<ScaleOp>| {
        if tier == Tier::ControlPlane && !*initialized {
            *initialized = true;
            ops.push(ScaleOp::Init { pool: key.clone(), target });
        } else {
            ops.push(ScaleOp::Join { pool: key.clone(), tier, target });
        }
    };

    for machine in kept {
        if !is_joined(current, machine.id()) {
            join(JoinTarget::Existing(machine.id().to_string()), ops);
        }
    }
    for _ in live.len()..desired {
        join(JoinTarget::Provisioned, ops);
    }

    if live.len() > desired {
        let quorum_intact = kept.iter().all(|m| is_joined(current, m.id()));
        if tier == Tier::Workers || quorum_intact {
            for machine in live[desired..].iter().rev() {
                ops.push(ScaleOp::Remove {
                    pool: key.clone(),
                    tier,
                    machine: machine.id().to_string(),
                });
            }
        }
    }
}

/// Ports a node of `tier` needs open for the cluster to work.
pub fn cluster_firewall(tier: Tier, api_port: u16) -> FirewallPolicy {
    let mut policy = FirewallPolicy::default();
    let internal = policy.zones.entry("internal".to_string()).or_default();
    internal.ports.insert(Port::tcp("10250"));
    match tier {
        Tier::ControlPlane => {
            internal.ports.insert(Port::tcp("2379-2380"));
            internal.ports.insert(Port::tcp("10251"));
            internal.ports.insert(Port::tcp("10252"));
            let external =
                policy.zones.entry("external".to_string()).or_default();
            external.ports.insert(Port::tcp(api_port.to_string()));
        }
        Tier::Workers => {
            internal.ports.insert(Port::tcp("30000-32767"));
        }
    }
    policy
}

fn all_at(target: &KubernetesVersion) -> Software {
    Software {
        kubeadm: Some(target.clone()),
        kubelet: Some(target.clone()),
        kubectl: Some(target.clone()),
    }
}

/// Executes `plan`.
///
/// Returns a pending outcome if a compute is not ready to join yet, e.g.
/// because its node agent has not installed the Kubernetes binaries.
pub(crate) async fn ensure_scale(
    log: &Logger,
    plan: &ScalePlan,
    topology: &Topology,
    desired: &DesiredSpec,
    pass: &Pass,
) -> Result<EnsureOutcome, Error> {
    let target = &desired.kubernetes;
    let mut outcome = EnsureOutcome::DONE;

    // Every node gets the ports the cluster needs.
    for (pool, machine) in topology.machines() {
        require_firewall(pass, machine.id(), pool.tier());
    }

    let mut provisioned = provision(log, plan, topology, pass).await?;

    let ctx = JoinContext {
        config: &pass.config,
        desired,
        kube_api: &pass.kube_api,
    };
    let mut join_at: Option<BoxedMachine> = None;
    let mut token: Option<String> = None;
    let mut certificate_key: Option<String> = None;
    let mut initialized =
        pass.update(|s| s.current.joined(Tier::ControlPlane).next().is_some());

    for op in &plan.ops {
        let (pool, target_machine) = match op {
            ScaleOp::Init { target: t, .. }
            | ScaleOp::Join { target: t, .. } => {
                let pool = pool_of(topology, op.pool())?;
                let machine = match t {
                    JoinTarget::Existing(id) => topology.machine(id).cloned(),
                    JoinTarget::Provisioned => provisioned
                        .get_mut(op.pool())
                        .and_then(VecDeque::pop_front),
                };
                let machine = machine.ok_or_else(|| Error::Planning {
                    resource: format!("pool {}", op.pool()),
                    reason: "compute to join is gone".to_string(),
                })?;
                (pool, machine)
            }
            ScaleOp::Remove { machine, .. } => {
                let pool = pool_of(topology, op.pool())?;
                remove(log, pass, pool, topology, machine).await?;
                continue;
            }
        };

        let id = target_machine.id().to_string();
        let log = log.new(o!("machine" => id.clone()));
        let tier = pool.tier();
        require_firewall(pass, &id, tier);

        if !ready(pass, &id, target) {
            debug!(log, "Compute is not ready to join yet");
            pass.update(|s| {
                s.agents_desired.entry(id.clone()).or_default().software =
                    all_at(target);
            });
            outcome = EnsureOutcome::PENDING;
            continue;
        }

        match op {
            ScaleOp::Init { .. } => {
                let token = target_machine
                    .execute(None, TOKEN_GENERATE)
                    .await
                    .map_err(Error::execution(
                        &*target_machine,
                        "generating token",
                    ))?;
                set_join_state(pass, &id, JoinState::Initializing);
                let joined = join::join(
                    &log,
                    ctx,
                    pool,
                    &*target_machine,
                    token.trim(),
                    Bootstrap::Init { network: &plan.network },
                )
                .await?;
                if let Joined::Initialized { kubeconfig } = joined {
                    pass.client
                        .refresh(&kubeconfig)
                        .await
                        .map_err(Error::cluster("refreshing client"))?;
                    pass.update(|s| s.current.kubeconfig = Some(kubeconfig));
                }
                set_join_state(pass, &id, JoinState::Joined);
                initialized = true;
                join_at = Some(target_machine);
            }
            ScaleOp::Join { .. } => {
                if !initialized {
                    debug!(log, "Waiting for the cluster to be initialized");
                    outcome = EnsureOutcome::PENDING;
                    continue;
                }
                let at = match &join_at {
                    Some(at) => Arc::clone(at),
                    None => {
                        let at = first_control_plane(topology, pass)?;
                        join_at = Some(Arc::clone(&at));
                        at
                    }
                };
                if token.is_none() {
                    token = Some(
                        run_on(&*at, TOKEN_CREATE, "creating token").await?,
                    );
                }
                if tier == Tier::ControlPlane && certificate_key.is_none() {
                    certificate_key = Some(
                        run_on(&*at, UPLOAD_CERTS, "uploading certificates")
                            .await?,
                    );
                }

                set_join_state(pass, &id, JoinState::Joining);
                join::join(
                    &log,
                    ctx,
                    pool,
                    &*target_machine,
                    token.as_deref().unwrap_or_default(),
                    Bootstrap::Join {
                        at: &*at,
                        certificate_key: certificate_key.as_deref(),
                    },
                )
                .await?;
                set_join_state(pass, &id, JoinState::Joined);
                join::recycle_surplus_dns_pod(&log, pass.client.as_ref())
                    .await;
            }
            ScaleOp::Remove { .. } => {}
        }
    }

    Ok(outcome)
}

async fn run_on(
    machine: &dyn RemoteMachine,
    command: &str,
    operation: &str,
) -> Result<String, Error> {
    let stdout = machine
        .execute(None, command)
        .await
        .map_err(Error::execution(machine, operation))?;
    Ok(stdout.trim().to_string())
}

fn pool_of<'a>(
    topology: &'a Topology,
    key: &PoolKey,
) -> Result<&'a Pool, Error> {
    topology
        .pools()
        .map(ScaleablePool::pool)
        .find(|p| p.key() == *key)
        .ok_or_else(|| Error::Planning {
            resource: format!("pool {key}"),
            reason: "pool is not known to any provider".to_string(),
        })
}

/// A joined control-plane compute new nodes can join through.
fn first_control_plane(
    topology: &Topology,
    pass: &Pass,
) -> Result<BoxedMachine, Error> {
    pass.update(|s| {
        s.current
            .joined(Tier::ControlPlane)
            .find_map(|id| topology.machine(id).cloned())
    })
    .ok_or_else(|| Error::Planning {
        resource: "control plane".to_string(),
        reason: "no joined control-plane node to join through".to_string(),
    })
}

fn ready(pass: &Pass, id: &str, target: &KubernetesVersion) -> bool {
    pass.agents_current.get(id).is_some_and(|agent| {
        agent.ready && agent.software.kubeadm.as_ref() == Some(target)
    })
}

fn require_firewall(pass: &Pass, id: &str, tier: Tier) {
    let required = cluster_firewall(tier, pass.kube_api.backend_port);
    pass.update(|s| {
        s.agents_desired
            .entry(id.to_string())
            .or_default()
            .firewall
            .merge(required)
    });
}

fn set_join_state(pass: &Pass, id: &str, join: JoinState) {
    pass.update(|s| {
        if let Some(compute) = s.current.computes.get_mut(id) {
            compute.join = join;
        }
    });
}

/// Asks every pool for the computes the plan provisions.
async fn provision(
    log: &Logger,
    plan: &ScalePlan,
    topology: &Topology,
    pass: &Pass,
) -> Result<BTreeMap<PoolKey, VecDeque<BoxedMachine>>, Error> {
    let mut provisioned = BTreeMap::new();
    for sp in topology.pools() {
        let pool = sp.pool();
        let key = pool.key();
        let count = plan
            .ops
            .iter()
            .filter(|op| op.provisions() && *op.pool() == key)
            .count();
        if count == 0 {
            continue;
        }

        let added = pool
            .infra
            .add_computes(count)
            .await
            .map_err(Error::provider(&key, "adding computes"))?;
        info!(log, "Computes added"; "pool" => %key, "count" => added.len());
        pass.update(|s| {
            for machine in &added {
                s.current.computes.insert(
                    machine.id().to_string(),
                    Compute {
                        status: Status::Maintaining,
                        metadata: pool.metadata(),
                        join: JoinState::Unjoined,
                    },
                );
            }
        });
        provisioned.insert(key, added.into_iter().collect());
    }
    Ok(provisioned)
}

/// Drains `id` out of the cluster and has its pool destroy it.
async fn remove(
    log: &Logger,
    pass: &Pass,
    pool: &Pool,
    topology: &Topology,
    id: &str,
) -> Result<(), Error> {
    let log = log.new(o!("machine" => id.to_string()));
    let Some(machine) = topology.machine(id) else {
        return Ok(());
    };

    match pass.client.drain_node(id).await {
        Ok(()) | Err(ClientError::NotFound(_)) => {}
        Err(err) => return Err(Error::cluster("draining node")(err)),
    }
    run_on(&**machine, RESET_NODE, "resetting node").await?;
    match pass
        .client
        .delete(&ObjectRef::cluster_scoped(ObjectKind::Node, id))
        .await
    {
        Ok(()) | Err(ClientError::NotFound(_)) => {}
        Err(err) => return Err(Error::cluster("deleting node")(err)),
    }
    pool.infra
        .remove(&**machine)
        .await
        .map_err(Error::provider(&pool.key(), "removing compute"))?;

    pass.update(|s| {
        s.current.computes.remove(id);
        s.agents_desired.remove(id);
    });
    info!(log, "Node removed"; "tier" => %pool.tier());
    Ok(())
}

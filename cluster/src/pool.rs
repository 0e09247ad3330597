// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pools of computes and how they map onto the desired topology.

use crate::model::{
    Compute, ComputeMetadata, DesiredSpec, JoinState, PoolKey, PoolSpec,
    Status, Tier,
};
use crate::Error;

use async_trait::async_trait;
use remote_machine::{BoxedMachine, RemoteMachine};
use slog::{debug, o, Logger};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A provider's handle on one pool of computes.
#[async_trait]
pub trait InfraPool: Send + Sync {
    /// Live computes, oldest first.
    async fn computes(&self) -> anyhow::Result<Vec<BoxedMachine>>;

    /// Provisions `count` new computes and returns them.
    async fn add_computes(
        &self,
        count: usize,
    ) -> anyhow::Result<Vec<BoxedMachine>>;

    /// Makes the compute reachable through whatever fronts the pool, e.g. a
    /// load balancer.
    async fn ensure_member(&self, machine: &dyn RemoteMachine)
        -> anyhow::Result<()>;

    /// Destroys the compute.
    async fn remove(&self, machine: &dyn RemoteMachine) -> anyhow::Result<()>;
}

pub type BoxedPool = Arc<dyn InfraPool>;

/// Every pool of every provider, keyed by provider and then pool name.
pub type ProviderPools = BTreeMap<String, BTreeMap<String, BoxedPool>>;

/// Where a live pool belongs in the desired topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolAssignment {
    pub tier: Tier,
    pub group: String,
    pub spec: PoolSpec,
}

/// Matches a live pool against the desired spec.
///
/// A pool declared neither as the control plane nor by any worker group is
/// drained: it is assigned zero nodes and no updates.
pub fn assign_pool(
    desired: &DesiredSpec,
    provider: &str,
    pool: &str,
) -> PoolAssignment {
    let cp = &desired.control_plane;
    if cp.provider == provider && cp.pool == pool {
        return PoolAssignment {
            tier: Tier::ControlPlane,
            group: String::new(),
            spec: cp.clone(),
        };
    }
    match desired.worker_group(provider, pool) {
        Some((group, spec)) => PoolAssignment {
            tier: Tier::Workers,
            group: group.to_string(),
            spec: spec.clone(),
        },
        None => PoolAssignment {
            tier: Tier::Workers,
            group: String::new(),
            spec: PoolSpec {
                updates_disabled: true,
                provider: provider.to_string(),
                nodes: 0,
                pool: pool.to_string(),
            },
        },
    }
}

/// A live pool and the computes it held when the pass started.
#[derive(Clone)]
pub struct Pool {
    pub assignment: PoolAssignment,
    pub infra: BoxedPool,
    pub computes: Vec<BoxedMachine>,
}

impl Pool {
    pub fn key(&self) -> PoolKey {
        self.assignment.spec.key()
    }

    pub fn tier(&self) -> Tier {
        self.assignment.tier
    }

    /// Metadata of computes in this pool.
    pub fn metadata(&self) -> ComputeMetadata {
        ComputeMetadata {
            tier: self.assignment.tier,
            provider: self.assignment.spec.provider.clone(),
            pool: self.assignment.spec.pool.clone(),
            group: self.assignment.group.clone(),
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("assignment", &self.assignment)
            .field(
                "computes",
                &self.computes.iter().map(|c| c.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A pool paired with the size it should have at the end of the pass.
#[derive(Clone, Debug)]
pub struct ScaleablePool {
    pool: Pool,
    desired_scale: usize,
}

impl ScaleablePool {
    pub fn new(pool: Pool) -> ScaleablePool {
        let desired_scale = pool.assignment.spec.nodes;
        ScaleablePool { pool, desired_scale }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn desired_scale(&self) -> usize {
        self.desired_scale
    }
}

/// The live pools of a cluster, split by tier.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    pub control_plane: Option<ScaleablePool>,
    pub workers: Vec<ScaleablePool>,
}

impl Topology {
    /// Lists the computes of every provider pool and assigns each pool its
    /// place in the desired topology.
    pub async fn discover(
        log: &Logger,
        desired: &DesiredSpec,
        providers: &ProviderPools,
    ) -> Result<Topology, Error> {
        let mut topology = Topology::default();
        let mut seen = BTreeSet::new();
        for (provider, pools) in providers {
            for (name, infra) in pools {
                let assignment = assign_pool(desired, provider, name);
                let key = assignment.spec.key();
                let log = log.new(o!(
                    "provider" => provider.clone(),
                    "pool" => name.clone(),
                    "tier" => assignment.tier.to_string(),
                ));
                let computes = infra
                    .computes()
                    .await
                    .map_err(Error::provider(&key, "listing computes"))?;
                for compute in &computes {
                    if !seen.insert(compute.id().to_string()) {
                        return Err(Error::Planning {
                            resource: format!("pool {key}"),
                            reason: format!(
                                "compute {} is reported by more than one pool",
                                compute.id()
                            ),
                        });
                    }
                }
                debug!(log, "Using pool"; "computes" => computes.len());

                let pool = ScaleablePool::new(Pool {
                    assignment,
                    infra: Arc::clone(infra),
                    computes,
                });
                match pool.pool.tier() {
                    Tier::ControlPlane => topology.control_plane = Some(pool),
                    Tier::Workers => topology.workers.push(pool),
                }
            }
        }
        Ok(topology)
    }

    /// Control plane first, then workers.
    pub fn pools(&self) -> impl Iterator<Item = &ScaleablePool> {
        self.control_plane.iter().chain(self.workers.iter())
    }

    pub fn machines(&self) -> impl Iterator<Item = (&Pool, &BoxedMachine)> {
        self.pools().flat_map(|sp| {
            sp.pool().computes.iter().map(move |c| (sp.pool(), c))
        })
    }

    pub fn machine(&self, id: &str) -> Option<&BoxedMachine> {
        self.machines().map(|(_, m)| m).find(|m| m.id() == id)
    }

    /// Current-state entries for every live compute, marked maintaining.
    ///
    /// The join state already recorded in `known` is kept.
    pub fn observe(
        &self,
        known: &BTreeMap<String, Compute>,
    ) -> BTreeMap<String, Compute> {
        self.machines()
            .map(|(pool, machine)| {
                let join = known
                    .get(machine.id())
                    .map(|c| c.join)
                    .unwrap_or(JoinState::Unjoined);
                let compute = Compute {
                    status: Status::Maintaining,
                    metadata: pool.metadata(),
                    join,
                };
                (machine.id().to_string(), compute)
            })
            .collect()
    }
}

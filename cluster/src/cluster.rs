// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plans and executes one pass of the cluster lifecycle.
//!
//! A pass does exactly one of three things, in order of precedence:
//!
//! * tear the cluster down, if the desired state says it is destroyed
//! * roll the target Kubernetes version out to one more node
//! * grow or shrink the pools towards their desired size
//!
//! Scaling is never evaluated while a version rollout is still in progress.

use crate::config::Config;
use crate::model::{Compute, CurrentState, DesiredSpec, KubeApi, Status};
use crate::network::NetworkAddon;
use crate::pool::{ProviderPools, Topology};
use crate::resources::ClusterClient;
use crate::scale::{self, cluster_firewall, plan_scale, ScalePlan};
use crate::store::{NodeAgentsCurrent, NodeAgentsDesired, StateStore};
use crate::version::{plan_version, UpgradeStep, VersionPlan};
use crate::Error;

use async_trait::async_trait;
use fleet_common::fanout::FanOut;
use fleet_common::{EnsureAction, EnsureOutcome, MultiError};
use remote_machine::RemoteMachine;
use slog::{debug, info, warn, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Commands run on every compute when the cluster is destroyed.
const TEARDOWN: [(&str, &str); 2] = [
    ("resetting node", "sudo kubeadm reset -f"),
    ("wiping etcd data", "sudo rm -rf /var/lib/etcd"),
];

/// Everything a pass needs besides the desired and current state.
#[derive(Clone)]
pub struct ClusterReconciler {
    config: Arc<Config>,
    providers: ProviderPools,
    client: Arc<dyn ClusterClient>,
    store: Arc<dyn StateStore>,
    kube_api: KubeApi,
}

impl ClusterReconciler {
    pub fn new(
        config: Arc<Config>,
        providers: ProviderPools,
        client: Arc<dyn ClusterClient>,
        store: Arc<dyn StateStore>,
        kube_api: KubeApi,
    ) -> ClusterReconciler {
        ClusterReconciler { config, providers, client, store, kube_api }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Computes what this pass should do, without changing anything.
    pub async fn query(
        &self,
        log: &Logger,
        desired: &DesiredSpec,
        current: &CurrentState,
        agents_current: &NodeAgentsCurrent,
        agents_desired: &NodeAgentsDesired,
    ) -> Result<ClusterPlan, Error> {
        let destroy = desired.destroyed;
        desired.validate(destroy)?;

        let topology = Topology::discover(log, desired, &self.providers).await?;
        if topology.control_plane.is_none() && !destroy {
            return Err(Error::Planning {
                resource: format!("pool {}", desired.control_plane.key()),
                reason: "no provider has the control plane pool".to_string(),
            });
        }
        let mut observed = topology.observe(&current.computes);

        let step = if destroy {
            PlanStep::Destroy
        } else {
            let version = plan_version(
                &desired.kubernetes,
                &topology,
                current,
                agents_current,
                agents_desired,
            );
            if version.is_done() {
                let mut scale = plan_scale(&topology, current);
                if scale.needs_init() {
                    scale.network = NetworkAddon::select(
                        &desired.networking.network,
                        desired.custom_image_registry.as_deref(),
                        self.store.as_ref(),
                    )
                    .await?;
                }
                PlanStep::Scale(scale)
            } else {
                PlanStep::Upgrade(version)
            }
        };

        let converged = match &step {
            PlanStep::Scale(scale) => {
                scale.is_empty()
                    && current.status == Status::Running
                    && firewalls_required(
                        &topology,
                        self.kube_api.backend_port,
                        agents_desired,
                    )
            }
            PlanStep::Destroy | PlanStep::Upgrade(_) => false,
        };
        if converged {
            for compute in observed.values_mut() {
                compute.status = Status::Running;
            }
        }
        debug!(
            log,
            "Cluster queried";
            "step" => ?step,
            "converged" => converged,
        );

        Ok(ClusterPlan {
            observed,
            topology,
            desired: desired.clone(),
            step,
            converged,
        })
    }

    /// The shared state for ensuring a plan computed from `current`.
    pub fn pass(
        &self,
        current: CurrentState,
        agents_current: NodeAgentsCurrent,
        agents_desired: NodeAgentsDesired,
    ) -> Pass {
        Pass {
            config: Arc::clone(&self.config),
            client: Arc::clone(&self.client),
            kube_api: self.kube_api.clone(),
            agents_current,
            state: Mutex::new(PassState {
                current,
                agents_desired,
                teardown: None,
            }),
        }
    }
}

/// True if every node agent is already asked to open the cluster's ports.
fn firewalls_required(
    topology: &Topology,
    api_port: u16,
    agents_desired: &NodeAgentsDesired,
) -> bool {
    topology.machines().all(|(pool, machine)| {
        agents_desired.get(machine.id()).is_some_and(|agent| {
            let mut merged = agent.firewall.clone();
            merged.merge(cluster_firewall(pool.tier(), api_port));
            merged == agent.firewall
        })
    })
}

#[derive(Debug)]
pub enum PlanStep {
    Destroy,
    Upgrade(VersionPlan),
    Scale(ScalePlan),
}

/// The outcome of querying the cluster.
#[derive(Debug)]
pub struct ClusterPlan {
    /// Every live compute, as it should be recorded before ensuring.
    pub observed: BTreeMap<String, Compute>,
    pub topology: Topology,
    pub desired: DesiredSpec,
    pub step: PlanStep,
    converged: bool,
}

impl ClusterPlan {
    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// Records the live computes in `current`, before anything is ensured.
    pub fn record_observed(&self, current: &mut CurrentState) {
        current.computes = self.observed.clone();
        if !self.converged {
            current.status = Status::Maintaining;
        }
    }
}

/// Mutable state of one pass, written back to the store at its end.
#[derive(Debug, Default)]
pub struct PassState {
    pub current: CurrentState,
    pub agents_desired: NodeAgentsDesired,
    /// Failures of a best-effort teardown.
    pub teardown: Option<MultiError<Error>>,
}

/// What a [`ClusterPlan`] is ensured against.
pub struct Pass {
    pub config: Arc<Config>,
    pub client: Arc<dyn ClusterClient>,
    pub kube_api: KubeApi,
    pub agents_current: NodeAgentsCurrent,
    state: Mutex<PassState>,
}

impl Pass {
    /// Runs `f` on the state of the pass.
    ///
    /// A panic inside an earlier update leaves the state as it was written so
    /// far, which is still what has to be persisted.
    pub fn update<R>(&self, f: impl FnOnce(&mut PassState) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Takes the state out of the pass, leaving an empty one behind.
    pub fn take(&self) -> PassState {
        self.update(std::mem::take)
    }
}

#[async_trait]
impl EnsureAction for ClusterPlan {
    type Target = Pass;
    type Error = Error;

    fn is_noop(&self) -> bool {
        match &self.step {
            PlanStep::Destroy => self.topology.machines().next().is_none(),
            PlanStep::Upgrade(plan) => plan.is_done(),
            PlanStep::Scale(_) => self.converged,
        }
    }

    async fn ensure(
        &self,
        log: &Logger,
        pass: &Pass,
    ) -> Result<EnsureOutcome, Error> {
        let outcome = match &self.step {
            PlanStep::Destroy => {
                return destroy(log, &self.topology, pass).await;
            }
            PlanStep::Upgrade(plan) => {
                refresh_client(pass).await?;
                self.upgrade(log, plan, pass).await?
            }
            PlanStep::Scale(plan) => {
                refresh_client(pass).await?;
                let (topology, desired) = (&self.topology, &self.desired);
                scale::ensure_scale(log, plan, topology, desired, pass).await?
            }
        };

        let status =
            if outcome.done { Status::Running } else { Status::Maintaining };
        pass.update(|s| {
            s.current.status = status;
            if outcome.done {
                for compute in s.current.computes.values_mut() {
                    compute.status = Status::Running;
                }
            }
        });
        Ok(outcome)
    }
}

impl ClusterPlan {
    async fn upgrade(
        &self,
        log: &Logger,
        plan: &VersionPlan,
        pass: &Pass,
    ) -> Result<EnsureOutcome, Error> {
        let Some(upgrade) = &plan.upgrade else {
            return Ok(EnsureOutcome::DONE);
        };
        let target = &plan.target;
        let id = upgrade.machine.as_str();

        match &upgrade.step {
            UpgradeStep::InstallKubeadm => {
                info!(
                    log,
                    "Installing kubeadm";
                    "machine" => id,
                    "version" => %target,
                );
                pass.update(|s| {
                    let agent = s.agents_desired.entry(id.to_string());
                    agent.or_default().software.kubeadm = Some(target.clone());
                });
            }
            UpgradeStep::Upgrade { command } => {
                let machine =
                    self.topology.machine(id).ok_or_else(|| Error::Planning {
                        resource: format!("compute {id}"),
                        reason: "compute to upgrade is gone".to_string(),
                    })?;
                let stdout = machine
                    .execute(None, command)
                    .await
                    .map_err(Error::execution(
                        &**machine,
                        "upgrading kubernetes",
                    ))?;
                info!(
                    log,
                    "Kubernetes upgraded";
                    "machine" => id,
                    "version" => %target,
                    "stdout" => stdout,
                );
                pass.update(|s| {
                    let agent = s.agents_desired.entry(id.to_string());
                    let software = &mut agent.or_default().software;
                    software.kubeadm = Some(target.clone());
                    software.kubelet = Some(target.clone());
                    software.kubectl = Some(target.clone());
                });
            }
            UpgradeStep::Wait => {
                debug!(log, "Waiting for node agent"; "machine" => id);
            }
        }

        Ok(EnsureOutcome::PENDING)
    }
}

/// Points the client at the cluster recorded in the current state, if any.
async fn refresh_client(pass: &Pass) -> Result<(), Error> {
    if let Some(kubeconfig) = pass.update(|s| s.current.kubeconfig.clone()) {
        pass.client
            .refresh(&kubeconfig)
            .await
            .map_err(Error::cluster("refreshing client"))?;
    }
    Ok(())
}

/// Resets every compute, in parallel, collecting every failure.
///
/// Teardown is best effort: failures are logged and kept in the pass
/// instead of failing it.
async fn destroy(
    log: &Logger,
    topology: &Topology,
    pass: &Pass,
) -> Result<EnsureOutcome, Error> {
    let mut group =
        FanOut::<Error>::new_with_parallelism(pass.config.teardown_parallelism);
    for (_, machine) in topology.machines() {
        for (operation, command) in TEARDOWN {
            let machine = Arc::clone(machine);
            group.spawn(format!("{operation} on {}", machine.id()), async move {
                machine
                    .execute(None, command)
                    .await
                    .map(|_| ())
                    .map_err(Error::execution(&*machine, operation))
            });
        }
    }
    let spawned = group.len();

    match group.join_all().await {
        Ok(()) => {
            info!(log, "Cluster destroyed"; "operations" => spawned);
        }
        Err(errors) => {
            warn!(
                log,
                "Tearing down the cluster failed";
                "operations" => spawned,
                "failed" => errors.len(),
                "error" => %errors,
            );
            pass.update(|s| s.teardown = Some(errors));
        }
    }
    Ok(EnsureOutcome::DONE)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::{
        agent_at, desired_spec, joined_state, FakeClusterClient, FakePool,
        MemoryStateStore,
    };
    use crate::model::{JoinState, KubernetesVersion, Software, Tier};
    use crate::scale::{JoinTarget, ScaleOp};
    use crate::version::NodeUpgrade;
    use camino::Utf8Path;
    use fleet_test_utils::dev::test_setup_log;
    use node_firewall::Port;
    use remote_machine::FakeOutput;
    use std::panic::AssertUnwindSafe;

    fn kube_api() -> KubeApi {
        KubeApi {
            location: "10.0.0.100".to_string(),
            frontend_port: 6443,
            backend_port: 6666,
        }
    }

    fn reconciler(
        providers: ProviderPools,
        client: &Arc<FakeClusterClient>,
    ) -> ClusterReconciler {
        ClusterReconciler::new(
            Arc::new(Config::new("prod")),
            providers,
            Arc::clone(client) as Arc<dyn ClusterClient>,
            Arc::new(MemoryStateStore::new()),
            kube_api(),
        )
    }

    fn agents_at(
        version: &KubernetesVersion,
        ids: &[&str],
    ) -> NodeAgentsCurrent {
        ids.iter().map(|id| (id.to_string(), agent_at(version))).collect()
    }

    #[tokio::test]
    async fn test_invalid_control_plane_size_is_rejected() {
        let logctx =
            test_setup_log("test_invalid_control_plane_size_is_rejected");
        let log = &logctx.log;
        let masters = FakePool::new(log, "masters", 2);
        let client = Arc::new(FakeClusterClient::new());
        let reconciler =
            reconciler(FakePool::providers([&masters]), &client);

        let mut desired = desired_spec(2, &[]);
        let err = reconciler
            .query(
                log,
                &desired,
                &CurrentState::default(),
                &NodeAgentsCurrent::new(),
                &NodeAgentsDesired::new(),
            )
            .await
            .expect_err("two control plane nodes cannot hold a quorum");
        assert!(matches!(err, Error::Validation(_)), "{err}");
        assert!(masters.machines().iter().all(|m| m.calls().is_empty()));

        // Anything goes when destroying.
        desired.destroyed = true;
        let plan = reconciler
            .query(
                log,
                &desired,
                &CurrentState::default(),
                &NodeAgentsCurrent::new(),
                &NodeAgentsDesired::new(),
            )
            .await
            .unwrap();
        assert!(matches!(plan.step, PlanStep::Destroy));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_missing_control_plane_pool() {
        let logctx = test_setup_log("test_missing_control_plane_pool");
        let log = &logctx.log;
        let workers = FakePool::new(log, "workers", 1);
        let client = Arc::new(FakeClusterClient::new());
        let reconciler =
            reconciler(FakePool::providers([&workers]), &client);

        let err = reconciler
            .query(
                log,
                &desired_spec(1, &[("apps", "workers", 1)]),
                &CurrentState::default(),
                &NodeAgentsCurrent::new(),
                &NodeAgentsDesired::new(),
            )
            .await
            .expect_err("no provider has the masters pool");
        assert!(matches!(err, Error::Planning { .. }), "{err}");

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_version_gates_scaling() {
        let logctx = test_setup_log("test_version_gates_scaling");
        let log = &logctx.log;
        let desired = desired_spec(3, &[]);
        let masters = FakePool::new(log, "masters", 1);
        let providers = FakePool::providers([&masters]);
        let client = Arc::new(FakeClusterClient::new());
        let reconciler = reconciler(providers.clone(), &client);
        let topology =
            Topology::discover(log, &desired, &providers).await.unwrap();
        let current = joined_state(&topology);
        let old: KubernetesVersion = "v1.17.0".parse().unwrap();
        let agents_current = agents_at(&old, &["masters-0"]);

        let plan = reconciler
            .query(
                log,
                &desired,
                &current,
                &agents_current,
                &NodeAgentsDesired::new(),
            )
            .await
            .unwrap();
        let PlanStep::Upgrade(version) = &plan.step else {
            panic!("expected an upgrade, got {:?}", plan.step);
        };
        assert_eq!(
            version.upgrade,
            Some(NodeUpgrade {
                machine: "masters-0".to_string(),
                tier: Tier::ControlPlane,
                step: UpgradeStep::InstallKubeadm,
            })
        );
        assert!(!plan.is_noop());

        let pass =
            reconciler.pass(current, agents_current, NodeAgentsDesired::new());
        let outcome = plan.ensure(log, &pass).await.unwrap();
        assert!(!outcome.done);

        // Nothing was provisioned while the version is rolling out.
        assert_eq!(masters.machines().len(), 1);
        let state = pass.take();
        assert_eq!(state.current.status, Status::Maintaining);
        assert_eq!(
            state.agents_desired["masters-0"].software.kubeadm,
            Some(desired.kubernetes.clone())
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_upgrade_runs_kubeadm() {
        let logctx = test_setup_log("test_upgrade_runs_kubeadm");
        let log = &logctx.log;
        let desired = desired_spec(1, &[]);
        let target = desired.kubernetes.clone();
        let masters = FakePool::new(log, "masters", 1);
        let providers = FakePool::providers([&masters]);
        let client = Arc::new(FakeClusterClient::new());
        let reconciler = reconciler(providers.clone(), &client);
        let topology =
            Topology::discover(log, &desired, &providers).await.unwrap();
        let current = joined_state(&topology);

        let mut agent = agent_at(&"v1.17.3".parse().unwrap());
        agent.software.kubeadm = Some(target.clone());
        let agents_current: NodeAgentsCurrent =
            [("masters-0".to_string(), agent)].into_iter().collect();

        let plan = reconciler
            .query(
                log,
                &desired,
                &current,
                &agents_current,
                &NodeAgentsDesired::new(),
            )
            .await
            .unwrap();
        let pass =
            reconciler.pass(current, agents_current, NodeAgentsDesired::new());
        let outcome = plan.ensure(log, &pass).await.unwrap();
        assert!(!outcome.done);

        let machine = masters.machine("masters-0").unwrap();
        assert_eq!(
            machine.commands(),
            vec!["sudo kubeadm upgrade apply --yes v1.18.2".to_string()]
        );
        let state = pass.take();
        assert_eq!(
            state.agents_desired["masters-0"].software,
            Software {
                kubeadm: Some(target.clone()),
                kubelet: Some(target.clone()),
                kubectl: Some(target),
            }
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_control_plane_grows() {
        let logctx = test_setup_log("test_control_plane_grows");
        let log = &logctx.log;
        let desired = desired_spec(3, &[]);
        let target = desired.kubernetes.clone();
        let masters = FakePool::new(log, "masters", 1);
        let providers = FakePool::providers([&masters]);
        let client = Arc::new(FakeClusterClient::new());
        let reconciler = reconciler(providers.clone(), &client);
        let topology =
            Topology::discover(log, &desired, &providers).await.unwrap();
        let current = joined_state(&topology);
        let agents_current = agents_at(&target, &["masters-0"]);

        // First pass: two computes are provisioned, but their node agents
        // have not installed kubeadm yet.
        let plan = reconciler
            .query(
                log,
                &desired,
                &current,
                &agents_current,
                &NodeAgentsDesired::new(),
            )
            .await
            .unwrap();
        let PlanStep::Scale(scale) = &plan.step else {
            panic!("expected scaling, got {:?}", plan.step);
        };
        assert_eq!(scale.joins(Tier::ControlPlane), 2);
        assert_eq!(scale.removals(Tier::ControlPlane), 0);

        let pass = reconciler.pass(
            current,
            agents_current.clone(),
            NodeAgentsDesired::new(),
        );
        let outcome = plan.ensure(log, &pass).await.unwrap();
        assert!(!outcome.done);
        assert_eq!(masters.machines().len(), 3);
        let state = pass.take();
        assert_eq!(state.current.status, Status::Maintaining);
        assert_eq!(
            state.current.computes["masters-2"].join,
            JoinState::Unjoined
        );
        assert_eq!(
            state.agents_desired["masters-1"].software.kubeadm,
            Some(target.clone())
        );

        // Second pass: the agents are ready and both computes join through
        // the first master.
        let agents_current =
            agents_at(&target, &["masters-0", "masters-1", "masters-2"]);
        let plan = reconciler
            .query(
                log,
                &desired,
                &state.current,
                &agents_current,
                &state.agents_desired,
            )
            .await
            .unwrap();
        let PlanStep::Scale(scale) = &plan.step else {
            panic!("expected scaling, got {:?}", plan.step);
        };
        assert_eq!(
            scale.ops[0],
            ScaleOp::Join {
                pool: desired.control_plane.key(),
                tier: Tier::ControlPlane,
                target: JoinTarget::Existing("masters-1".to_string()),
            }
        );

        let pass = reconciler.pass(
            state.current,
            agents_current.clone(),
            state.agents_desired,
        );
        let outcome = plan.ensure(log, &pass).await.unwrap();
        assert!(outcome.done);
        let state = pass.take();
        assert_eq!(state.current.status, Status::Running);
        assert!(state
            .current
            .computes
            .values()
            .all(|c| c.joined() && c.status == Status::Running));

        let first = masters.machine("masters-0").unwrap().commands();
        assert_eq!(
            first,
            vec![
                "sudo kubeadm token create".to_string(),
                "sudo kubeadm init phase upload-certs --upload-certs \
                 2>/dev/null | tail -1"
                    .to_string(),
            ]
        );
        let joined = masters.machine("masters-1").unwrap();
        assert_eq!(
            joined.commands(),
            vec![
                "sudo kubeadm reset -f && sudo rm -rf /var/lib/etcd"
                    .to_string(),
                "sudo kubeadm join --ignore-preflight-errors=Port-6666 \
                 10.0.0.1:6443 --config /etc/kubeadm/config.yaml"
                    .to_string(),
            ]
        );
        let document = joined
            .file(Utf8Path::new("/etc/kubeadm/config.yaml"))
            .expect("bootstrap document was written");
        let document = String::from_utf8(document).unwrap();
        assert!(document.contains("f00dfeed"), "{document}");
        assert!(document.contains("abcdef.0123456789abcdef"), "{document}");
        assert!(masters.members().contains("masters-2"));

        // Third pass: nothing left to do.
        let plan = reconciler
            .query(
                log,
                &desired,
                &state.current,
                &agents_current,
                &state.agents_desired,
            )
            .await
            .unwrap();
        assert!(plan.is_noop());
        assert!(plan.is_converged());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_fresh_cluster_is_initialized() {
        let logctx = test_setup_log("test_fresh_cluster_is_initialized");
        let log = &logctx.log;
        let desired = desired_spec(1, &[("apps", "workers", 1)]);
        let target = desired.kubernetes.clone();
        let masters = FakePool::new(log, "masters", 1);
        let workers = FakePool::new(log, "workers", 1);
        let providers = FakePool::providers([&masters, &workers]);
        let client = Arc::new(FakeClusterClient::new());
        let reconciler = reconciler(providers, &client);
        let agents_current = agents_at(&target, &["masters-0", "workers-0"]);

        let plan = reconciler
            .query(
                log,
                &desired,
                &CurrentState::default(),
                &agents_current,
                &NodeAgentsDesired::new(),
            )
            .await
            .unwrap();
        let PlanStep::Scale(scale) = &plan.step else {
            panic!("expected scaling, got {:?}", plan.step);
        };
        assert!(scale.needs_init());
        assert!(matches!(
            scale.network,
            NetworkAddon::BuiltIn { name: "calico", .. }
        ));

        let mut current = CurrentState::default();
        plan.record_observed(&mut current);
        let pass =
            reconciler.pass(current, agents_current, NodeAgentsDesired::new());
        let outcome = plan.ensure(log, &pass).await.unwrap();
        assert!(outcome.done);

        let master = masters.machine("masters-0").unwrap();
        let commands = master.commands();
        assert_eq!(commands[0], "sudo kubeadm token generate");
        assert!(commands[2].starts_with("sudo kubeadm init"));
        let manifest = Utf8Path::new("/var/lib/fleet/calico.yaml");
        let apply = format!("kubectl create -f {manifest}");
        assert!(commands[2].ends_with(&apply), "{}", commands[2]);
        assert!(master.file(manifest).is_some());

        let state = pass.take();
        let kubeconfig = state.current.kubeconfig.unwrap();
        assert!(kubeconfig.contains("prod-admin"), "{kubeconfig}");
        assert_eq!(client.kubeconfig(), Some(kubeconfig));
        assert_eq!(state.current.computes["workers-0"].join, JoinState::Joined);
        assert!(state.agents_desired["workers-0"].firewall.zones["internal"]
            .ports
            .contains(&Port::tcp("30000-32767")));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_surplus_workers_are_drained() {
        let logctx = test_setup_log("test_surplus_workers_are_drained");
        let log = &logctx.log;
        let desired = desired_spec(1, &[("apps", "workers", 1)]);
        let target = desired.kubernetes.clone();
        let masters = FakePool::new(log, "masters", 1);
        let workers = FakePool::new(log, "workers", 2);
        let providers = FakePool::providers([&masters, &workers]);
        let client = Arc::new(FakeClusterClient::new());
        let reconciler = reconciler(providers.clone(), &client);
        let topology =
            Topology::discover(log, &desired, &providers).await.unwrap();
        let current = joined_state(&topology);
        let agents_current =
            agents_at(&target, &["masters-0", "workers-0", "workers-1"]);

        let plan = reconciler
            .query(
                log,
                &desired,
                &current,
                &agents_current,
                &NodeAgentsDesired::new(),
            )
            .await
            .unwrap();
        let pass =
            reconciler.pass(current, agents_current, NodeAgentsDesired::new());
        let outcome = plan.ensure(log, &pass).await.unwrap();
        assert!(outcome.done);

        assert_eq!(client.drained(), vec!["workers-1".to_string()]);
        assert_eq!(workers.removed(), vec!["workers-1".to_string()]);
        let state = pass.take();
        assert!(!state.current.computes.contains_key("workers-1"));
        assert!(!state.agents_desired.contains_key("workers-1"));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failed_dns_recycling_keeps_node_joined() {
        let logctx =
            test_setup_log("test_failed_dns_recycling_keeps_node_joined");
        let log = &logctx.log;
        let desired = desired_spec(1, &[("apps", "workers", 1)]);
        let target = desired.kubernetes.clone();
        let masters = FakePool::new(log, "masters", 1);
        let workers = FakePool::new(log, "workers", 1);
        let providers = FakePool::providers([&masters, &workers]);
        let client = Arc::new(FakeClusterClient::new());
        let reconciler = reconciler(providers.clone(), &client);
        let topology =
            Topology::discover(log, &desired, &providers).await.unwrap();
        let mut current = joined_state(&topology);
        current.computes.get_mut("workers-0").unwrap().join =
            JoinState::Unjoined;
        let agents_current = agents_at(&target, &["masters-0", "workers-0"]);
        client.set_pods("kube-system", "k8s-app=kube-dns", &["dns-a", "dns-b"]);
        client.fail_requests("apiserver hiccup");

        let plan = reconciler
            .query(
                log,
                &desired,
                &current,
                &agents_current,
                &NodeAgentsDesired::new(),
            )
            .await
            .unwrap();
        let pass = reconciler.pass(
            current,
            agents_current.clone(),
            NodeAgentsDesired::new(),
        );
        let outcome = plan.ensure(log, &pass).await.unwrap();
        assert!(outcome.done);
        let state = pass.take();
        assert_eq!(state.current.computes["workers-0"].join, JoinState::Joined);
        assert_eq!(client.pods("kube-system", "k8s-app=kube-dns").len(), 2);

        // The next pass leaves the healthy member alone.
        let worker = workers.machine("workers-0").unwrap();
        let executed = worker.commands();
        assert_eq!(executed.len(), 2);
        let plan = reconciler
            .query(
                log,
                &desired,
                &state.current,
                &agents_current,
                &state.agents_desired,
            )
            .await
            .unwrap();
        assert!(plan.is_noop(), "{:?}", plan.step);
        let pass = reconciler.pass(
            state.current,
            agents_current,
            state.agents_desired,
        );
        let outcome = plan.ensure(log, &pass).await.unwrap();
        assert!(outcome.done);
        assert_eq!(worker.commands(), executed);

        logctx.cleanup_successful();
    }

    #[test]
    fn test_pass_state_survives_a_panicking_update() {
        let client = Arc::new(FakeClusterClient::new());
        let pass = reconciler(FakePool::providers([]), &client).pass(
            CurrentState::default(),
            NodeAgentsCurrent::new(),
            NodeAgentsDesired::new(),
        );

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            pass.update(|s| {
                s.current.status = Status::Running;
                panic!("adapter bug");
            })
        }));
        assert!(result.is_err());

        pass.update(|s| s.current.kubeconfig = Some("kubeconfig".into()));
        let state = pass.take();
        assert_eq!(state.current.status, Status::Running);
        assert_eq!(state.current.kubeconfig.as_deref(), Some("kubeconfig"));
    }

    #[tokio::test]
    async fn test_teardown_collects_every_failure() {
        let logctx = test_setup_log("test_teardown_collects_every_failure");
        let log = &logctx.log;
        let mut desired = desired_spec(1, &[("apps", "workers", 2)]);
        desired.destroyed = true;
        let masters = FakePool::new(log, "masters", 1);
        let workers = FakePool::new(log, "workers", 2);
        let providers = FakePool::providers([&masters, &workers]);
        let client = Arc::new(FakeClusterClient::new());
        let reconciler = reconciler(providers, &client);

        let machines: Vec<_> =
            masters.machines().into_iter().chain(workers.machines()).collect();
        for machine in &machines {
            machine.set_execute_handler(Box::new(|_| {
                FakeOutput::failure(1, "no route to host")
            }));
        }

        let plan = reconciler
            .query(
                log,
                &desired,
                &CurrentState::default(),
                &NodeAgentsCurrent::new(),
                &NodeAgentsDesired::new(),
            )
            .await
            .unwrap();
        let pass = reconciler.pass(
            CurrentState::default(),
            NodeAgentsCurrent::new(),
            NodeAgentsDesired::new(),
        );

        // Teardown is best effort: the pass succeeds.
        let outcome = plan.ensure(log, &pass).await.unwrap();
        assert!(outcome.done);

        let errors = pass.take().teardown.expect("every command failed");
        assert_eq!(errors.len(), 2 * machines.len());
        for machine in &machines {
            let mut commands = machine.commands();
            commands.sort();
            assert_eq!(
                commands,
                vec![
                    "sudo kubeadm reset -f".to_string(),
                    "sudo rm -rf /var/lib/etcd".to_string(),
                ]
            );
        }

        logctx.cleanup_successful();
    }
}

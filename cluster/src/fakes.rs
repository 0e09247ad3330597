// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators for exercising the reconcilers without a cluster,
//! a state repository, or a cloud provider.

use crate::model::{
    Compute, CurrentState, DesiredSpec, JoinState,
    KubernetesVersion, MasterKey, NodeAgentCurrent, Networking, PoolSpec,
    Software, Status,
};
use crate::pool::{InfraPool, ProviderPools, Topology};
use crate::resources::{
    ClientError, ClusterClient, ClusterObject, ObjectKind, ObjectRef,
};
use crate::store::{
    DesiredDocument, NodeAgentsCurrent, NodeAgentsDesired, StateStore,
};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use remote_machine::{BoxedMachine, FakeMachine, FakeOutput, RemoteMachine};
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

/// Provider name every [`FakePool`] is registered under.
pub const FAKE_PROVIDER: &str = "static";

/// Admin kubeconfig printed by machines of a [`FakePool`].
pub const FAKE_KUBECONFIG: &str = "users:\n- name: kubernetes-admin\n";
/// Where kubeadm init leaves the admin kubeconfig under the default config.
pub const FAKE_ADMIN_CONFIG_PATH: &str = "/var/lib/fleet/admin.conf";

/// A cluster API which keeps objects in memory.
#[derive(Default)]
pub struct FakeClusterClient {
    inner: Mutex<FakeCluster>,
}

#[derive(Default)]
struct FakeCluster {
    objects: BTreeMap<ObjectRef, ClusterObject>,
    pods: BTreeMap<(String, String), Vec<String>>,
    drained: Vec<String>,
    kubeconfig: Option<String>,
    failure: Option<String>,
}

impl FakeClusterClient {
    pub fn new() -> FakeClusterClient {
        FakeClusterClient::default()
    }

    pub fn objects(&self) -> BTreeMap<ObjectRef, ClusterObject> {
        self.inner.lock().unwrap().objects.clone()
    }

    /// Makes `list_pods(namespace, selector)` return `pods`.
    pub fn set_pods(&self, namespace: &str, selector: &str, pods: &[&str]) {
        self.inner.lock().unwrap().pods.insert(
            (namespace.to_string(), selector.to_string()),
            pods.iter().map(|p| p.to_string()).collect(),
        );
    }

    pub fn pods(&self, namespace: &str, selector: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), selector.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Nodes drained so far, in order.
    pub fn drained(&self) -> Vec<String> {
        self.inner.lock().unwrap().drained.clone()
    }

    /// The kubeconfig of the last refresh.
    pub fn kubeconfig(&self) -> Option<String> {
        self.inner.lock().unwrap().kubeconfig.clone()
    }

    /// Fails every following API request with `message`.  Loading a
    /// kubeconfig is not a request and keeps working.
    pub fn fail_requests(&self, message: &str) {
        self.inner.lock().unwrap().failure = Some(message.to_string());
    }

    fn check(inner: &FakeCluster) -> Result<(), ClientError> {
        match &inner.failure {
            Some(message) => Err(ClientError::Api(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn refresh(&self, kubeconfig: &str) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().unwrap();
        inner.kubeconfig = Some(kubeconfig.to_string());
        Ok(())
    }

    async fn apply(&self, object: &ClusterObject) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        inner.objects.insert(object.reference(), object.clone());
        Ok(())
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        if object.kind == ObjectKind::Pod {
            let mut found = false;
            for ((namespace, _), pods) in inner.pods.iter_mut() {
                if object.namespace.as_ref() == Some(namespace) {
                    found |= pods.iter().any(|p| *p == object.name);
                    pods.retain(|p| *p != object.name);
                }
            }
            if !found {
                return Err(ClientError::NotFound(object.clone()));
            }
            return Ok(());
        }
        match inner.objects.remove(object) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(object.clone())),
        }
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<String>, ClientError> {
        let inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        Ok(inner
            .pods
            .get(&(namespace.to_string(), label_selector.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn drain_node(&self, name: &str) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        inner.drained.push(name.to_string());
        Ok(())
    }
}

/// A state repository held in memory.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    desired: Option<DesiredDocument>,
    current: CurrentState,
    agents_current: NodeAgentsCurrent,
    agents_desired: NodeAgentsDesired,
    files: BTreeMap<String, Vec<u8>>,
    commits: Vec<String>,
    errors: Vec<String>,
}

impl MemoryStateStore {
    pub fn new() -> MemoryStateStore {
        MemoryStateStore::default()
    }

    pub fn insert_file(&self, path: &str, content: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_vec());
    }

    pub fn set_desired(&self, spec: DesiredSpec, migrated: bool) {
        self.inner.lock().unwrap().desired =
            Some(DesiredDocument { spec, migrated });
    }

    pub fn set_current(&self, current: CurrentState) {
        self.inner.lock().unwrap().current = current;
    }

    pub fn set_agents_current(&self, agents: NodeAgentsCurrent) {
        self.inner.lock().unwrap().agents_current = agents;
    }

    pub fn stored_current(&self) -> CurrentState {
        self.inner.lock().unwrap().current.clone()
    }

    pub fn stored_agents_desired(&self) -> NodeAgentsDesired {
        self.inner.lock().unwrap().agents_desired.clone()
    }

    /// Commit messages of every push, in order.
    pub fn commits(&self) -> Vec<String> {
        self.inner.lock().unwrap().commits.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner.lock().unwrap().errors.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn desired(
        &self,
        _key: &MasterKey,
    ) -> anyhow::Result<DesiredDocument> {
        self.inner
            .lock()
            .unwrap()
            .desired
            .clone()
            .ok_or_else(|| anyhow!("no desired state"))
    }

    async fn current(&self, _key: &MasterKey) -> anyhow::Result<CurrentState> {
        Ok(self.inner.lock().unwrap().current.clone())
    }

    async fn node_agents_current(&self) -> anyhow::Result<NodeAgentsCurrent> {
        Ok(self.inner.lock().unwrap().agents_current.clone())
    }

    async fn node_agents_desired(&self) -> anyhow::Result<NodeAgentsDesired> {
        Ok(self.inner.lock().unwrap().agents_desired.clone())
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().files.get(path).cloned())
    }

    async fn push_desired(
        &self,
        spec: &DesiredSpec,
        _key: &MasterKey,
        message: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.desired =
            Some(DesiredDocument { spec: spec.clone(), migrated: false });
        inner.commits.push(message.to_string());
        Ok(())
    }

    async fn push_current(
        &self,
        current: &CurrentState,
        agents: &NodeAgentsDesired,
        _key: &MasterKey,
        message: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.current = current.clone();
        inner.agents_desired = agents.clone();
        inner.commits.push(message.to_string());
        Ok(())
    }

    async fn push_error(&self, error: &str) -> anyhow::Result<()> {
        self.inner.lock().unwrap().errors.push(error.to_string());
        Ok(())
    }
}

/// A provider pool of [`FakeMachine`]s.
///
/// Machines are named `<pool>-<n>` and answer the kubeadm commands the
/// reconcilers issue.
pub struct FakePool {
    log: Logger,
    name: String,
    inner: Mutex<FakePoolState>,
}

#[derive(Default)]
struct FakePoolState {
    next: usize,
    computes: Vec<Arc<FakeMachine>>,
    removed: Vec<String>,
    members: BTreeSet<String>,
    failure: Option<String>,
}

impl FakePool {
    pub fn new(log: &Logger, name: &str, count: usize) -> Arc<FakePool> {
        let pool = FakePool {
            log: log.clone(),
            name: name.to_string(),
            inner: Mutex::new(FakePoolState::default()),
        };
        {
            let mut inner = pool.inner.lock().unwrap();
            for _ in 0..count {
                let machine = pool.create(&mut inner);
                inner.computes.push(machine);
            }
        }
        Arc::new(pool)
    }

    /// Registers `pools` under [`FAKE_PROVIDER`].
    pub fn providers<const N: usize>(
        pools: [&Arc<FakePool>; N],
    ) -> ProviderPools {
        let pools = pools
            .into_iter()
            .map(|p| (p.name.clone(), Arc::clone(p) as Arc<dyn InfraPool>))
            .collect();
        [(FAKE_PROVIDER.to_string(), pools)].into_iter().collect()
    }

    pub fn machine(&self, id: &str) -> Option<Arc<FakeMachine>> {
        self.inner
            .lock()
            .unwrap()
            .computes
            .iter()
            .find(|m| m.id() == id)
            .cloned()
    }

    pub fn machines(&self) -> Vec<Arc<FakeMachine>> {
        self.inner.lock().unwrap().computes.clone()
    }

    /// Ids of destroyed computes, in order.
    pub fn removed(&self) -> Vec<String> {
        self.inner.lock().unwrap().removed.clone()
    }

    pub fn members(&self) -> BTreeSet<String> {
        self.inner.lock().unwrap().members.clone()
    }

    /// Fails every following call with `message`.
    pub fn fail_requests(&self, message: &str) {
        self.inner.lock().unwrap().failure = Some(message.to_string());
    }

    fn create(&self, inner: &mut FakePoolState) -> Arc<FakeMachine> {
        let n = inner.next;
        inner.next += 1;
        let octet = u8::try_from(n % 250).unwrap_or(0) + 1;
        let machine = FakeMachine::new(
            &self.log,
            format!("{}-{n}", self.name),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet)),
        );
        machine.set_execute_handler(Box::new(kubeadm_responses));
        machine
    }

    fn check(inner: &FakePoolState) -> anyhow::Result<()> {
        match &inner.failure {
            Some(message) => bail!("{message}"),
            None => Ok(()),
        }
    }
}

/// Answers the commands which print something the reconcilers read back.
pub fn kubeadm_responses(command: &str) -> FakeOutput {
    if command.contains("kubeadm token") {
        FakeOutput::stdout("abcdef.0123456789abcdef\n")
    } else if command.contains("upload-certs") {
        FakeOutput::stdout("f00dfeed\n")
    } else if command.starts_with("sudo kubeadm init") {
        FakeOutput::success()
            .with_file(FAKE_ADMIN_CONFIG_PATH, FAKE_KUBECONFIG.as_bytes())
    } else {
        FakeOutput::success()
    }
}

#[async_trait]
impl InfraPool for FakePool {
    async fn computes(&self) -> anyhow::Result<Vec<BoxedMachine>> {
        let inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        Ok(inner.computes.iter().map(|m| Arc::clone(m).as_machine()).collect())
    }

    async fn add_computes(
        &self,
        count: usize,
    ) -> anyhow::Result<Vec<BoxedMachine>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            let machine = self.create(&mut inner);
            inner.computes.push(Arc::clone(&machine));
            added.push(machine.as_machine());
        }
        Ok(added)
    }

    async fn ensure_member(
        &self,
        machine: &dyn RemoteMachine,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        inner.members.insert(machine.id().to_string());
        Ok(())
    }

    async fn remove(&self, machine: &dyn RemoteMachine) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check(&inner)?;
        inner.computes.retain(|m| m.id() != machine.id());
        inner.members.remove(machine.id());
        inner.removed.push(machine.id().to_string());
        Ok(())
    }
}

/// A desired spec with a control plane of `control_plane` nodes in the
/// `masters` pool and the given `(group, pool, nodes)` worker groups, all
/// under [`FAKE_PROVIDER`].
pub fn desired_spec(
    control_plane: usize,
    workers: &[(&str, &str, usize)],
) -> DesiredSpec {
    let pool_spec = |pool: &str, nodes: usize| PoolSpec {
        updates_disabled: false,
        provider: FAKE_PROVIDER.to_string(),
        nodes,
        pool: pool.to_string(),
    };
    DesiredSpec {
        destroyed: false,
        verbose: false,
        kubernetes: KubernetesVersion { major: 1, minor: 18, patch: 2 },
        networking: Networking {
            dns_domain: "cluster.local".to_string(),
            network: "calico".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            pod_cidr: "192.168.0.0/16".to_string(),
        },
        control_plane: pool_spec("masters", control_plane),
        workers: workers
            .iter()
            .map(|(group, pool, nodes)| {
                (group.to_string(), pool_spec(pool, *nodes))
            })
            .collect(),
        custom_image_registry: None,
    }
}

/// A ready node agent with every binary at `version`.
pub fn agent_at(version: &KubernetesVersion) -> NodeAgentCurrent {
    NodeAgentCurrent {
        ready: true,
        software: Software {
            kubeadm: Some(version.clone()),
            kubelet: Some(version.clone()),
            kubectl: Some(version.clone()),
        },
        open: Vec::new(),
    }
}

/// Current state in which every compute of `topology` has joined.
pub fn joined_state(topology: &Topology) -> CurrentState {
    let computes = topology
        .observe(&BTreeMap::new())
        .into_iter()
        .map(|(id, compute)| {
            (id, Compute { join: JoinState::Joined, ..compute })
        })
        .collect();
    CurrentState {
        status: Status::Running,
        computes,
        kubeconfig: Some(FAKE_KUBECONFIG.to_string()),
        ..Default::default()
    }
}


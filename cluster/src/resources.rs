// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Objects kept in the live cluster, and the client used to reach it.

use async_trait::async_trait;
use fleet_common::{EnsureAction, EnsureOutcome};
use serde::{Deserialize, Serialize};
use slog::{debug, Logger};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(ObjectRef),

    #[error("cluster API request failed: {0}")]
    Api(String),
}

/// The management API of the live cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Points the client at the cluster described by `kubeconfig`.
    async fn refresh(&self, kubeconfig: &str) -> Result<(), ClientError>;

    /// Creates `object` or updates it to match.
    async fn apply(&self, object: &ClusterObject) -> Result<(), ClientError>;

    /// Deletes the object, failing with [`ClientError::NotFound`] if it does
    /// not exist.
    async fn delete(&self, object: &ObjectRef) -> Result<(), ClientError>;

    /// Names of the pods in `namespace` matching `label_selector`, oldest
    /// first.
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<String>, ClientError>;

    /// Evicts every pod from a node and marks it unschedulable.
    async fn drain_node(&self, name: &str) -> Result<(), ClientError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectKind {
    Namespace,
    Secret,
    ConfigMap,
    ClusterRole,
    Pod,
    Node,
}

/// Names an object in the cluster.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn cluster_scoped(kind: ObjectKind, name: impl Into<String>) -> Self {
        ObjectRef { kind, name: name.into(), namespace: None }
    }

    pub fn namespaced(
        kind: ObjectKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        ObjectRef { kind, name: name.into(), namespace: Some(namespace.into()) }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{:?} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{:?} {}", self.kind, self.name),
        }
    }
}

pub type Labels = BTreeMap<String, String>;

/// One rule of a cluster role.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
}

/// An object the reconcilers own in the live cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterObject {
    Namespace {
        name: String,
    },
    /// An opaque secret.
    Secret {
        name: String,
        namespace: String,
        labels: Labels,
        data: BTreeMap<String, String>,
    },
    ConfigMap {
        name: String,
        namespace: String,
        labels: Labels,
        data: BTreeMap<String, String>,
    },
    ClusterRole {
        name: String,
        labels: Labels,
        rules: Vec<PolicyRule>,
    },
}

impl ClusterObject {
    pub fn reference(&self) -> ObjectRef {
        match self {
            ClusterObject::Namespace { name } => {
                ObjectRef::cluster_scoped(ObjectKind::Namespace, name)
            }
            ClusterObject::Secret { name, namespace, .. } => {
                ObjectRef::namespaced(ObjectKind::Secret, namespace, name)
            }
            ClusterObject::ConfigMap { name, namespace, .. } => {
                ObjectRef::namespaced(ObjectKind::ConfigMap, namespace, name)
            }
            ClusterObject::ClusterRole { name, .. } => {
                ObjectRef::cluster_scoped(ObjectKind::ClusterRole, name)
            }
        }
    }
}

/// Converges one cluster object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceAction {
    Apply(ClusterObject),
    /// Deleting an object which does not exist succeeds.
    Delete(ObjectRef),
}

#[async_trait]
impl EnsureAction for ResourceAction {
    type Target = dyn ClusterClient;
    type Error = ClientError;

    fn is_noop(&self) -> bool {
        false
    }

    async fn ensure(
        &self,
        log: &Logger,
        client: &Self::Target,
    ) -> Result<EnsureOutcome, ClientError> {
        match self {
            ResourceAction::Apply(object) => {
                debug!(log, "applying {}", object.reference());
                client.apply(object).await?;
            }
            ResourceAction::Delete(reference) => {
                debug!(log, "deleting {reference}");
                match client.delete(reference).await {
                    Ok(()) | Err(ClientError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(EnsureOutcome::DONE)
    }
}

pub mod namespace {
    use super::*;

    pub fn adapt(name: &str) -> ResourceAction {
        let name = name.to_string();
        ResourceAction::Apply(ClusterObject::Namespace { name })
    }

    pub fn destroy(name: &str) -> ResourceAction {
        ResourceAction::Delete(ObjectRef::cluster_scoped(
            ObjectKind::Namespace,
            name,
        ))
    }
}

pub mod secret {
    use super::*;

    pub fn adapt(
        name: &str,
        namespace: &str,
        labels: Labels,
        data: BTreeMap<String, String>,
    ) -> ResourceAction {
        ResourceAction::Apply(ClusterObject::Secret {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels,
            data,
        })
    }

    pub fn destroy(name: &str, namespace: &str) -> ResourceAction {
        ResourceAction::Delete(ObjectRef::namespaced(
            ObjectKind::Secret,
            namespace,
            name,
        ))
    }
}

pub mod configmap {
    use super::*;

    pub fn adapt(
        name: &str,
        namespace: &str,
        labels: Labels,
        data: BTreeMap<String, String>,
    ) -> ResourceAction {
        ResourceAction::Apply(ClusterObject::ConfigMap {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels,
            data,
        })
    }

    pub fn destroy(name: &str, namespace: &str) -> ResourceAction {
        ResourceAction::Delete(ObjectRef::namespaced(
            ObjectKind::ConfigMap,
            namespace,
            name,
        ))
    }
}

pub mod clusterrole {
    use super::*;

    pub fn adapt(
        name: &str,
        labels: Labels,
        rules: Vec<PolicyRule>,
    ) -> ResourceAction {
        ResourceAction::Apply(ClusterObject::ClusterRole {
            name: name.to_string(),
            labels,
            rules,
        })
    }

    pub fn destroy(name: &str) -> ResourceAction {
        ResourceAction::Delete(ObjectRef::cluster_scoped(
            ObjectKind::ClusterRole,
            name,
        ))
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootstrapping a node into the cluster.
//!
//! The very first control-plane node of a fresh cluster is initialized, every
//! other node joins through an already joined control-plane node.  Both
//! paths write the bootstrap document, reset whatever cluster state the node
//! carries, and then run kubeadm.

use crate::bootstrap::{self, BootstrapParams, JoinDiscovery};
use crate::config::Config;
use crate::model::{DesiredSpec, KubeApi, Tier};
use crate::network::NetworkAddon;
use crate::pool::Pool;
use crate::resources::{ClientError, ClusterClient, ObjectKind, ObjectRef};
use crate::Error;

use camino::Utf8PathBuf;
use fleet_common::backoff::{retry_notify, retry_policy_bounded, BackoffError};
use remote_machine::{ExecutionError, RemoteMachine};
use slog::{debug, info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::net::SocketAddr;

pub const RESET_COMMAND: &str =
    "sudo kubeadm reset -f && sudo rm -rf /var/lib/etcd";

/// What is shared by every join of a pass.
#[derive(Clone, Copy)]
pub struct JoinContext<'a> {
    pub config: &'a Config,
    pub desired: &'a DesiredSpec,
    pub kube_api: &'a KubeApi,
}

/// How a node gets into the cluster.
#[derive(Clone, Copy)]
pub enum Bootstrap<'a> {
    /// Start a new cluster on this node and install the network add-on.
    Init { network: &'a NetworkAddon },
    /// Join the cluster through `at`, a joined control-plane node.
    Join { at: &'a dyn RemoteMachine, certificate_key: Option<&'a str> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Joined {
    Joined,
    /// The cluster was created; carries the admin kubeconfig.
    Initialized { kubeconfig: String },
}

/// Where kubeadm init leaves a copy of the admin kubeconfig readable by the
/// remote user.
pub fn admin_config_path(config: &Config) -> Utf8PathBuf {
    config.remote_dir.join("admin.conf")
}

/// The kubeadm invocation for `bootstrap`.
pub fn bootstrap_command(
    config: &Config,
    kube_api: &KubeApi,
    bootstrap: &Bootstrap<'_>,
) -> String {
    let path = &config.bootstrap_config_path;
    match bootstrap {
        Bootstrap::Init { network } => format!(
            "sudo kubeadm init --ignore-preflight-errors=Port-{port} \
             --config {path} && mkdir -p ${{HOME}}/.kube && \
             yes | sudo cp -rf /etc/kubernetes/admin.conf \
             ${{HOME}}/.kube/config && \
             sudo chown $(id -u):$(id -g) ${{HOME}}/.kube/config && \
             sudo install -D -m 0600 -o $(id -u) -g $(id -g) \
             /etc/kubernetes/admin.conf {admin} && {apply}",
            port = kube_api.backend_port,
            admin = admin_config_path(config),
            apply = network.apply_command(&config.remote_dir),
        ),
        Bootstrap::Join { at, .. } => format!(
            "sudo kubeadm join --ignore-preflight-errors=Port-{} {} \
             --config {path}",
            kube_api.backend_port,
            SocketAddr::new(at.ip(), kube_api.frontend_port),
        ),
    }
}

/// Brings `machine` of `pool` into the cluster as a `tier` node.
///
/// Any failing step aborts the join; the caller retries on its next pass.
/// Only writing the bootstrap document is retried here.  Once this returns
/// `Ok` the node is a cluster member.
pub async fn join(
    log: &Logger,
    ctx: JoinContext<'_>,
    pool: &Pool,
    machine: &dyn RemoteMachine,
    token: &str,
    bootstrap: Bootstrap<'_>,
) -> Result<Joined, Error> {
    let tier = pool.tier();
    let log = log.new(o!(
        "machine" => machine.id().to_string(),
        "tier" => tier.to_string(),
    ));

    let join = match bootstrap {
        Bootstrap::Init { .. } => None,
        Bootstrap::Join { at, certificate_key } => Some(JoinDiscovery {
            join_at: at.ip(),
            certificate_key: match tier {
                Tier::ControlPlane => certificate_key,
                Tier::Workers => None,
            },
        }),
    };
    let document = bootstrap::render(&BootstrapParams {
        cluster_id: &ctx.config.cluster_id,
        node_name: machine.id(),
        node_ip: machine.ip(),
        token,
        kube_api: ctx.kube_api,
        image_repository: &ctx.config.image_repository,
        version: &ctx.desired.kubernetes,
        networking: &ctx.desired.networking,
        join,
    })
    .map_err(|err| Error::Planning {
        resource: format!("bootstrap document for {}", machine.id()),
        reason: err.to_string(),
    })?;

    write_bootstrap_document(&log, ctx.config, machine, &document).await?;

    let stdout = machine
        .execute(None, RESET_COMMAND)
        .await
        .map_err(Error::execution(machine, "resetting node"))?;
    debug!(log, "Cleaned up machine"; "stdout" => stdout);

    let command = bootstrap_command(ctx.config, ctx.kube_api, &bootstrap);
    match bootstrap {
        Bootstrap::Join { .. } => {
            let stdout = machine
                .execute(None, &command)
                .await
                .map_err(Error::execution(machine, "kubeadm join"))?;
            debug!(log, "Executed kubeadm join"; "stdout" => stdout);

            pool.infra
                .ensure_member(machine)
                .await
                .map_err(Error::provider(&pool.key(), "ensuring membership"))?;
            info!(log, "Node joined");
            Ok(Joined::Joined)
        }
        Bootstrap::Init { network } => {
            pool.infra
                .ensure_member(machine)
                .await
                .map_err(Error::provider(&pool.key(), "ensuring membership"))?;
            network.prepare(machine, &ctx.config.remote_dir).await?;

            let stdout = machine
                .execute(None, &command)
                .await
                .map_err(Error::execution(machine, "kubeadm init"))?;
            debug!(log, "Executed kubeadm init"; "stdout" => stdout);

            let admin = machine
                .read_file(&admin_config_path(ctx.config))
                .await
                .map_err(Error::execution(
                    machine,
                    "reading admin kubeconfig",
                ))?;
            info!(log, "Cluster initialized");

            let kubeconfig = String::from_utf8_lossy(&admin).replace(
                "kubernetes-admin",
                &format!("{}-admin", ctx.config.cluster_id),
            );
            Ok(Joined::Initialized { kubeconfig })
        }
    }
}

async fn write_bootstrap_document(
    log: &Logger,
    config: &Config,
    machine: &dyn RemoteMachine,
    document: &str,
) -> Result<(), Error> {
    let path = &config.bootstrap_config_path;
    let policy = retry_policy_bounded(
        config.file_write_retry.interval(),
        config.file_write_retry.max_elapsed(),
    );
    retry_notify(
        policy,
        || async {
            machine
                .write_file(path, document.as_bytes(), 0o600)
                .await
                .map_err(BackoffError::transient)
        },
        |err: ExecutionError, delay| {
            warn!(
                log,
                "writing bootstrap document failed, will retry in {:?}", delay;
                "error" => InlineErrorChain::new(&err),
            );
        },
    )
    .await
    .map_err(Error::execution(machine, "writing bootstrap document"))?;
    debug!(log, "Written file"; "path" => %path);
    Ok(())
}

/// Deletes one cluster DNS pod when there is more than one, so the DNS
/// deployment gets rescheduled onto the grown cluster.
///
/// This works around DNS pods piling up on the first nodes.  Convergence does
/// not depend on it, so failures are only logged.
pub(crate) async fn recycle_surplus_dns_pod(
    log: &Logger,
    client: &dyn ClusterClient,
) {
    let pods = match client.list_pods("kube-system", "k8s-app=kube-dns").await
    {
        Ok(pods) => pods,
        Err(err) => {
            warn!(
                log,
                "listing DNS pods failed";
                "error" => InlineErrorChain::new(&err),
            );
            return;
        }
    };
    if pods.len() <= 1 {
        return;
    }

    let pod = ObjectRef::namespaced(ObjectKind::Pod, "kube-system", &pods[0]);
    debug!(log, "recycling DNS pod"; "pod" => &pods[0]);
    match client.delete(&pod).await {
        Ok(()) | Err(ClientError::NotFound(_)) => {}
        Err(err) => {
            warn!(
                log,
                "deleting DNS pod failed";
                "pod" => &pods[0],
                "error" => InlineErrorChain::new(&err),
            );
        }
    }
}

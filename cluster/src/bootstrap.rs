// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kubeadm configuration written to a node before it is bootstrapped.

use crate::model::{KubeApi, KubernetesVersion, Networking};

use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

const KUBEADM_API: &str = "kubeadm.k8s.io/v1beta2";
const KUBELET_API: &str = "kubelet.config.k8s.io/v1beta1";

/// Everything that goes into a node's bootstrap document.
#[derive(Clone, Debug)]
pub struct BootstrapParams<'a> {
    pub cluster_id: &'a str,
    pub node_name: &'a str,
    pub node_ip: IpAddr,
    pub token: &'a str,
    pub kube_api: &'a KubeApi,
    pub image_repository: &'a str,
    pub version: &'a KubernetesVersion,
    pub networking: &'a Networking,
    /// `None` when initializing a fresh cluster.
    pub join: Option<JoinDiscovery<'a>>,
}

/// How a joining node finds the cluster.
#[derive(Clone, Debug)]
pub struct JoinDiscovery<'a> {
    /// An already joined control-plane node.
    pub join_at: IpAddr,
    /// Set when joining as a control-plane node.
    pub certificate_key: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitConfiguration<'a> {
    api_version: &'static str,
    kind: &'static str,
    bootstrap_tokens: Vec<BootstrapToken<'a>>,
    #[serde(rename = "localAPIEndpoint")]
    local_api_endpoint: ApiEndpoint,
    node_registration: NodeRegistration<'a>,
}

#[derive(Serialize)]
struct BootstrapToken<'a> {
    groups: Vec<&'static str>,
    token: &'a str,
    ttl: &'static str,
    usages: Vec<&'static str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiEndpoint {
    advertise_address: IpAddr,
    bind_port: u16,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeRegistration<'a> {
    name: &'a str,
    kubelet_extra_args: BTreeMap<&'static str, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    taints: Vec<Taint>,
}

#[derive(Serialize)]
struct Taint {
    effect: &'static str,
    key: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfiguration {
    api_version: &'static str,
    kind: &'static str,
    cgroup_driver: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfiguration<'a> {
    api_version: &'static str,
    kind: &'static str,
    api_server: ApiServer<'a>,
    certificates_dir: &'static str,
    cluster_name: &'a str,
    control_plane_endpoint: String,
    controller_manager: BTreeMap<String, String>,
    dns: Dns,
    etcd: Etcd<'a>,
    image_repository: &'a str,
    kubernetes_version: String,
    networking: ClusterNetworking<'a>,
    scheduler: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiServer<'a> {
    timeout_for_control_plane: &'static str,
    #[serde(rename = "certSANs")]
    cert_sans: Vec<&'a str>,
}

#[derive(Serialize)]
struct Dns {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct Etcd<'a> {
    local: LocalEtcd<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalEtcd<'a> {
    image_repository: &'a str,
    data_dir: &'static str,
    extra_args: BTreeMap<&'static str, &'static str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterNetworking<'a> {
    dns_domain: &'a str,
    pod_subnet: &'a str,
    service_subnet: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinConfiguration<'a> {
    api_version: &'static str,
    kind: &'static str,
    ca_cert_path: &'static str,
    discovery: Discovery<'a>,
    node_registration: NodeRegistration<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    control_plane: Option<JoinControlPlane<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Discovery<'a> {
    bootstrap_token: DiscoveryToken<'a>,
    timeout: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveryToken<'a> {
    api_server_endpoint: String,
    token: &'a str,
    #[serde(rename = "unsafeSkipCAVerification")]
    unsafe_skip_ca_verification: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinControlPlane<'a> {
    #[serde(rename = "localAPIEndpoint")]
    local_api_endpoint: ApiEndpoint,
    certificate_key: &'a str,
}

fn node_ip_args(ip: IpAddr) -> BTreeMap<&'static str, String> {
    [("node-ip", ip.to_string())].into_iter().collect()
}

/// Renders the multi-document bootstrap configuration for a node.
pub fn render(
    params: &BootstrapParams<'_>,
) -> Result<String, serde_yaml::Error> {
    let init = InitConfiguration {
        api_version: KUBEADM_API,
        kind: "InitConfiguration",
        bootstrap_tokens: vec![BootstrapToken {
            groups: vec!["system:bootstrappers:kubeadm:default-node-token"],
            token: params.token,
            ttl: "10m0s",
            usages: vec!["signing", "authentication"],
        }],
        local_api_endpoint: ApiEndpoint {
            advertise_address: params.node_ip,
            bind_port: params.kube_api.backend_port,
        },
        node_registration: NodeRegistration {
            name: params.node_name,
            kubelet_extra_args: node_ip_args(params.node_ip),
            taints: vec![Taint {
                effect: "NoSchedule",
                key: "node-role.kubernetes.io/master",
            }],
        },
    };

    let kubelet = KubeletConfiguration {
        api_version: KUBELET_API,
        kind: "KubeletConfiguration",
        cgroup_driver: "systemd",
    };

    let cluster = ClusterConfiguration {
        api_version: KUBEADM_API,
        kind: "ClusterConfiguration",
        api_server: ApiServer {
            timeout_for_control_plane: "4m0s",
            cert_sans: vec![params.kube_api.location.as_str()],
        },
        certificates_dir: "/etc/kubernetes/pki",
        cluster_name: params.cluster_id,
        control_plane_endpoint: params.kube_api.to_string(),
        controller_manager: BTreeMap::new(),
        dns: Dns { kind: "CoreDNS" },
        etcd: Etcd {
            local: LocalEtcd {
                image_repository: params.image_repository,
                data_dir: "/var/lib/etcd",
                extra_args: [("listen-metrics-urls", "http://0.0.0.0:2381")]
                    .into_iter()
                    .collect(),
            },
        },
        image_repository: params.image_repository,
        kubernetes_version: params.version.to_string(),
        networking: ClusterNetworking {
            dns_domain: &params.networking.dns_domain,
            pod_subnet: &params.networking.pod_cidr,
            service_subnet: &params.networking.service_cidr,
        },
        scheduler: BTreeMap::new(),
    };

    let mut docs = vec![
        serde_yaml::to_string(&init)?,
        serde_yaml::to_string(&kubelet)?,
        serde_yaml::to_string(&cluster)?,
    ];

    if let Some(join) = &params.join {
        let doc = JoinConfiguration {
            api_version: KUBEADM_API,
            kind: "JoinConfiguration",
            ca_cert_path: "/etc/kubernetes/pki/ca.crt",
            discovery: Discovery {
                bootstrap_token: DiscoveryToken {
                    api_server_endpoint: SocketAddr::new(
                        join.join_at,
                        params.kube_api.backend_port,
                    )
                    .to_string(),
                    token: params.token,
                    unsafe_skip_ca_verification: true,
                },
                timeout: "5m0s",
            },
            node_registration: NodeRegistration {
                name: params.node_name,
                kubelet_extra_args: node_ip_args(params.node_ip),
                taints: Vec::new(),
            },
            control_plane: join.certificate_key.map(|certificate_key| {
                JoinControlPlane {
                    local_api_endpoint: ApiEndpoint {
                        advertise_address: params.node_ip,
                        bind_port: params.kube_api.backend_port,
                    },
                    certificate_key,
                }
            }),
        };
        docs.push(serde_yaml::to_string(&doc)?);
    }

    Ok(docs.join("---\n"))
}

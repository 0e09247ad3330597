// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pod network add-on installed with the first control-plane node.

use crate::store::StateStore;
use crate::Error;

use camino::{Utf8Path, Utf8PathBuf};
use remote_machine::RemoteMachine;

const CALICO_TEMPLATE: &str = include_str!("../manifests/calico.yaml");
const CILIUM_TEMPLATE: &str = include_str!("../manifests/cilium.yaml");

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkAddon {
    /// No add-on is installed by the reconciler.
    None,
    /// A built-in add-on rendered for the configured registry.
    BuiltIn { name: &'static str, manifest: String },
    /// A manifest supplied through the state store.
    External { path: String, manifest: Vec<u8> },
}

impl NetworkAddon {
    /// Chooses the add-on named by a desired spec's `network` setting.
    pub async fn select(
        network: &str,
        custom_registry: Option<&str>,
        store: &dyn StateStore,
    ) -> Result<NetworkAddon, Error> {
        let registry = custom_registry.filter(|r| !r.is_empty());
        match network {
            "" => Ok(NetworkAddon::None),
            "calico" => {
                let prefix =
                    registry.map(|r| format!("{r}/")).unwrap_or_default();
                Ok(NetworkAddon::BuiltIn {
                    name: "calico",
                    manifest: CALICO_TEMPLATE
                        .replace("{{ImageRegistry}}", &prefix),
                })
            }
            "cilium" => {
                let istio =
                    registry.map(|r| format!("{r}/")).unwrap_or_default();
                let cilium = registry.unwrap_or("docker.io");
                Ok(NetworkAddon::BuiltIn {
                    name: "cilium",
                    manifest: CILIUM_TEMPLATE
                        .replace("{{IstioProxyImageRegistry}}", &istio)
                        .replace("{{CiliumImageRegistry}}", cilium),
                })
            }
            path => {
                let manifest = store.read_file(path).await.map_err(|err| {
                    Error::State {
                        operation: format!("reading network file {path}"),
                        err,
                    }
                })?;
                match manifest {
                    Some(manifest) if !manifest.is_empty() => {
                        Ok(NetworkAddon::External {
                            path: path.to_string(),
                            manifest,
                        })
                    }
                    _ => Err(Error::Planning {
                        resource: "network add-on".to_string(),
                        reason: format!(
                            "network file {path} is empty or not found in \
                             the state store"
                        ),
                    }),
                }
            }
        }
    }

    /// Where the manifest is placed on the node.
    pub fn remote_path(&self, remote_dir: &Utf8Path) -> Option<Utf8PathBuf> {
        match self {
            NetworkAddon::None => None,
            NetworkAddon::BuiltIn { name, .. } => {
                Some(remote_dir.join(format!("{name}.yaml")))
            }
            NetworkAddon::External { path, .. } => {
                let name = Utf8Path::new(path).file_name().unwrap_or(path);
                Some(remote_dir.join(name))
            }
        }
    }

    /// The shell command installing the add-on once the API is up.
    pub fn apply_command(&self, remote_dir: &Utf8Path) -> String {
        match self.remote_path(remote_dir) {
            Some(path) => format!("kubectl create -f {path}"),
            None => "true".to_string(),
        }
    }

    /// Places the manifest on the node which is about to initialize the
    /// cluster.
    pub async fn prepare(
        &self,
        machine: &dyn RemoteMachine,
        remote_dir: &Utf8Path,
    ) -> Result<(), Error> {
        let (Some(path), Some(manifest)) =
            (self.remote_path(remote_dir), self.manifest())
        else {
            return Ok(());
        };
        machine
            .write_file(&path, manifest, 0o600)
            .await
            .map_err(Error::execution(machine, "writing network manifest"))
    }

    fn manifest(&self) -> Option<&[u8]> {
        match self {
            NetworkAddon::None => None,
            NetworkAddon::BuiltIn { manifest, .. } => Some(manifest.as_bytes()),
            NetworkAddon::External { manifest, .. } => Some(manifest),
        }
    }
}

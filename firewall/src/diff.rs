// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Port, ZoneDesc, ZonePolicy};
use std::collections::BTreeSet;

/// Difference between a zone's live state and its policy.
///
/// Every list is sorted and free of duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneDiff {
    pub create_zone: bool,
    pub add_interfaces: Vec<String>,
    pub remove_interfaces: Vec<String>,
    pub add_sources: Vec<String>,
    pub remove_sources: Vec<String>,
    pub add_ports: Vec<Port>,
    pub remove_ports: Vec<Port>,
    pub set_target: Option<String>,
}

impl ZoneDiff {
    pub fn is_empty(&self) -> bool {
        !self.create_zone
            && self.add_interfaces.is_empty()
            && self.remove_interfaces.is_empty()
            && self.add_sources.is_empty()
            && self.remove_sources.is_empty()
            && self.add_ports.is_empty()
            && self.remove_ports.is_empty()
            && self.set_target.is_none()
    }
}

fn is_ignored(port: &Port, ignore: &BTreeSet<String>) -> bool {
    ignore.contains(&port.to_string()) || ignore.contains(&port.port)
}

fn add_and_remove<T: Ord + Clone>(
    live: &BTreeSet<T>,
    desired: &BTreeSet<T>,
) -> (Vec<T>, Vec<T>) {
    (
        desired.difference(live).cloned().collect(),
        live.difference(desired).cloned().collect(),
    )
}

/// Computes what has to change for `live` to match `desired`.
///
/// `exists` tells whether the daemon knows the zone at all.  Ports listed in
/// `ignore` (either as `port/protocol` or as a bare port) are never opened or
/// closed.  Services are reported but never changed.
pub fn diff_zone(
    live: &ZoneDesc,
    exists: bool,
    desired: &ZonePolicy,
    ignore: &BTreeSet<String>,
) -> ZoneDiff {
    let live_ports: BTreeSet<Port> = live
        .fw
        .iter()
        .map(|a| Port { port: a.port.clone(), protocol: a.protocol.clone() })
        .filter(|p| !is_ignored(p, ignore))
        .collect();
    let desired_ports: BTreeSet<Port> = desired
        .ports
        .iter()
        .filter(|p| !is_ignored(p, ignore))
        .cloned()
        .collect();
    let (add_ports, remove_ports) = add_and_remove(&live_ports, &desired_ports);

    let live_sources: BTreeSet<String> = live.sources.iter().cloned().collect();
    let (add_sources, remove_sources) =
        add_and_remove(&live_sources, &desired.sources);

    let live_ifaces: BTreeSet<String> =
        live.interfaces.iter().cloned().collect();
    let (add_interfaces, remove_interfaces) =
        add_and_remove(&live_ifaces, &desired.interfaces);

    let set_target = match (&desired.target, &live.target) {
        (Some(want), Some(have)) if want == have => None,
        (Some(want), _) => Some(want.clone()),
        (None, _) => None,
    };

    ZoneDiff {
        create_zone: !exists,
        add_interfaces,
        remove_interfaces,
        add_sources,
        remove_sources,
        add_ports,
        remove_ports,
        set_target,
    }
}

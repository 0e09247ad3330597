// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queries and drives `firewalld` through `firewall-cmd`.

use crate::diff::{diff_zone, ZoneDiff};
use crate::{
    Allowed, FirewallError, FirewallPolicy, Port, Service, ZoneDesc,
};

use async_trait::async_trait;
use camino::Utf8Path;
use fleet_common::contract::ensure_siblings;
use fleet_common::{EnsureAction, EnsureOutcome, MultiError};
use itertools::Itertools;
use remote_machine::{ExecutionError, RemoteMachine};
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};
use std::collections::BTreeSet;

const FIREWALL_CMD: &str = "firewall-cmd";
const OS_RELEASE: &str = "/etc/os-release";

/// Operating system family of a node, as far as the firewall cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystem {
    CentOS,
    Fedora,
    Rhel,
    Ubuntu,
    Unknown,
}

impl OperatingSystem {
    /// Classifies the contents of `/etc/os-release`.
    pub fn from_os_release(contents: &str) -> OperatingSystem {
        let id = contents
            .lines()
            .filter_map(|line| line.strip_prefix("ID="))
            .map(|v| v.trim().trim_matches('"').to_ascii_lowercase())
            .next();
        match id.as_deref() {
            Some("centos") => OperatingSystem::CentOS,
            Some("fedora") => OperatingSystem::Fedora,
            Some("rhel") | Some("rocky") | Some("almalinux") => {
                OperatingSystem::Rhel
            }
            Some("ubuntu") | Some("debian") => OperatingSystem::Ubuntu,
            _ => OperatingSystem::Unknown,
        }
    }

    /// Reads and classifies the machine's `/etc/os-release`.
    pub async fn detect(
        machine: &dyn RemoteMachine,
    ) -> Result<OperatingSystem, ExecutionError> {
        let contents = machine.read_file(Utf8Path::new(OS_RELEASE)).await?;
        Ok(Self::from_os_release(&String::from_utf8_lossy(&contents)))
    }

    pub fn uses_firewalld(self) -> bool {
        matches!(
            self,
            OperatingSystem::CentOS
                | OperatingSystem::Fedora
                | OperatingSystem::Rhel
        )
    }
}

/// Plans firewall convergence for one machine.
#[async_trait]
pub trait FirewallEnsurer: Send + Sync {
    /// Reads live state once per desired zone and returns the plan.
    ///
    /// Every zone is evaluated even if another zone's query fails; all
    /// failures are returned together.
    async fn query(
        &self,
        log: &Logger,
        machine: &dyn RemoteMachine,
        desired: &FirewallPolicy,
    ) -> Result<FirewallPlan, MultiError<FirewallError>>;
}

/// Returns the ensurer appropriate for `os`.
pub fn ensurer(
    os: OperatingSystem,
    ignore: BTreeSet<String>,
) -> Box<dyn FirewallEnsurer> {
    if os.uses_firewalld() {
        Box::new(Firewalld::new(ignore))
    } else {
        Box::new(NoopEnsurer)
    }
}

/// Leaves the firewall alone; used on systems without firewalld.
#[derive(Debug, Default)]
pub struct NoopEnsurer;

#[async_trait]
impl FirewallEnsurer for NoopEnsurer {
    async fn query(
        &self,
        log: &Logger,
        _machine: &dyn RemoteMachine,
        _desired: &FirewallPolicy,
    ) -> Result<FirewallPlan, MultiError<FirewallError>> {
        debug!(log, "firewall is not managed on this operating system");
        Ok(FirewallPlan::default())
    }
}

/// The firewalld-backed ensurer.
#[derive(Debug, Default)]
pub struct Firewalld {
    ignore: BTreeSet<String>,
}

impl Firewalld {
    /// `ignore` lists ports (`22/tcp` or `22`) which are never opened or
    /// closed.
    pub fn new(ignore: BTreeSet<String>) -> Firewalld {
        Firewalld { ignore }
    }

    async fn query_zone(
        &self,
        machine: &dyn RemoteMachine,
        zone: &str,
        exists: bool,
    ) -> Result<ZoneDesc, FirewallError> {
        let mut current =
            ZoneDesc { name: zone.to_string(), ..Default::default() };
        if !exists {
            return Ok(current);
        }

        let list = |arg: &'static str| async move {
            let cmd = format!(
                "{FIREWALL_CMD} --permanent --zone={} {arg}",
                quote(zone)
            );
            machine.execute(None, &cmd).await.map_err(|err| {
                FirewallError::Query { zone: zone.to_string(), err }
            })
        };

        current.interfaces = fields(&list("--list-interfaces").await?);
        current.sources = fields(&list("--list-sources").await?);
        current.services = fields(&list("--list-services").await?)
            .into_iter()
            .map(|name| Service { name })
            .collect();
        current.fw = fields(&list("--list-ports").await?)
            .iter()
            .filter_map(|p| Port::parse(p))
            .map(|p| Allowed::from(&p))
            .collect();
        let target = list("--get-target").await?;
        let target = target.trim();
        if !target.is_empty() {
            current.target = Some(target.to_string());
        }
        Ok(current)
    }
}

#[async_trait]
impl FirewallEnsurer for Firewalld {
    async fn query(
        &self,
        log: &Logger,
        machine: &dyn RemoteMachine,
        desired: &FirewallPolicy,
    ) -> Result<FirewallPlan, MultiError<FirewallError>> {
        let mut errors = MultiError::new();
        if desired.zones.is_empty() {
            return Ok(FirewallPlan::default());
        }

        let zones_cmd = format!("{FIREWALL_CMD} --permanent --get-zones");
        let known: BTreeSet<String> =
            match machine.execute(None, &zones_cmd).await {
                Ok(out) => fields(&out).into_iter().collect(),
                Err(err) => {
                    errors.push(FirewallError::Query {
                        zone: "*".to_string(),
                        err,
                    });
                    return Err(errors);
                }
            };

        let mut plan = FirewallPlan::default();
        for (name, policy) in &desired.zones {
            let log = log.new(o!("zone" => name.clone()));
            let exists = known.contains(name);
            let current = match self.query_zone(machine, name, exists).await {
                Ok(current) => current,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };

            let diff = diff_zone(&current, exists, policy, &self.ignore);
            debug!(
                log,
                "firewall changes determined";
                "open" => diff.add_ports.iter().join(";"),
                "close" => diff.remove_ports.iter().join(";"),
            );
            if !diff.is_empty() {
                plan.actions.push(ZoneAction { zone: name.clone(), diff });
            }
            plan.current.push(current);
        }

        errors.into_result().map(|()| plan)
    }
}

/// Everything needed to converge one machine's firewall.
#[derive(Debug, Clone, Default)]
pub struct FirewallPlan {
    /// Observed zones, sorted by name.
    pub current: Vec<ZoneDesc>,
    /// One action per zone which needs changes.
    pub actions: Vec<ZoneAction>,
}

#[async_trait]
impl EnsureAction for FirewallPlan {
    type Target = dyn RemoteMachine;
    type Error = MultiError<FirewallError>;

    fn is_noop(&self) -> bool {
        self.actions.iter().all(|a| a.is_noop())
    }

    async fn ensure(
        &self,
        log: &Logger,
        machine: &Self::Target,
    ) -> Result<EnsureOutcome, Self::Error> {
        if self.is_noop() {
            debug!(log, "Not changing firewall");
            return Ok(EnsureOutcome::DONE);
        }
        info!(log, "Ensuring firewall"; "zones" => self.actions.len());
        ensure_siblings(log, &self.actions, machine).await
    }
}

/// One remediation command and what it is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub description: &'static str,
    pub command: String,
}

/// The remediation for a single zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneAction {
    pub zone: String,
    pub diff: ZoneDiff,
}

impl ZoneAction {
    /// The exact commands the action runs, in order.
    ///
    /// Within each category removals come before additions, and the daemon
    /// is reloaded once after each category that changed.
    pub fn steps(&self) -> Vec<Step> {
        if self.diff.is_empty() {
            return Vec::new();
        }

        let zone = quote(&self.zone);
        let mut steps = vec![
            Step {
                description: "enabling firewalld",
                command: "systemctl enable firewalld".to_string(),
            },
            Step {
                description: "starting firewalld",
                command: "systemctl start firewalld".to_string(),
            },
        ];

        let d = &self.diff;
        if d.create_zone {
            // --new-zone cannot be combined with --zone.
            steps.push(Step {
                description: "creating zone",
                command: format!(
                    "{FIREWALL_CMD} --permanent --new-zone={zone}"
                ),
            });
            steps.push(reload());
        }

        let mut category = |changes: Vec<(&'static str, String)>| {
            let mut changed = false;
            for (description, change) in changes {
                if change.is_empty() {
                    continue;
                }
                steps.push(Step {
                    description,
                    command: format!(
                        "{FIREWALL_CMD} --permanent --zone={zone} {change}"
                    ),
                });
                changed = true;
            }
            if changed {
                steps.push(reload());
            }
        };

        category(vec![
            (
                "removing interfaces",
                args("--remove-interface", &d.remove_interfaces),
            ),
            (
                "adding interfaces",
                args("--change-interface", &d.add_interfaces),
            ),
        ]);
        category(vec![(
            "setting target",
            d.set_target
                .as_ref()
                .map(|t| format!("--set-target={}", quote(t)))
                .unwrap_or_default(),
        )]);
        category(vec![
            ("removing sources", args("--remove-source", &d.remove_sources)),
            ("adding sources", args("--add-source", &d.add_sources)),
        ]);
        category(vec![
            ("closing ports", args("--remove-port", &d.remove_ports)),
            ("opening ports", args("--add-port", &d.add_ports)),
        ]);

        steps
    }

    pub fn commands(&self) -> Vec<String> {
        self.steps().into_iter().map(|s| s.command).collect()
    }
}

#[async_trait]
impl EnsureAction for ZoneAction {
    type Target = dyn RemoteMachine;
    type Error = FirewallError;

    fn is_noop(&self) -> bool {
        self.diff.is_empty()
    }

    async fn ensure(
        &self,
        log: &Logger,
        machine: &Self::Target,
    ) -> Result<EnsureOutcome, FirewallError> {
        let log = log.new(o!("zone" => self.zone.clone()));
        for step in self.steps() {
            debug!(log, "{} in zone {}", step.description, self.zone);
            machine.execute(None, &step.command).await.map_err(|err| {
                FirewallError::Apply {
                    zone: self.zone.clone(),
                    step: step.description.to_string(),
                    err,
                }
            })?;
        }
        info!(log, "firewall zone ensured");
        Ok(EnsureOutcome::DONE)
    }
}

fn reload() -> Step {
    Step {
        description: "reloading firewalld",
        command: format!("{FIREWALL_CMD} --reload"),
    }
}

fn fields(out: &str) -> Vec<String> {
    out.split_whitespace().map(str::to_string).collect()
}

fn args<T: std::fmt::Display>(flag: &str, values: &[T]) -> String {
    values
        .iter()
        .map(|v| format!("{flag}={}", quote(&v.to_string())))
        .join(" ")
}

/// Quotes `s` for `/bin/sh` unless it is made only of characters that never
/// need quoting.
fn quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '-' | '_' | '.' | '/' | ':')
        });
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Port, ZonePolicy};
    use fleet_test_utils::dev::test_setup_log;
    use remote_machine::{FakeMachine, FakeOutput};
    use std::net::Ipv4Addr;

    /// Answers `firewall-cmd` queries for a machine with a single "public"
    /// zone holding eth0, 10.0.0.0/8, ssh, and 22/tcp + 80/tcp.
    fn public_zone(cmd: &str) -> FakeOutput {
        if cmd.ends_with("--get-zones") {
            return FakeOutput::stdout("block drop public trusted\n");
        }
        if !cmd.contains("--zone=public ") {
            return FakeOutput::success();
        }
        let out = if cmd.ends_with("--list-interfaces") {
            "eth0\n"
        } else if cmd.ends_with("--list-sources") {
            "10.0.0.0/8\n"
        } else if cmd.ends_with("--list-services") {
            "ssh dhcpv6-client\n"
        } else if cmd.ends_with("--list-ports") {
            "22/tcp 80/tcp\n"
        } else if cmd.ends_with("--get-target") {
            "default\n"
        } else {
            ""
        };
        FakeOutput::stdout(out)
    }

    fn public_policy(ports: &[Port]) -> FirewallPolicy {
        let mut policy = FirewallPolicy::default();
        policy.zones.insert(
            "public".to_string(),
            ZonePolicy {
                ports: ports.iter().cloned().collect(),
                sources: ["10.0.0.0/8".to_string()].into_iter().collect(),
                interfaces: ["eth0".to_string()].into_iter().collect(),
                target: None,
            },
        );
        policy
    }

    #[test]
    fn test_os_release_detection() {
        let centos =
            "NAME=\"CentOS Linux\"\nID=\"centos\"\nVERSION_ID=\"7\"\n";
        assert_eq!(
            OperatingSystem::from_os_release(centos),
            OperatingSystem::CentOS
        );
        assert_eq!(
            OperatingSystem::from_os_release("ID=ubuntu\nID_LIKE=debian\n"),
            OperatingSystem::Ubuntu
        );
        assert_eq!(
            OperatingSystem::from_os_release("NAME=unknown"),
            OperatingSystem::Unknown
        );
        assert!(OperatingSystem::CentOS.uses_firewalld());
        assert!(!OperatingSystem::Ubuntu.uses_firewalld());
    }

    #[tokio::test]
    async fn test_converged_zone_changes_nothing() {
        let logctx = test_setup_log("test_converged_zone_changes_nothing");
        let machine =
            FakeMachine::new(&logctx.log, "node-0", Ipv4Addr::LOCALHOST.into());
        machine.set_execute_handler(Box::new(public_zone));

        let desired = public_policy(&[Port::tcp("22"), Port::tcp("80")]);
        let plan = Firewalld::default()
            .query(&logctx.log, &*machine, &desired)
            .await
            .unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.current.len(), 1);
        assert_eq!(plan.current[0].services.len(), 2);

        let queries = machine.commands().len();
        assert_eq!(
            plan.ensure(&logctx.log, &*machine).await.unwrap(),
            EnsureOutcome::DONE
        );
        // Ensuring a no-op plan runs nothing, not even systemctl.
        assert_eq!(machine.commands().len(), queries);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_removals_come_before_additions() {
        let logctx = test_setup_log("test_removals_come_before_additions");
        let machine =
            FakeMachine::new(&logctx.log, "node-0", Ipv4Addr::LOCALHOST.into());
        machine.set_execute_handler(Box::new(public_zone));

        let desired = public_policy(&[Port::tcp("22"), Port::tcp("443")]);
        let plan = Firewalld::default()
            .query(&logctx.log, &*machine, &desired)
            .await
            .unwrap();
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(
            plan.actions[0].commands(),
            vec![
                "systemctl enable firewalld",
                "systemctl start firewalld",
                "firewall-cmd --permanent --zone=public --remove-port=80/tcp",
                "firewall-cmd --permanent --zone=public --add-port=443/tcp",
                "firewall-cmd --reload",
            ]
        );

        let queries = machine.commands().len();
        let outcome = plan.ensure(&logctx.log, &*machine).await.unwrap();
        assert!(outcome.done);
        assert_eq!(
            machine.commands()[queries..].to_vec(),
            plan.actions[0].commands()
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_ignored_ports_are_left_alone() {
        let logctx = test_setup_log("test_ignored_ports_are_left_alone");
        let machine =
            FakeMachine::new(&logctx.log, "node-0", Ipv4Addr::LOCALHOST.into());
        machine.set_execute_handler(Box::new(public_zone));

        // 22/tcp is live but not desired.
        let desired = public_policy(&[Port::tcp("80")]);
        let ignore = ["22/tcp".to_string()].into_iter().collect();
        let plan = ensurer(OperatingSystem::CentOS, ignore)
            .query(&logctx.log, &*machine, &desired)
            .await
            .unwrap();
        assert!(plan.is_noop(), "{plan:?}");

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_missing_zone_is_created_first() {
        let logctx = test_setup_log("test_missing_zone_is_created_first");
        let machine =
            FakeMachine::new(&logctx.log, "node-0", Ipv4Addr::LOCALHOST.into());
        machine.set_execute_handler(Box::new(public_zone));

        let mut desired = FirewallPolicy::default();
        let zone = desired.zones.entry("internal".to_string()).or_default();
        zone.sources.insert("192.168.1.0/24".to_string());
        zone.target = Some("ACCEPT".to_string());

        let plan = Firewalld::default()
            .query(&logctx.log, &*machine, &desired)
            .await
            .unwrap();
        // A zone the daemon does not know is never listed.
        assert!(!machine
            .commands()
            .iter()
            .any(|c| c.contains("--zone=internal")));
        assert_eq!(
            plan.actions[0].commands(),
            vec![
                "systemctl enable firewalld",
                "systemctl start firewalld",
                "firewall-cmd --permanent --new-zone=internal",
                "firewall-cmd --reload",
                "firewall-cmd --permanent --zone=internal --set-target=ACCEPT",
                "firewall-cmd --reload",
                "firewall-cmd --permanent --zone=internal \
                 --add-source=192.168.1.0/24",
                "firewall-cmd --reload",
            ]
        );

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failing_zone_does_not_hide_others() {
        let logctx = test_setup_log("test_failing_zone_does_not_hide_others");
        let machine =
            FakeMachine::new(&logctx.log, "node-0", Ipv4Addr::LOCALHOST.into());
        machine.set_execute_handler(Box::new(|cmd| {
            if cmd.ends_with("--get-zones") {
                FakeOutput::stdout("public trusted")
            } else if cmd.contains("--zone=trusted ") {
                FakeOutput::failure(1, "INVALID_ZONE")
            } else {
                FakeOutput::success()
            }
        }));

        let mut desired = FirewallPolicy::default();
        desired.zones.insert("public".to_string(), ZonePolicy::default());
        desired.zones.insert("trusted".to_string(), ZonePolicy::default());

        let errors = Firewalld::default()
            .query(&logctx.log, &*machine, &desired)
            .await
            .expect_err("trusted cannot be listed");
        assert_eq!(errors.len(), 1);
        match &errors.errors()[0] {
            FirewallError::Query { zone, .. } => assert_eq!(zone, "trusted"),
            other => panic!("unexpected error {other:?}"),
        }
        // "public" was still fully queried.
        assert!(machine
            .commands()
            .iter()
            .any(|c| c.contains("--zone=public --get-target")));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_apply_failure_names_the_step() {
        let logctx = test_setup_log("test_apply_failure_names_the_step");
        let machine =
            FakeMachine::new(&logctx.log, "node-0", Ipv4Addr::LOCALHOST.into());
        machine.set_execute_handler(Box::new(|cmd| {
            if cmd.starts_with("systemctl start") {
                FakeOutput::failure(5, "unit not found")
            } else {
                FakeOutput::success()
            }
        }));

        let action = ZoneAction {
            zone: "public".to_string(),
            diff: ZoneDiff {
                add_ports: vec![Port::tcp("6443")],
                ..Default::default()
            },
        };
        let err = action
            .ensure(&logctx.log, &*machine)
            .await
            .expect_err("firewalld cannot start");
        match err {
            FirewallError::Apply { zone, step, err } => {
                assert_eq!(zone, "public");
                assert_eq!(step, "starting firewalld");
                assert_eq!(err.exit_status(), Some(5));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Nothing after the failing step ran.
        assert_eq!(machine.commands().len(), 2);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_noop_ensurer_plans_nothing() {
        let logctx = test_setup_log("test_noop_ensurer_plans_nothing");
        let machine =
            FakeMachine::new(&logctx.log, "node-0", Ipv4Addr::LOCALHOST.into());
        let plan = ensurer(OperatingSystem::Ubuntu, BTreeSet::new())
            .query(&logctx.log, &*machine, &public_policy(&[]))
            .await
            .unwrap();
        assert!(plan.is_noop());
        assert!(machine.calls().is_empty());
        logctx.cleanup_successful();
    }
}

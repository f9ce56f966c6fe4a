//! ST-017: Host and fleet orchestration.
//!
//! A host run is: prepare the cache group, list the cache once, then run
//! every task in order on the runner. Hosts are independent; a failing host
//! never cancels the others.

use super::compiler::CompiledTask;
use super::error::{ProvisionError, TransportError};
use super::inventory::build_inventory;
use super::prepare::prepare_host;
use super::runner::{classify, RunCounts, Runner, TaskPlan};
use super::types::Settings;
use crate::events::{Event, EventBus, EventKind};
use crate::transport::Target;

/// Outcome of one host.
#[derive(Debug, Clone)]
pub struct HostReport {
    pub host: String,
    pub counts: RunCounts,
    pub error: Option<ProvisionError>,
}

/// Outcome of every host, in input order.
#[derive(Debug, Clone, Default)]
pub struct FleetReport {
    pub hosts: Vec<HostReport>,
}

impl FleetReport {
    pub fn totals(&self) -> RunCounts {
        let mut totals = RunCounts::default();
        for report in &self.hosts {
            totals += report.counts;
        }
        totals
    }

    pub fn failed(&self) -> usize {
        self.hosts.iter().filter(|h| h.error.is_some()).count()
    }

    /// Totals, or every host error aggregated.
    pub fn into_result(self) -> Result<RunCounts, ProvisionError> {
        let totals = self.totals();
        let total = self.hosts.len();
        let failures: Vec<(String, ProvisionError)> = self
            .hosts
            .into_iter()
            .filter_map(|h| h.error.map(|e| (h.host, e)))
            .collect();
        if failures.is_empty() {
            Ok(totals)
        } else {
            Err(ProvisionError::Fleet { total, failures })
        }
    }
}

pub struct Provisioner<'a> {
    settings: &'a Settings,
    bus: Option<&'a EventBus>,
}

impl<'a> Provisioner<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: &'a EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    fn publish(&self, host: &str, kind: EventKind) {
        if let Some(bus) = self.bus {
            bus.publish(Event::new(Some(host), kind));
        }
    }

    /// Provision one host. Stops at the first failure; markers of commands
    /// that completed stay on the target.
    pub fn provision_host(
        &self,
        host: &str,
        target: &dyn Target,
        tasks: &[CompiledTask],
    ) -> Result<RunCounts, ProvisionError> {
        log::info!("{host}: provisioning {} task(s) via {}", tasks.len(), target.address());
        self.publish(
            host,
            EventKind::HostStarted {
                tasks: tasks.len(),
                dry_run: false,
            },
        );

        let mut counts = RunCounts::default();
        let result = self.run_host(host, target, tasks, &mut counts);

        self.publish(
            host,
            EventKind::HostFinished {
                executed: counts.executed,
                cached: counts.cached,
                invalidated: counts.invalidated,
                error: result.as_ref().err().map(ToString::to_string),
            },
        );
        match &result {
            Ok(()) => log::info!(
                "{host}: done ({} executed, {} cached, {} invalidated)",
                counts.executed,
                counts.cached,
                counts.invalidated
            ),
            Err(e) => log::error!("{host}: {e}"),
        }
        result.map(|()| counts)
    }

    fn run_host(
        &self,
        host: &str,
        target: &dyn Target,
        tasks: &[CompiledTask],
        counts: &mut RunCounts,
    ) -> Result<(), ProvisionError> {
        if self.settings.manage_group {
            prepare_host(target, self.settings)?;
        }
        let mut inventory = build_inventory(target, &self.settings.cache_root)?;
        let runner = Runner::new(host, target, self.settings, self.bus);
        for task in tasks {
            *counts += runner.run_task(task, &mut inventory)?;
        }
        Ok(())
    }

    /// Dry run: classify every task against the live inventory without
    /// changing anything on the target.
    pub fn plan_host(
        &self,
        host: &str,
        target: &dyn Target,
        tasks: &[CompiledTask],
    ) -> Result<Vec<TaskPlan>, ProvisionError> {
        self.publish(
            host,
            EventKind::HostStarted {
                tasks: tasks.len(),
                dry_run: true,
            },
        );
        let inventory = build_inventory(target, &self.settings.cache_root)?;
        Ok(tasks
            .iter()
            .map(|task| classify(task, &inventory.get(&task.name)))
            .collect())
    }

    /// Provision every host. Concurrent when `parallel_hosts` is set.
    pub fn provision_fleet(
        &self,
        hosts: &[(String, Box<dyn Target>)],
        tasks: &[CompiledTask],
    ) -> FleetReport {
        let run = |host: &str, target: &dyn Target| {
            let (counts, error) = match self.provision_host(host, target, tasks) {
                Ok(counts) => (counts, None),
                Err(e) => (RunCounts::default(), Some(e)),
            };
            HostReport {
                host: host.to_string(),
                counts,
                error,
            }
        };

        if !self.settings.parallel_hosts || hosts.len() < 2 {
            return FleetReport {
                hosts: hosts
                    .iter()
                    .map(|(host, target)| run(host, target.as_ref()))
                    .collect(),
            };
        }

        let run = &run;
        let reports = std::thread::scope(|s| {
            let handles: Vec<_> = hosts
                .iter()
                .map(|(host, target)| (host, s.spawn(move || run(host, target.as_ref()))))
                .collect();
            handles
                .into_iter()
                .map(|(host, handle)| {
                    handle.join().unwrap_or_else(|_| HostReport {
                        host: host.clone(),
                        counts: RunCounts::default(),
                        error: Some(ProvisionError::Transport(TransportError::Io(
                            "host thread panicked".to_string(),
                        ))),
                    })
                })
                .collect()
        });
        FleetReport { hosts: reports }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::CompiledCommand;
    use crate::core::runner::Action;
    use crate::core::types::Elevation;
    use crate::transport::{capture, LocalTarget};

    fn task(name: &str, shells: &[&str]) -> CompiledTask {
        CompiledTask {
            name: name.to_string(),
            commands: shells
                .iter()
                .map(|s| CompiledCommand::new(*s, *s))
                .collect(),
        }
    }

    fn settings(root: &std::path::Path) -> Settings {
        Settings {
            cache_root: root.join("cache").to_string_lossy().to_string(),
            elevation: Elevation::Never,
            manage_group: false,
            ..Settings::default()
        }
    }

    fn list_markers(root: &std::path::Path, task: &str) -> Vec<String> {
        let dir = root.join("cache").join(task);
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .filter(|n| n.ends_with(".done"))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn test_st017_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("count");
        let settings = settings(dir.path());
        let target = LocalTarget::new();
        let bump = format!("echo x >> {}", out.display());
        let tasks = vec![task("a", &[&bump, "true"]), task("b", &[&bump])];

        let p = Provisioner::new(&settings);
        let first = p.provision_host("local", &target, &tasks).unwrap();
        assert_eq!(first.executed, 3);
        let second = p.provision_host("local", &target, &tasks).unwrap();
        assert_eq!(second.executed, 0);
        assert_eq!(second.cached, 3);
        assert_eq!(std::fs::read_to_string(&out).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_st017_edit_resumes_from_change() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let target = LocalTarget::new();
        let p = Provisioner::new(&settings);

        let before = task("t", &["echo c0", "echo c1", "echo c2"]);
        p.provision_host("local", &target, std::slice::from_ref(&before))
            .unwrap();
        let after = task("t", &["echo c0", "echo c3"]);
        let counts = p
            .provision_host("local", &target, std::slice::from_ref(&after))
            .unwrap();
        assert_eq!(counts.cached, 1);
        assert_eq!(counts.executed, 1);
        assert_eq!(counts.invalidated, 2);

        let mut expect: Vec<String> = after
            .checksums()
            .into_iter()
            .map(|cs| format!("{cs}.done"))
            .collect();
        expect.sort();
        assert_eq!(list_markers(dir.path(), "t"), expect);
    }

    #[test]
    fn test_st017_failure_then_rerun_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let target = LocalTarget::new();
        let p = Provisioner::new(&settings);
        let flag = dir.path().join("ok");
        let gate = format!("test -e {}", flag.display());
        let tasks = vec![task("t", &["true", &gate, "true"]), task("u", &["true"])];

        let err = p.provision_host("local", &target, &tasks).unwrap_err();
        assert!(matches!(err, ProvisionError::CommandFailed { index: 1, .. }));
        assert!(list_markers(dir.path(), "u").is_empty());

        std::fs::write(&flag, "").unwrap();
        let counts = p.provision_host("local", &target, &tasks).unwrap();
        assert_eq!(counts.cached, 1);
        assert_eq!(counts.executed, 3);
    }

    #[test]
    fn test_st017_plan_matches_apply_and_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let target = LocalTarget::new();
        let p = Provisioner::new(&settings);

        let tasks = vec![task("t", &["echo a", "echo b"])];
        let plans = p.plan_host("local", &target, &tasks).unwrap();
        assert_eq!(plans[0].to_execute(), 2);
        assert!(!dir.path().join("cache").exists());

        p.provision_host("local", &target, &tasks).unwrap();
        let edited = vec![task("t", &["echo a", "echo B"])];
        let plans = p.plan_host("local", &target, &edited).unwrap();
        let actions: Vec<_> = plans[0].commands.iter().map(|c| c.action).collect();
        assert_eq!(actions, [Action::Cached, Action::Execute]);
        assert_eq!(plans[0].stale.len(), 1);

        // still the markers of the applied version
        let mut expect: Vec<String> = tasks[0]
            .checksums()
            .into_iter()
            .map(|cs| format!("{cs}.done"))
            .collect();
        expect.sort();
        assert_eq!(list_markers(dir.path(), "t"), expect);
    }

    #[test]
    fn test_st017_corrupt_inventory_aborts_host() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let bad = dir.path().join("cache/t");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("garbage.done"), "").unwrap();

        let p = Provisioner::new(&settings);
        let err = p
            .provision_host("local", &LocalTarget::new(), &[task("t", &["true"])])
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Inventory(_)));
    }

    #[test]
    fn test_st017_host_events() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let bus = EventBus::new();
        let sub = bus.subscribe("host.", 16);
        let p = Provisioner::new(&settings).with_bus(&bus);
        p.provision_host("web1", &LocalTarget::new(), &[task("t", &["true"])])
            .unwrap();

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].category(), "host.started");
        assert_eq!(events[0].host.as_deref(), Some("web1"));
        match &events[1].kind {
            EventKind::HostFinished {
                executed, error, ..
            } => {
                assert_eq!(*executed, 1);
                assert!(error.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_st017_fleet_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        let bad = dir.path().join("bad");
        std::fs::create_dir_all(&good).unwrap();
        std::fs::create_dir_all(&bad).unwrap();
        // a file where the cache root should be
        std::fs::write(bad.join("cache"), "").unwrap();

        let tasks = vec![task("t", &["true"])];
        let good_settings = settings(&good);
        let hosts: Vec<(String, Box<dyn Target>)> = vec![
            ("a".to_string(), Box::new(LocalTarget::new())),
            ("b".to_string(), Box::new(LocalTarget::new())),
        ];
        let good_report = Provisioner::new(&good_settings).provision_fleet(&hosts, &tasks);
        assert_eq!(good_report.failed(), 0);
        assert_eq!(good_report.hosts[0].host, "a");

        let bad_settings = settings(&bad);
        let hosts: Vec<(String, Box<dyn Target>)> =
            vec![("c".to_string(), Box::new(LocalTarget::new()))];
        let report = Provisioner::new(&bad_settings).provision_fleet(&hosts, &tasks);
        assert_eq!(report.failed(), 1);
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().starts_with("1 of 1 host(s) failed"));
    }

    #[test]
    fn test_st017_sequential_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            parallel_hosts: false,
            ..settings(dir.path())
        };
        let marker = dir.path().join("seq");
        let append = format!("echo run >> {}", marker.display());
        let hosts: Vec<(String, Box<dyn Target>)> = vec![
            ("one".to_string(), Box::new(LocalTarget::new())),
            ("two".to_string(), Box::new(LocalTarget::new())),
        ];
        let report = Provisioner::new(&settings).provision_fleet(&hosts, &[task("t", &[&append])]);
        let totals = report.into_result().unwrap();
        // same cache root: the second host finds the first host's marker
        assert_eq!(totals.executed, 1);
        assert_eq!(totals.cached, 1);
        let ran = capture(&LocalTarget::new(), &format!("wc -l < {}", marker.display())).unwrap();
        assert_eq!(ran.stdout.trim(), "1");
    }
}

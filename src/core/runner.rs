//! ST-007: Execution runner.
//!
//! Per task, commands are matched against the inventory in order. While the
//! cumulative checksums keep matching the task is SCANNING and commands are
//! skipped; the first miss makes it DIRTY and everything from there on runs.
//! Markers that were not matched are stale and get deleted, either when the
//! first command runs or when the task ends still SCANNING.

use super::checksum::ChecksumChain;
use super::compiler::CompiledTask;
use super::error::{ProvisionError, RelayError};
use super::inventory::Inventory;
use super::relay;
use super::types::Settings;
use crate::commands::quote;
use crate::events::eventlog::now_iso8601;
use crate::events::{Event, EventBus, EventKind, StreamOrigin};
use crate::transport::{capture, Target};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rustc_hash::FxHashSet;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::sync::mpsc::{self, Sender};
use std::time::Instant;

/// What happens to one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Cached,
    Execute,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cached => write!(f, "CACHED"),
            Self::Execute => write!(f, "EXECUTE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    pub index: usize,
    pub checksum: String,
    pub logging: String,
    pub action: Action,
}

/// Classification of one task against its inventory set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPlan {
    pub task: String,
    pub commands: Vec<PlannedCommand>,
    /// Markers that will be deleted, sorted
    pub stale: Vec<String>,
}

impl TaskPlan {
    pub fn to_execute(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| c.action == Action::Execute)
            .count()
    }

    pub fn cached(&self) -> usize {
        self.commands.len() - self.to_execute()
    }
}

/// Classify a task's commands against the checksums known for it.
pub fn classify(task: &CompiledTask, known: &FxHashSet<String>) -> TaskPlan {
    let mut remaining = known.clone();
    let mut chain = ChecksumChain::new();
    let mut scanning = true;
    let mut commands = Vec::with_capacity(task.commands.len());

    for (index, command) in task.commands.iter().enumerate() {
        let checksum = chain.push(&command.shell);
        let action = if scanning && remaining.remove(&checksum) {
            Action::Cached
        } else {
            scanning = false;
            Action::Execute
        };
        commands.push(PlannedCommand {
            index,
            checksum,
            logging: command.logging.clone(),
            action,
        });
    }

    let mut stale: Vec<String> = remaining.into_iter().collect();
    stale.sort_unstable();
    TaskPlan {
        task: task.name.clone(),
        commands,
        stale,
    }
}

/// Counts for one task or host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub executed: usize,
    pub cached: usize,
    pub invalidated: usize,
}

impl std::ops::AddAssign for RunCounts {
    fn add_assign(&mut self, other: Self) {
        self.executed += other.executed;
        self.cached += other.cached;
        self.invalidated += other.invalidated;
    }
}

/// Remote cache directory of a task.
pub fn task_dir(cache_root: &str, task: &str) -> String {
    format!("{}/{}", cache_root.trim_end_matches('/'), task)
}

/// Runs compiled tasks on one target.
pub struct Runner<'a> {
    host: &'a str,
    target: &'a dyn Target,
    settings: &'a Settings,
    bus: Option<&'a EventBus>,
    elevate: bool,
}

impl<'a> Runner<'a> {
    pub fn new(
        host: &'a str,
        target: &'a dyn Target,
        settings: &'a Settings,
        bus: Option<&'a EventBus>,
    ) -> Self {
        let elevate = settings.elevation.applies(target.user());
        Self {
            host,
            target,
            settings,
            bus,
            elevate,
        }
    }

    fn publish(&self, kind: EventKind) {
        if let Some(bus) = self.bus {
            bus.publish(Event::new(Some(self.host), kind));
        }
    }

    /// The shell actually sent to the target for a command.
    pub fn wrap(&self, shell: &str) -> String {
        let mut script = String::new();
        for (key, value) in &self.settings.env {
            script.push_str(&format!("export {key}={}; ", quote(value)));
        }
        script.push_str(shell);
        let wrapped = format!("bash -e -c {}", quote(&script));
        if self.elevate {
            format!("sudo -n -H {wrapped}")
        } else {
            wrapped
        }
    }

    /// Cache bookkeeping on the target. Runs as the login user; the cache
    /// root is group-writable.
    fn remote(&self, task: &str, action: &str, shell: &str) -> Result<(), ProvisionError> {
        let out = capture(self.target, shell)?;
        if !out.success() {
            return Err(ProvisionError::Remote {
                task: task.to_string(),
                action: action.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Run one task, consuming its inventory entry.
    pub fn run_task(
        &self,
        task: &CompiledTask,
        inventory: &mut Inventory,
    ) -> Result<RunCounts, ProvisionError> {
        let dir = task_dir(&self.settings.cache_root, &task.name);
        let qdir = quote(&dir);
        self.remote(
            &task.name,
            "create cache directory",
            &format!("test -d {qdir} || {{ mkdir -p {qdir} && chmod g+w {qdir}; }}"),
        )?;

        let plan = classify(task, &inventory.take(&task.name));
        let mut counts = RunCounts::default();
        let mut invalidated = false;

        for step in &plan.commands {
            match step.action {
                Action::Cached => {
                    log::debug!("[{}] {} #{} cached", self.host, task.name, step.index);
                    counts.cached += 1;
                    self.publish(EventKind::CommandCached {
                        task: task.name.clone(),
                        index: step.index,
                        checksum: step.checksum.clone(),
                        logging: step.logging.clone(),
                    });
                }
                Action::Execute => {
                    if !invalidated {
                        counts.invalidated = self.invalidate(&task.name, &dir, &plan.stale)?;
                        invalidated = true;
                    }
                    let command = &task.commands[step.index];
                    self.execute(&task.name, &dir, step, &command.shell)?;
                    counts.executed += 1;
                }
            }
        }

        if !invalidated {
            counts.invalidated = self.invalidate(&task.name, &dir, &plan.stale)?;
        }
        Ok(counts)
    }

    /// Delete stale markers in one command.
    fn invalidate(
        &self,
        task: &str,
        dir: &str,
        stale: &[String],
    ) -> Result<usize, ProvisionError> {
        if stale.is_empty() {
            return Ok(0);
        }
        let files = stale
            .iter()
            .map(|cs| quote(&format!("{dir}/{cs}.done")))
            .collect::<Vec<_>>()
            .join(" ");
        self.remote(task, "delete stale markers", &format!("rm -f {files}"))?;
        log::debug!("[{}] {} invalidated {} marker(s)", self.host, task, stale.len());
        self.publish(EventKind::CacheInvalidated {
            task: task.to_string(),
            checksums: stale.to_vec(),
        });
        Ok(stale.len())
    }

    fn execute(
        &self,
        task: &str,
        dir: &str,
        step: &PlannedCommand,
        shell: &str,
    ) -> Result<(), ProvisionError> {
        log::debug!("[{}] {} #{} {}", self.host, task, step.index, step.logging);
        self.publish(EventKind::CommandExecStart {
            task: task.to_string(),
            index: step.index,
            checksum: step.checksum.clone(),
            logging: step.logging.clone(),
        });

        let started = Instant::now();
        let streamed = self.stream(task, dir, &step.checksum, shell);
        self.publish(EventKind::CommandExecFinished {
            task: task.to_string(),
            index: step.index,
            checksum: step.checksum.clone(),
            exit_code: *streamed.as_ref().unwrap_or(&-1),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            error: streamed.as_ref().err().map(ToString::to_string),
        });

        let encoded = STANDARD.encode(shell.as_bytes());
        let marker = |ext: &str| quote(&format!("{dir}/{}.{ext}", step.checksum));
        let failed = || {
            if let Err(e) = self.remote(
                task,
                "write failure marker",
                &format!("printf '%s' {encoded} | base64 -d > {}", marker("failed")),
            ) {
                log::warn!("[{}] {e}", self.host);
            }
        };
        let exit_code = match streamed {
            Ok(code) => code,
            Err(e) => {
                failed();
                return Err(e);
            }
        };
        if exit_code == 0 {
            self.remote(
                task,
                "write success marker",
                &format!(
                    "printf '%s' {encoded} | base64 -d > {} && rm -f {}",
                    marker("done"),
                    marker("failed")
                ),
            )?;
            return Ok(());
        }

        failed();
        Err(ProvisionError::CommandFailed {
            task: task.to_string(),
            index: step.index,
            checksum: step.checksum.clone(),
            exit_code,
        })
    }

    /// Start the command, fan its output out to events and the log relay,
    /// and return its exit code. Joins: readers, then the process, then the
    /// relay.
    fn stream(
        &self,
        task: &str,
        dir: &str,
        checksum: &str,
        shell: &str,
    ) -> Result<i32, ProvisionError> {
        let mut process = self.target.command(&self.wrap(shell))?;
        process.start()?;
        // nothing is fed to user commands; an open pipe would block readers
        drop(process.take_stdin());
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();
        let (tx, rx) = mpsc::channel::<String>();

        let (exit_code, relayed) = std::thread::scope(|s| {
            let relay = s.spawn(move || relay::relay_log(self.target, dir, checksum, rx));
            let out = {
                let tx = tx.clone();
                s.spawn(move || self.pump(stdout, StreamOrigin::Stdout, &tx, task, checksum))
            };
            let err = s.spawn(move || self.pump(stderr, StreamOrigin::Stderr, &tx, task, checksum));
            let _ = out.join();
            let _ = err.join();
            let exit_code = process.wait();
            let relayed = relay
                .join()
                .unwrap_or_else(|_| Err(RelayError::Write("log relay panicked".to_string())));
            (exit_code, relayed)
        });

        if let Err(e) = relayed {
            log::warn!("[{}] log relay for {task} {checksum}: {e}", self.host);
            self.publish(EventKind::LogRelayFailed {
                task: task.to_string(),
                checksum: checksum.to_string(),
                error: e.to_string(),
            });
        }
        Ok(exit_code?)
    }

    /// Forward lines of one stream until EOF. Invalid UTF-8 is replaced, not
    /// fatal, so the pipe is always drained.
    fn pump(
        &self,
        reader: Option<Box<dyn Read + Send>>,
        origin: StreamOrigin,
        relay: &Sender<String>,
        task: &str,
        checksum: &str,
    ) {
        let Some(reader) = reader else {
            return;
        };
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("[{}] {task} {origin} read failed: {e}", self.host);
                    // the child must never block on a full pipe
                    let _ = std::io::copy(&mut reader, &mut std::io::sink());
                    break;
                }
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            self.publish(EventKind::CommandStream {
                task: task.to_string(),
                checksum: checksum.to_string(),
                stream: origin,
                line: line.to_string(),
            });
            // a closed relay only loses the log
            let _ = relay.send(format!("{} [{origin}] {line}", now_iso8601()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::CompiledCommand;
    use crate::core::checksum::checksums;
    use crate::core::types::Elevation;
    use crate::transport::LocalTarget;
    use proptest::prelude::*;

    fn task(name: &str, shells: &[&str]) -> CompiledTask {
        CompiledTask {
            name: name.to_string(),
            commands: shells
                .iter()
                .map(|s| CompiledCommand::new(*s, *s))
                .collect(),
        }
    }

    fn known(sums: &[&String]) -> FxHashSet<String> {
        sums.iter().map(|s| (*s).clone()).collect()
    }

    #[test]
    fn test_st007_classify_fresh() {
        let t = task("t", &["a", "b"]);
        let plan = classify(&t, &FxHashSet::default());
        assert_eq!(plan.to_execute(), 2);
        assert!(plan.stale.is_empty());
    }

    #[test]
    fn test_st007_classify_all_cached() {
        let t = task("t", &["a", "b"]);
        let sums = checksums(["a", "b"]);
        let plan = classify(&t, &known(&[&sums[0], &sums[1]]));
        assert_eq!(plan.cached(), 2);
        assert!(plan.stale.is_empty());
    }

    #[test]
    fn test_st007_stale_cleanup() {
        // markers for c0 c1 c2, then command 1 changes: c0 cached, c1' runs
        let old = checksums(["c0", "c1", "c2"]);
        let t = task("t", &["c0", "c3"]);
        let plan = classify(&t, &known(&[&old[0], &old[1], &old[2]]));
        assert_eq!(plan.commands[0].action, Action::Cached);
        assert_eq!(plan.commands[1].action, Action::Execute);
        let mut expect = vec![old[1].clone(), old[2].clone()];
        expect.sort();
        assert_eq!(plan.stale, expect);
    }

    #[test]
    fn test_st007_leftovers_when_scanning() {
        let old = checksums(["a", "b", "c"]);
        let t = task("t", &["a", "b"]);
        let plan = classify(&t, &known(&[&old[0], &old[1], &old[2]]));
        assert_eq!(plan.to_execute(), 0);
        assert_eq!(plan.stale, vec![old[2].clone()]);
    }

    #[test]
    fn test_st007_dirty_never_returns_to_cached() {
        // a later checksum that happens to be known still runs once dirty
        let sums = checksums(["a", "b", "c"]);
        let t = task("t", &["a", "b", "c"]);
        let plan = classify(&t, &known(&[&sums[0], &sums[2]]));
        let actions: Vec<_> = plan.commands.iter().map(|c| c.action).collect();
        assert_eq!(actions, [Action::Cached, Action::Execute, Action::Execute]);
        assert_eq!(plan.stale, vec![sums[2].clone()]);
    }

    proptest! {
        #[test]
        fn test_st007_prefix_invalidation(
            cmds in prop::collection::vec("[a-z]{1,6}", 1..7),
            pick in any::<prop::sample::Index>(),
        ) {
            let k = pick.index(cmds.len());
            let shells: Vec<&str> = cmds.iter().map(String::as_str).collect();
            let sums = checksums(shells.iter().copied());
            let inventory: FxHashSet<String> = sums.iter().cloned().collect();

            let mut edited: Vec<String> = cmds.clone();
            edited[k].push('X');
            let edited_refs: Vec<&str> = edited.iter().map(String::as_str).collect();
            let plan = classify(&task("t", &edited_refs), &inventory);

            for c in &plan.commands {
                let expected = if c.index < k { Action::Cached } else { Action::Execute };
                prop_assert_eq!(c.action, expected);
            }
            prop_assert_eq!(plan.stale.len(), cmds.len() - k);
        }
    }

    fn local_settings(root: &std::path::Path) -> Settings {
        Settings {
            cache_root: root.to_string_lossy().to_string(),
            elevation: Elevation::Never,
            manage_group: false,
            ..Settings::default()
        }
    }

    #[test]
    fn test_st007_wrap() {
        let mut settings = Settings {
            elevation: Elevation::Always,
            ..Settings::default()
        };
        settings.env.insert("LANG".to_string(), "C.UTF-8".to_string());
        let target = LocalTarget::with_user("deploy");
        let runner = Runner::new("h", &target, &settings, None);
        assert_eq!(
            runner.wrap("echo hi"),
            "sudo -n -H bash -e -c 'export LANG=C.UTF-8; echo hi'"
        );

        let settings = Settings {
            elevation: Elevation::Auto,
            ..Settings::default()
        };
        let root = LocalTarget::with_user("root");
        let runner = Runner::new("h", &root, &settings, None);
        assert_eq!(runner.wrap("true"), "bash -e -c true");
    }

    #[test]
    fn test_st007_run_task_writes_markers_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let settings = local_settings(dir.path());
        let target = LocalTarget::new();
        let bus = EventBus::new();
        let sub = bus.subscribe("command.", 64);
        let runner = Runner::new("local", &target, &settings, Some(&bus));

        let t = task("app.setup", &["echo out; echo err >&2", "true"]);
        let counts = runner.run_task(&t, &mut Inventory::new()).unwrap();
        assert_eq!(counts.executed, 2);

        let sums = t.checksums();
        let tdir = dir.path().join("app.setup");
        let marker = std::fs::read_to_string(tdir.join(format!("{}.done", sums[0]))).unwrap();
        assert_eq!(marker, "echo out; echo err >&2");
        let log = std::fs::read_to_string(tdir.join(format!("{}.log", sums[0]))).unwrap();
        assert!(log.contains("[stdout] out"));
        assert!(log.contains("[stderr] err"));

        let events = sub.drain();
        let streamed: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::CommandStream { stream, line, .. } => Some((*stream, line.clone())),
                _ => None,
            })
            .collect();
        assert!(streamed.contains(&(StreamOrigin::Stdout, "out".to_string())));
        assert!(streamed.contains(&(StreamOrigin::Stderr, "err".to_string())));
    }

    #[test]
    fn test_st007_failure_writes_failed_marker_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let settings = local_settings(dir.path());
        let target = LocalTarget::new();
        let runner = Runner::new("local", &target, &settings, None);

        let t = task("t", &["true", "exit 3", "touch never"]);
        let err = runner.run_task(&t, &mut Inventory::new()).unwrap_err();
        match err {
            ProvisionError::CommandFailed {
                index, exit_code, ..
            } => {
                assert_eq!(index, 1);
                assert_eq!(exit_code, 3);
            }
            other => panic!("unexpected: {other}"),
        }
        let sums = t.checksums();
        let tdir = dir.path().join("t");
        assert!(tdir.join(format!("{}.done", sums[0])).exists());
        assert!(tdir.join(format!("{}.failed", sums[1])).exists());
        assert!(!tdir.join(format!("{}.done", sums[1])).exists());
        assert!(!tdir.join(format!("{}.done", sums[2])).exists());
    }

    #[test]
    fn test_st007_success_clears_failed_marker() {
        let dir = tempfile::tempdir().unwrap();
        let settings = local_settings(dir.path());
        let target = LocalTarget::new();
        let runner = Runner::new("local", &target, &settings, None);
        let t = task("t", &["true"]);
        let cs = &t.checksums()[0];
        let tdir = dir.path().join("t");
        std::fs::create_dir_all(&tdir).unwrap();
        std::fs::write(tdir.join(format!("{cs}.failed")), "true").unwrap();

        runner.run_task(&t, &mut Inventory::new()).unwrap();
        assert!(tdir.join(format!("{cs}.done")).exists());
        assert!(!tdir.join(format!("{cs}.failed")).exists());
    }

    #[test]
    fn test_st007_non_utf8_output_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let settings = local_settings(dir.path());
        let target = LocalTarget::new();
        let runner = Runner::new("local", &target, &settings, None);
        let t = task("t", &["printf '\\377\\376 bad\\n'; seq 1 20000"]);
        let counts = runner.run_task(&t, &mut Inventory::new()).unwrap();
        assert_eq!(counts.executed, 1);
    }

    #[test]
    fn test_st007_stdin_reading_command_completes() {
        let dir = tempfile::tempdir().unwrap();
        let settings = local_settings(dir.path());
        let target = LocalTarget::new();
        let runner = Runner::new("local", &target, &settings, None);
        let t = task("t", &["read x || true; echo after"]);

        let counts = runner.run_task(&t, &mut Inventory::new()).unwrap();
        assert_eq!(counts.executed, 1);

        let cs = &t.checksums()[0];
        let log = std::fs::read_to_string(dir.path().join("t").join(format!("{cs}.log"))).unwrap();
        assert!(log.contains("[stdout] after"));
    }

    /// Runs cache bookkeeping locally but cannot spawn user commands.
    struct BrokenSpawn(LocalTarget);

    impl Target for BrokenSpawn {
        fn user(&self) -> &str {
            self.0.user()
        }

        fn address(&self) -> &str {
            self.0.address()
        }

        fn command(
            &self,
            shell: &str,
        ) -> Result<Box<dyn crate::transport::Process>, crate::core::error::TransportError> {
            if shell.starts_with("bash -e -c") {
                return Ok(Box::new(crate::transport::ChildProcess::new(
                    "/nonexistent/strata-shell",
                    &[],
                )));
            }
            self.0.command(shell)
        }
    }

    #[test]
    fn test_st007_spawn_failure_finishes_command() {
        let dir = tempfile::tempdir().unwrap();
        let settings = local_settings(dir.path());
        let target = BrokenSpawn(LocalTarget::new());
        let bus = EventBus::new();
        let sub = bus.subscribe("command.", 16);
        let runner = Runner::new("local", &target, &settings, Some(&bus));
        let t = task("t", &["true"]);

        let err = runner.run_task(&t, &mut Inventory::new()).unwrap_err();
        assert!(matches!(err, ProvisionError::Transport(_)), "{err}");

        let events = sub.drain();
        let kinds: Vec<_> = events.iter().map(|e| e.kind.category()).collect();
        assert_eq!(kinds, ["command.exec_start", "command.exec_finished"]);
        match &events[1].kind {
            EventKind::CommandExecFinished {
                exit_code, error, ..
            } => {
                assert_eq!(*exit_code, -1);
                assert!(error.as_deref().unwrap_or_default().contains("strata-shell"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        let cs = &t.checksums()[0];
        assert!(dir.path().join("t").join(format!("{cs}.failed")).exists());
    }

    /// Serves scripted chunks, then reports whether it was read to EOF.
    struct FlakyReader {
        chunks: std::collections::VecDeque<std::io::Result<&'static [u8]>>,
        exhausted: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl Read for FlakyReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => {
                    self.exhausted
                        .store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(0)
                }
            }
        }
    }

    #[test]
    fn test_st007_read_error_keeps_draining() {
        use std::io::{Error, ErrorKind};
        let exhausted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = FlakyReader {
            chunks: [
                Ok(&b"one\n"[..]),
                Err(Error::from(ErrorKind::Interrupted)),
                Ok(&b"two\n"[..]),
                Err(Error::other("reset")),
                Ok(&b"tail\n"[..]),
            ]
            .into_iter()
            .collect(),
            exhausted: exhausted.clone(),
        };
        let settings = Settings::default();
        let target = LocalTarget::new();
        let runner = Runner::new("local", &target, &settings, None);
        let (tx, rx) = mpsc::channel();

        runner.pump(Some(Box::new(reader)), StreamOrigin::Stdout, &tx, "t", "cs");
        drop(tx);

        let lines: Vec<String> = rx.iter().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[stdout] one"));
        assert!(lines[1].ends_with("[stdout] two"));
        assert!(exhausted.load(std::sync::atomic::Ordering::SeqCst));
    }
}

//! ST-040: CLI subcommands: validate, tasks, plan, apply.

use crate::core::compiler::{CompiledTask, Compiler};
use crate::core::parser;
use crate::core::provision::Provisioner;
use crate::core::recipe::compile_config;
use crate::core::runner::{Action, TaskPlan};
use crate::core::types::StrataConfig;
use crate::events::{eventlog, Event, EventBus, EventKind, StreamOrigin};
use crate::transport::{target_for, Target};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate strata.yaml and compile it, without connecting to machines
    Validate {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,
    },

    /// List compiled tasks with their command checksums
    Tasks {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,
    },

    /// Show which commands would run (dry run against the remote cache)
    Plan {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,

        /// Target specific machine
        #[arg(short, long)]
        machine: Option<String>,
    },

    /// Run every task, resuming from the first changed command
    Apply {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,

        /// Target specific machine
        #[arg(short, long)]
        machine: Option<String>,

        /// Write JSONL event logs under this directory
        #[arg(long)]
        events: Option<PathBuf>,

        /// Do not print command output
        #[arg(short, long)]
        quiet: bool,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Tasks { file } => cmd_tasks(&file),
        Commands::Plan { file, machine } => cmd_plan(&file, machine.as_deref()),
        Commands::Apply {
            file,
            machine,
            events,
            quiet,
        } => cmd_apply(&file, machine.as_deref(), events.as_deref(), quiet),
    }
}

fn load(file: &Path) -> Result<StrataConfig, String> {
    parser::parse_and_validate(file).map_err(|e| e.to_string())
}

fn compile(config: &StrataConfig, bus: Option<&EventBus>) -> Result<Vec<CompiledTask>, String> {
    let compiler = Compiler::new().with_render_rounds(config.settings.render_rounds);
    let compiler = match bus {
        Some(bus) => compiler.with_bus(bus),
        None => compiler,
    };
    compile_config(config, &compiler).map_err(|e| format!("compile error: {e}"))
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = load(file)?;
    let tasks = compile(&config, None)?;
    let commands: usize = tasks.iter().map(|t| t.commands.len()).sum();
    println!(
        "OK: {} ({} machines, {} tasks, {} commands)",
        config.name,
        config.machines.len(),
        tasks.len(),
        commands
    );
    Ok(())
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

fn cmd_tasks(file: &Path) -> Result<(), String> {
    let config = load(file)?;
    for task in compile(&config, None)? {
        println!("{}:", task.name);
        for (i, (command, checksum)) in task.commands.iter().zip(task.checksums()).enumerate() {
            println!("  {i:>3} {} {}", short(&checksum), command.logging);
        }
    }
    Ok(())
}

/// Resolve the machines to run on, in config order.
fn select_targets(
    config: &StrataConfig,
    machine_filter: Option<&str>,
) -> Result<Vec<(String, Box<dyn Target>)>, String> {
    if let Some(filter) = machine_filter {
        if !config.machines.contains_key(filter) {
            return Err(format!("unknown machine '{filter}'"));
        }
    }
    let targets: Vec<(String, Box<dyn Target>)> = config
        .machines
        .iter()
        .filter(|(name, _)| machine_filter.is_none_or(|f| f == name.as_str()))
        .map(|(name, machine)| (name.clone(), target_for(machine)))
        .collect();
    if targets.is_empty() {
        return Err("no machines defined".to_string());
    }
    Ok(targets)
}

fn print_plan(host: &str, plans: &[TaskPlan]) -> (usize, usize, usize) {
    println!("{host}:");
    let (mut execute, mut cached, mut stale) = (0, 0, 0);
    for plan in plans {
        println!("  {}", plan.task);
        for command in &plan.commands {
            let symbol = match command.action {
                Action::Cached => "=",
                Action::Execute => "+",
            };
            println!(
                "    {symbol} {:>3} {} {}",
                command.index,
                short(&command.checksum),
                command.logging
            );
        }
        for checksum in &plan.stale {
            println!("    -     {}", short(checksum));
        }
        execute += plan.to_execute();
        cached += plan.cached();
        stale += plan.stale.len();
    }
    (execute, cached, stale)
}

fn cmd_plan(file: &Path, machine_filter: Option<&str>) -> Result<(), String> {
    let config = load(file)?;
    let tasks = compile(&config, None)?;
    let targets = select_targets(&config, machine_filter)?;
    let provisioner = Provisioner::new(&config.settings);

    println!("Planning: {} ({} tasks)", config.name, tasks.len());
    println!();
    let (mut execute, mut cached, mut stale) = (0, 0, 0);
    for (host, target) in &targets {
        let plans = provisioner
            .plan_host(host, target.as_ref(), &tasks)
            .map_err(|e| format!("{host}: {e}"))?;
        let (e, c, s) = print_plan(host, &plans);
        execute += e;
        cached += c;
        stale += s;
    }
    println!();
    println!("Plan: {execute} to execute, {cached} cached, {stale} stale marker(s).");
    Ok(())
}

/// Console view of a run. Returns how many events were seen.
fn print_events(events: Receiver<Event>) -> usize {
    let mut seen = 0;
    for event in events {
        seen += 1;
        let host = event.host.as_deref().unwrap_or("-");
        match event.kind {
            EventKind::CommandCached {
                task,
                index,
                logging,
                ..
            } => println!("{host}: {task} #{index} cached: {logging}"),
            EventKind::CommandExecStart {
                task,
                index,
                logging,
                ..
            } => println!("{host}: {task} #{index} $ {logging}"),
            EventKind::CommandStream { stream, line, .. } => match stream {
                StreamOrigin::Stdout => println!("{host}  | {line}"),
                StreamOrigin::Stderr => println!("{host}  ! {line}"),
            },
            EventKind::CommandExecFinished {
                task,
                index,
                error: Some(error),
                ..
            } => println!("{host}: {task} #{index} did not run: {error}"),
            EventKind::CommandExecFinished {
                task,
                index,
                exit_code,
                duration_ms,
                ..
            } if exit_code != 0 => {
                println!("{host}: {task} #{index} exited {exit_code} after {duration_ms}ms");
            }
            EventKind::CacheInvalidated { task, checksums } => {
                println!("{host}: {task} invalidated {} marker(s)", checksums.len());
            }
            _ => {}
        }
    }
    seen
}

fn cmd_apply(
    file: &Path,
    machine_filter: Option<&str>,
    events_dir: Option<&Path>,
    quiet: bool,
) -> Result<(), String> {
    let config = load(file)?;
    let targets = select_targets(&config, machine_filter)?;
    let capacity = config.settings.event_queue;
    let bus = EventBus::new();
    let console = (!quiet).then(|| bus.subscribe("", capacity).into_parts());
    let journal = events_dir.map(|dir| (dir, bus.subscribe("", capacity).into_parts()));

    let report = std::thread::scope(|s| {
        let mut handles = Vec::new();
        let mut workers = Vec::new();
        if let Some((rx, handle)) = console {
            handles.push(("console", handle));
            workers.push(s.spawn(move || print_events(rx)));
        }
        if let Some((dir, (rx, handle))) = journal {
            handles.push(("event log", handle));
            workers.push(s.spawn(move || eventlog::write_events(dir, rx)));
        }

        let report = compile(&config, Some(&bus)).map(|tasks| {
            Provisioner::new(&config.settings)
                .with_bus(&bus)
                .provision_fleet(&targets, &tasks)
        });

        for (name, handle) in &handles {
            handle.cancel();
            if handle.dropped() > 0 {
                eprintln!("warning: {name} fell behind, {} event(s) dropped", handle.dropped());
            }
        }
        for worker in workers {
            let _ = worker.join();
        }
        report
    })?;

    let stats = bus.stats();
    log::debug!(
        "events: {} published, {} delivered, {} dropped",
        stats.published,
        stats.delivered,
        stats.dropped
    );

    println!();
    for host in &report.hosts {
        match &host.error {
            None => println!(
                "{}: {} executed, {} cached, {} invalidated",
                host.host, host.counts.executed, host.counts.cached, host.counts.invalidated
            ),
            Some(e) => println!("{}: FAILED: {e}", host.host),
        }
    }
    let totals = report.into_result().map_err(|e| e.to_string())?;
    println!(
        "Apply complete: {} executed, {} cached.",
        totals.executed, totals.cached
    );
    Ok(())
}

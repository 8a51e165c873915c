//! Host simulator for the LWK partition scheduler.
//!
//! Runs the scheduler core against a synthetic machine: scenario files
//! describe the partition, one HPC process and the threads it clones, and
//! the tool prints where every thread landed together with the launch
//! statistics.

mod cli;
mod scenario;
mod sim;

use std::fmt;

use anyhow::{Context, Result};
use clap::Parser;
use lwk_core::id::CpuId;
use lwk_core::kprintln;
use lwk_core::log::{self, LogLevel};
use lwk_sched::thread::ThreadRole;
use lwk_sched::topology::CpuTopology;
use lwk_sched::{LwkOptions, UniformMachine};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    install_logger(cli.log_level.into());

    match cli.command {
        cli::Command::Run(ref args) => cmd_run(args),
        cli::Command::Topology(ref args) => cmd_topology(args),
        cli::Command::Options(ref args) => cmd_options(args),
    }
}

// ===========================================================================
// Logging
// ===========================================================================

fn stdout_print(args: fmt::Arguments<'_>) {
    print!("{args}");
}

fn stderr_log(level: LogLevel, args: fmt::Arguments<'_>) {
    eprintln!("[{}] {args}", level.name());
}

fn install_logger(level: LogLevel) {
    // SAFETY: reports go to stdout and log lines to stderr; neither sink
    // calls back into the scheduler.
    unsafe {
        log::set_print_fn(stdout_print);
        log::set_log_fn(stderr_log);
    }
    log::set_max_level(level);
}

// ===========================================================================
// Commands
// ===========================================================================

fn cmd_run(args: &cli::RunArgs) -> Result<()> {
    let scenario = scenario::Scenario::load(&args.scenario)?;
    let report = sim::run(&scenario, args.ticks)
        .with_context(|| format!("running {}", args.scenario.display()))?;

    kprintln!("{:>6}  {:<10} {:>4} {:>5} {:>5} {:<11} {:<16} result", "tid", "role", "cpu", "home", "prio", "policy", "allowed");
    for row in report.threads.iter().chain(&report.guests) {
        let role = match row.role {
            ThreadRole::Guest { .. } => "guest".to_string(),
            other => format!("{other:?}").to_lowercase(),
        };
        let home = row.home.map_or_else(|| "-".to_string(), |c| c.to_string());
        let result = row
            .result
            .map_or_else(|| "-".to_string(), |r| format!("{:?}/{:?}", r.behavior, r.placement));
        kprintln!(
            "{:>6}  {:<10} {:>4} {:>5} {:>5} {:<11} {:<16} {}",
            row.tid.to_string(),
            role,
            row.cpu.to_string(),
            home,
            row.prio,
            format!("{:?}", row.policy),
            row.allowed.to_string(),
            result
        );
    }

    let t = &report.summary.totals;
    kprintln!();
    kprintln!("process {}:", report.summary.pid);
    kprintln!("  max compute commits  {}", t.max_compute_level);
    kprintln!("  max utility commits  {}", t.max_util_level);
    kprintln!("  max running          {}", t.max_running);
    kprintln!("  timer pops           {}", t.timer_pop);
    kprintln!("  guest dispatches     {}", t.guest_dispatch);
    kprintln!("  pushed               {}", t.pushed);
    kprintln!("  guests given back    {}", report.given_back);
    for (key, refs) in &report.summary.keys {
        kprintln!("  location key {key}     {refs} refs");
    }
    Ok(())
}

fn cmd_topology(args: &cli::TopologyArgs) -> Result<()> {
    let machine = UniformMachine::new(args.nodes, args.cores, args.threads);
    let show = |id: Option<u32>| id.map_or_else(|| "?".to_string(), |v| v.to_string());

    kprintln!("{:>4} {:>4} {:>4} {:>4} {:>4} {:>4} {:>3}", "cpu", "node", "core", "l1", "l2", "l3", "smt");
    for n in 0..machine.nr_cpus() {
        let cpu = CpuId::new(n);
        let topo = CpuTopology::discover(cpu, &machine);
        kprintln!(
            "{:>4} {:>4} {:>4} {:>4} {:>4} {:>4} {:>3}",
            cpu.to_string(),
            show(topo.numa.map(|n| n.as_u32())),
            show(topo.core.map(CpuId::as_u32)),
            show(topo.l1.map(CpuId::as_u32)),
            show(topo.l2.map(CpuId::as_u32)),
            show(topo.l3.map(CpuId::as_u32)),
            show(topo.thread_index),
        );
    }
    Ok(())
}

fn cmd_options(args: &cli::OptionsArgs) -> Result<()> {
    let mut options = LwkOptions::default();
    options
        .apply_all(&args.list)
        .with_context(|| format!("parsing '{}'", args.list))?;
    kprintln!("{options:#?}");
    Ok(())
}

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hooktrace::{
    cli::{Cli, OutputFormat},
    config::Config,
    locator::{FileLocator, RootTable},
    replay::{self, ReplayOutcome},
    server_timing::{self, SERVER_TIMING_HEADER},
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Config file, then environment, then command line
fn load_config(args: &Cli) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .apply_env();

    if args.debug {
        config.debug = true;
    }

    let mut roots = args.roots.clone();
    roots.append(&mut config.roots);
    if let Some(abspath) = &args.wordpress {
        roots.extend(RootTable::wordpress(abspath).roots().iter().cloned());
    }
    config.roots = roots;
    Ok(config)
}

fn read_trace(args: &Cli, locator: Arc<FileLocator>) -> Result<ReplayOutcome> {
    let outcome = if args.trace.as_os_str() == "-" {
        replay::replay(io::stdin().lock(), locator)
    } else {
        let file = File::open(&args.trace)
            .with_context(|| format!("Failed to open trace {}", args.trace.display()))?;
        replay::replay(BufReader::new(file), locator)
    };
    outcome.with_context(|| format!("Failed to replay {}", args.trace.display()))
}

fn print_text(out: &mut impl Write, outcome: &ReplayOutcome) -> Result<()> {
    let watcher = &outcome.watcher;
    write!(out, "{}", watcher.render_tree(&outcome.actions))?;

    let timings = server_timing::aggregate(&watcher.invocations());
    if !timings.is_empty() {
        writeln!(out)?;
        for entry in timings.entries() {
            writeln!(out, "{}: {}", SERVER_TIMING_HEADER, entry)?;
        }
    }

    writeln!(out)?;
    writeln!(
        out,
        "{} invocations, {} incomplete, {} unattributed, {} issues",
        watcher.len(),
        watcher.invocations().iter().filter(|inv| !inv.is_complete()).count(),
        timings.unattributed(),
        outcome.issues.len()
    )?;
    Ok(())
}

fn print_json(out: &mut impl Write, outcome: &ReplayOutcome) -> Result<()> {
    let timings = server_timing::aggregate(&outcome.watcher.invocations());
    let report = json!({
        "invocations": outcome.watcher.export(&outcome.actions),
        "server_timing": timings
            .entries()
            .iter()
            .map(|entry| json!({
                "component": entry.component_key,
                "dur_ms": entry.millis(),
            }))
            .collect::<Vec<_>>(),
        "issues": outcome.issues.iter().map(|issue| issue.to_string()).collect::<Vec<_>>(),
    });
    writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    Ok(())
}

fn print_server_timing(out: &mut impl Write, outcome: &ReplayOutcome) -> Result<()> {
    let mut headers: Vec<(String, String)> = Vec::new();
    server_timing::send(&outcome.watcher.invocations(), &mut headers);
    for (name, value) in headers {
        writeln!(out, "{}: {}", name, value)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let config = load_config(&args)?;

    // Initialize tracing if debug mode is on
    init_tracing(config.debug);
    tracing::debug!(roots = config.roots.len(), "configuration loaded");

    let locator = Arc::new(FileLocator::new(config.root_table()));
    let outcome = read_trace(&args, locator)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match args.format {
        OutputFormat::Text => print_text(&mut out, &outcome)?,
        OutputFormat::Json => print_json(&mut out, &outcome)?,
        OutputFormat::ServerTiming => print_server_timing(&mut out, &outcome)?,
    }

    for issue in &outcome.issues {
        eprintln!("warning: {}", issue);
    }
    if args.strict && !outcome.issues.is_empty() {
        anyhow::bail!(
            "{} desynchronised event(s) in {}",
            outcome.issues.len(),
            args.trace.display()
        );
    }

    Ok(())
}

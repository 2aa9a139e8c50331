//! harel - statechart interpreter
//!
//! Validates, resolves and runs statechart definitions from the command line.

use clap::{Parser, Subcommand};
use colored::Colorize;
use harel_actor::{Actor, ActorLogic, ActorRegistry, Config, InspectionEvent, InspectionKind};
use harel_core::{Event, Implementations, Machine, Snapshot, StateDescriptor, Status};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harel")]
#[command(about = "Statechart interpreter with actor semantics")]
#[command(version)]
struct Cli {
    /// YAML config file (defaults to $HAREL_CONFIG)
    #[arg(short = 'C', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a definition and print its summary
    Validate {
        /// Definition file (.json, .yaml or .yml)
        file: PathBuf,
    },

    /// Resolve a partial state value against a definition
    Resolve {
        /// Definition file (.json, .yaml or .yml)
        file: PathBuf,

        /// State path ("a.b"), JSON array of paths, or JSON state value
        descriptor: String,
    },

    /// Run a definition as an actor and feed it events
    Run {
        /// Definition file (.json, .yaml or .yml)
        file: PathBuf,

        /// Event type or JSON event object (repeatable)
        #[arg(short, long = "event")]
        events: Vec<String>,

        /// Initial context JSON merged into the default (or @file.json)
        #[arg(short, long)]
        context: Option<String>,

        /// Print every microstep
        #[arg(long)]
        trace: bool,

        /// Milliseconds to keep running after the last event for pending
        /// invocations and timers
        #[arg(short, long, default_value = "0")]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match Config::load_from(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Resolve { file, descriptor } => resolve(&file, &descriptor),
        Commands::Run {
            file,
            events,
            context,
            trace,
            wait,
        } => run(&file, events, context, trace, wait, &config).await,
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
    Ok(())
}

fn validate(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let machine = load_machine(file)?;
    println!(
        "{} machine {} ({} nodes, checksum {})",
        "Valid".green(),
        machine.id().cyan(),
        machine.node_count(),
        machine.checksum()
    );
    println!("  initial: {}", machine.initial_value().to_string().yellow());
    Ok(())
}

fn resolve(file: &Path, descriptor: &str) -> Result<(), Box<dyn std::error::Error>> {
    let machine = load_machine(file)?;
    let descriptor: StateDescriptor = if descriptor.starts_with('{') || descriptor.starts_with('[')
    {
        serde_json::from_str(descriptor)?
    } else {
        StateDescriptor::Path(descriptor.to_string())
    };
    let value = machine.resolve(descriptor)?;
    println!("{}", format_json(&serde_json::to_value(&value)?));
    Ok(())
}

async fn run(
    file: &Path,
    events: Vec<String>,
    context: Option<String>,
    trace: bool,
    wait: u64,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let machine = Arc::new(load_machine(file)?);
    let mut actor_config = config.actor.clone();
    actor_config.trace_microsteps |= trace;

    let actor = match context {
        Some(raw) => Actor::with_input(machine, demo_registry(), actor_config, parse_json_arg(&raw)?)?,
        None => Actor::new(machine, demo_registry(), actor_config)?,
    };
    let mut inspector = trace.then(|| actor.inspect());

    actor.start()?;
    if let Some(rx) = inspector.as_mut() {
        drain_microsteps(rx);
    }
    print_snapshot("start", &actor.get_snapshot());

    for raw in events {
        let event = parse_event(&raw)?;
        let label = event.event_type.clone();
        let result = actor.send_and_wait(event).await;
        if let Some(rx) = inspector.as_mut() {
            drain_microsteps(rx);
        }
        match result {
            Ok(snapshot) => print_snapshot(&label, &snapshot),
            Err(e) => eprintln!("{} {}: {}", "Rejected".red(), label.cyan(), e),
        }
    }

    if wait > 0 && actor.get_snapshot().is_active() {
        let mut rx = actor.subscribe_channel();
        let deadline = tokio::time::sleep(Duration::from_millis(wait));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(snapshot) => {
                        if let Some(rx) = inspector.as_mut() {
                            drain_microsteps(rx);
                        }
                        print_snapshot("(async)", &snapshot);
                        if snapshot.is_terminal() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} snapshots", "Warning".yellow(), n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = &mut deadline => break,
            }
        }
    }

    let last = actor.stop().await;
    println!("{}", format_json(&serde_json::to_value(&*last)?));
    Ok(())
}

/// Demo invocation logic available to `invoke.src`.
fn demo_registry() -> ActorRegistry {
    ActorRegistry::new()
        .register("echo", ActorLogic::task(|input| async move { Ok(input) }))
        .register("fail", ActorLogic::task(|input| async move { Err(input) }))
        .register(
            "sleep",
            ActorLogic::task(|input| async move {
                let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(input)
            }),
        )
}

/// Loads a definition from JSON or YAML, chosen by file extension.
fn load_machine(file: &Path) -> Result<Machine, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| format!("failed to read '{}': {}", file.display(), e))?;
    let definition: Value = match file.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };
    let machine = Machine::from_json(&definition, Implementations::new())?;
    tracing::debug!(
        file = %file.display(),
        machine = %machine.id(),
        checksum = %machine.checksum(),
        "loaded definition"
    );
    Ok(machine)
}

fn parse_event(raw: &str) -> Result<Event, Box<dyn std::error::Error>> {
    if raw.trim_start().starts_with('{') {
        let json: Value = serde_json::from_str(raw)?;
        Ok(Event::from_json(&json)?)
    } else {
        Ok(Event::new(raw))
    }
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

fn drain_microsteps(rx: &mut broadcast::Receiver<InspectionEvent>) {
    while let Ok(record) = rx.try_recv() {
        if record.kind == InspectionKind::Microstep {
            println!(
                "  {} {} {}",
                "·".dimmed(),
                record.event.dimmed(),
                record.snapshot.value.to_string().dimmed()
            );
        }
    }
}

fn print_snapshot(label: &str, snapshot: &Snapshot) {
    let status = match snapshot.status {
        Status::Active => snapshot.status.as_str().green(),
        Status::Done => snapshot.status.as_str().blue(),
        Status::Error => snapshot.status.as_str().red(),
        Status::Stopped => snapshot.status.as_str().dimmed(),
    };
    let unchanged = if snapshot.changed { "" } else { " (unchanged)" };
    println!(
        "{} -> {} [{}]{}",
        label.cyan(),
        snapshot.value.to_string().yellow(),
        status,
        unchanged.dimmed()
    );
    if let Some(error) = &snapshot.error {
        println!("  {} {}: {}", "error".red(), error.code, error.message);
    }
    if let Some(output) = &snapshot.output {
        println!("  output: {}", output);
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

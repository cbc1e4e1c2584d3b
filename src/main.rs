//! durafsm - Persistent declarative state machines
//!
//! One-shot command-line tool: loads a machine definition, opens a record
//! store and raises events against stored instances.

mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::{Backend, Config};
use durafsm_core::{EventKind, MachineDefinition};
use durafsm_storage::{
    CoordinatorConfig, FileStore, MemoryStore, PersistenceCoordinator, RecordStore,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "durafsm")]
#[command(about = "Persistent declarative state machines with composite events")]
#[command(version)]
struct Cli {
    /// Config file (YAML)
    #[arg(short, long, env = "DURAFSM_CONFIG")]
    config: Option<PathBuf>,

    /// Machine definition file (.json, .yaml or .yml)
    #[arg(short, long, env = "DURAFSM_MACHINE")]
    machine: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Raise an event against an instance, creating it if needed
    Raise {
        /// Instance ID (auto-generated if not provided)
        #[arg(short, long)]
        instance: Option<String>,

        /// Event name
        #[arg(short, long)]
        event: String,

        /// Event data JSON (or @file.json to read from file)
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Show a stored instance
    Show {
        /// Instance ID
        id: String,
    },

    /// Describe the machine: states, events, composite bit assignments
    Describe,

    /// Check the machine definition and exit
    Validate,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries JSON output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        tracing::error!("{}", e);
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let definition = Arc::new(load_machine(&cli.machine)?);
    tracing::debug!(
        "Loaded machine '{}' from {}",
        definition.name(),
        cli.machine.display()
    );

    match cli.command {
        Commands::Validate => {
            eprintln!(
                "{} machine '{}' ({} states, {} events, {} composites)",
                "Valid".green(),
                definition.name().cyan(),
                definition.states().len(),
                definition.events().len(),
                definition.composites().len()
            );
        }
        Commands::Describe => {
            print_json(&describe(&definition))?;
        }
        Commands::Show { id } => {
            let config = Config::load(cli.config.as_deref())?;
            let coordinator = open_coordinator(&config, definition)?;
            let record = coordinator.get(&id)?;
            print_json(&serde_json::to_value(&record)?)?;
        }
        Commands::Raise {
            instance,
            event,
            data,
        } => {
            let config = Config::load(cli.config.as_deref())?;
            let coordinator = open_coordinator(&config, definition)?;

            let id = instance.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let data = match data {
                Some(raw) => parse_json_arg(&raw)?,
                None => Value::Null,
            };

            let outcome = coordinator.raise(&id, &event, &data)?;
            if outcome.result.transitioned() {
                eprintln!(
                    "{} {} -> {}",
                    id.cyan(),
                    outcome.result.from_state.yellow(),
                    outcome.result.to_state.green()
                );
            }
            for composite in &outcome.result.fired_composites {
                eprintln!("{} {}", "Fired".magenta(), composite);
            }

            print_json(&json!({
                "instance": id,
                "created": outcome.created,
                "from_state": outcome.result.from_state,
                "to_state": outcome.result.to_state,
                "handled": outcome.result.handled,
                "fired_composites": outcome.result.fired_composites,
                "record": outcome.record,
            }))?;
        }
    }

    Ok(())
}

/// Parses a definition file, picking the format from its extension.
fn load_machine(path: &Path) -> Result<MachineDefinition, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read machine file '{}': {}", path.display(), e))?;

    let definition = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => MachineDefinition::from_yaml(&content)?,
        _ => MachineDefinition::from_json(&serde_json::from_str(&content)?)?,
    };
    Ok(definition)
}

fn open_coordinator(
    config: &Config,
    definition: Arc<MachineDefinition>,
) -> Result<PersistenceCoordinator, Box<dyn std::error::Error>> {
    let lock_timeout = config.coordinator.lock_timeout();

    let store: Arc<dyn RecordStore> = match config.storage.backend {
        Backend::Memory => {
            tracing::warn!("Using in-memory store; nothing is kept after exit");
            let store = MemoryStore::new();
            Arc::new(match lock_timeout {
                Some(timeout) => store.with_lock_timeout(timeout),
                None => store,
            })
        }
        Backend::File => {
            let store = FileStore::open(&config.storage.data_dir)?;
            Arc::new(match lock_timeout {
                Some(timeout) => store.with_lock_timeout(timeout),
                None => store,
            })
        }
    };

    Ok(PersistenceCoordinator::with_config(
        store,
        definition,
        CoordinatorConfig::from(&config.coordinator),
    ))
}

/// Parses inline JSON, or reads it from a file when prefixed with '@'.
fn parse_json_arg(raw: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read data file '{}': {}", path, e))?,
        None => raw.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

fn describe(definition: &MachineDefinition) -> Value {
    let events: Vec<Value> = definition
        .events()
        .iter()
        .map(|event| {
            let kind = match definition.event_kind(event) {
                Some(EventKind::Composite) => "composite",
                _ => "simple",
            };
            json!({"name": event, "kind": kind})
        })
        .collect();

    let composites: Vec<Value> = definition
        .composites()
        .iter()
        .map(|composite| {
            let bits: serde_json::Map<String, Value> = composite
                .constituents
                .iter()
                .filter_map(|constituent| {
                    definition
                        .tracked_bits(constituent)
                        .iter()
                        .find(|t| t.accumulator == composite.accumulator)
                        .map(|t| (constituent.clone(), json!(t.bit)))
                })
                .collect();

            json!({
                "name": composite.name,
                "constituents": composite.constituents,
                "accumulator": composite.accumulator,
                "include_initial": composite.include_initial,
                "bits": bits,
                "mask": composite.mask(),
            })
        })
        .collect();

    let states: Vec<Value> = definition
        .states()
        .iter()
        .map(|state| {
            json!({
                "name": state.as_str(),
                "handles": definition.events_from(state.as_str()),
            })
        })
        .collect();

    json!({
        "name": definition.name(),
        "states": states,
        "events": events,
        "composites": composites,
    })
}

fn print_json(value: &Value) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

use clap::{Parser, Subcommand};
use std::sync::Arc;

use chainloom::checkpoint;
use chainloom::config::{get_global_config, init_global_config, Settings};
use chainloom::errors::{EngineError, EngineResult};
use chainloom::metrics;
use chainloom::store::{PostgresStore, StateStore};
use chainloom::telemetry::{init_tracing, short_checkpoint, TelemetryConfig};

/// Database-side operations for a chainloom deployment. The indexing run
/// itself is embedded through the library API (`Pipeline`), since sync
/// sources and handlers are compiled-in collaborators; this binary covers
/// everything that only needs the database.
#[derive(Parser)]
#[command(name = "chainloom", version, about)]
struct Cli {
    /// Path to config.toml
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create user tables, bookkeeping tables, shadow tables and triggers
    Migrate,
    /// Print the stored safe/latest checkpoints
    Status,
    /// Revert user tables to a checkpoint (triggers dropped around it)
    Revert {
        #[arg(long)]
        to: String,
    },
    /// Prune shadow rows at or below a checkpoint
    Finalize {
        #[arg(long)]
        to: String,
    },
    /// Drop shadow tables and triggers
    DropShadow,
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Migrate => "migrate",
            Command::Status => "status",
            Command::Revert { .. } => "revert",
            Command::Finalize { .. } => "finalize",
            Command::DropShadow => "drop-shadow",
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(TelemetryConfig::default()) {
        eprintln!("failed to initialize logging: {}", err);
        std::process::exit(1);
    }
    metrics::register_metrics();

    if let Err(err) = init_global_config(&cli.config) {
        eprintln!("failed to load {}: {}", cli.config, err);
        std::process::exit(1);
    }

    let settings = match Settings::from_config(get_global_config()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("invalid configuration: {}", err);
            std::process::exit(1);
        }
    };

    metrics::SETTINGS_INFO
        .with_label_values(&[
            settings.ordering.as_str(),
            "postgres",
            cli.command.label(),
        ])
        .set(1);

    if let Err(err) = run_command(&cli.command, &settings).await {
        err.log_fatal();
        std::process::exit(err.exit_code());
    }
}

async fn run_command(command: &Command, settings: &Settings) -> EngineResult<()> {
    let schema = Arc::new(settings.compiled_schema()?);
    // Fails fast on malformed source declarations.
    let handler_keys = chainloom::events::handler_names(&settings.sources)?;
    let store =
        PostgresStore::connect(&settings.database_url, settings.max_connections, schema).await?;

    match command {
        Command::Migrate => {
            store.migrate().await?;
            store.create_reorg_runtime().await?;
            println!("migration complete ({} handler keys declared)", handler_keys.len());
        }
        Command::Status => {
            match store.checkpoints().await? {
                Some(checkpoints) => {
                    println!("safe checkpoint:   {}", checkpoints.safe_checkpoint);
                    println!("latest checkpoint: {}", checkpoints.latest_checkpoint);
                    print_decoded("safe", &checkpoints.safe_checkpoint);
                    print_decoded("latest", &checkpoints.latest_checkpoint);
                }
                None => println!("no checkpoint row (run `chainloom migrate` first)"),
            }
        }
        Command::Revert { to } => {
            validate_checkpoint(to)?;
            let restored = store.revert_to(to).await?;
            println!(
                "reverted to {} ({} rows restored)",
                short_checkpoint(to),
                restored
            );
        }
        Command::Finalize { to } => {
            validate_checkpoint(to)?;
            let pruned = store.finalize_to(to).await?;
            println!(
                "finalized through {} ({} shadow rows pruned)",
                short_checkpoint(to),
                pruned
            );
        }
        Command::DropShadow => {
            store.drop_reorg_runtime().await?;
            println!("shadow tables and triggers dropped");
        }
    }
    Ok(())
}

/// Boundary checkpoints carry a 9 in the event-type slot and will not fully
/// decode, so length and digit checks are the useful validation here.
fn validate_checkpoint(checkpoint: &str) -> EngineResult<()> {
    if checkpoint.len() != checkpoint::CHECKPOINT_LEN
        || !checkpoint.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(EngineError::user(format!(
            "invalid checkpoint '{}': expected {} decimal digits",
            checkpoint,
            checkpoint::CHECKPOINT_LEN
        )));
    }
    Ok(())
}

fn print_decoded(label: &str, encoded: &str) {
    if let Ok(fields) = checkpoint::decode(encoded) {
        println!(
            "  {}: chain {} block {} ts {}",
            label, fields.chain_id, fields.block_number, fields.block_timestamp
        );
    }
}

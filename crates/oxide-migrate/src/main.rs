//! oxide-migrate CLI
//!
//! Command-line tool for building databases and managing migrations.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_migrate::prelude::*;
use oxide_schema::datasource::{DataSourceConfig, DataSourcesConfig, DEFAULT_DATA_SOURCE};
use oxide_schema::prelude::{CompileOptions, ModifyPolicy, RegistryFile, SchemaRegistry};

/// Declarative schemas and migrations for SQLite, PostgreSQL and MySQL.
#[derive(Parser)]
#[command(name = "oxide-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL or DSN (used when no config file is given).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Data sources configuration file (JSON).
    #[arg(short, long, env = "OXIDE_DATA_SOURCES")]
    config: Option<PathBuf>,

    /// Data source to work on.
    #[arg(short, long, default_value = DEFAULT_DATA_SOURCE)]
    source: String,

    /// Schema file (JSON).
    #[arg(long, default_value = "schema.json")]
    schema: PathBuf,

    /// Migrations directory.
    #[arg(short, long, default_value = "migrations")]
    migrations_dir: PathBuf,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the DDL that creates the schema.
    Sql {
        /// Drop tables before creating them.
        #[arg(long)]
        clean: bool,
    },

    /// Create every table of the schema.
    Build {
        /// Drop tables before creating them.
        #[arg(long)]
        clean: bool,

        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the differences between the schema and the live database.
    Diff {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,

        /// Rebuild tables instead of dropping and re-adding modified columns.
        #[arg(long)]
        rebuild: bool,
    },

    /// Manage migration scripts.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Show migration status.
    Status,

    /// Apply pending migrations.
    Up {
        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Create an empty migration script.
    New {
        /// Migration label.
        label: String,
    },

    /// Write a migration script for the differences with the live database.
    Diff {
        /// Migration label.
        label: String,

        /// Accept changes that can lose data.
        #[arg(long)]
        allow_destructive: bool,

        /// Rebuild tables instead of dropping and re-adding modified columns.
        #[arg(long)]
        rebuild: bool,
    },

    /// Record a migration as applied without running it.
    MarkApplied {
        /// Migration id.
        id: String,
    },

    /// Clear the failure of a migration so the next upgrade retries it.
    ClearFailure {
        /// Migration id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {err}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let status = err
                .downcast_ref::<MigrateError>()
                .map_or(ExitStatus::ExecutionFailure, MigrateError::exit_status);
            ExitCode::from(status.code())
        }
    }
}

fn load_registry(path: &Path) -> anyhow::Result<SchemaRegistry> {
    let content = fs::read_to_string(path)
        .map_err(MigrateError::from)
        .with_context(|| format!("reading schema file {}", path.display()))?;
    let file: RegistryFile = serde_json::from_str(&content)
        .map_err(MigrateError::from)
        .with_context(|| format!("parsing schema file {}", path.display()))?;
    Ok(file.into_registry().map_err(MigrateError::from)?)
}

async fn connect(cli: &Cli) -> anyhow::Result<Connection> {
    let mut manager = match &cli.config {
        Some(path) => {
            let content = fs::read_to_string(path)
                .map_err(MigrateError::from)
                .with_context(|| format!("reading data sources {}", path.display()))?;
            let config: DataSourcesConfig = serde_json::from_str(&content)
                .map_err(MigrateError::from)
                .with_context(|| format!("parsing data sources {}", path.display()))?;
            ConnectionManager::from_config(&config)?
        }
        None => {
            let mut manager = ConnectionManager::new();
            manager.add_data_source(
                DEFAULT_DATA_SOURCE,
                &DataSourceConfig::from_dsn(cli.database.as_str()),
            )?;
            manager
        }
    };
    Ok(manager.get_connection(&cli.source).await?)
}

fn policy(rebuild: bool) -> ModifyPolicy {
    if rebuild {
        ModifyPolicy::Rebuild
    } else {
        ModifyPolicy::DropAndAdd
    }
}

fn print_status(report: &StatusReport) {
    if report.scripts.is_empty() {
        info!("No migrations found.");
        return;
    }

    println!("\nMigrations:");
    println!("{:-<60}", "");
    for script in &report.scripts {
        match &script.state {
            ScriptState::Applied { applied_at } => println!(
                " [X] {} ({})",
                script.id,
                applied_at.format("%Y-%m-%d %H:%M:%S")
            ),
            ScriptState::Pending => println!(" [ ] {}", script.id),
            ScriptState::Skipped => println!(" [-] {} (older than the last applied)", script.id),
            ScriptState::Failed { error } => println!(" [!] {} failed: {error}", script.id),
            ScriptState::Unrecorded { error } => {
                println!(" [?] {} ran but was not recorded: {error}", script.id);
            }
        }
    }
    println!();

    if report.is_blocked() {
        info!("Upgrades are blocked: use `mark-applied` or `clear-failure` to reconcile.");
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Sql { clean } => {
            let registry = load_registry(&cli.schema)?;
            let connection = connect(&cli).await?;
            let statements = DatabaseBuilder::new(connection.clone())
                .with_options(CompileOptions::default().clean(*clean))
                .sql(&registry)?;
            for sql in statements {
                println!("{sql};");
            }
            connection.close().await;
        }

        Commands::Build { clean, dry_run } => {
            let registry = load_registry(&cli.schema)?;
            let connection = connect(&cli).await?;
            if *dry_run {
                info!("Dry run mode - SQL will be printed but not executed.");
            }
            DatabaseBuilder::new(connection.clone())
                .with_options(CompileOptions::default().clean(*clean))
                .dry_run(*dry_run)
                .build(&registry)
                .await?;
            connection.close().await;
        }

        Commands::Diff { json, rebuild } => {
            let registry = load_registry(&cli.schema)?;
            let connection = connect(&cli).await?;
            let manager = MigrationManager::new(connection.clone()).with_policy(policy(*rebuild));
            let diff = manager.diff_live(&registry).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&diff)?);
            } else if diff.is_empty() {
                info!("Database matches the schema.");
            } else {
                for sql in diff.statements() {
                    println!("{sql};");
                }
            }
            for table in &diff.unmanaged_tables {
                info!(table = %table, "Table is not declared in the schema");
            }
            connection.close().await;
        }

        Commands::Migrate { action } => {
            let connection = connect(&cli).await?;
            let mut manager =
                MigrationManager::new(connection.clone()).with_directory(&cli.migrations_dir);
            manager.load()?;

            match action {
                MigrateAction::Status => {
                    print_status(&manager.status().await?);
                }
                MigrateAction::Up { dry_run } => {
                    if *dry_run {
                        info!("Dry run mode - SQL will be printed but not executed.");
                    }
                    let applied = manager.dry_run(*dry_run).upgrade().await?;
                    info!(count = applied.len(), "Migrations applied");
                }
                MigrateAction::New { label } => {
                    let script = manager.create_script(label, Vec::new())?;
                    info!(id = %script.id, "Created empty migration");
                }
                MigrateAction::Diff {
                    label,
                    allow_destructive,
                    rebuild,
                } => {
                    let registry = load_registry(&cli.schema)?;
                    let mut manager = manager
                        .with_policy(policy(*rebuild))
                        .allow_destructive(*allow_destructive);
                    match manager.generate_with_diff(&registry, label).await? {
                        Some(script) => info!(
                            id = %script.id,
                            statements = script.statements.len(),
                            "Created migration"
                        ),
                        None => info!("No changes detected."),
                    }
                }
                MigrateAction::MarkApplied { id } => {
                    manager.mark_applied(id).await?;
                }
                MigrateAction::ClearFailure { id } => {
                    if !manager.clear_failure(id).await? {
                        info!(id = %id, "Migration has no open failure");
                    }
                }
            }
            connection.close().await;
        }
    }

    Ok(())
}

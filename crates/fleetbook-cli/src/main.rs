use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fleetbook_core::Record;
use fleetbook_storage::StorageError;
use fleetbook_sync::{
    approve_document, export_staging, parse_line_items, summarize, sync_master, ExportOutcome,
    SinkSelection, SyncConfig, SyncOrchestrator, SyncOutcome, SyncStatus, RECENT_ENTRIES,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fleetbook")]
#[command(about = "Fleet maintenance ledger: approve, export and sync line items")]
struct Cli {
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stage the line items of one source document and mark it processed.
    Approve {
        #[arg(long)]
        group: String,
        #[arg(long)]
        file: String,
        /// JSON file holding one line item or an array of them.
        #[arg(long)]
        records: PathBuf,
    },
    /// Mark a source document as handled without staging anything.
    Mark {
        #[arg(long)]
        group: String,
        #[arg(long)]
        file: String,
    },
    /// Processed counts per group.
    Status,
    /// Source PDFs of a group that still need a decision.
    Pending {
        #[arg(long)]
        group: String,
    },
    /// Supplier totals of the staged rows.
    Summary,
    /// Merge staged rows into the master table.
    Export,
    /// Push the master table to the configured sinks.
    Sync {
        #[arg(long, value_enum)]
        only: Option<SinkArg>,
    },
    /// Forget processed documents. Requires the administrator password.
    Reset {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        group: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long, env = "FLEETBOOK_ADMIN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkArg {
    Sheets,
    Database,
}

fn sink_selection(value: Option<SinkArg>) -> SinkSelection {
    match value {
        None => SinkSelection::All,
        Some(SinkArg::Sheets) => SinkSelection::SheetsOnly,
        Some(SinkArg::Database) => SinkSelection::DatabaseOnly,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetbook=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("ignoring unreadable .env: {err}");
        }
    }
    init_logging();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    info!(data_dir = %config.data_dir.display(), "fleetbook starting");
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    match cli.command {
        Commands::Approve {
            group,
            file,
            records,
        } => {
            let text = std::fs::read_to_string(&records)
                .with_context(|| format!("reading {}", records.display()))?;
            let items = parse_line_items(&text)?;
            let report =
                approve_document(&config.staging(), &config.tracking(), &group, &file, items)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "approved {group}/{file}: {} line item(s) staged, {} row(s) awaiting export",
                    report.appended, report.staged_rows
                );
            }
        }
        Commands::Mark { group, file } => {
            let newly = config.tracking().mark_processed(&group, &file)?;
            println!("{}", mark_message(&group, &file, newly, cli.json)?);
        }
        Commands::Status => {
            let counts = config.tracking().group_counts();
            if cli.json {
                print_json(&counts)?;
            } else if counts.is_empty() {
                println!("no documents processed yet");
            } else {
                for (group, count) in counts {
                    println!("{group}: {count} processed");
                }
            }
        }
        Commands::Pending { group } => {
            let pending = config
                .tracking()
                .pending_files(&group, &config.group_dir(&group))?;
            if cli.json {
                print_json(&pending)?;
            } else {
                println!("{} pending in {group}", pending.len());
                for path in pending {
                    println!("  {}", path.display());
                }
            }
        }
        Commands::Summary => {
            let staged = config.staging().load();
            let summary = summarize(&staged, RECENT_ENTRIES);
            if cli.json {
                print_json(&summary)?;
            } else if summary.rows == 0 {
                println!("nothing staged");
            } else {
                for supplier in &summary.suppliers {
                    println!(
                        "{:<32} {:>4} invoice(s) {:>12.2}",
                        supplier.supplier, supplier.invoices, supplier.total
                    );
                }
                println!(
                    "{:<32} {:>4} invoice(s) {:>12.2}",
                    "TOTAL", summary.invoices, summary.total
                );
                println!("last {} entries:", summary.recent.len());
                for record in &summary.recent {
                    print_record(record);
                }
            }
        }
        Commands::Export => {
            let outcome = export_staging(&config.staging(), &config.master())?;
            if cli.json {
                print_json(&outcome)?;
            } else {
                match outcome {
                    ExportOutcome::NothingStaged => println!("nothing staged; master unchanged"),
                    ExportOutcome::Exported(report) => println!(
                        "master now holds {} row(s); {} staged, {} duplicate(s) removed",
                        report.total_rows, report.staged_rows, report.duplicates_removed
                    ),
                }
            }
        }
        Commands::Sync { only } => {
            let orchestrator = SyncOrchestrator::from_env(sink_selection(only));
            let outcome = sync_master(&config.master(), &orchestrator).await?;
            if cli.json {
                print_json(&outcome)?;
            }
            match outcome {
                SyncOutcome::NothingToSync => {
                    if !cli.json {
                        println!("master table is empty; export first");
                    }
                }
                SyncOutcome::Synced(summary) => {
                    if !cli.json {
                        println!("sheets:   {}", serde_json::to_string(&summary.sheets)?);
                        println!("database: {}", serde_json::to_string(&summary.database)?);
                        println!("status:   {:?}", summary.status);
                    }
                    if summary.status != SyncStatus::Complete {
                        bail!("sync finished with status {:?}", summary.status);
                    }
                }
            }
        }
        Commands::Reset {
            group,
            all,
            password,
        } => {
            let password = match password {
                Some(password) => password,
                None => prompt("administrator password: ")?,
            };
            let grant = match config.admin_credential()?.verify(&password) {
                Ok(grant) => grant,
                Err(StorageError::CredentialRejected) => {
                    warn!("reset refused: wrong administrator password");
                    bail!("administrator password rejected; nothing was reset");
                }
                Err(err) => return Err(err.into()),
            };
            let tracking = config.tracking();
            let changed = match (group, all) {
                (_, true) => tracking.unmark_all(&grant)?,
                (Some(group), false) => tracking.unmark(&grant, &group)?,
                (None, false) => bail!("pass --group <name> or --all"),
            };
            println!("{}", if changed { "reset done" } else { "nothing to reset" });
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn mark_message(group: &str, file: &str, newly: bool, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(&serde_json::json!({ "newly_marked": newly }))?);
    }
    Ok(if newly {
        format!("marked {group}/{file} as processed")
    } else {
        format!("{group}/{file} was already processed")
    })
}

fn print_record(record: &Record) {
    println!(
        "  {:<12} {:<10} {:<10} {:<32} {:>10}",
        record.document_id,
        record.date.as_cell(),
        record.vehicle,
        record.description,
        record.total.map(|t| t.to_string()).unwrap_or_default()
    );
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush().context("flushing stdout")?;
    let mut input = String::new();
    io::stdin()
        .read_line(&mut input)
        .context("reading password")?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}

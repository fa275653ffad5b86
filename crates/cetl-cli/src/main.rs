use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use cetl_adapters::collect_phone_numbers;
use cetl_storage::{contacts_csv, PgContactStore};
use cetl_sync::{list_sink_files, run_ingest, PipelineConfig};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cetl-cli")]
#[command(about = "Contact ETL command-line interface")]
struct Cli {
    /// Debug-level logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest every CSV in the source directory.
    Ingest,
    Migrate,
    /// Tag stored contacts whose phone appears in a phone list.
    MarkUsed {
        /// A text file with one phone per line, or a directory of CSV exports.
        input: PathBuf,
        #[arg(long, default_value = "used")]
        tag: String,
        /// Only count matching contacts.
        #[arg(long)]
        report_only: bool,
    },
    ViewContacts {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    ViewProfiles,
    AuditContact {
        #[arg(long)]
        id: i64,
    },
    CountContacts,
    /// Write every stored contact to a CSV file.
    ExportContacts {
        #[arg(long, default_value = "contact_export.csv")]
        filename: PathBuf,
    },
    CheckReview,
    CheckDropped,
    /// Delete every contact and profile.
    ResetDatabase {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

async fn connect(env: &PipelineConfig) -> Result<PgContactStore> {
    let store = PgContactStore::connect(env.database_url()?)
        .await
        .context("connecting to contact store")?;
    Ok(store)
}

fn print_sink_files(label: &str, dir: &Path) -> Result<()> {
    let files = list_sink_files(dir)?;
    if files.is_empty() {
        println!("no {label} files in {}", dir.display());
        return Ok(());
    }
    println!("{} {label} file(s) in {}:", files.len(), dir.display());
    for file in files {
        if let Some(name) = file.file_name() {
            println!("  {}", name.to_string_lossy());
        }
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N]: ");
    std::io::stdout().flush().context("flushing prompt")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("reading confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env = PipelineConfig::from_env();
    let config = env.load_etl_config();
    let log_file = config
        .as_ref()
        .ok()
        .and_then(|c| c.log_file.as_ref())
        .map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                env.workspace_root.join(p)
            }
        });
    init_tracing(cli.verbose, log_file.as_deref())?;
    if let Err(err) = &config {
        warn!(error = %err, "configuration not loaded");
    }

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let config = config.context("loading configuration")?;
            let summary = run_ingest(&env, &config).await?;
            println!(
                concat!(
                    "ingest complete: run_id={} files={} loaded={} review={} ",
                    "rejected_existing={} dropped={} invalid={} reports={}",
                ),
                summary.run_id,
                summary.files.len(),
                summary.totals.loaded,
                summary.totals.needs_review,
                summary.totals.rejected_existing_phone,
                summary.totals.intra_file_duplicates + summary.totals.duplicate_at_load,
                summary.totals.invalid,
                summary.reports_dir
            );
        }
        Commands::Migrate => {
            connect(&env).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::MarkUsed {
            input,
            tag,
            report_only,
        } => {
            let phones = collect_phone_numbers(&input)?
                .into_iter()
                .collect::<Vec<_>>();
            info!(input = %input.display(), phones = phones.len(), "collected phone list");
            let store = connect(&env).await?;
            let matching = store.count_by_phones(&phones).await?;
            if report_only {
                println!(
                    "{matching} stored contact(s) match {} phone number(s)",
                    phones.len()
                );
            } else {
                let updated = store.mark_used(&phones, &tag).await?;
                println!("marked {updated} contact(s) as used with tag '{tag}'");
            }
        }
        Commands::ViewContacts { limit } => {
            let contacts = connect(&env).await?.recent_contacts(limit).await?;
            for c in &contacts {
                println!(
                    "{:>6}  {:<40}  {:<16}  {}",
                    c.id,
                    c.company_name,
                    c.phone_number.as_deref().unwrap_or("-"),
                    c.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("{} contact(s)", contacts.len());
        }
        Commands::ViewProfiles => {
            let profiles = connect(&env).await?.profiles().await?;
            for p in &profiles {
                println!(
                    "{:>4}  contacts={:<6}  {}  [{}]",
                    p.id,
                    p.contact_count,
                    &p.profile_hash[..12.min(p.profile_hash.len())],
                    p.json_keys.join(", ")
                );
            }
            println!("{} profile(s)", profiles.len());
        }
        Commands::AuditContact { id } => match connect(&env).await?.contact_audit(id).await? {
            Some(audit) => println!(
                "{}",
                serde_json::to_string_pretty(&audit).context("rendering contact audit")?
            ),
            None => println!("no contact with id {id}"),
        },
        Commands::CountContacts => {
            let count = connect(&env).await?.count_contacts().await?;
            println!("{count} contact(s)");
        }
        Commands::ExportContacts { filename } => {
            let contacts = connect(&env).await?.all_contacts().await?;
            if contacts.is_empty() {
                println!("no contacts to export");
                return Ok(());
            }
            let bytes = contacts_csv(&contacts)?;
            std::fs::write(&filename, bytes)
                .with_context(|| format!("writing {}", filename.display()))?;
            info!(path = %filename.display(), contacts = contacts.len(), "exported contacts");
            println!("exported {} contact(s) to {}", contacts.len(), filename.display());
        }
        Commands::ResetDatabase { yes } => {
            if !yes && !confirm("Delete all contacts and profiles?")? {
                println!("reset cancelled");
                return Ok(());
            }
            let removed = connect(&env).await?.reset().await?;
            println!(
                "deleted {} contact(s) and {} profile(s)",
                removed.contacts, removed.profiles
            );
        }
        Commands::CheckReview => {
            let config = config.context("loading configuration")?;
            print_sink_files("review", &config.settings(&env.workspace_root).sinks.review)?;
        }
        Commands::CheckDropped => {
            let config = config.context("loading configuration")?;
            print_sink_files("dropped", &config.settings(&env.workspace_root).sinks.dropped)?;
        }
    }

    Ok(())
}

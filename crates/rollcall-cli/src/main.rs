use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::{Embedding, EmbeddingCatalog};
use rollcall_store::{identities, ledger, roster, AttendanceStatus, Store};
use serde::Deserialize;
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `AttendanceProxy` (async) and
// `AttendanceProxyBlocking`; the CLI runs on tokio and uses the async one.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn start_session(&self, class_id: &str, operator_id: &str) -> zbus::Result<String>;
    async fn stop_session(&self, class_id: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn snapshot(&self, class_id: &str) -> zbus::Result<String>;
    async fn snapshot_preview(&self, class_id: &str) -> zbus::Result<Vec<u8>>;
    async fn reload_catalog(&self) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    /// Database for local commands (default: $ROLLCALL_DB_PATH or the
    /// daemon's default location)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a capture session for a class
    Start {
        #[arg(short, long)]
        class: String,
        #[arg(short, long)]
        operator: String,
    },
    /// Stop a class's session and print who was marked absent
    Stop {
        #[arg(short, long)]
        class: String,
    },
    /// Show daemon status
    Status,
    /// Print the latest live snapshot of a session
    Snapshot {
        #[arg(short, long)]
        class: String,
        /// Also write the frame preview to this JPEG file
        #[arg(long)]
        preview: Option<PathBuf>,
    },
    /// Ask the daemon to reload enrolled identities
    Reload,
    /// Import a face_recognition_model.json file into the database
    ImportModel {
        path: PathBuf,
        /// Encodings per enrollment in the file
        #[arg(long, default_value_t = rollcall_core::catalog::DEFAULT_GROUP_SIZE)]
        group_size: usize,
    },
    /// Manage enrolled identities
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Manage class rosters
    Roster {
        #[command(subcommand)]
        action: RosterAction,
    },
    /// Show attendance for a class on a date
    Ledger {
        #[arg(short, long)]
        class: String,
        /// YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// List video capture devices
    Devices,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// List enrolled identities
    List,
    /// Delete an identity and its reference embeddings
    Remove { id: String },
}

#[derive(Subcommand)]
enum RosterAction {
    /// Add identities to a class roster
    Add {
        #[arg(short, long)]
        class: String,
        ids: Vec<String>,
    },
    /// Remove an identity from a class roster
    Remove {
        #[arg(short, long)]
        class: String,
        id: String,
    },
    /// List a class roster
    List {
        #[arg(short, long)]
        class: String,
    },
}

/// Legacy model file: `group_size` encodings per enrollment, in order.
#[derive(Deserialize)]
struct ModelFile {
    encodings: Vec<Vec<f32>>,
    enrollments: Vec<String>,
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".local/share"))
        .join("rollcall/attendance.db")
}

async fn proxy(session_bus: bool) -> Result<AttendanceProxy<'static>> {
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

/// Load a model file and store each enrollment as an identity.
fn import_model(store: &mut Store, path: &Path, group_size: usize) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let model: ModelFile = serde_json::from_str(&raw)
        .with_context(|| format!("invalid model file {}", path.display()))?;

    let encodings = model.encodings.into_iter().map(Embedding::new).collect();
    let catalog = EmbeddingCatalog::from_flat(encodings, &model.enrollments, group_size)?;
    for identity in catalog.identities() {
        identities::replace_identity(store.connection_mut(), identity)?;
    }
    Ok(catalog.len())
}

fn remove_identity(store: &Store, id: &str) -> Result<()> {
    if !identities::remove_identity(store.connection(), id)? {
        bail!("{id} is not enrolled");
    }
    Ok(())
}

fn print_ledger(store: &Store, class: &str, date: NaiveDate) -> Result<()> {
    let conn = store.connection();
    let records = ledger::records_for(conn, class, date)?;
    let names = identities::identity_names(conn)?;
    let totals = ledger::absence_totals(conn, class)?;

    if records.is_empty() {
        println!("No attendance recorded for {class} on {date}");
        return Ok(());
    }
    for record in records {
        let name = names.get(&record.identity_id).map(String::as_str).unwrap_or("-");
        let when = match (record.status, record.recognized_at) {
            (AttendanceStatus::Present, Some(at)) => at.format("%H:%M:%S").to_string(),
            _ => "-".to_string(),
        };
        println!(
            "{:<12} {:<24} {:<8} {:<9} absences: {}",
            record.identity_id,
            name,
            record.status.as_str(),
            when,
            totals.get(&record.identity_id).copied().unwrap_or(0),
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.clone().unwrap_or_else(default_db_path);

    match cli.command {
        Commands::Start { class, operator } => {
            let proxy = proxy(cli.session_bus).await?;
            let id = proxy.start_session(&class, &operator).await?;
            println!("Session {id} started for {class}");
        }
        Commands::Stop { class } => {
            let proxy = proxy(cli.session_bus).await?;
            let report: serde_json::Value =
                serde_json::from_str(&proxy.stop_session(&class).await?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status => {
            let proxy = proxy(cli.session_bus).await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Snapshot { class, preview } => {
            let proxy = proxy(cli.session_bus).await?;
            let snap: serde_json::Value = serde_json::from_str(&proxy.snapshot(&class).await?)?;
            println!("{}", serde_json::to_string_pretty(&snap)?);
            if let Some(path) = preview {
                let jpeg = proxy.snapshot_preview(&class).await?;
                if jpeg.is_empty() {
                    bail!("no preview available (is `preview` enabled in rollcalld?)");
                }
                std::fs::write(&path, jpeg)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("Preview written to {}", path.display());
            }
        }
        Commands::Reload => {
            let proxy = proxy(cli.session_bus).await?;
            let count = proxy.reload_catalog().await?;
            println!("Catalog reloaded: {count} identities");
        }
        Commands::ImportModel { path, group_size } => {
            let mut store = Store::open(&db_path)?;
            let count = import_model(&mut store, &path, group_size)?;
            println!("Imported {count} identities into {}", db_path.display());
        }
        Commands::Identity { action } => {
            let store = Store::open(&db_path)?;
            match action {
                IdentityAction::List => {
                    let mut names: Vec<_> =
                        identities::identity_names(store.connection())?.into_iter().collect();
                    names.sort();
                    for (id, name) in names {
                        println!("{id:<12} {name}");
                    }
                }
                IdentityAction::Remove { id } => {
                    remove_identity(&store, &id)?;
                    println!("Removed {id}; run `rollcall reload` to refresh the daemon");
                }
            }
        }
        Commands::Roster { action } => {
            let mut store = Store::open(&db_path)?;
            match action {
                RosterAction::Add { class, ids } => {
                    let added = roster::add_to_roster(store.connection_mut(), &class, &ids)?;
                    println!("Added {added} to {class}");
                }
                RosterAction::Remove { class, id } => {
                    if !roster::remove_from_roster(store.connection(), &class, &id)? {
                        bail!("{id} is not on the roster of {class}");
                    }
                    println!("Removed {id} from {class}");
                }
                RosterAction::List { class } => {
                    for entry in roster::roster_for(store.connection(), &class)? {
                        println!(
                            "{:<12} {}",
                            entry.identity_id,
                            entry.name.as_deref().unwrap_or("(not enrolled)")
                        );
                    }
                }
            }
        }
        Commands::Ledger { class, date } => {
            let store = Store::open(&db_path)?;
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            print_ledger(&store, &class, date)?;
        }
        Commands::Devices => {
            let devices = rollcall_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}

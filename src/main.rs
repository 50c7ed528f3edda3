use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use wxsync::config::Config;
use wxsync::feed::{ApiClient, FeedSource};
use wxsync::reconcile::ReconcileMode;
use wxsync::session::{FeedSession, FetchOutcome, SessionOptions, SessionRegistry};
use wxsync::storage::{Database, DatabaseError, FolderId};
use wxsync::util::{format_display_time, format_wire_time, parse_timestamp, sanitize_label, Timestamp};

/// Get the config directory path (~/.config/wxsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("wxsync"))
}

fn parse_time_arg(raw: &str) -> Result<Timestamp, String> {
    parse_timestamp(raw).ok_or_else(|| format!("'{raw}' is not an ISO-8601 timestamp"))
}

#[derive(Parser, Debug)]
#[command(name = "wxsync", about = "Sync weather polygon feeds into a foldered feature store")]
struct Args {
    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,

    /// Config file (default: ~/.config/wxsync/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the analysis times the API offers for a source
    Times { source: FeedSource },

    /// List the validity windows of one snapshot
    Windows {
        source: FeedSource,
        #[arg(long, value_parser = parse_time_arg)]
        analysis_time: Option<Timestamp>,
    },

    /// Fetch a snapshot and reconcile it into the store
    Sync {
        source: FeedSource,
        /// Analysis time (default: most recent available)
        #[arg(long, value_parser = parse_time_arg, conflicts_with = "near")]
        analysis_time: Option<Timestamp>,
        /// Use the available analysis time closest to this instant
        #[arg(long, value_parser = parse_time_arg)]
        near: Option<Timestamp>,
        /// Validity window (default: earliest in the snapshot)
        #[arg(long, value_parser = parse_time_arg, conflicts_with = "all")]
        window: Option<Timestamp>,
        /// Keep every feature regardless of validity
        #[arg(long)]
        all: bool,
        /// Overrides `reconcile_mode` from the config file
        #[arg(long)]
        mode: Option<ReconcileMode>,
    },

    /// List stored folders in display order
    Folders,

    /// List the features of one folder in display order
    Features { folder_id: FolderId },

    /// Show recent store transactions, newest first
    Log {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    // SEC-007: Config and database may hold credentials and payloads: user-only access.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config
        .feed_sources()
        .context("Invalid 'sources' in config file")?;

    let db_path = config_dir.join("wxsync.db");
    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    match args.command {
        Command::Folders => list_folders(&db).await,
        Command::Features { folder_id } => list_features(&db, folder_id).await,
        Command::Log { limit } => show_change_log(&db, limit).await,
        Command::Times { source } => {
            let session = open_session(&config, db, &source, None)?;
            let times = session.list_analysis_times().await?;
            if times.is_empty() {
                println!("No analysis times available for {source}");
            }
            for t in times {
                println!("{}  ({})", format_wire_time(&t), format_display_time(&t));
            }
            Ok(())
        }
        Command::Windows {
            source,
            analysis_time,
        } => {
            let session = open_session(&config, db, &source, None)?;
            if analysis_time.is_none() {
                session.list_analysis_times().await?;
            }
            session.fetch_snapshot(analysis_time).await?;
            let view = session.view();
            if let Some(snapshot) = &view.snapshot {
                println!(
                    "{} features, analysis {}",
                    snapshot.features.len(),
                    format_display_time(&snapshot.analysis_time)
                );
            }
            for w in &view.available_windows {
                println!("{}", format_wire_time(w));
            }
            Ok(())
        }
        Command::Sync {
            source,
            analysis_time,
            near,
            window,
            all,
            mode,
        } => {
            let mode = mode.unwrap_or(config.reconcile_mode);
            let auto = config.auto_materialize.then_some(mode);
            let session = open_session(&config, db, &source, auto)?;

            // Chosen before fetching so an auto-materialize run sees it.
            if all {
                session.select_validity_window(None);
            } else if let Some(w) = window {
                session.select_validity_window(Some(w));
            }

            let outcome = match (near, analysis_time) {
                (Some(target), _) => session.fetch_snapshot_near(target).await?,
                (None, t) => {
                    if t.is_none() {
                        session.list_analysis_times().await?;
                    }
                    session.fetch_snapshot(t).await?
                }
            };

            let receipt = match outcome {
                FetchOutcome::Loaded {
                    materialized: Some(receipt),
                    ..
                } => receipt,
                FetchOutcome::Loaded { .. } => session.materialize(mode).await?,
                FetchOutcome::Superseded => anyhow::bail!("Fetch was cancelled"),
            };
            println!(
                "{} '{}': {} features written, {} removed",
                if receipt.created_folder { "Created" } else { "Updated" },
                sanitize_label(&receipt.folder_name),
                receipt.features_put,
                receipt.features_deleted
            );
            Ok(())
        }
    }
}

fn open_session(
    config: &Config,
    db: Database,
    source: &FeedSource,
    auto_materialize: Option<ReconcileMode>,
) -> Result<Arc<FeedSession>> {
    let credentials = config.credentials()?;
    let client = ApiClient::new(&config.api_base_url, credentials, config.request_timeout())
        .context("Failed to create API client")?;
    let registry = SessionRegistry::new(
        Arc::new(client),
        Arc::new(db),
        SessionOptions { auto_materialize },
    );
    Ok(registry.session(source))
}

async fn list_folders(db: &Database) -> Result<()> {
    let folders = db.get_folders().await?;
    let counts = db.get_feature_counts().await?;
    let names: HashMap<FolderId, String> = folders
        .iter()
        .map(|f| (f.id, sanitize_label(&f.name).into_owned()))
        .collect();

    if folders.is_empty() {
        println!("No folders yet. Run `wxsync sync <source>` first.");
    }
    for folder in &folders {
        let parent = folder
            .parent_id
            .and_then(|p| names.get(&p))
            .map(|p| format!("  (in {p})"))
            .unwrap_or_default();
        let sync = folder
            .sync_key
            .as_deref()
            .map(|k| format!("  [{k}]"))
            .unwrap_or_default();
        println!(
            "{}  {}  {} features{}{}",
            folder.id,
            sanitize_label(&folder.name),
            counts.get(&folder.id).copied().unwrap_or(0),
            parent,
            sync
        );
    }
    Ok(())
}

async fn list_features(db: &Database, folder_id: FolderId) -> Result<()> {
    let Some(folder) = db.get_folder(folder_id).await? else {
        anyhow::bail!("No folder with id {folder_id}");
    };
    println!("{}", sanitize_label(&folder.name));
    for feature in db.get_features_in_folder(folder_id).await? {
        let start = feature
            .payload
            .validity_start
            .as_ref()
            .map(format_wire_time)
            .unwrap_or_else(|| "-".to_string());
        let end = feature
            .payload
            .validity_end
            .as_ref()
            .map(format_wire_time)
            .unwrap_or_else(|| "-".to_string());
        println!("{}  {}  {} → {}", feature.order_key, feature.id, start, end);
    }
    Ok(())
}

async fn show_change_log(db: &Database, limit: i64) -> Result<()> {
    let entries = db.get_change_log(limit).await?;
    if entries.is_empty() {
        println!("No changes recorded yet.");
    }
    for entry in entries {
        let applied = chrono::DateTime::from_timestamp(entry.applied_at, 0)
            .map(|t| format_display_time(&t))
            .unwrap_or_else(|| entry.applied_at.to_string());
        println!(
            "#{}  {}  {}  (+{} folders, +{} features, -{} features)",
            entry.id,
            applied,
            sanitize_label(&entry.note),
            entry.folders_put,
            entry.features_put,
            entry.features_deleted
        );
    }
    Ok(())
}

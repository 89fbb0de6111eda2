mod config;
mod error;
mod host;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone, Utc};
use clap::{Parser, Subcommand};
use permissions::{Caveat, CaveatType, PermissionKind, Subject, SubjectKind};
use serde_json::Value;
use storage::{HistoryEntry, Store};
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{Error, Result};
use host::Host;

const CONFIG_FILE: &str = "warden.toml";
const DB_FILE: &str = "warden.db";

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Capability-scoped permissions for wallet subjects", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./warden.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List permission targets and excluded targets
    Targets,
    /// Grant a permission to a subject
    Grant {
        #[arg(short, long)]
        subject: String,
        #[arg(short, long)]
        target: String,
        /// Caveat as JSON, e.g. '{"type":"restrictReturnedAccounts","value":["0xabc"]}'
        #[arg(long = "caveat")]
        caveats: Vec<String>,
    },
    /// Revoke one or every permission of a subject
    Revoke {
        #[arg(short, long)]
        subject: String,
        #[arg(short, long, required_unless_present = "all", conflicts_with = "all")]
        target: Option<String>,
        /// Revoke every permission of the subject
        #[arg(long)]
        all: bool,
    },
    /// Invoke a restricted method on behalf of a subject
    Call {
        #[arg(short, long)]
        subject: String,
        #[arg(short, long)]
        target: String,
        /// Method params as JSON (default: [])
        #[arg(short, long)]
        params: Option<String>,
    },
    /// Show a subject's active permissions
    Permissions {
        #[arg(short, long)]
        subject: String,
    },
    /// Show the permission history
    History {
        /// Only this subject
        #[arg(short, long)]
        subject: Option<String>,
    },
    /// Show the restricted-method activity log
    Activity {
        /// Show only the last N entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging.filter);

    let host = Host::new(&config, open_store(&config)?)?;

    match cli.command {
        Commands::Targets => cmd_targets(&host),
        Commands::Grant {
            subject,
            target,
            caveats,
        } => cmd_grant(&host, &subject, &target, &caveats),
        Commands::Revoke {
            subject,
            target,
            all,
        } => cmd_revoke(&host, &subject, target.as_deref(), all),
        Commands::Call {
            subject,
            target,
            params,
        } => cmd_call(&host, &subject, &target, params.as_deref()).await,
        Commands::Permissions { subject } => cmd_permissions(&host, &subject),
        Commands::History { subject } => cmd_history(&host, subject.as_deref()),
        Commands::Activity { limit } => cmd_activity(&host, limit),
    }
}

fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_targets(host: &Host) -> Result<()> {
    let specifications = host.controller.specifications();

    println!("{:<26}  {:<17}  CAVEATS", "TARGET", "KIND");
    println!("{}", "-".repeat(80));
    for spec in specifications.iter() {
        let kind = match spec.kind() {
            PermissionKind::RestrictedMethod => "restrictedMethod",
            PermissionKind::Endowment => "endowment",
        };
        let caveats: Vec<_> = spec
            .allowed_caveats()
            .iter()
            .map(CaveatType::as_str)
            .collect();
        println!(
            "{:<26}  {kind:<17}  {}",
            spec.target_name(),
            caveats.join(", ")
        );
    }

    let excluded: Vec<_> = specifications.excluded().collect();
    if !excluded.is_empty() {
        println!("\nExcluded:");
        for (target, reason) in excluded {
            println!("  {target}: {reason}");
        }
    }
    Ok(())
}

fn cmd_grant(host: &Host, subject: &str, target: &str, raw_caveats: &[String]) -> Result<()> {
    let caveats = raw_caveats
        .iter()
        .map(|raw| Ok(Caveat::from_json(parse_json("caveat", raw)?)?))
        .collect::<Result<Vec<_>>>()?;

    let subject = subject_of(subject);
    let permission = host
        .controller
        .request_permission(&subject.id, target, caveats)?;
    println!("{}", serde_json::to_string_pretty(&permission)?);
    Ok(())
}

fn cmd_revoke(host: &Host, subject: &str, target: Option<&str>, all: bool) -> Result<()> {
    let subject = subject_of(subject);
    match target {
        Some(target) if !all => {
            host.controller.revoke_permission(&subject.id, target)?;
            println!("Revoked {target} from {}", subject.id);
        }
        _ => {
            let revoked = host.controller.revoke_all(&subject.id)?;
            println!("Revoked {} permission(s) from {}", revoked.len(), subject.id);
        }
    }
    Ok(())
}

/// One `call` is one connection of the subject, so disconnect policy
/// applies when it returns.
async fn cmd_call(host: &Host, subject: &str, target: &str, params: Option<&str>) -> Result<()> {
    let params = match params {
        Some(raw) => parse_json("params", raw)?,
        None => Value::Array(Vec::new()),
    };

    let subject = subject_of(subject);
    host.connect(&subject)?;
    let result = host
        .controller
        .execute_restricted_method(&subject.id, target, params)
        .await;
    host.disconnect(&subject)?;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

fn cmd_permissions(host: &Host, subject: &str) -> Result<()> {
    let subject = subject_of(subject);
    let permissions = host.controller.get_permissions(&subject.id);
    if permissions.is_empty() {
        println!("No permissions granted to {}.", subject.id);
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&permissions)?);
    Ok(())
}

fn cmd_history(host: &Host, subject: Option<&str>) -> Result<()> {
    let entries: Vec<HistoryEntry> = match subject {
        Some(subject) => host
            .controller
            .query_history(&subject_of(subject).id)?
            .into_values()
            .collect(),
        None => host
            .controller
            .all_history()?
            .into_values()
            .flat_map(|by_target| by_target.into_values())
            .collect(),
    };

    if entries.is_empty() {
        println!("No history recorded.");
        return Ok(());
    }

    println!(
        "{:<30}  {:<26}  {:<16}  ACCOUNTS",
        "SUBJECT", "TARGET", "LAST APPROVED"
    );
    println!("{}", "-".repeat(100));
    for entry in entries {
        let accounts: Vec<_> = entry.accounts.keys().map(String::as_str).collect();
        println!(
            "{:<30}  {:<26}  {:<16}  {}",
            entry.subject,
            entry.target,
            local(&entry.last_approved).format("%Y-%m-%d %H:%M"),
            accounts.join(", ")
        );
    }
    Ok(())
}

fn cmd_activity(host: &Host, limit: usize) -> Result<()> {
    let log = host.controller.activity_log(limit)?;
    if log.is_empty() {
        println!("No activity recorded.");
        return Ok(());
    }

    for entry in log {
        let time = local(&entry.request_time).format("%Y-%m-%d %H:%M:%S");
        let outcome = if entry.success { "ok" } else { "failed" };
        let elapsed = entry
            .response_time
            .map(|done| format!(" ({}ms)", (done - entry.request_time).num_milliseconds()))
            .unwrap_or_default();
        println!("[{time}] {} {} {outcome}{elapsed}", entry.subject, entry.method);
    }
    Ok(())
}

fn local(time: &DateTime<Utc>) -> DateTime<Local> {
    Local.from_utc_datetime(&time.naive_utc())
}

/// Subjects named like `npm:...` are modules; everything else is a page.
fn subject_of(id: &str) -> Subject {
    let kind = if id.starts_with("npm:") || id.starts_with("local:") {
        SubjectKind::Module
    } else {
        SubjectKind::Page
    };
    Subject::new(id, kind)
}

fn parse_json(what: &'static str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|source| Error::InvalidJson { what, source })
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None if Path::new(CONFIG_FILE).exists() => Ok(Config::load(CONFIG_FILE)?),
        None => Ok(Config::default()),
    }
}

fn open_store(config: &Config) -> Result<Store> {
    let path = match &config.storage.path {
        Some(path) => path.clone(),
        None => dirs_data_dir().ok_or(Error::NoDataDir)?.join(DB_FILE),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Store::open(&path)?)
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/warden"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("warden"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("warden"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

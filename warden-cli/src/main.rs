/*!
Warden CLI - audit, remediate and track persistence mechanisms on macOS.

Every mutating command backs the artifact up first and records the outcome in
the timeline under the state directory.
*/

mod system;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tracing::{error, warn};
use warden_core::model::attr;
use warden_core::observability::{init_with_directive, DEFAULT_DIRECTIVE};
use warden_core::{
    ArtifactDescriptor, ArtifactIdentity, ArtifactOutcome, BackupRecord, Category, DiffResult,
    Lifecycle, Protocol, Snapshot, TimelineAction, TimelineEvent, TimelineFilter, Warden,
    WardenConfig, WardenError,
};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Security audit with backup-before-mutate remediation and snapshot forensics")]
#[command(version)]
struct Cli {
    /// Directory holding backups, snapshots and the timeline
    #[arg(long, global = true, env = "WARDEN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// JSON configuration file; environment variables are ignored when given
    #[arg(long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results (and logs) as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Print this run's Prometheus metrics to stderr when done
    #[cfg(feature = "metrics")]
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture, inspect and compare snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Inspect or clear the audit timeline
    #[command(subcommand)]
    Timeline(TimelineCommand),
    /// Launch agents and daemons
    #[command(subcommand)]
    Launch(LaunchCommand),
    /// Login items
    #[command(subcommand)]
    Login(LoginCommand),
    /// Listening ports
    #[command(subcommand)]
    Port(PortCommand),
    /// Stored backups
    #[command(subcommand)]
    Backups(BackupsCommand),
    /// Search live artifacts, backups and profiles
    Search {
        keyword: String,
    },
}

#[derive(Subcommand)]
enum SnapshotCommand {
    /// Capture and store a snapshot of every category
    Capture,
    /// List stored snapshots
    List,
    /// Show one snapshot
    Show { id: String },
    /// Compare two snapshots (earlier first)
    Compare { from: String, to: String },
    /// Delete every stored snapshot
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum TimelineCommand {
    /// Show timeline events, oldest first
    Show {
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        identity: Option<String>,
        #[arg(long, value_enum)]
        category: Option<CategoryArg>,
        /// RFC 3339 lower bound
        #[arg(long)]
        since: Option<String>,
        /// RFC 3339 upper bound
        #[arg(long)]
        until: Option<String>,
    },
    /// Archive and truncate the timeline
    Clear {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum LaunchCommand {
    /// List launch agents and daemons
    List,
    /// Back up and quarantine the given plists
    Quarantine {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Quarantine every launch item that is not code-signed
    QuarantineUnsigned,
    /// Put a quarantined plist back
    Restore { path: PathBuf },
    /// Delete the backups of a plist
    Purge { path: PathBuf },
    /// Delete every launch item backup
    PurgeAll {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum LoginCommand {
    /// List login items
    List,
    /// Back up a login item without removing it
    Backup { name: String },
    /// Back up and remove a login item
    Remove { name: String },
    /// Re-register a removed login item (by name or identity)
    Restore { item: String },
    /// Delete the backups of a login item (by name or identity)
    Purge { item: String },
}

#[derive(Subcommand)]
enum PortCommand {
    /// List listening ports
    List,
    /// Back up a port binding without closing it
    Backup {
        port: u16,
        #[arg(long, value_enum, default_value = "tcp")]
        protocol: ProtocolArg,
    },
    /// Back up the binding and terminate its owning process
    Close {
        port: u16,
        #[arg(long, value_enum, default_value = "tcp")]
        protocol: ProtocolArg,
    },
    /// Delete the backups of a port
    Purge {
        port: u16,
        #[arg(long, value_enum, default_value = "tcp")]
        protocol: ProtocolArg,
    },
}

#[derive(Subcommand)]
enum BackupsCommand {
    /// List stored backups
    List {
        #[arg(long, value_enum)]
        category: Option<CategoryArg>,
    },
    /// Delete every backup, or every backup of one category
    PurgeAll {
        #[arg(long, value_enum)]
        category: Option<CategoryArg>,
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CategoryArg {
    Launch,
    Login,
    Port,
}

impl From<CategoryArg> for Category {
    fn from(value: CategoryArg) -> Self {
        match value {
            CategoryArg::Launch => Category::LaunchItem,
            CategoryArg::Login => Category::LoginItem,
            CategoryArg::Port => Category::Port,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ProtocolArg {
    Tcp,
    Udp,
}

impl From<ProtocolArg> for Protocol {
    fn from(value: ProtocolArg) -> Self {
        match value {
            ProtocolArg::Tcp => Protocol::Tcp,
            ProtocolArg::Udp => Protocol::Udp,
        }
    }
}

#[derive(Tabled)]
struct ArtifactRow {
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "Signed")]
    signed: String,
    #[tabled(rename = "Notes")]
    notes: String,
    #[tabled(rename = "State")]
    state: String,
}

#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "State")]
    state: String,
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Captured")]
    captured: String,
    #[tabled(rename = "Artifacts")]
    artifacts: usize,
    #[tabled(rename = "Profiles")]
    profiles: usize,
    #[tabled(rename = "Failed")]
    failed: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "#")]
    sequence: u64,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Artifact")]
    artifact: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Restores")]
    restores: u32,
}

#[derive(Tabled)]
struct MatchRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Actions")]
    actions: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let directive = if cli.verbose { "warden=debug" } else { DEFAULT_DIRECTIVE };
    init_with_directive(cli.json, directive)?;

    let mut config = match &cli.config {
        Some(path) => WardenConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WardenConfig::from_env()?,
    };
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }

    let mut warden = Warden::open(config, system::strategies())
        .context("Failed to open Warden state directory")?
        .with_profile_collector(system::profile_collector());
    for collector in system::collectors() {
        warden = warden.with_collector(collector);
    }

    let out = Output { json: cli.json };
    let result = match cli.command {
        Commands::Snapshot(command) => snapshot_command(&warden, &out, command),
        Commands::Timeline(command) => timeline_command(&warden, &out, command),
        Commands::Launch(command) => launch_command(&warden, &out, command),
        Commands::Login(command) => login_command(&warden, &out, command),
        Commands::Port(command) => port_command(&warden, &out, command),
        Commands::Backups(BackupsCommand::List { category }) => {
            list_backups(&warden, &out, category.map(Category::from))
        }
        Commands::Backups(BackupsCommand::PurgeAll { category, force }) => {
            let category = category.map(Category::from);
            let prompt = match category {
                Some(category) => format!("Delete every {category} backup?"),
                None => "Delete every backup?".to_string(),
            };
            purge_all(&warden, &out, category, &prompt, force)
        }
        Commands::Search { keyword } => search(&warden, &out, &keyword),
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    #[cfg(feature = "metrics")]
    if cli.metrics {
        dump_metrics()?;
    }
    result
}

#[cfg(feature = "metrics")]
fn dump_metrics() -> anyhow::Result<()> {
    let metrics = warden_core::observability::WardenMetrics::global()
        .ok_or_else(|| anyhow!("Metrics registry is unavailable"))?;
    eprint!("{}", metrics.gather_metrics()?);
    Ok(())
}

/// Renders either tables and prose or JSON documents
struct Output {
    json: bool,
}

impl Output {
    fn value<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn table<R: Tabled>(&self, rows: Vec<R>, empty: &str) {
        if rows.is_empty() {
            println!("{empty}");
        } else {
            println!("{}", Table::new(rows));
        }
    }
}

fn confirm(prompt: &str, force: bool) -> anyhow::Result<bool> {
    if force {
        return Ok(true);
    }
    print!("{prompt} (y/N): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let confirmed = input.trim().to_lowercase().starts_with('y');
    if !confirmed {
        println!("Cancelled");
    }
    Ok(confirmed)
}

/// Collect live state, reporting categories whose collector failed
fn live(warden: &Warden) -> anyhow::Result<Snapshot> {
    let snapshot = warden.snapshots().collect()?;
    for (category, reason) in &snapshot.failures {
        warn!("Could not enumerate {}: {}", category, reason);
    }
    Ok(snapshot)
}

fn snapshot_command(warden: &Warden, out: &Output, command: SnapshotCommand) -> anyhow::Result<()> {
    let engine = warden.snapshots();
    match command {
        SnapshotCommand::Capture => {
            let snapshot = engine.capture()?;
            if out.json {
                return out.value(&snapshot);
            }
            println!("✓ Captured snapshot {} ({} artifacts)", snapshot.id, snapshot.len());
            for (category, reason) in &snapshot.failures {
                println!("  ! {category} collector failed: {reason}");
            }
        }
        SnapshotCommand::List => {
            let snapshots = engine.list()?;
            if out.json {
                return out.value(&snapshots);
            }
            let rows = snapshots
                .into_iter()
                .map(|m| SnapshotRow {
                    failed: join(m.failed_categories.iter()),
                    artifacts: m.total(),
                    profiles: m.profile_count,
                    captured: format_time(m.captured_at),
                    size: format_size(m.compressed_size.unwrap_or(m.uncompressed_size) as u64),
                    id: m.snapshot_id,
                })
                .collect();
            out.table(rows, "No snapshots found");
        }
        SnapshotCommand::Show { id } => {
            let snapshot = engine.load(&id)?;
            if out.json {
                return out.value(&snapshot);
            }
            println!("Snapshot {}", snapshot.id);
            println!("  Captured: {}", format_time(snapshot.captured_at));
            for category in Category::ALL {
                match snapshot.failures.get(&category) {
                    Some(reason) => println!("  {category}: collection failed ({reason})"),
                    None => println!("  {category}: {}", snapshot.entries(category).len()),
                }
            }
            println!("  profiles: {}", snapshot.profiles.len());
            for category in Category::ALL {
                for descriptor in snapshot.entries(category) {
                    println!("    [{category}] {}", descriptor.identity);
                }
            }
        }
        SnapshotCommand::Compare { from, to } => {
            let diff = engine.compare(&from, &to)?;
            if out.json {
                return out.value(&diff);
            }
            print_diff(&diff);
        }
        SnapshotCommand::Clear { force } => {
            if confirm("Delete every stored snapshot?", force)? {
                let removed = engine.clear_all()?;
                println!("✓ Deleted {removed} snapshots");
            }
        }
    }
    Ok(())
}

fn print_diff(diff: &DiffResult) {
    println!("{} -> {}", diff.from_id, diff.to_id);
    if diff.is_empty() {
        println!("No changes");
    }
    for summary in diff.summary() {
        println!("  {summary}");
    }
    for (category, changes) in &diff.categories {
        for descriptor in &changes.added {
            println!("  + [{category}] {}", descriptor.identity);
        }
        for descriptor in &changes.removed {
            println!("  - [{category}] {}", descriptor.identity);
        }
        for modified in &changes.modified {
            println!(
                "  ~ [{category}] {} ({})",
                modified.identity,
                modified.changed_keys().join(", ")
            );
        }
    }
    for profile in &diff.profiles.added {
        println!("  + [profile] {}", profile.identifier);
    }
    for profile in &diff.profiles.removed {
        println!("  - [profile] {}", profile.identifier);
    }
    if !diff.incomplete.is_empty() {
        println!(
            "  ! incomplete: collection failed for {}",
            join(diff.incomplete.iter())
        );
    }
}

fn parse_time(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid RFC 3339 time: {value}"))?
        .with_timezone(&Utc))
}

fn timeline_command(warden: &Warden, out: &Output, command: TimelineCommand) -> anyhow::Result<()> {
    match command {
        TimelineCommand::Show {
            action,
            identity,
            category,
            since,
            until,
        } => {
            let mut filter = TimelineFilter::new();
            if let Some(action) = action {
                let action = TimelineAction::parse(&action)
                    .ok_or_else(|| anyhow!("Unknown timeline action: {action}"))?;
                filter = filter.action(action);
            }
            if let Some(identity) = identity {
                filter = filter.identity(ArtifactIdentity::new(identity));
            }
            if let Some(category) = category {
                filter = filter.category(category.into());
            }
            let since = since.as_deref().map(parse_time).transpose()?;
            let until = until.as_deref().map(parse_time).transpose()?;
            filter = filter.between(since, until);

            let events = warden
                .timeline()
                .query(filter)?
                .collect::<Result<Vec<TimelineEvent>, WardenError>>()?;
            if out.json {
                return out.value(&events);
            }
            let rows = events.into_iter().map(event_row).collect();
            out.table(rows, "Timeline is empty");
        }
        TimelineCommand::Clear { force } => {
            if confirm("Archive and clear the timeline?", force)? {
                let archive = warden.timeline().clear()?;
                println!("✓ Timeline archived to {archive}");
            }
        }
    }
    Ok(())
}

fn event_row(event: TimelineEvent) -> EventRow {
    EventRow {
        sequence: event.sequence,
        time: format_time(event.timestamp),
        action: event.action.to_string(),
        artifact: event
            .artifact_identity
            .map(|i| i.to_string())
            .unwrap_or_default(),
        outcome: event.outcome.to_string(),
        detail: event.detail.unwrap_or_default(),
    }
}

fn artifact_rows(lifecycle: &Lifecycle, descriptors: &[ArtifactDescriptor]) -> Vec<ArtifactRow> {
    descriptors
        .iter()
        .map(|d| {
            let mut notes = Vec::new();
            if d.attribute(attr::WORLD_WRITABLE).and_then(|v| v.as_bool()) == Some(true) {
                notes.push("world-writable".to_string());
            }
            if let Some(keyword) = d.attribute_str(system::launch::KEYWORD_ATTR) {
                notes.push(format!("keyword: {keyword}"));
            }
            if let Some(pid) = d.attribute(attr::PID) {
                notes.push(format!("pid {pid}"));
            }
            ArtifactRow {
                identity: d.identity.to_string(),
                label: d
                    .attribute_str(attr::LABEL)
                    .or_else(|| d.attribute_str(attr::NAME))
                    .or_else(|| d.attribute_str(attr::PROCESS))
                    .unwrap_or_default()
                    .to_string(),
                signed: match d.is_signed() {
                    Some(true) => "yes".to_string(),
                    Some(false) => "NO".to_string(),
                    None => "-".to_string(),
                },
                notes: notes.join(", "),
                state: lifecycle
                    .state(&d.identity)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| format!("unknown ({e})")),
            }
        })
        .collect()
}

fn list_category(warden: &Warden, out: &Output, category: Category) -> anyhow::Result<()> {
    let snapshot = live(warden)?;
    if let Some(reason) = snapshot.failures.get(&category) {
        bail!("Could not enumerate {category}s: {reason}");
    }
    let descriptors = snapshot.entries(category);
    if out.json {
        return out.value(&descriptors);
    }
    let rows = artifact_rows(warden.lifecycle(category), descriptors);
    out.table(rows, &format!("No {category}s found"));
    Ok(())
}

fn print_outcomes(out: &Output, outcomes: Vec<ArtifactOutcome>) -> anyhow::Result<()> {
    if out.json {
        return out.value(&outcomes);
    }
    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    let rows = outcomes
        .into_iter()
        .map(|o| OutcomeRow {
            identity: o.identity.to_string(),
            action: o.action.to_string(),
            outcome: o.outcome.to_string(),
            state: o.state.map(|s| s.to_string()).unwrap_or_default(),
        })
        .collect();
    out.table(rows, "Nothing to do");
    if failed > 0 {
        bail!("{failed} artifacts could not be processed");
    }
    Ok(())
}

/// The live descriptor for `identity`, if it is currently present
fn find_live(
    warden: &Warden,
    category: Category,
    identity: &ArtifactIdentity,
) -> anyhow::Result<Option<ArtifactDescriptor>> {
    Ok(live(warden)?.find(category, identity).cloned())
}

fn launch_command(warden: &Warden, out: &Output, command: LaunchCommand) -> anyhow::Result<()> {
    let lifecycle = warden.launch_items();
    match command {
        LaunchCommand::List => list_category(warden, out, Category::LaunchItem)?,
        LaunchCommand::Quarantine { paths } => {
            let snapshot = live(warden)?;
            let descriptors: Vec<ArtifactDescriptor> = paths
                .iter()
                .map(|path| {
                    let identity = ArtifactIdentity::for_path(path);
                    snapshot
                        .find(Category::LaunchItem, &identity)
                        .cloned()
                        .unwrap_or_else(|| ArtifactDescriptor::launch_item(path))
                })
                .collect();
            print_outcomes(out, lifecycle.apply_all(&descriptors)?)?;
        }
        LaunchCommand::QuarantineUnsigned => {
            let snapshot = live(warden)?;
            if let Some(reason) = snapshot.failures.get(&Category::LaunchItem) {
                bail!("Could not enumerate launch items: {reason}");
            }
            let outcomes = lifecycle.quarantine_unsigned(snapshot.entries(Category::LaunchItem))?;
            print_outcomes(out, outcomes)?;
        }
        LaunchCommand::Restore { path } => {
            let descriptor = lifecycle.restore(&ArtifactIdentity::for_path(&path))?;
            println!("✓ Restored {}", descriptor.identity);
        }
        LaunchCommand::Purge { path } => purge(lifecycle, &ArtifactIdentity::for_path(&path))?,
        LaunchCommand::PurgeAll { force } => purge_all(
            warden,
            out,
            Some(Category::LaunchItem),
            "Delete every launch item backup?",
            force,
        )?,
    }
    Ok(())
}

fn purge_all(
    warden: &Warden,
    out: &Output,
    category: Option<Category>,
    prompt: &str,
    force: bool,
) -> anyhow::Result<()> {
    if !confirm(prompt, force)? {
        return Ok(());
    }
    let report = warden.purge_all(category)?;
    if out.json {
        return out.value(&report);
    }
    println!("✓ Purged backups of {} artifacts", report.purged.len());
    for failure in &report.failures {
        println!("  ! {}: {}", failure.identity, failure.reason);
    }
    if !report.is_clean() {
        bail!("{} artifacts could not be purged", report.failures.len());
    }
    Ok(())
}

fn purge(lifecycle: &Lifecycle, identity: &ArtifactIdentity) -> anyhow::Result<()> {
    let state = lifecycle.purge(identity)?;
    println!("✓ Purged backups of {identity} (now {state})");
    Ok(())
}

/// Resolve a login item given by name or identity against live state and
/// stored backups
fn login_identity(warden: &Warden, item: &str) -> anyhow::Result<ArtifactIdentity> {
    let by_name = |d: &ArtifactDescriptor| d.attribute_str(attr::NAME) == Some(item);
    if let Some(record) = warden
        .backups()
        .records(Some(Category::LoginItem))?
        .into_iter()
        .find(|r| r.artifact_identity.as_str() == item || by_name(&r.descriptor))
    {
        return Ok(record.artifact_identity);
    }
    if let Some(descriptor) = live(warden)?
        .entries(Category::LoginItem)
        .iter()
        .find(|d| d.identity.as_str() == item || by_name(d))
    {
        return Ok(descriptor.identity.clone());
    }
    bail!("No login item named {item}")
}

fn live_login_item(warden: &Warden, name: &str) -> anyhow::Result<ArtifactDescriptor> {
    live(warden)?
        .entries(Category::LoginItem)
        .iter()
        .find(|d| d.attribute_str(attr::NAME) == Some(name) || d.identity.as_str() == name)
        .cloned()
        .ok_or_else(|| anyhow!("No login item named {name}"))
}

fn login_command(warden: &Warden, out: &Output, command: LoginCommand) -> anyhow::Result<()> {
    let lifecycle = warden.login_items();
    match command {
        LoginCommand::List => list_category(warden, out, Category::LoginItem)?,
        LoginCommand::Backup { name } => {
            let record = lifecycle.backup(&live_login_item(warden, &name)?)?;
            print_backup(out, &record)?;
        }
        LoginCommand::Remove { name } => {
            let descriptor = live_login_item(warden, &name)?;
            let state = lifecycle.remove(&descriptor)?;
            println!("✓ {} is now {state}", descriptor.identity);
        }
        LoginCommand::Restore { item } => {
            let descriptor = lifecycle.restore(&login_identity(warden, &item)?)?;
            println!("✓ Restored {}", descriptor.identity);
        }
        LoginCommand::Purge { item } => purge(lifecycle, &login_identity(warden, &item)?)?,
    }
    Ok(())
}

fn port_command(warden: &Warden, out: &Output, command: PortCommand) -> anyhow::Result<()> {
    let lifecycle = warden.ports();
    let live_port = |port: u16, protocol: ProtocolArg| -> anyhow::Result<ArtifactDescriptor> {
        let identity = ArtifactIdentity::for_port(port, protocol.into());
        find_live(warden, Category::Port, &identity)?
            .ok_or_else(|| anyhow!("Nothing is listening on {identity}"))
    };
    match command {
        PortCommand::List => list_category(warden, out, Category::Port)?,
        PortCommand::Backup { port, protocol } => {
            let record = lifecycle.backup(&live_port(port, protocol)?)?;
            print_backup(out, &record)?;
        }
        PortCommand::Close { port, protocol } => {
            let descriptor = live_port(port, protocol)?;
            let state = lifecycle.close(&descriptor)?;
            println!("✓ {} is now {state}", descriptor.identity);
        }
        PortCommand::Purge { port, protocol } => {
            purge(lifecycle, &ArtifactIdentity::for_port(port, protocol.into()))?
        }
    }
    Ok(())
}

fn print_backup(out: &Output, record: &BackupRecord) -> anyhow::Result<()> {
    if out.json {
        return out.value(record);
    }
    println!(
        "✓ Backed up {} ({}, checksum {})",
        record.artifact_identity,
        format_size(record.payload_size),
        record.checksum
    );
    Ok(())
}

fn list_backups(warden: &Warden, out: &Output, category: Option<Category>) -> anyhow::Result<()> {
    let records = warden.backups().records(category)?;
    if out.json {
        return out.value(&records);
    }
    let rows = records
        .into_iter()
        .map(|r| BackupRow {
            identity: r.artifact_identity.to_string(),
            category: r.category.to_string(),
            created: format_time(r.created_at),
            state: r.artifact_state.to_string(),
            size: format_size(r.payload_size),
            restores: r.restore_count,
        })
        .collect();
    out.table(rows, "No backups found");
    Ok(())
}

fn search(warden: &Warden, out: &Output, keyword: &str) -> anyhow::Result<()> {
    let matches = warden.search(keyword)?;
    if out.json {
        return out.value(&matches);
    }
    let advice: Vec<String> = matches.iter().filter_map(|m| m.advice.clone()).collect();
    let rows = matches
        .into_iter()
        .map(|m| MatchRow {
            source: m.source.to_string(),
            identity: m.identity,
            label: m.label.unwrap_or_default(),
            state: m.state.map(|s| s.to_string()).unwrap_or_default(),
            actions: join(m.actions.iter()),
        })
        .collect();
    out.table(rows, &format!("Nothing matches {keyword:?}"));
    for line in advice {
        println!("  * {line}");
    }
    Ok(())
}

fn join<T: ToString>(items: impl Iterator<Item = T>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

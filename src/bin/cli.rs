//! Binary entry point for the heapvac administrative CLI.
#![forbid(unsafe_code)]

#[path = "cli/config.rs"]
mod config;

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use heapvac::{
    admin::{
        checkpoint, init, seed_demo, stats, vacuum_database, AdminError, AdminOpenOptions,
        CheckpointReport, InitReport, SeedOptions, SeedReport, StatsReport, VacuumRunReport,
    },
    types::RoleId,
    vacuum::{RelationOutcome, VacuumOptions},
};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{CliConfig, Profile};

#[derive(Parser, Debug)]
#[command(
    name = "heapvac",
    version,
    about = "Vacuum and maintenance CLI for heapvac clusters",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, value_name = "FILE", help = "CLI config file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Config profile to use")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, help = "Database to connect to")]
    database: Option<String>,

    #[arg(long, global = true, value_name = "ID", help = "Role id to run as")]
    role: Option<u32>,

    #[arg(
        long,
        global = true,
        help = "Run without superuser rights (ownership checks apply)"
    )]
    no_superuser: bool,

    #[arg(long, global = true, help = "Page size (bytes) when creating a cluster")]
    page_size: Option<usize>,

    #[arg(
        long,
        global = true,
        value_name = "MS",
        help = "Relation lock wait before a relation is skipped"
    )]
    lock_timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create a cluster directory and database")]
    Init {
        #[arg(value_name = "DIR")]
        cluster: Option<PathBuf>,
    },

    #[command(about = "Print catalog, watermark and file statistics")]
    Stats {
        #[arg(value_name = "DIR")]
        cluster: Option<PathBuf>,
    },

    #[command(about = "Write all pages back and empty the log")]
    Checkpoint {
        #[arg(value_name = "DIR")]
        cluster: Option<PathBuf>,
    },

    #[command(about = "Reclaim space held by dead row versions")]
    Vacuum(VacuumCmd),

    #[command(about = "Populate a demo table and leave dead rows behind")]
    SeedDemo(SeedDemoCmd),
}

#[derive(Args, Debug)]
struct VacuumCmd {
    #[arg(value_name = "DIR")]
    cluster: Option<PathBuf>,

    #[arg(value_name = "TABLE", help = "Vacuum only this relation")]
    table: Option<String>,

    #[arg(long, help = "Compact under an exclusive lock and shrink files")]
    full: bool,

    #[arg(long, help = "Freeze every row older than the oldest running transaction")]
    freeze: bool,

    #[arg(long, help = "Report per-relation detail")]
    verbose: bool,

    #[arg(long, help = "Run the analyzer after each relation")]
    analyze: bool,
}

#[derive(Args, Debug)]
struct SeedDemoCmd {
    #[arg(value_name = "DIR")]
    cluster: Option<PathBuf>,

    #[arg(long, default_value = "demo", help = "Table to create")]
    table: String,

    #[arg(long, default_value_t = 1_000, help = "Rows to insert")]
    rows: usize,

    #[arg(long, default_value_t = 64, help = "Row payload width in bytes")]
    row_width: usize,

    #[arg(long, default_value_t = 2, help = "Delete every n-th row (0 = none)")]
    delete_every: usize,

    #[arg(long, default_value_t = 5, help = "Update every n-th row (0 = none)")]
    update_every: usize,

    #[arg(long, help = "Skip the primary-key index")]
    no_index: bool,

    #[arg(long, help = "Create the cluster if it does not exist")]
    create: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let verbose = matches!(&cli.command, Command::Vacuum(cmd) if cmd.verbose);
    install_tracing(verbose);

    let config = CliConfig::load(cli.config.clone())?;
    let profile = config.resolve(cli.profile.as_deref())?;
    let open_opts = build_open_options(&cli.open, &profile);

    match cli.command {
        Command::Init { cluster } => {
            let path = cluster_path(cluster, &profile)?;
            let report = init(&path, &open_opts)?;
            emit(&cli.format, &report, || print_init_text(&report))?;
        }
        Command::Stats { cluster } => {
            let path = cluster_path(cluster, &profile)?;
            let report = stats(&path, &open_opts)?;
            emit(&cli.format, &report, || print_stats_text(&report))?;
        }
        Command::Checkpoint { cluster } => {
            let path = cluster_path(cluster, &profile)?;
            let report = checkpoint(&path, &open_opts)?;
            emit(&cli.format, &report, || print_checkpoint_text(&report))?;
        }
        Command::Vacuum(cmd) => {
            let path = cluster_path(cmd.cluster, &profile)?;
            let vacuum_opts = VacuumOptions {
                full: cmd.full,
                freeze: cmd.freeze,
                verbose: cmd.verbose,
                analyze: cmd.analyze,
                relation: cmd.table,
            };
            let report = vacuum_database(&path, &open_opts, &vacuum_opts, config.vacuum())?;
            emit(&cli.format, &report, || print_vacuum_text(&report))?;
        }
        Command::SeedDemo(cmd) => {
            let path = cluster_path(cmd.cluster, &profile)?;
            let mut opts = open_opts.clone();
            opts.create_if_missing = cmd.create;
            let seed = SeedOptions {
                table: cmd.table,
                rows: cmd.rows,
                row_width: cmd.row_width,
                delete_every: cmd.delete_every,
                update_every: cmd.update_every,
                with_index: !cmd.no_index,
            };
            let report = seed_demo(&path, &opts, &seed)?;
            emit(&cli.format, &report, || print_seed_text(&report))?;
        }
    }

    Ok(())
}

fn install_tracing(verbose: bool) {
    let default = if verbose { "heapvac=info" } else { "heapvac=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_open_options(args: &OpenArgs, profile: &Profile) -> AdminOpenOptions {
    let mut opts = AdminOpenOptions::default();
    if let Some(database) = args.database.clone().or_else(|| profile.database.clone()) {
        opts.database = database;
    }
    if let Some(role) = args.role {
        opts.role = RoleId(role);
    }
    opts.superuser = !args.no_superuser;
    if let Some(page_size) = args.page_size.or(profile.page_size) {
        opts.cluster = opts.cluster.page_size(page_size);
    }
    if let Some(ms) = args.lock_timeout_ms.or(profile.lock_timeout_ms) {
        opts.cluster = opts.cluster.lock_timeout(Duration::from_millis(ms));
    }
    if let Some(pages) = profile.max_fsm_pages {
        opts.cluster = opts.cluster.max_fsm_pages(pages);
    }
    opts
}

fn cluster_path(explicit: Option<PathBuf>, profile: &Profile) -> Result<PathBuf, AdminError> {
    explicit
        .or_else(|| profile.cluster.clone())
        .ok_or_else(|| AdminError::Message("no cluster directory given and none configured".into()))
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_init_text(report: &InitReport) {
    println!(
        "Initialized cluster {} with database {} (page_size={}, next_xid={})",
        report.root, report.database, report.page_size, report.next_xid
    );
}

fn print_stats_text(report: &StatsReport) {
    println!(
        "Cluster: root={} page_size={} next_xid={} oldest_retained_xid={}",
        report.cluster.root,
        report.cluster.page_size,
        report.cluster.next_xid,
        report.cluster.oldest_retained_xid
    );
    println!(
        "  recovery: records={} pages_restored={} truncations={}",
        report.cluster.recovery.records,
        report.cluster.recovery.pages_restored,
        report.cluster.recovery.truncations
    );
    println!();
    println!("Databases:");
    for db in &report.databases {
        println!(
            "  {} (id={} owner={}) allow_conn={} template={} vacuum_xid={} frozen_xid={}",
            db.name,
            db.id,
            db.owner,
            db.allow_conn,
            db.is_template,
            optional(db.vacuum_xid),
            optional(db.frozen_xid)
        );
    }
    println!();
    println!("Relations:");
    for rel in &report.relations {
        println!(
            "  {}.{} (id={} {:?}) nblocks={} indexes={} relpages={} reltuples={}",
            rel.database,
            rel.relation,
            rel.id,
            rel.kind,
            rel.nblocks,
            rel.indexes,
            rel.stats.pages,
            rel.stats.tuples
        );
    }
    println!();
    println!(
        "FSM: relations={} pages_stored={} pages_requested={} max_pages={}",
        report.fsm.relations, report.fsm.pages_stored, report.fsm.pages_requested, report.fsm.max_pages
    );
    println!(
        "WAL: exists={} size={} path={}",
        report.wal.exists, report.wal.size_bytes, report.wal.path
    );
}

fn print_checkpoint_text(report: &CheckpointReport) {
    println!(
        "Checkpoint completed in {:.2} ms ({} pages written, {} databases, {} records replayed)",
        report.duration_ms, report.pages_written, report.databases, report.records_replayed
    );
}

fn print_vacuum_text(report: &VacuumRunReport) {
    let run = &report.vacuum;
    println!(
        "Vacuum{} of {} finished in {:.2} ms",
        if run.full { " full" } else { "" },
        run.database,
        report.duration_ms
    );
    for rel in &run.relations {
        match rel.outcome {
            RelationOutcome::Vacuumed => println!(
                "  {}: removed={} kept={} recently_dead={} moved={} pages {} -> {}",
                rel.relation,
                rel.removed,
                rel.kept,
                rel.recently_dead,
                rel.moved,
                rel.pages_before,
                rel.pages_after
            ),
            outcome => println!("  {}: {:?}", rel.relation, outcome),
        }
        for index in &rel.indexes {
            println!(
                "    index {}: tuples={} removed={} pages={}",
                index.name, index.result.num_index_tuples, index.result.tuples_removed, index.result.num_pages
            );
        }
    }
    for warning in &run.warnings {
        println!("WARNING: {}", warning.message);
    }
    if run.database_wide {
        println!(
            "watermarks_advanced={} history_truncated={}",
            run.watermarks_advanced, run.history_truncated
        );
    }
}

fn print_seed_text(report: &SeedReport) {
    println!(
        "Seeded {} with {} rows ({} deleted, {} updated) in {} pages",
        report.table, report.inserted, report.deleted, report.updated, report.nblocks
    );
}

fn optional(value: Option<u32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

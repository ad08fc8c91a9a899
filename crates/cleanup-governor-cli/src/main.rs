use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use cleanup_governor_audit_core::AuditSink;
use cleanup_governor_audit_sqlite::{parse_run_id, SqliteAuditSink};
use cleanup_governor_config::{load_governor_config_from_path, GovernorConfigEnvelope};
use cleanup_governor_connectors::{
    FilePlanner, FileStateProbe, HttpRelayExecutor, HttpValidationGate,
};
use cleanup_governor_domain::Domain;
use cleanup_governor_pipeline::{
    AllowAllValidationGate, Executor, GovernancePipeline, GovernorScheduler, NoopExecutor,
    RunOptions, RunReport, ScheduledOutcome, ValidationGate, ENGINE_VERSION,
};

#[derive(Debug, Parser)]
#[command(name = "cleanup-governor")]
#[command(about = "Validated cleanup runs with append-only SQLite audit records")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one governance cycle for a single domain.
    Run(RunArgs),
    /// Run one governance cycle for every registered domain.
    RunAll(RunAllArgs),
    /// Inspect the audit log.
    Audit(AuditArgs),
    /// Export audit records as JSON lines.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    domain: String,
    #[arg(long)]
    audit_db: PathBuf,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, default_value = "manual")]
    triggered_by: String,
    /// Skip real execution; approved actions are acknowledged, not applied.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct RunAllArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    audit_db: PathBuf,
    #[arg(long, default_value = "scheduler")]
    triggered_by: String,
    #[arg(long, default_value_t = 4)]
    max_concurrency: usize,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[command(subcommand)]
    command: AuditSubcommand,
}

#[derive(Debug, Subcommand)]
enum AuditSubcommand {
    Runs {
        #[arg(long)]
        audit_db: PathBuf,
        #[arg(long)]
        domain: Option<String>,
    },
    Record {
        #[arg(long)]
        audit_db: PathBuf,
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    audit_db: PathBuf,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    out: PathBuf,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_command(args),
        Commands::RunAll(args) => run_all_command(args),
        Commands::Audit(args) => audit_command(args),
        Commands::Export(args) => export_command(&args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(args: RunArgs) -> Result<()> {
    let config = load_governor_config_from_path(&args.config)?;
    let envelope = config.domain(&args.domain).ok_or_else(|| {
        anyhow!(
            "domain '{}' is not registered in {}",
            args.domain,
            args.config.display()
        )
    })?;

    let sink = SqliteAuditSink::open(&args.audit_db)?;
    sink.migrate()?;

    let probe = FileStateProbe;
    let planner = FilePlanner;
    let gate = build_gate(&config);
    let executor = build_executor(&config, args.dry_run);
    let pipeline = GovernancePipeline::new(&probe, &planner, &*gate, &*executor, &sink);

    let options = RunOptions {
        run_id: args.run_id.as_deref().map(parse_run_id).transpose()?,
        triggered_by: args.triggered_by,
        engine_version: ENGINE_VERSION.to_string(),
    };
    let report = pipeline.run_once(envelope, &options);
    print_report(&report);

    if report.audit_recorded {
        Ok(())
    } else {
        Err(anyhow!("run record was not persisted to the audit log"))
    }
}

fn run_all_command(args: RunAllArgs) -> Result<()> {
    let config = load_governor_config_from_path(&args.config)?;

    let sink = SqliteAuditSink::open(&args.audit_db)?;
    sink.migrate()?;

    let probe = FileStateProbe;
    let planner = FilePlanner;
    let gate = build_gate(&config);
    let executor = build_executor(&config, args.dry_run);
    let pipeline = GovernancePipeline::new(&probe, &planner, &*gate, &*executor, &sink);
    let scheduler = GovernorScheduler::new(&pipeline, args.max_concurrency);

    let options = RunOptions {
        run_id: None,
        triggered_by: args.triggered_by,
        engine_version: ENGINE_VERSION.to_string(),
    };
    let results = scheduler.run_all(&config.domains, &options);

    let mut unrecorded = 0_usize;
    for (domain, outcome) in &results {
        match outcome {
            ScheduledOutcome::Ran(report) => {
                print_report(report);
                if !report.audit_recorded {
                    unrecorded += 1;
                }
            }
            ScheduledOutcome::OverlapSkipped => {
                println!("domain={domain} outcome=overlap_skipped");
            }
        }
    }

    if unrecorded == 0 {
        Ok(())
    } else {
        Err(anyhow!(
            "{unrecorded} run record(s) were not persisted to the audit log"
        ))
    }
}

fn audit_command(args: AuditArgs) -> Result<()> {
    match args.command {
        AuditSubcommand::Runs { audit_db, domain } => {
            let sink = SqliteAuditSink::open(&audit_db)?;
            sink.migrate()?;
            let domain = domain.map(Domain);
            let records = sink.list_runs(domain.as_ref())?;
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        AuditSubcommand::Record { audit_db, run_id } => {
            let sink = SqliteAuditSink::open(&audit_db)?;
            sink.migrate()?;
            let run_id = parse_run_id(&run_id)?;
            let record = sink
                .get_run(run_id)?
                .ok_or_else(|| anyhow!("run_id {run_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }
    Ok(())
}

fn export_command(args: &ExportArgs) -> Result<()> {
    let sink = SqliteAuditSink::open(&args.audit_db)?;
    sink.migrate()?;
    let domain = args.domain.clone().map(Domain);
    let records = sink.list_runs(domain.as_ref())?;
    let record_count = records.len();

    let output = File::create(&args.out)?;
    let mut writer = BufWriter::new(output);
    for record in &records {
        writeln!(writer, "{}", serde_json::to_string(record)?)?;
    }
    writer.flush()?;

    println!("exported {} records to {}", record_count, args.out.display());
    Ok(())
}

fn build_gate(config: &GovernorConfigEnvelope) -> Box<dyn ValidationGate> {
    match &config.services.gate {
        Some(service) => Box::new(HttpValidationGate::new(service.clone())),
        None => {
            tracing::warn!("no validation gate configured; every candidate will be cleared");
            Box::new(AllowAllValidationGate::default())
        }
    }
}

fn build_executor(config: &GovernorConfigEnvelope, dry_run: bool) -> Box<dyn Executor> {
    if dry_run {
        return Box::new(NoopExecutor);
    }
    match &config.services.relay {
        Some(service) => Box::new(HttpRelayExecutor::new(service.clone())),
        None => {
            tracing::warn!("no execution relay configured; actions will be acknowledged only");
            Box::new(NoopExecutor)
        }
    }
}

fn print_report(report: &RunReport) {
    let record = &report.record;
    println!(
        "run_id={} domain={} outcome={} candidates={} approved={} declined={} executed={} audit_recorded={}",
        record.run_id,
        record.domain,
        record.outcome.as_str(),
        record.candidates.len(),
        record.approved.len(),
        record.declined.len(),
        record.execution_results.len(),
        report.audit_recorded
    );
}

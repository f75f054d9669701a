//! ledgersync CLI: relay daemon and operator tooling.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use ledgersync::config::Config;
use ledgersync::config::secrets::ExposeSecret;
use ledgersync::db::Db;
use ledgersync::engine::{Engine, Submitted};
use ledgersync::ledger::Ledger;
use ledgersync::model::outbox::LedgerMutation;
use ledgersync::model::report::ReconciliationReport;
use ledgersync::model::work::{NewWorkItem, WorkId};
use ledgersync::replica::PgReplica;
use ledgersync::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "ledgersync", about = "Ledger to replica outbox relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run relay workers and scheduled reconciliation until Ctrl-C
    Serve {
        /// Number of relay workers (overrides LEDGERSYNC_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
    /// Reconciliation operations
    Reconcile {
        #[command(subcommand)]
        action: ReconcileAction,
    },
}

#[derive(Subcommand)]
enum WorkAction {
    /// Ingest an event and commit its ledger mutation
    Submit {
        /// Business key of the record being mutated
        business_key: String,
        /// JSON object of fields to merge into the ledger record
        fields: String,
        /// Inbound event id, for dedup
        #[arg(long)]
        source_event: Option<String>,
    },
    /// Show a work item
    Show {
        /// Work item ID
        id: String,
    },
    /// Force a work item back to queued
    Reset {
        /// Work item ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ReconcileAction {
    /// Run a sweep now and print its report
    Run,
    /// List recent reports
    Reports {
        /// Maximum reports to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show one report with its findings
    Show {
        /// Report run ID
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { workers } => cmd_serve(config, workers).await,
        Command::Work { action } => match action {
            WorkAction::Submit {
                business_key,
                fields,
                source_event,
            } => cmd_work_submit(&config, business_key, fields, source_event).await,
            WorkAction::Show { id } => {
                let db = connect_ledger(&config).await?;
                cmd_work_show(db.as_ref(), parse_work_id(&id)?).await
            }
            WorkAction::Reset { id } => {
                let engine = connect_engine(&config).await?;
                let item = engine.reset_to_queued(parse_work_id(&id)?).await?;
                println!(
                    "Reset: {} (status: {}, retry_count: {})",
                    item.id, item.status, item.retry_count
                );
                Ok(())
            }
        },
        Command::Reconcile { action } => match action {
            ReconcileAction::Run => {
                let engine = connect_engine(&config).await?;
                let report = engine.reconcile_now().await?;
                print_report(&report);
                Ok(())
            }
            ReconcileAction::Reports { limit } => {
                let db = connect_ledger(&config).await?;
                cmd_reconcile_reports(db.as_ref(), limit).await
            }
            ReconcileAction::Show { run_id } => {
                let db = connect_ledger(&config).await?;
                let report = db.get_report(uuid::Uuid::parse_str(&run_id)?).await?;
                print_report(&report);
                Ok(())
            }
        },
    }
}

async fn connect_ledger(config: &Config) -> anyhow::Result<Arc<Db>> {
    let db = Db::connect(config.database_url.expose_secret(), config.db_max_connections).await?;
    db.migrate().await?;
    Ok(Arc::new(db))
}

async fn connect_engine(config: &Config) -> anyhow::Result<Engine> {
    let ledger = connect_ledger(config).await?;

    let replica_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(config.replica_database_url.expose_secret())
        .await?;
    let replica = PgReplica::new(replica_pool);
    replica.ensure_schema().await?;

    let engine = Engine::builder(ledger, Arc::new(replica), config.ownership()?)
        .collection(config.collection.clone())
        .relay_config(config.relay_config())
        .reconcile_config(config.reconcile_config())
        .build()?;
    Ok(engine)
}

async fn cmd_serve(config: Config, workers: Option<usize>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    let engine = connect_engine(&config).await?;
    let pool = engine.spawn_workers(workers.unwrap_or(config.workers));
    let scheduler = engine.start_scheduler();

    tracing::info!(
        workers = pool.workers().len(),
        collection = %config.collection,
        "ledgersync serving"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    pool.shutdown_and_join().await;
    scheduler.shutdown().await;
    Ok(())
}

async fn cmd_work_submit(
    config: &Config,
    business_key: String,
    fields: String,
    source_event: Option<String>,
) -> anyhow::Result<()> {
    let fields: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&fields)?;
    let mutation = LedgerMutation { fields };

    let mut new = NewWorkItem::new(business_key);
    if let Some(id) = source_event {
        new = new.source_event_id(id);
    }

    let engine = connect_engine(config).await?;
    match engine.submit(new, mutation).await? {
        Submitted::Committed { work_id, outcome } => {
            println!(
                "Committed: {work_id} (aggregate version {}, outbox {})",
                outcome.aggregate.version,
                outcome
                    .outbox
                    .map(|r| r.id.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        Submitted::Duplicate { existing } => {
            println!("Duplicate event: already ingested as {existing}");
        }
    }
    Ok(())
}

async fn cmd_work_show(ledger: &dyn Ledger, id: WorkId) -> anyhow::Result<()> {
    let item = ledger.get_work_item(id).await?;

    println!("ID:           {}", item.id);
    println!("Business Key: {}", item.business_key);
    println!("Status:       {}", item.status);
    println!("Retries:      {}", item.retry_count);
    println!("Stalls:       {}", item.stall_count);
    println!(
        "Lease:        {}",
        match (&item.lease_owner, item.lease_expires_at) {
            (Some(owner), Some(expires)) => format!("{owner} until {expires}"),
            _ => "-".to_string(),
        }
    );
    if let Some(next) = item.next_attempt_at {
        println!("Next Attempt: {next}");
    }
    println!("Created:      {}", item.created_at);
    println!("Updated:      {}", item.updated_at);
    if let Some(started) = item.started_at {
        println!("Started:      {started}");
    }
    if let Some(completed) = item.completed_at {
        println!("Completed:    {completed}");
    }
    if let Some(ref err) = item.last_error {
        println!("Last Error:   {err}");
    }

    for record in ledger.outbox_for_work(id).await? {
        println!("---");
        println!("Outbox:       {} ({})", record.id, record.operation);
        println!("Attempts:     {}", record.delivery_attempts);
        println!(
            "Delivered:    {}",
            record
                .delivered_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        println!("Payload:      {}", serde_json::to_string_pretty(&record.payload)?);
    }
    Ok(())
}

async fn cmd_reconcile_reports(ledger: &dyn Ledger, limit: usize) -> anyhow::Result<()> {
    let reports = ledger.list_reports(limit).await?;
    if reports.is_empty() {
        println!("No reconciliation reports found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:>7}  {:>9}  {:>6}  {:>7}  {:>7}",
        "RUN", "GENERATED", "CHECKED", "RESYNC", "REVIEW", "STALLED", "HEALTH"
    );
    println!("{}", "-".repeat(100));
    for report in &reports {
        println!(
            "{:<36}  {:<16}  {:>7}  {:>9}  {:>6}  {:>7}  {:>7.3}",
            report.run_id,
            report.generated_at.format("%Y-%m-%d %H:%M"),
            report.checked(),
            report.counts.re_syncable,
            report.counts.manual_review,
            report.counts.stalled,
            report.health_score
        );
    }
    println!("\n{} report(s)", reports.len());
    Ok(())
}

fn print_report(report: &ReconciliationReport) {
    println!("Run:          {}", report.run_id);
    println!("Window:       {} .. {}", report.window_start, report.window_end);
    println!("Checked:      {}", report.checked());
    println!("Re-syncable:  {}", report.counts.re_syncable);
    println!("Manual:       {}", report.counts.manual_review);
    println!("Stalled:      {}", report.counts.stalled);
    println!("No action:    {}", report.counts.no_action);
    if report.skipped > 0 {
        println!("Skipped:      {}", report.skipped);
    }
    println!("Health:       {:.3}", report.health_score);
    for finding in &report.findings {
        println!(
            "  {} {} [{}] {:?}: {}",
            finding.work_id, finding.business_key, finding.class, finding.action, finding.detail
        );
    }
}

fn parse_work_id(raw: &str) -> anyhow::Result<WorkId> {
    Ok(WorkId(uuid::Uuid::parse_str(raw)?))
}

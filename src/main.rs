use clap::Parser;
use escrow_ledger::application::engine::SettlementEngine;
use escrow_ledger::config::SettlementConfig;
use escrow_ledger::domain::ports::StoreRef;
use escrow_ledger::infrastructure::gateway::SandboxGateway;
use escrow_ledger::infrastructure::in_memory::{InMemoryAuditSink, InMemoryStore};
use escrow_ledger::interfaces::csv::balance_writer::BalanceWriter;
use escrow_ledger::interfaces::csv::command_reader::CommandReader;
use escrow_ledger::interfaces::runner::CommandRunner;
use escrow_ledger::telemetry;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input command script (CSV)
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JSON settings file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn open_store(db_path: Option<PathBuf>) -> Result<StoreRef> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store =
                escrow_ledger::infrastructure::rocksdb::RocksDBStore::open(path).into_diagnostic()?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            Ok(Arc::new(InMemoryStore::new()))
        }
        None => Ok(Arc::new(InMemoryStore::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SettlementConfig::from_file(path).into_diagnostic()?,
        None => SettlementConfig::default(),
    };
    telemetry::init_tracing(&config.log_filter);

    let store = open_store(cli.db_path)?;
    let gateway = SandboxGateway::new(config.gateway.clone());
    let audit = InMemoryAuditSink::new();
    let engine = SettlementEngine::new(
        store,
        Arc::new(gateway.clone()),
        Some(Arc::new(audit.clone())),
        config,
    );
    let runner = CommandRunner::new(engine, gateway);

    let file = File::open(cli.input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    for cmd_result in reader.commands() {
        match cmd_result {
            Ok(cmd) => {
                if let Err(e) = runner.apply(&cmd).await {
                    eprintln!("Error processing command: {}", e);
                }
            }
            Err(e) => {
                eprintln!("Error reading command: {}", e);
            }
        }
    }
    info!(audit_events = audit.events().await.len(), "script finished");

    let rows = runner.engine().report().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = BalanceWriter::new(stdout.lock());
    writer.write_rows(&rows).into_diagnostic()?;

    Ok(())
}

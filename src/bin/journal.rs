//! KeelKV Journal Tool
//!
//! Inspects and recovers a KeelKV data directory.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use keelkv::journal::{JournalReader, JournalRecord};
use keelkv::recovery::RecoveryManager;
use keelkv::{Config, Engine};
use tracing_subscriber::{fmt, EnvFilter};

/// KeelKV journal tool
#[derive(Parser, Debug)]
#[command(name = "keel-journal")]
#[command(about = "Inspect, verify and recover a KeelKV journal")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./keelkv_data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check every journal file and report torn tails or corruption
    Verify,

    /// Print journal records
    Dump {
        /// Only records of this transaction
        #[arg(short, long)]
        txn: Option<u64>,

        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Run crash recovery and checkpoint the result
    Recover {
        /// Plan only; change nothing on disk
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keelkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("KeelKV journal tool v{}", keelkv::VERSION);

    let result = match args.command {
        Command::Verify => verify(&args.data_dir),
        Command::Dump { txn, limit } => dump(&args.data_dir, txn, limit),
        Command::Recover { dry_run } => recover(&args.data_dir, dry_run),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn journal_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("journal")
}

fn verify(data_dir: &std::path::Path) -> keelkv::Result<()> {
    let scan = JournalReader::scan(&journal_dir(data_dir))?;
    println!("files:       {:?}", scan.generations);
    println!("block size:  {}", scan.block_size.unwrap_or(0));
    println!("records:     {}", scan.entries.len());
    println!("end address: {}", scan.end_address);
    match &scan.torn_tail {
        Some(torn) => println!(
            "torn tail:   {} at address {} ({})",
            torn.path.display(),
            torn.stop.address,
            torn.stop.reason
        ),
        None => println!("torn tail:   none"),
    }
    Ok(())
}

fn dump(data_dir: &std::path::Path, txn: Option<u64>, limit: Option<usize>) -> keelkv::Result<()> {
    let scan = JournalReader::scan(&journal_dir(data_dir))?;
    let entries = scan
        .entries
        .iter()
        .filter(|e| txn.map_or(true, |t| e.txn_id == t))
        .take(limit.unwrap_or(usize::MAX));

    for entry in entries {
        let detail = match &entry.record {
            JournalRecord::BeginTransaction { start_ts } => format!("start_ts={}", start_ts),
            JournalRecord::Store {
                tree_id,
                step,
                key,
                value,
            } => format!(
                "tree={} step={} key={:?} value_len={}",
                tree_id,
                step,
                String::from_utf8_lossy(key),
                value.len()
            ),
            JournalRecord::RemoveRange {
                tree_id,
                step,
                from,
                to,
                keys,
            } => format!(
                "tree={} step={} from={:?} to={:?} keys={}",
                tree_id,
                step,
                String::from_utf8_lossy(from),
                String::from_utf8_lossy(to),
                keys.len()
            ),
            JournalRecord::CreateTree {
                tree_id,
                timestamp,
                name,
            } => format!("tree={} ts={} name={}", tree_id, timestamp, name),
            JournalRecord::RemoveTree { tree_id } => format!("tree={}", tree_id),
            JournalRecord::AccumulatorDelta {
                tree_id,
                index,
                kind,
                value,
            } => format!("tree={} index={} kind={:?} value={}", tree_id, index, kind, value),
            JournalRecord::Commit { commit_ts } => format!("commit_ts={}", commit_ts),
            JournalRecord::Rollback => String::new(),
            JournalRecord::Checkpoint {
                timestamp,
                base_address,
            } => format!("ts={} base={}", timestamp, base_address),
        };
        println!(
            "{:>14} txn={:<10} {:<16} {}",
            entry.address,
            entry.txn_id,
            entry.record.name(),
            detail
        );
    }
    if let Some(torn) = &scan.torn_tail {
        println!("-- torn tail at {}: {}", torn.stop.address, torn.stop.reason);
    }
    Ok(())
}

fn recover(data_dir: &std::path::Path, dry_run: bool) -> keelkv::Result<()> {
    if dry_run {
        let checkpoint_dir = data_dir.join("checkpoints");
        let mut manager = RecoveryManager::new(&journal_dir(data_dir), &checkpoint_dir);
        manager.scan()?;
        let plan = manager.plan()?;
        println!("{:#?}", plan.stats);
        println!("transactions to replay: {}", plan.transactions.len());
        println!("updates to replay:      {}", plan.update_count());
        return Ok(());
    }

    let config = Config::builder().data_dir(data_dir).build();
    let engine = Engine::open(config)?;
    println!("{:#?}", engine.recovery_stats());
    engine.close()
}

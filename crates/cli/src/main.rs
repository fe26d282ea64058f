use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};
use codematch::commands::*;
use codematch::init_tracing;
use codematch_core::config::StorageMethod;

/// Function-similarity store for disassembled binaries.
///
/// This CLI is a thin wrapper around `codematch-core`. All substantive logic
/// lives in the library so it can be tested thoroughly and reused from other
/// frontends.
#[derive(Parser, Debug)]
#[command(
    name = "codematch",
    version,
    about = "Function-similarity store for disassembled binaries",
    long_about = None
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). `RUST_LOG` overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write `codematch.json` under the root and create its databases.
    Init {
        /// Root directory. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Storage backend (`sqlite` or `memory`).
        #[arg(long, default_value = "sqlite")]
        method: StorageMethod,

        /// Storage database file, relative to the root unless absolute.
        #[arg(long)]
        db: Option<String>,

        /// Queue database file, relative to the root unless absolute.
        #[arg(long)]
        queue_db: Option<String>,

        /// Overwrite an existing config file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Show the resolved configuration.
    Info {
        #[arg(long, default_value = ".")]
        root: String,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Ingest a disassembly report (JSON).
    Ingest {
        #[arg(long, default_value = ".")]
        root: String,

        /// Path to the report JSON.
        #[arg(long)]
        report: String,

        /// Family label; defaults to the report's own.
        #[arg(long)]
        family: Option<String>,

        /// Original binary; its SHA-256 replaces the report's.
        #[arg(long)]
        binary: Option<String>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Storage-wide counts.
    Stats {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show one sample.
    #[command(group(ArgGroup::new("key").required(true).args(["id", "sha256"])))]
    Sample {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        id: Option<u32>,

        #[arg(long)]
        sha256: Option<String>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List samples.
    Samples {
        #[arg(long, default_value = ".")]
        root: String,

        /// Only samples of this family.
        #[arg(long)]
        family: Option<String>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Delete a sample with its functions and index entries.
    DeleteSample {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        id: u32,
    },

    /// Exact (PicHash) matches for a function or a whole sample.
    #[command(group(ArgGroup::new("target").required(true).args(["function_id", "sample_id"])))]
    Pichash {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        function_id: Option<u64>,

        #[arg(long)]
        sample_id: Option<u32>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Approximate (LSH) candidates for a stored function.
    Candidates {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        function_id: u64,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Drop stored xcfg payloads for one sample, or all of them.
    PurgeXcfg {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        sample_id: Option<u32>,
    },

    /// Work queue operations.
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
    /// Enqueue a JSON payload.
    Put {
        #[arg(long, default_value = ".")]
        root: String,

        /// Payload as a JSON document.
        #[arg(long)]
        payload: String,

        /// Higher runs first.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i64,
    },

    /// Claim the next job.
    Next {
        #[arg(long, default_value = ".")]
        root: String,

        /// Consumer id recorded on the lease.
        #[arg(long)]
        consumer: Option<String>,

        /// Delete the job right after claiming it.
        #[arg(long, default_value_t = false)]
        complete: bool,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show one job.
    Show {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        id: i64,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Counts by job state.
    Stats {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Return expired leases to the queue.
    Repair {
        #[arg(long, default_value = ".")]
        root: String,
    },

    /// Drop every job.
    Clear {
        #[arg(long, default_value = ".")]
        root: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Init { root, method, db, queue_db, force } => {
            init_command(&root, method, db, queue_db, force)?
        }
        Command::Info { root, json } => info_command(&root, json)?,
        Command::Ingest { root, report, family, binary, json } => {
            ingest_command(&root, &report, family, binary, json)?
        }
        Command::Stats { root, json } => stats_command(&root, json)?,
        Command::Sample { root, id, sha256, json } => {
            show_sample_command(&root, id, sha256, json)?
        }
        Command::Samples { root, family, json } => list_samples_command(&root, family, json)?,
        Command::DeleteSample { root, id } => delete_sample_command(&root, id)?,
        Command::Pichash { root, function_id, sample_id, json } => {
            pichash_command(&root, function_id, sample_id, json)?
        }
        Command::Candidates { root, function_id, json } => {
            candidates_command(&root, function_id, json)?
        }
        Command::PurgeXcfg { root, sample_id } => purge_xcfg_command(&root, sample_id)?,
        Command::Queue { action } => match action {
            QueueCommand::Put { root, payload, priority } => {
                queue_put_command(&root, &payload, priority)?
            }
            QueueCommand::Next { root, consumer, complete, json } => {
                queue_next_command(&root, consumer, complete, json)?
            }
            QueueCommand::Show { root, id, json } => queue_show_command(&root, id, json)?,
            QueueCommand::Stats { root, json } => queue_stats_command(&root, json)?,
            QueueCommand::Repair { root } => queue_repair_command(&root)?,
            QueueCommand::Clear { root } => queue_clear_command(&root)?,
        },
    }

    Ok(())
}

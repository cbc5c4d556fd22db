//! # Ragline CLI (`ragline`)
//!
//! Ingest documents into the knowledge base, run the background worker
//! that extracts, embeds and indexes them, then search or ask questions.
//!
//! ## Usage
//!
//! ```bash
//! ragline --config ./config/ragline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragline init` | Create the SQLite database and run schema migrations |
//! | `ragline ingest <file>` | Ingest a file (txt, md, html, pdf, docx) |
//! | `ragline ingest --text "..." --title "..."` | Ingest raw text |
//! | `ragline status <id>` | Show a document's processing status and jobs |
//! | `ragline list` | List documents |
//! | `ragline search "<query>"` | Retrieve matching chunks |
//! | `ragline ask "<question>"` | Answer a question from the knowledge base |
//! | `ragline delete <id>` | Delete a document and its vectors |
//! | `ragline clear --yes` | Delete everything |
//! | `ragline reprocess <id>` | Re-extract a finished document |
//! | `ragline retry-job <job_id>` | Retry a failed processing job |
//! | `ragline cancel <id>` | Cancel an in-flight extraction |
//! | `ragline worker` | Run queued pipeline tasks |
//! | `ragline optimize [--prune-days N]` | Requeue unsynced chunks, prune old records |
//! | `ragline stats` | Counts, sync coverage and usage |
//! | `ragline health` | Check every configured backend |

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use ragline::config;
use ragline::service::KnowledgeBase;
use ragline::{cli, db, logging, migrate};

/// Ragline: a retrieval-augmented knowledge base.
#[derive(Parser)]
#[command(
    name = "ragline",
    about = "Ragline: document ingestion, hybrid search and grounded question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragline.toml")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running it
    /// more than once is safe.
    Init,

    #[command(flatten)]
    Kb(KbCommand),
}

/// Commands that run against an opened knowledge base.
#[derive(Subcommand)]
enum KbCommand {
    /// Ingest a file or a piece of text.
    ///
    /// Identical content is deduplicated: ingesting it again returns the
    /// existing document.
    Ingest {
        /// File to ingest.
        #[arg(conflicts_with = "text", required_unless_present = "text")]
        file: Option<PathBuf>,

        /// Raw text to ingest instead of a file.
        #[arg(long)]
        text: Option<String>,

        /// Document title. Defaults to the file name for files.
        #[arg(long)]
        title: Option<String>,
    },

    /// Show the processing status of a document.
    Status {
        /// Document id.
        id: String,
    },

    /// List documents, newest first.
    List {
        /// Only documents in this status (pending, processing, completed, failed).
        #[arg(long)]
        status: Option<String>,
    },

    /// Search the knowledge base.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum similarity for vector hits, in [0, 1].
        #[arg(long)]
        threshold: Option<f64>,

        /// Search mode: `vector`, `keyword` or `hybrid`.
        #[arg(long)]
        mode: Option<String>,
    },

    /// Answer a question from the knowledge base.
    Ask {
        question: String,

        /// Number of chunks used as context.
        #[arg(long)]
        limit: Option<usize>,

        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },

    /// Delete a document with its chunks, vectors and stored file.
    Delete {
        id: String,
    },

    /// Delete every document, chunk, vector and queued task.
    Clear {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Purge a finished document's chunks and extract it again.
    Reprocess {
        id: String,
    },

    /// Retry a failed document processing job.
    RetryJob {
        job_id: String,
    },

    /// Cancel the in-flight extraction of a document.
    Cancel {
        id: String,
    },

    /// Run queued pipeline tasks until interrupted.
    Worker {
        /// Run the tasks that are due now, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Requeue stranded unsynced chunks and compact the keyword index.
    Optimize {
        /// Also delete search and usage records, and failed jobs, older
        /// than this many days.
        #[arg(long)]
        prune_days: Option<u32>,
    },

    /// Show document, chunk, job and usage statistics.
    Stats,

    /// Check every configured backend.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            std::fs::create_dir_all(&cfg.storage.path)?;
            println!("Database initialized successfully.");
        }
        Commands::Kb(command) => {
            let kb = KnowledgeBase::open(cfg).await?;
            run(&kb, command).await?;
        }
    }

    Ok(())
}

async fn run(kb: &KnowledgeBase, command: KbCommand) -> Result<()> {
    match command {
        KbCommand::Ingest { file, text, title } => {
            cli::run_ingest(kb, file.as_deref(), text, title).await?;
        }
        KbCommand::Status { id } => cli::run_status(kb, &id).await?,
        KbCommand::List { status } => cli::run_list(kb, status.as_deref()).await?,
        KbCommand::Search {
            query,
            limit,
            threshold,
            mode,
        } => {
            cli::run_search(kb, &query, limit, threshold, mode.as_deref()).await?;
        }
        KbCommand::Ask {
            question,
            limit,
            stream,
        } => cli::run_ask(kb, &question, limit, stream).await?,
        KbCommand::Delete { id } => cli::run_delete(kb, &id).await?,
        KbCommand::Clear { yes } => cli::run_clear(kb, yes).await?,
        KbCommand::Reprocess { id } => cli::run_reprocess(kb, &id).await?,
        KbCommand::RetryJob { job_id } => cli::run_retry_job(kb, &job_id).await?,
        KbCommand::Cancel { id } => cli::run_cancel(kb, &id).await?,
        KbCommand::Worker { once } => cli::run_worker(kb, once).await?,
        KbCommand::Optimize { prune_days } => cli::run_optimize(kb, prune_days).await?,
        KbCommand::Stats => cli::run_stats(kb).await?,
        KbCommand::Health => cli::run_health(kb).await?,
    }
    Ok(())
}

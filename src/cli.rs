//! Command runners for the `ragline` binary.
//!
//! Each `run_*` function performs one CLI command against a
//! [`KnowledgeBase`] and prints human-readable output to stdout.
//! Diagnostics go through `tracing` instead.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::answer::StreamEvent;
use crate::pipeline::{IngestRequest, PROCESSING_ERROR_KEY};
use crate::search::SearchOptions;
use crate::service::KnowledgeBase;
use ragline_core::models::{Document, DocumentStatus, SearchMode};

pub async fn run_ingest(
    kb: &KnowledgeBase,
    file: Option<&Path>,
    text: Option<String>,
    title: Option<String>,
) -> Result<()> {
    let request = match (file, text) {
        (Some(path), None) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("Invalid file name: {}", path.display()))?;
            let title = title.unwrap_or_else(|| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(filename)
                    .to_string()
            });
            IngestRequest::file(&title, filename, bytes)
        }
        (None, Some(text)) => {
            let Some(title) = title else {
                bail!("--title is required with --text");
            };
            IngestRequest::text(&title, &text)
        }
        _ => bail!("Provide either a file path or --text"),
    };

    let doc = kb.ingest(request).await?;
    println!("Ingested document {}", doc.id);
    println!("  title:  {}", doc.title);
    println!("  status: {}", doc.status);
    if let Some(error) = doc.metadata.get(PROCESSING_ERROR_KEY) {
        println!("  error:  {}", error);
    }
    if doc.status == DocumentStatus::Pending || doc.status == DocumentStatus::Processing {
        println!();
        println!("Run `ragline worker` to continue processing.");
    }
    Ok(())
}

pub async fn run_status(kb: &KnowledgeBase, document_id: &str) -> Result<()> {
    let status = kb.get_status(document_id).await?;
    println!("--- Document ---");
    println!("id:        {}", status.document_id);
    println!("title:     {}", status.title);
    println!("status:    {}", status.status);
    println!("progress:  {:.0}%", status.progress);
    println!(
        "chunks:    {} synced / {} total",
        status.synced_chunks, status.total_chunks
    );
    if let Some(started) = status.processing_started_at {
        println!("started:   {}", format_ts(started));
    }
    if let Some(completed) = status.processing_completed_at {
        println!("completed: {}", format_ts(completed));
    }

    if !status.jobs.is_empty() {
        println!();
        println!("--- Jobs ({}) ---", status.jobs.len());
        println!(
            "  {:<36} {:<22} {:<11} {:>7}  {}",
            "ID", "KIND", "STATUS", "RETRIES", "ERROR"
        );
        for job in &status.jobs {
            println!(
                "  {:<36} {:<22} {:<11} {:>3}/{:<3}  {}",
                job.id,
                job.kind.as_str(),
                job.status.as_str(),
                job.retry_count,
                job.max_retries,
                job.error_message.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

pub async fn run_list(kb: &KnowledgeBase, status: Option<&str>) -> Result<()> {
    let status = match status {
        Some(s) => Some(
            DocumentStatus::parse(s)
                .with_context(|| format!("Unknown status: {}. Use pending, processing, completed or failed.", s))?,
        ),
        None => None,
    };
    let docs = kb.list_documents(status).await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    println!(
        "{:<36} {:<11} {:>9}  {:<16}  {}",
        "ID", "STATUS", "SIZE", "CREATED", "TITLE"
    );
    for doc in &docs {
        print_document_row(doc);
    }
    println!();
    println!("{} document{}", docs.len(), if docs.len() == 1 { "" } else { "s" });
    Ok(())
}

fn print_document_row(doc: &Document) {
    println!(
        "{:<36} {:<11} {:>9}  {:<16}  {}",
        doc.id,
        doc.status.as_str(),
        format_bytes(doc.byte_size),
        format_ts(doc.created_at),
        doc.title
    );
}

fn search_options(
    limit: Option<usize>,
    threshold: Option<f64>,
    mode: Option<&str>,
) -> Result<SearchOptions> {
    let mode = match mode {
        Some(m) => Some(
            SearchMode::parse(m)
                .with_context(|| format!("Unknown search mode: {}. Use vector, keyword, or hybrid.", m))?,
        ),
        None => None,
    };
    if let Some(t) = threshold {
        if !(0.0..=1.0).contains(&t) {
            bail!("--threshold must be in [0.0, 1.0]");
        }
    }
    Ok(SearchOptions {
        limit,
        threshold,
        mode,
    })
}

pub async fn run_search(
    kb: &KnowledgeBase,
    query: &str,
    limit: Option<usize>,
    threshold: Option<f64>,
    mode: Option<&str>,
) -> Result<()> {
    let options = search_options(limit, threshold, mode)?;
    let results = kb.search(query, &options).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} (similarity {:.2})",
            i + 1,
            r.score,
            r.document_title,
            r.similarity_score
        );
        println!("    document: {}  chunk: {}", r.document_id, r.chunk_id);
        println!("    {}", snippet(&r.content, 240));
        println!();
    }
    Ok(())
}

pub async fn run_ask(
    kb: &KnowledgeBase,
    question: &str,
    limit: Option<usize>,
    stream: bool,
) -> Result<()> {
    let options = SearchOptions {
        limit,
        ..Default::default()
    };

    if !stream {
        let result = kb.ask(question, &options).await?;
        println!("{}", result.answer);
        println!();
        print_sources(result.sources.iter().map(|s| (&s.document_title, s.similarity_score)));
        println!("confidence: {:.2}", result.confidence);
        if let Some(model) = &result.model {
            println!(
                "model: {}  tokens: {}{}",
                model,
                result.usage.total_tokens,
                result
                    .usage
                    .cost_usd
                    .map(|c| format!("  cost: ${:.4}", c))
                    .unwrap_or_default()
            );
        }
        return Ok(());
    }

    let mut answer = kb.ask_stream(question, &options).await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = answer.events.recv().await {
        match event {
            StreamEvent::Delta { content } => {
                print!("{}", content);
                stdout.flush().ok();
            }
            StreamEvent::Complete { usage } => {
                println!();
                println!();
                print_sources(
                    answer
                        .sources
                        .iter()
                        .map(|s| (&s.document_title, s.similarity_score)),
                );
                println!("confidence: {:.2}", answer.confidence);
                if usage.total_tokens > 0 {
                    println!("tokens: {}", usage.total_tokens);
                }
                return Ok(());
            }
            StreamEvent::Error { message } => {
                println!();
                bail!("Answer stream failed: {}", message);
            }
        }
    }
    println!();
    Ok(())
}

fn print_sources<'a>(sources: impl Iterator<Item = (&'a String, f64)>) {
    let sources: Vec<_> = sources.collect();
    if sources.is_empty() {
        return;
    }
    println!("Sources:");
    for (title, similarity) in sources {
        println!("  - {} ({:.2})", title, similarity);
    }
}

pub async fn run_delete(kb: &KnowledgeBase, document_id: &str) -> Result<()> {
    if kb.delete(document_id).await? {
        println!("Deleted document {}", document_id);
    } else {
        bail!("document not found: {}", document_id);
    }
    Ok(())
}

pub async fn run_clear(kb: &KnowledgeBase, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to delete everything without --yes");
    }
    if kb.clear_all().await? {
        println!("Knowledge base cleared.");
    } else {
        println!("Knowledge base cleared, but the vector index or blob storage reported errors (see log).");
    }
    Ok(())
}

pub async fn run_reprocess(kb: &KnowledgeBase, document_id: &str) -> Result<()> {
    let doc = kb.reprocess(document_id).await?;
    println!("Reprocessing document {} (status: {})", doc.id, doc.status);
    Ok(())
}

pub async fn run_retry_job(kb: &KnowledgeBase, job_id: &str) -> Result<()> {
    let job = kb.retry_job(job_id).await?;
    println!(
        "Job {} is {} (retry {}/{})",
        job.id, job.status, job.retry_count, job.max_retries
    );
    Ok(())
}

pub async fn run_cancel(kb: &KnowledgeBase, document_id: &str) -> Result<()> {
    let doc = kb.cancel(document_id).await?;
    println!("Cancelled processing of {} (status: {})", doc.id, doc.status);
    Ok(())
}

pub async fn run_worker(kb: &KnowledgeBase, once: bool) -> Result<()> {
    let worker = kb.worker();
    if once {
        let ran = worker.drain().await?;
        println!("Processed {} task{}.", ran, if ran == 1 { "" } else { "s" });
        return Ok(());
    }
    worker
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

pub async fn run_optimize(kb: &KnowledgeBase, prune_days: Option<u32>) -> Result<()> {
    let report = kb
        .optimize(prune_days.map(|d| chrono::Duration::days(d as i64)))
        .await?;
    if report.requeued_chunks == 0 {
        println!("All chunks are synced or already queued.");
    } else {
        println!("Queued {} unsynced chunk(s) for embedding.", report.requeued_chunks);
    }
    if let (Some(pruned), Some(days)) = (report.pruned, prune_days) {
        println!("Pruned records older than {} days:", days);
        println!("  Searches:    {}", pruned.search_queries);
        println!("  API usage:   {}", pruned.api_usage);
        println!("  Failed jobs: {}", pruned.failed_jobs);
    }
    println!("Keyword index compacted.");
    Ok(())
}

pub async fn run_stats(kb: &KnowledgeBase) -> Result<()> {
    let stats = kb.stats().await?;
    let store = &stats.store;

    println!("Ragline Knowledge Base Stats");
    println!("============================");
    println!();
    println!("  Database:    {}", kb.config().db.path.display());
    let db_size = std::fs::metadata(&kb.config().db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    let total_docs: usize = store.documents_by_status.values().sum();
    println!("  Documents:   {}", total_docs);
    for (status, count) in &store.documents_by_status {
        println!("    {:<12} {}", status, count);
    }
    println!("  Chunks:      {}", store.total_chunks);
    println!(
        "  Synced:      {} / {} ({}%)",
        store.synced_chunks,
        store.total_chunks,
        if store.total_chunks > 0 {
            store.synced_chunks * 100 / store.total_chunks
        } else {
            0
        }
    );
    println!("  Queued:      {}", stats.queued_tasks);
    if !store.jobs_by_status.is_empty() {
        println!("  Jobs:");
        for (status, count) in &store.jobs_by_status {
            println!("    {:<12} {}", status, count);
        }
    }
    println!();
    match (&stats.vector_index, &stats.vector_index_error) {
        (Some(index), _) => println!(
            "  Vectors:     {} ({} dims)",
            index.count, index.dimensions
        ),
        (None, Some(error)) => println!("  Vectors:     unavailable ({})", error),
        (None, None) => {}
    }
    println!("  Searches:    {}", store.search_queries);
    println!(
        "  API calls:   {} (${:.4})",
        store.api_calls, store.total_cost_usd
    );
    println!();
    Ok(())
}

pub async fn run_health(kb: &KnowledgeBase) -> Result<()> {
    let report = kb.health().await;
    println!("{:<14} {:<16} {:<8} {}", "COMPONENT", "PROVIDER", "STATUS", "DETAIL");
    for c in &report.components {
        println!(
            "{:<14} {:<16} {:<8} {}",
            c.component,
            c.provider,
            if c.healthy { "ok" } else { "error" },
            c.detail.as_deref().unwrap_or("")
        );
    }
    if !report.healthy {
        bail!("One or more components are unhealthy");
    }
    Ok(())
}

/// First `max` characters of `text` on one line.
fn snippet(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max).collect();
    format!("{}…", cut.trim_end())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

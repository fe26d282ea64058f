use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::commands::{open_root_queue, print_json};

/// Enqueue a JSON payload.
pub fn queue_put_command(root: &str, payload: &str, priority: i64) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload must be valid JSON")?;
    let queue = open_root_queue(root, None)?;
    let id = queue.put(&payload, priority).context("Failed to enqueue job")?;
    tracing::debug!(id, priority, collection = queue.collection(), "queued job");
    println!("Queued job {id} (priority {priority})");
    Ok(())
}

#[derive(Debug, Serialize)]
struct ClaimedJob<'a> {
    id: i64,
    priority: i64,
    attempts_left: u32,
    consumer: &'a str,
    payload: &'a serde_json::Value,
}

/// Claim the next job and print it.
///
/// With `complete` the job is deleted right away, which drains one job.
pub fn queue_next_command(
    root: &str,
    consumer: Option<String>,
    complete: bool,
    json: bool,
) -> Result<()> {
    let queue = open_root_queue(root, consumer)?;
    let Some(job) = queue.next().context("Failed to claim job")? else {
        if json {
            return print_json(&serde_json::Value::Null);
        }
        println!("No job available");
        return Ok(());
    };

    if json {
        print_json(&ClaimedJob {
            id: job.id(),
            priority: job.priority(),
            attempts_left: job.attempts_left(),
            consumer: queue.consumer_id(),
            payload: job.payload(),
        })?;
    } else {
        println!("Claimed job {} as {}:", job.id(), queue.consumer_id());
        println!("  Priority: {}", job.priority());
        println!("  Attempts left: {}", job.attempts_left());
        println!("  Payload: {}", job.payload());
    }

    if complete {
        job.complete().context("Failed to complete job")?;
        if !json {
            println!("  Completed");
        }
    }
    Ok(())
}

/// Show one job by id.
pub fn queue_show_command(root: &str, id: i64, json: bool) -> Result<()> {
    let queue = open_root_queue(root, None)?;
    let job = queue.get(id)?.ok_or_else(|| anyhow!("Job not found: {id}"))?;
    if json {
        return print_json(&job);
    }

    println!("Job {}:", job.id);
    println!("  Status: {}", job.status.as_str());
    println!("  Priority: {}", job.priority);
    println!("  Attempts left: {}", job.attempts_left);
    println!("  Created: {}", job.created_at.to_rfc3339());
    if let (Some(consumer), Some(locked_at)) = (&job.locked_by, job.locked_at) {
        let held = Utc::now().signed_duration_since(locked_at);
        println!("  Locked by: {consumer} ({}s ago)", held.num_seconds().max(0));
    }
    if let Some(message) = &job.error_message {
        println!("  Error: {message}");
    }
    println!("  Payload: {}", job.payload);
    Ok(())
}

pub fn queue_stats_command(root: &str, json: bool) -> Result<()> {
    let queue = open_root_queue(root, None)?;
    let stats = queue.stats().context("Failed to read queue stats")?;
    if json {
        return print_json(&stats);
    }
    println!("Queue '{}':", queue.collection());
    println!("  Available: {}", stats.available);
    println!("  Locked: {}", stats.locked);
    println!("  Errors: {}", stats.errors);
    println!("  Total: {}", stats.total);
    Ok(())
}

/// Return expired leases to the queue.
pub fn queue_repair_command(root: &str) -> Result<()> {
    let queue = open_root_queue(root, None)?;
    let repaired = queue.repair().context("Failed to repair queue")?;
    if repaired > 0 {
        tracing::info!(repaired, "returned expired leases to the queue");
    }
    println!("Repaired {repaired} expired lease(s)");
    Ok(())
}

pub fn queue_clear_command(root: &str) -> Result<()> {
    let queue = open_root_queue(root, None)?;
    queue.clear().context("Failed to clear queue")?;
    println!("Cleared queue '{}'", queue.collection());
    Ok(())
}

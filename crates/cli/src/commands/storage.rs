use std::fs;

use anyhow::{anyhow, Context, Result};
use codematch_core::model::{ContentHash, Report};
use codematch_core::storage::{MinHash, PicHashMatches, SampleRecord};
use serde::Serialize;

use crate::commands::{load_root_config, open_root_storage, print_json, resolve_under};
use crate::sha256_file;

/// Ingest a JSON report into the configured storage.
///
/// `binary` replaces the report's sha256 with the digest of that file.
pub fn ingest_command(
    root: &str,
    report_path: &str,
    family: Option<String>,
    binary: Option<String>,
    json: bool,
) -> Result<()> {
    let (root_path, _config) = load_root_config(root)?;
    let report_path = resolve_under(&root_path, report_path);
    let contents = fs::read_to_string(&report_path)
        .with_context(|| format!("Failed to read report at {}", report_path.display()))?;
    let mut report = Report::from_json(&contents)
        .with_context(|| format!("Failed to parse report JSON at {}", report_path.display()))?;

    if let Some(binary) = binary {
        let binary_path = resolve_under(&root_path, &binary);
        if !binary_path.exists() {
            return Err(anyhow!("Binary file does not exist: {}", binary_path.display()));
        }
        report.sha256 = sha256_file(&binary_path)?;
    }
    let family = family.unwrap_or_else(|| report.family.clone());

    let storage = open_root_storage(root)?;
    let added = storage.add_sample(&report, &family).context("Failed to ingest report")?;

    match added {
        Some(sample) if json => print_json(&sample)?,
        Some(sample) if sample.num_functions == 0 => {
            tracing::warn!(sha256 = %sample.sha256, "report carried no functions");
            println!("Added sample {} with no functions", sample.sample_id);
        }
        Some(sample) => {
            println!("Added sample:");
            println!("  Id: {}", sample.sample_id);
            println!("  Family: {} ({})", display_family(&sample.family), sample.family_id);
            println!("  SHA256: {}", sample.sha256);
            println!("  Functions: {}", sample.num_functions);
        }
        None if json => print_json(&serde_json::Value::Null)?,
        None => println!("Sample already stored: {}", report.sha256),
    }

    Ok(())
}

/// Print storage-wide counts.
pub fn stats_command(root: &str, json: bool) -> Result<()> {
    let storage = open_root_storage(root)?;
    let stats = storage.get_stats().context("Failed to read storage stats")?;

    if json {
        return print_json(&stats);
    }
    println!("Families: {}", stats.num_families);
    println!("Samples: {}", stats.num_samples);
    println!("Functions: {}", stats.num_functions);
    println!("PicHashes: {}", stats.num_pichashes);
    println!("MinHashes: {}", stats.num_minhashes);
    println!("Band buckets: {}", stats.num_band_buckets);
    Ok(())
}

/// Show one sample, looked up by id or by sha256.
pub fn show_sample_command(
    root: &str,
    id: Option<u32>,
    sha256: Option<String>,
    json: bool,
) -> Result<()> {
    let storage = open_root_storage(root)?;
    let sample = match (id, sha256) {
        (Some(id), _) => storage.get_sample_by_id(id)?,
        (None, Some(hex)) => {
            let hash: ContentHash =
                hex.parse().with_context(|| format!("Invalid sha256 '{hex}'"))?;
            storage.get_sample_by_sha256(&hash)?
        }
        (None, None) => return Err(anyhow!("Pass --id or --sha256")),
    };
    let sample = sample.ok_or_else(|| anyhow!("Sample not found"))?;

    if json {
        return print_json(&sample);
    }
    print_sample(&sample);
    if let Some(library) = storage.get_library_info_for_sample_id(sample.sample_id)? {
        println!("  Library: {} {}", library.family, library.version.as_deref().unwrap_or("-"));
    }
    Ok(())
}

/// List samples, optionally restricted to one family.
pub fn list_samples_command(root: &str, family: Option<String>, json: bool) -> Result<()> {
    let storage = open_root_storage(root)?;
    let samples = match family {
        Some(name) => {
            let family_id = storage
                .get_family_id(&name)?
                .ok_or_else(|| anyhow!("Unknown family '{name}'"))?;
            storage.get_samples_by_family_id(family_id)?.unwrap_or_default()
        }
        None => {
            let mut samples = Vec::new();
            for id in storage.get_sample_ids()? {
                if let Some(sample) = storage.get_sample_by_id(id)? {
                    samples.push(sample);
                }
            }
            samples
        }
    };

    if json {
        return print_json(&samples);
    }
    println!("Samples ({}):", samples.len());
    if samples.is_empty() {
        println!("  (none)");
    }
    for sample in &samples {
        println!(
            "  - {} [{}] {} functions={} {}",
            sample.sample_id,
            display_family(&sample.family),
            sample.sha256,
            sample.num_functions,
            sample.filename
        );
    }
    Ok(())
}

/// Delete a sample and everything indexed under it.
pub fn delete_sample_command(root: &str, id: u32) -> Result<()> {
    let storage = open_root_storage(root)?;
    if !storage.delete_sample(id).context("Failed to delete sample")? {
        return Err(anyhow!("Sample not found: {id}"));
    }
    println!("Deleted sample {id}");
    Ok(())
}

#[derive(Debug, Serialize)]
struct PicHashReport {
    pichash: String,
    matches: Vec<PicHashMatchEntry>,
}

#[derive(Debug, Serialize)]
struct PicHashMatchEntry {
    sample_id: u32,
    function_id: u64,
}

fn pichash_reports(matches: PicHashMatches) -> Vec<PicHashReport> {
    matches
        .into_iter()
        .map(|(pichash, pairs)| PicHashReport {
            pichash: format!("{pichash:016x}"),
            matches: pairs
                .into_iter()
                .map(|(sample_id, function_id)| PicHashMatchEntry { sample_id, function_id })
                .collect(),
        })
        .collect()
}

/// Exact matches for one function or for every function of a sample.
pub fn pichash_command(
    root: &str,
    function_id: Option<u64>,
    sample_id: Option<u32>,
    json: bool,
) -> Result<()> {
    let storage = open_root_storage(root)?;
    let matches = match (function_id, sample_id) {
        (Some(id), _) => storage
            .get_pichash_matches_by_function_id(id)?
            .ok_or_else(|| anyhow!("Function not found: {id}"))?,
        (None, Some(id)) => storage
            .get_pichash_matches_by_sample_id(id)?
            .ok_or_else(|| anyhow!("Sample not found: {id}"))?,
        (None, None) => return Err(anyhow!("Pass --function-id or --sample-id")),
    };
    let reports = pichash_reports(matches);

    if json {
        return print_json(&reports);
    }
    for report in &reports {
        println!("PicHash {} ({} matches):", report.pichash, report.matches.len());
        for entry in &report.matches {
            println!("  - sample {} function {}", entry.sample_id, entry.function_id);
        }
    }
    Ok(())
}

/// LSH candidates for a stored function's MinHash, excluding the function itself.
pub fn candidates_command(root: &str, function_id: u64, json: bool) -> Result<()> {
    let storage = open_root_storage(root)?;
    if !storage.is_function_id(function_id)? {
        return Err(anyhow!("Function not found: {function_id}"));
    }
    let signature = storage
        .get_minhash_by_function_id(function_id)?
        .ok_or_else(|| anyhow!("Function {function_id} has no MinHash"))?;
    let mut candidates = storage.get_candidates_for_minhash(&MinHash::unbound(signature))?;
    candidates.remove(&function_id);

    if json {
        return print_json(&candidates);
    }
    println!("Candidates for function {function_id} ({}):", candidates.len());
    if candidates.is_empty() {
        println!("  (none)");
    }
    for candidate in &candidates {
        let sample_id = storage.get_sample_id_by_function_id(*candidate)?;
        match sample_id {
            Some(sample_id) => println!("  - function {candidate} (sample {sample_id})"),
            None => println!("  - function {candidate}"),
        }
    }
    Ok(())
}

/// Drop stored xcfg payloads for one sample, or for everything.
pub fn purge_xcfg_command(root: &str, sample_id: Option<u32>) -> Result<()> {
    let storage = open_root_storage(root)?;
    match sample_id {
        Some(id) => {
            if !storage.is_sample_id(id)? {
                return Err(anyhow!("Sample not found: {id}"));
            }
            storage.delete_xcfg_for_sample_id(id).context("Failed to purge xcfg")?;
            println!("Purged xcfg payloads of sample {id}");
        }
        None => {
            storage.delete_xcfg_data().context("Failed to purge xcfg")?;
            println!("Purged all xcfg payloads");
        }
    }
    Ok(())
}

fn print_sample(sample: &SampleRecord) {
    println!("Sample {}:", sample.sample_id);
    println!("  Family: {} ({})", display_family(&sample.family), sample.family_id);
    println!("  SHA256: {}", sample.sha256);
    println!("  Filename: {}", sample.filename);
    println!("  Bitness: {}", sample.bitness);
    println!("  Base address: {:#x}", sample.base_addr);
    println!("  Functions: {}", sample.num_functions);
    println!("  Binweight: {}", sample.binweight);
    println!("  Ingested: {}", sample.timestamp.to_rfc3339());
}

fn display_family(family: &str) -> &str {
    if family.is_empty() {
        "-"
    } else {
        family
    }
}

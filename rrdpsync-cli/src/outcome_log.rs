//! Outcome log display for the rrdpsync CLI.
//!
//! Human-readable formatting on top of the core [`OutcomeLog`].

use anyhow::Result;
use rrdp_core::{CycleResult, OutcomeLog, SyncOutcome};
use std::io::Write;

/// Format one outcome for display.
pub fn format_outcome(outcome: &SyncOutcome) -> String {
    let date = outcome.timestamp.format("%Y-%m-%d %H:%M:%S UTC");
    let position = match (&outcome.session_id, outcome.serial) {
        (Some(session), Some(serial)) => format!("{}#{}", short_session(session), serial),
        _ => "-".to_string(),
    };
    let status = match &outcome.result {
        CycleResult::Failed(_) => "FAILED",
        _ => "OK",
    };

    let mut extra = Vec::new();
    if let Some(objects) = outcome.objects {
        extra.push(format!("{} objects", objects));
    }
    if outcome.collisions > 0 {
        extra.push(format!("{} duplicate URIs", outcome.collisions));
    }
    if outcome.rejected_objects > 0 {
        extra.push(format!("{} rejected", outcome.rejected_objects));
    }

    format!(
        "[{}] {} | {} | {} | {}ms | {}{}",
        date,
        outcome.repository,
        position,
        outcome.result,
        outcome.duration.as_millis(),
        status,
        if extra.is_empty() {
            String::new()
        } else {
            format!(" ({})", extra.join(", "))
        },
    )
}

fn short_session(session: &str) -> &str {
    session.get(..8).unwrap_or(session)
}

/// Print the outcome log of a repository, newest last.
pub fn print_outcome_log(
    log: &OutcomeLog,
    repository: &str,
    limit: Option<usize>,
    writer: &mut dyn Write,
) -> Result<()> {
    let mut entries = log.entries(repository)?;
    if let Some(limit) = limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    if entries.is_empty() {
        writeln!(writer, "No outcomes recorded for {}.", repository)?;
        return Ok(());
    }

    writeln!(writer, "Outcome log for {} ({} entries):", repository, entries.len())?;
    writeln!(writer, "{}", "-".repeat(80))?;
    for entry in &entries {
        writeln!(writer, "  {}", format_outcome(entry))?;
    }
    writeln!(writer, "{}", "-".repeat(80))?;

    let failures = entries.iter().filter(|e| !e.is_success()).count();
    let snapshots = entries
        .iter()
        .filter(|e| e.result == CycleResult::SnapshotFetched)
        .count();
    let deltas: usize = entries
        .iter()
        .map(|e| match e.result {
            CycleResult::DeltasApplied(n) => n,
            _ => 0,
        })
        .sum();
    let total_ms: u128 = entries.iter().map(|e| e.duration.as_millis()).sum();

    writeln!(
        writer,
        "Summary: {} cycles ({} failed), {} snapshots, {} deltas, {}ms total",
        entries.len(),
        failures,
        snapshots,
        deltas,
        total_ms,
    )?;

    Ok(())
}

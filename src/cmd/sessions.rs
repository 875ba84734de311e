//! Session inspection commands: `sessions`, `status`, `history`.

use anyhow::{Context, Result};
use std::path::Path;

use delve::model::{DEFAULT_COVERAGE_TARGET, Session};
use delve::pipeline::Phase;
use delve::store::{RecordKind, SessionStore, StoreRecord};

pub async fn cmd_sessions(store: &SessionStore, store_dir: &Path) -> Result<()> {
    let headers = store.list_sessions().await?;

    println!();
    if headers.is_empty() {
        println!("No sessions found in {}", store_dir.display());
        println!();
        return Ok(());
    }

    println!(
        "{:<38} {:<16} {:<7} {:<8} Updated",
        "Session", "Phase", "Round", "Records"
    );
    println!(
        "{:<38} {:<16} {:<7} {:<8} -------",
        "-".repeat(36),
        "-----",
        "-----",
        "-------"
    );
    for h in &headers {
        let round = format!("{}/{}", h.current_round, h.max_rounds);
        println!(
            "{:<38} {:<16} {:<7} {:<8} {}",
            h.id,
            h.phase,
            round,
            h.record_count,
            h.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(err) = &h.error {
            println!("  error: {} ({})", err.message, err.code);
        }
    }
    println!();
    println!("{} session(s)", headers.len());
    println!();
    Ok(())
}

pub async fn cmd_status(store: &SessionStore, id: &str, json: bool) -> Result<()> {
    let session = store
        .restore(id)
        .await
        .with_context(|| format!("Failed to load session {}", id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    print_status(&session);
    Ok(())
}

fn print_status(session: &Session) {
    println!();
    println!("Session {}", session.id);
    println!(
        "  Phase:   {} (round {}/{})",
        session.phase, session.current_round, session.max_rounds
    );
    println!("  Created: {}", session.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated: {}", session.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(err) = &session.error {
        let resumable = if err.recoverable {
            "resumable"
        } else {
            "not resumable"
        };
        println!("  Error:   [{}] {} ({})", err.code, err.message, resumable);
        if let Some(from) = session.failed_from {
            println!("  Failed in: {}", from);
        }
    }
    println!();

    let brief = &session.brief;
    println!("Brief v{}: {}", brief.version, brief.goal);
    let latest = session.rounds.last();
    for item in &brief.scope {
        let coverage = latest
            .and_then(|r| r.coverage.iter().find(|a| a.scope_item_id == item.id))
            .map(|a| format!("{:.1}%", a.percent))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<16} {:<9} target {:>5.1}%  coverage {:>6}  {}",
            item.id,
            item.kind.as_str(),
            item.target_or(DEFAULT_COVERAGE_TARGET),
            coverage,
            item.topic
        );
    }
    println!();

    if !session.planned.is_empty() {
        println!(
            "{:<6} {:<6} {:<7} {:<8} {:<9} {:<22} Timeout",
            "Round", "Tasks", "Failed", "MinCov", "Decision", "Reason"
        );
        for (&round, tasks) in &session.planned {
            let failed = session
                .results_for_round(round)
                .iter()
                .filter(|r| !r.is_success())
                .count();
            let record = session.rounds.iter().find(|r| r.round == round);
            let min = record
                .and_then(|r| r.min_coverage())
                .map(|p| format!("{:.1}", p))
                .unwrap_or_else(|| "-".to_string());
            let (decision, reason) = match record {
                Some(r) => (
                    format!("{:?}", r.decision).to_lowercase(),
                    r.reason.as_str().to_string(),
                ),
                None => ("pending".to_string(), "-".to_string()),
            };
            let timeout = if session.round_timed_out(round) {
                "yes"
            } else {
                ""
            };
            println!(
                "{:<6} {:<6} {:<7} {:<8} {:<9} {:<22} {}",
                round,
                tasks.len(),
                failed,
                min,
                decision,
                reason,
                timeout
            );
        }
        println!();
    }

    if let Some(agg) = &session.aggregation {
        println!(
            "Overall coverage {:.1}% after {} round(s): {} ({} of {} tasks failed)",
            agg.overall_coverage,
            agg.rounds,
            agg.termination.as_str(),
            agg.failed_tasks,
            agg.total_tasks
        );
        println!();
    }
}

pub async fn cmd_history(
    store: &SessionStore,
    id: &str,
    phase: Option<Phase>,
    round: Option<u32>,
    task: Option<&str>,
) -> Result<()> {
    let records = match (phase, round, task) {
        (_, _, Some(task)) => store.records_for_task(id, task).await?,
        (Some(phase), Some(round), None) => store.records_in(id, phase, round).await?,
        (None, Some(round), None) => store
            .records(id)
            .await?
            .into_iter()
            .filter(|r| r.round == round)
            .collect(),
        _ => store.records(id).await?,
    };

    println!();
    if records.is_empty() {
        println!("No matching records for session {}", id);
        println!();
        return Ok(());
    }
    println!(
        "{:>5}  {:<19}  {:<15} {:<16} {:<5} Detail",
        "Seq", "Time", "Kind", "Phase", "Round"
    );
    for record in &records {
        println!(
            "{:>5}  {:<19}  {:<15} {:<16} {:<5} {}",
            record.seq,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.kind.as_str(),
            record.phase,
            record.round,
            detail(record)
        );
    }
    println!();
    Ok(())
}

fn detail(record: &StoreRecord) -> String {
    let field = |name: &str| {
        record
            .payload
            .get(name)
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string()
    };
    match record.kind {
        RecordKind::SessionCreated => "session created".to_string(),
        RecordKind::Transition => field("event"),
        RecordKind::TaskResult => format!(
            "{} {}",
            record.task_id.as_deref().unwrap_or("?"),
            field("status")
        ),
    }
}

//! Shared plumbing for the subcommand handlers.

use anyhow::Result;
use std::sync::Arc;

use es3_core::agenda::Agenda;
use es3_core::path::RemotePath;
use es3_core::remote::{Connection, Context};
use es3_core::sync::RunOutcome;

/// Parses an `s3://` spec and resolves its bucket's region.
pub fn parse_remote(ctx: &Arc<Context>, spec: &str) -> Result<RemotePath> {
    let mut path = RemotePath::parse(spec)?;
    let conn = Connection::new(ctx);
    conn.resolve_zone(&mut path)?;
    Ok(path)
}

/// Exit code for a finished schedule-rounds driver.
pub fn outcome_code(outcome: RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Clean => 0,
        RunOutcome::SourceMissing => 2,
        RunOutcome::TransferFailed(_) => 6,
        RunOutcome::WorkRemains => 4,
    }
}

/// Exit code for a single `agenda.run` invocation: failed tasks beat
/// leftover queue entries.
pub fn finish_run(agenda: &Arc<Agenda>) -> i32 {
    let failed = agenda.run();
    if failed > 0 {
        return 6;
    }
    if agenda.tasks_count() > 0 {
        eprintln!("ERR: tasks still pending:");
        for line in agenda.queued_descriptions() {
            eprintln!("  {}", line);
        }
        return 4;
    }
    0
}

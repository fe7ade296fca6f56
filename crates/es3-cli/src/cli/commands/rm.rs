//! `es3 rm`: parallel remote deletion.
//!
//! Implemented as a synchronization against an empty local side with
//! delete-missing on; the agenda then drains the deletions in parallel.

use anyhow::Result;
use std::sync::Arc;

use es3_core::agenda::Agenda;
use es3_core::remote::Context;
use es3_core::sync::{run_schedule_rounds, Direction, PatternFilter, Synchronizer};

use super::helpers::{outcome_code, parse_remote};

pub fn run(
    ctx: &Arc<Context>,
    agenda: &Arc<Agenda>,
    paths: Vec<String>,
    recursive: bool,
    included: &[String],
    excluded: &[String],
) -> Result<i32> {
    let filter = Arc::new(PatternFilter::new(included, excluded)?);
    let mut remotes = Vec::new();
    for path in &paths {
        remotes.push(parse_remote(ctx, path)?);
    }

    let synchronizer = Synchronizer::new(
        agenda,
        ctx,
        remotes,
        Vec::new(),
        Direction::Upload,
        true,
        filter,
    );
    let outcome =
        run_schedule_rounds(agenda, || synchronizer.create_delete_schedule(recursive))?;
    if outcome_code(outcome) == 2 {
        eprintln!("ERR: <PATH> not found.");
    }
    Ok(outcome_code(outcome))
}

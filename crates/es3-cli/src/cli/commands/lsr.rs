//! `es3 lsr`: parallel recursive listing.

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use es3_core::agenda::Agenda;
use es3_core::remote::{listing, Context, WalkAction};
use es3_core::sync::PatternFilter;

use super::helpers::{finish_run, parse_remote};

pub fn run(
    ctx: &Arc<Context>,
    agenda: &Arc<Agenda>,
    paths: Vec<String>,
    included: &[String],
    excluded: &[String],
) -> Result<i32> {
    let filter = Arc::new(PatternFilter::new(included, excluded)?);
    let listed = Arc::new(AtomicUsize::new(0));
    for path in &paths {
        let remote = parse_remote(ctx, path)?;
        listing::schedule_recursive_walk(
            &remote,
            ctx,
            agenda,
            WalkAction::Print { filter: Arc::clone(&filter), listed: Arc::clone(&listed) },
        );
    }

    let code = finish_run(agenda);
    if code != 0 {
        return Ok(code);
    }
    eprintln!("Total files listed: {}", listed.load(Ordering::SeqCst));
    Ok(0)
}

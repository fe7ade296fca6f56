//! `es3 publish`: recursively apply the public-read ACL.

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
    let published = Arc::new(AtomicUsize::new(0));
    for path in &paths {
        let remote = parse_remote(ctx, path)?;
        listing::schedule_recursive_walk(
            &remote,
            ctx,
            agenda,
            WalkAction::Publish {
                filter: Arc::clone(&filter),
                published: Arc::clone(&published),
            },
        );
    }

    let code = finish_run(agenda);
    if code != 0 {
        return Ok(code);
    }
    println!("Total files published: {}", published.load(Ordering::SeqCst));
    Ok(0)
}
